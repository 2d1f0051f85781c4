use chrono::NaiveDate;
use serde::Serialize;

use crate::cycle::{days_in_month, last_day_of_month, remaining_days};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProRataQuote {
    /// Unrounded; currency rounding belongs to whoever renders it.
    pub price: f64,
    pub remaining_days: u32,
    pub days_in_month: u32,
}

/// Charge for the rest of the current calendar month, today included.
pub fn pro_rata_quote(monthly_price: f64, today: NaiveDate) -> ProRataQuote {
    let days_in_month = days_in_month(today);
    let remaining = remaining_days(last_day_of_month(today), today) + 1;
    let remaining_days = u32::try_from(remaining).unwrap_or(days_in_month);
    ProRataQuote {
        price: price_for_days(monthly_price, days_in_month, remaining_days),
        remaining_days,
        days_in_month,
    }
}

pub fn price_for_days(monthly_price: f64, days_in_month: u32, remaining_days: u32) -> f64 {
    if days_in_month == 0 {
        return 0.0;
    }
    monthly_price / f64::from(days_in_month) * f64::from(remaining_days)
}
