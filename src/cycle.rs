use chrono::{Datelike, Duration, NaiveDate};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DurationCategory {
    Monthly,
    Quarterly,
    Semiannual,
    Annual,
}

/// Bucket a day count into a billing cycle. Negative counts and anything past a year
/// (plus a few days of slack) are never offered.
pub fn classify_days(days: i64) -> Option<DurationCategory> {
    match days {
        0..=35 => Some(DurationCategory::Monthly),
        36..=95 => Some(DurationCategory::Quarterly),
        96..=185 => Some(DurationCategory::Semiannual),
        186..=370 => Some(DurationCategory::Annual),
        _ => None,
    }
}

/// Calendar days from `today` to `expires_on`; dates carry no time of day.
pub fn remaining_days(expires_on: NaiveDate, today: NaiveDate) -> i64 {
    (expires_on - today).num_days()
}

/// A credential matches a plan only when both land in the same bucket.
pub fn matches_plan(plan_days: i64, credential_remaining_days: i64) -> bool {
    match (
        classify_days(plan_days),
        classify_days(credential_remaining_days),
    ) {
        (Some(plan), Some(credential)) => plan == credential,
        _ => false,
    }
}

pub fn last_day_of_month(date: NaiveDate) -> NaiveDate {
    let (next_year, next_month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    match NaiveDate::from_ymd_opt(next_year, next_month, 1) {
        Some(first_of_next) => first_of_next - Duration::days(1),
        // Only reachable at the end of chrono's representable range.
        None => NaiveDate::MAX,
    }
}

pub fn days_in_month(date: NaiveDate) -> u32 {
    last_day_of_month(date).day()
}
