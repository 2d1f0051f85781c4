use std::cmp::Ordering;

use chrono::NaiveDate;
use serde::Serialize;

use crate::{
    cycle::{DurationCategory, matches_plan},
    domain::ClassCounts,
    pricing::ProRataQuote,
};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OfferCredential {
    pub login: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlotOffer {
    pub server_id: String,
    pub server_name: String,
    /// Decrypted, for display.
    pub credential: OfferCredential,
    /// As stored; a later attach writes these back unchanged instead of re-encrypting.
    pub stored_login: Option<String>,
    pub stored_password: Option<String>,
    pub available: ClassCounts,
    pub member_names: Vec<String>,
    pub expires_on: Option<NaiveDate>,
    pub remaining_days: Option<i64>,
    pub duration: Option<DurationCategory>,
    pub quote: Option<ProRataQuote>,
}

/// Soonest expiration first; offers without one go last. Stable, so ties keep input order.
pub fn sort_offers(offers: &mut [SlotOffer]) {
    offers.sort_by(|a, b| compare_expiry(a.expires_on, b.expires_on));
}

fn compare_expiry(a: Option<NaiveDate>, b: Option<NaiveDate>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Keep only offers whose remaining time lands in the plan's duration bucket.
pub fn retain_for_plan(offers: &mut Vec<SlotOffer>, plan_days: i64) {
    offers.retain(|offer| {
        offer
            .remaining_days
            .is_some_and(|remaining| matches_plan(plan_days, remaining))
    });
}
