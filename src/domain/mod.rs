use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq)]
pub enum DomainError {
    InvalidDisplayName,
    InvalidMonthlyPrice { monthly_price: f64 },
    InvalidPlanDays { plan_days: i64 },
    MissingServer { server_id: String },
    CredentialNotFound { server_id: String },
    NoSlotAvailable {
        server_id: String,
        service_class: ServiceClass,
    },
}

impl DomainError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidDisplayName
            | Self::InvalidMonthlyPrice { .. }
            | Self::InvalidPlanDays { .. } => "invalid_request",
            Self::MissingServer { .. } | Self::CredentialNotFound { .. } => "not_found",
            Self::NoSlotAvailable { .. } => "conflict",
        }
    }
}

impl std::fmt::Display for DomainError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidDisplayName => write!(f, "display_name is empty"),
            Self::InvalidMonthlyPrice { monthly_price } => {
                write!(f, "invalid monthly_price: {monthly_price}")
            }
            Self::InvalidPlanDays { plan_days } => write!(f, "invalid plan_days: {plan_days}"),
            Self::MissingServer { server_id } => write!(f, "server not found: {server_id}"),
            Self::CredentialNotFound { server_id } => {
                write!(f, "credential not found on server: server_id={server_id}")
            }
            Self::NoSlotAvailable {
                server_id,
                service_class,
            } => write!(
                f,
                "no {} slot available on credential: server_id={server_id}",
                service_class.as_str()
            ),
        }
    }
}

impl std::error::Error for DomainError {}

pub fn validate_display_name(display_name: &str) -> Result<(), DomainError> {
    if display_name.trim().is_empty() {
        return Err(DomainError::InvalidDisplayName);
    }
    Ok(())
}

pub fn validate_monthly_price(monthly_price: f64) -> Result<(), DomainError> {
    if !monthly_price.is_finite() || monthly_price < 0.0 {
        return Err(DomainError::InvalidMonthlyPrice { monthly_price });
    }
    Ok(())
}

/// The two slot sub-types a credential grants.
#[derive(
    clap::ValueEnum, Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "snake_case")]
pub enum ServiceClass {
    A,
    B,
}

impl ServiceClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::A => "a",
            Self::B => "b",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ClassCounts {
    #[serde(default)]
    pub a: u32,
    #[serde(default)]
    pub b: u32,
}

impl ClassCounts {
    pub const fn new(a: u32, b: u32) -> Self {
        Self { a, b }
    }

    pub fn get(&self, class: ServiceClass) -> u32 {
        match class {
            ServiceClass::A => self.a,
            ServiceClass::B => self.b,
        }
    }

    pub fn increment(&mut self, class: ServiceClass) {
        match class {
            ServiceClass::A => self.a = self.a.saturating_add(1),
            ServiceClass::B => self.b = self.b.saturating_add(1),
        }
    }

    pub fn total(&self) -> u32 {
        self.a.saturating_add(self.b)
    }

    pub fn is_zero(&self) -> bool {
        self.a == 0 && self.b == 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Server {
    pub server_id: String,
    pub tenant_id: String,
    pub server_name: String,
    /// Slots one credential on this server grants, per service class.
    ///
    /// A server with zero slots for both classes is never a sharing candidate.
    #[serde(default)]
    pub slots_per_credential: ClassCounts,
    #[serde(default)]
    pub monthly_price: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Customer {
    pub customer_id: String,
    pub tenant_id: String,
    pub server_id: String,
    pub service_class: ServiceClass,
    /// Stored login: ciphertext, or plaintext for rows written before encryption.
    #[serde(default)]
    pub login: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub expires_on: Option<NaiveDate>,
    pub display_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    #[test]
    fn class_counts_track_per_class_totals() {
        let mut counts = ClassCounts::default();
        assert!(counts.is_zero());
        counts.increment(ServiceClass::A);
        counts.increment(ServiceClass::A);
        counts.increment(ServiceClass::B);
        assert_eq!(counts, ClassCounts::new(2, 1));
        assert_eq!(counts.get(ServiceClass::A), 2);
        assert_eq!(counts.get(ServiceClass::B), 1);
        assert_eq!(counts.total(), 3);
    }

    #[test]
    fn legacy_customer_rows_deserialize_without_credentials() {
        let customer: Customer = serde_json::from_value(serde_json::json!({
            "customer_id": "c1",
            "tenant_id": "t1",
            "server_id": "s1",
            "service_class": "b",
            "display_name": "alice",
        }))
        .unwrap();
        assert_eq!(customer.login, None);
        assert_eq!(customer.password, None);
        assert_eq!(customer.expires_on, None);
        assert_eq!(customer.service_class, ServiceClass::B);
    }

    #[test]
    fn validation_rejects_bad_prices_and_names() {
        assert!(validate_monthly_price(-1.0).is_err());
        assert!(validate_monthly_price(f64::NAN).is_err());
        assert!(validate_monthly_price(0.0).is_ok());
        assert!(validate_display_name("  ").is_err());
        assert!(validate_display_name("bob").is_ok());
    }
}
