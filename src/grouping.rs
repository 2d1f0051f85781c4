use std::collections::{BTreeMap, HashMap};

use chrono::NaiveDate;

use crate::{credentials::DecryptedCustomer, domain::ClassCounts};

/// Decrypted `(login, password)` pair a group is keyed on. A missing password keys as "".
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CredentialKey {
    pub login: String,
    pub password: String,
}

impl CredentialKey {
    pub fn new(login: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            login: login.into(),
            password: password.into(),
        }
    }

    /// `None` for records that can never share a credential.
    pub fn of(customer: &DecryptedCustomer) -> Option<Self> {
        let login = customer.login()?;
        Some(Self::new(login, customer.password()))
    }
}

#[derive(Debug, Clone)]
pub struct CredentialGroup {
    pub server_id: String,
    pub key: CredentialKey,
    /// Snapshot order.
    pub members: Vec<DecryptedCustomer>,
}

impl CredentialGroup {
    pub fn used(&self) -> ClassCounts {
        let mut used = ClassCounts::default();
        for member in &self.members {
            used.increment(member.record.service_class);
        }
        used
    }

    /// Earliest member expiration. Members are expected to share one date; when they
    /// don't, the soonest one is what the shared credential can actually be sold against.
    pub fn representative_expiry(&self) -> Option<NaiveDate> {
        self.members
            .iter()
            .filter_map(|m| m.record.expires_on)
            .min()
    }

    pub fn has_mixed_expiry(&self) -> bool {
        let mut dates = self.members.iter().map(|m| m.record.expires_on);
        match dates.next() {
            Some(first) => dates.any(|d| d != first),
            None => false,
        }
    }

    pub fn member_names(&self) -> Vec<String> {
        self.members
            .iter()
            .map(|m| m.record.display_name.clone())
            .collect()
    }

    /// Stored (encrypted) login/password of the first member, reused verbatim on attach.
    pub fn stored_credential(&self) -> (Option<String>, Option<String>) {
        self.members
            .first()
            .map(|m| (m.record.login.clone(), m.record.password.clone()))
            .unwrap_or((None, None))
    }
}

/// Groups one server's records by decrypted credential. Records on other servers are ignored.
pub fn group_server(
    server_id: &str,
    customers: &[DecryptedCustomer],
) -> BTreeMap<CredentialKey, CredentialGroup> {
    let mut groups: BTreeMap<CredentialKey, CredentialGroup> = BTreeMap::new();
    for customer in customers {
        if customer.record.server_id != server_id {
            continue;
        }
        let Some(key) = CredentialKey::of(customer) else {
            continue;
        };
        groups
            .entry(key.clone())
            .or_insert_with(|| CredentialGroup {
                server_id: server_id.to_string(),
                key,
                members: Vec::new(),
            })
            .members
            .push(customer.clone());
    }
    groups
}

/// Groups every record, per server.
pub fn group_by_credential(
    customers: &[DecryptedCustomer],
) -> BTreeMap<String, BTreeMap<CredentialKey, CredentialGroup>> {
    let mut out: BTreeMap<String, BTreeMap<CredentialKey, CredentialGroup>> = BTreeMap::new();
    for customer in customers {
        let Some(key) = CredentialKey::of(customer) else {
            continue;
        };
        let server_id = &customer.record.server_id;
        out.entry(server_id.clone())
            .or_default()
            .entry(key.clone())
            .or_insert_with(|| CredentialGroup {
                server_id: server_id.clone(),
                key,
                members: Vec::new(),
            })
            .members
            .push(customer.clone());
    }
    out
}

/// How many records system-wide use each decrypted login.
///
/// Must be built from a snapshot read across every tenant and server.
#[derive(Debug, Clone, Default)]
pub struct GlobalUsage {
    counts: HashMap<String, u32>,
}

impl GlobalUsage {
    pub fn from_customers(customers: &[DecryptedCustomer]) -> Self {
        let mut counts: HashMap<String, u32> = HashMap::new();
        for login in customers.iter().filter_map(DecryptedCustomer::login) {
            let n = counts.entry(login.to_string()).or_default();
            *n = n.saturating_add(1);
        }
        Self { counts }
    }

    pub fn count(&self, login: &str) -> u32 {
        self.counts.get(login).copied().unwrap_or(0)
    }
}

pub fn global_usage_count(login: &str, customers: &[DecryptedCustomer]) -> u32 {
    customers
        .iter()
        .filter(|c| c.login() == Some(login))
        .count() as u32
}
