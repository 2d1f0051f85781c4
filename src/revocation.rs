use serde::{Deserialize, Serialize, Serializer, ser::SerializeStruct};
use tokio::sync::Mutex;
use tracing::info;

use crate::{
    credentials::{CredentialCipher, DecryptPass, DecryptedCustomer, fingerprint},
    state::{CustomerStore, Scope, StoreError},
};

#[derive(Debug, Clone, Deserialize)]
pub struct RevocationTarget {
    pub server_id: String,
    pub login: String,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevocationOutcome {
    Deleted { deleted: usize },
    /// The group was already gone when resolved.
    NothingToDelete,
}

impl RevocationOutcome {
    pub fn deleted(&self) -> usize {
        match self {
            Self::Deleted { deleted } => *deleted,
            Self::NothingToDelete => 0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deleted { .. } => "deleted",
            Self::NothingToDelete => "nothing_to_delete",
        }
    }
}

impl Serialize for RevocationOutcome {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut out = serializer.serialize_struct("RevocationOutcome", 2)?;
        out.serialize_field("outcome", self.as_str())?;
        out.serialize_field("deleted", &self.deleted())?;
        out.end()
    }
}

/// Members of `target`: same server, same decrypted login, and the same decrypted password
/// unless the target leaves it empty.
pub fn resolve_members(customers: &[DecryptedCustomer], target: &RevocationTarget) -> Vec<String> {
    let password = target.password.as_deref().filter(|p| !p.is_empty());
    customers
        .iter()
        .filter(|c| c.record.server_id == target.server_id)
        .filter(|c| c.login() == Some(target.login.as_str()))
        .filter(|c| password.is_none_or(|p| c.password() == p))
        .map(|c| c.record.customer_id.clone())
        .collect()
}

/// Delete every record of `tenant_id` sharing the target credential as one batch.
///
/// Membership is resolved from the live store while holding its lock, never from an
/// earlier offer, so two overlapping revocations cannot leave half a group behind.
/// Records of other tenants are never touched, matching the groups offers are built from.
pub async fn revoke<S: CustomerStore + Send>(
    store: &Mutex<S>,
    cipher: &dyn CredentialCipher,
    tenant_id: &str,
    target: &RevocationTarget,
) -> Result<RevocationOutcome, StoreError> {
    let mut store = store.lock().await;

    let customers: Vec<_> = store
        .list_customers(&Scope::Tenant(tenant_id.to_string()))
        .into_iter()
        .filter(|c| c.server_id == target.server_id)
        .collect();
    let pass = DecryptPass::new(cipher);
    let decrypted = pass.decrypt_all(&customers).await;
    let ids = resolve_members(&decrypted, target);
    if ids.is_empty() {
        info!(
            tenant_id,
            server_id = target.server_id,
            credential = fingerprint(&target.login),
            "revocation resolved no records"
        );
        return Ok(RevocationOutcome::NothingToDelete);
    }

    let deleted = store.delete_customers(&ids)?;
    info!(
        tenant_id,
        server_id = target.server_id,
        credential = fingerprint(&target.login),
        deleted,
        "credential group revoked"
    );
    if deleted == 0 {
        return Ok(RevocationOutcome::NothingToDelete);
    }
    Ok(RevocationOutcome::Deleted { deleted })
}
