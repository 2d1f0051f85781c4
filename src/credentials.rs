use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use futures_util::future::join_all;
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, OnceCell};
use tracing::warn;

use crate::domain::Customer;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecryptionError {
    Malformed { reason: String },
    KeyMismatch,
}

impl std::fmt::Display for DecryptionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed { reason } => write!(f, "malformed ciphertext: {reason}"),
            Self::KeyMismatch => write!(f, "ciphertext was sealed with a different key"),
        }
    }
}

impl std::error::Error for DecryptionError {}

pub type DecryptFuture<'a> = Pin<Box<dyn Future<Output = Result<String, DecryptionError>> + Send + 'a>>;

pub trait CredentialCipher: Send + Sync {
    fn decrypt<'a>(&'a self, ciphertext: &'a str) -> DecryptFuture<'a>;
}

/// For datasets that were never encrypted: every stored value already is the plaintext.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaintextCipher;

impl CredentialCipher for PlaintextCipher {
    fn decrypt<'a>(&'a self, ciphertext: &'a str) -> DecryptFuture<'a> {
        Box::pin(async move { Ok(ciphertext.to_string()) })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DecryptedCredential {
    pub login: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptedCustomer {
    pub record: Customer,
    pub credential: DecryptedCredential,
}

impl DecryptedCustomer {
    pub fn login(&self) -> Option<&str> {
        self.credential.login.as_deref()
    }

    pub fn password(&self) -> &str {
        self.credential.password.as_deref().unwrap_or("")
    }
}

/// Decryption memo for a single computation pass.
///
/// Each customer id is decrypted at most once, even when several callers ask for it
/// concurrently. Dropping the pass drops every plaintext it holds.
pub struct DecryptPass<'c> {
    cipher: &'c dyn CredentialCipher,
    cells: Mutex<HashMap<String, Arc<OnceCell<DecryptedCredential>>>>,
    decrypt_calls: AtomicU64,
    fallbacks: AtomicU64,
}

impl<'c> DecryptPass<'c> {
    pub fn new(cipher: &'c dyn CredentialCipher) -> Self {
        Self {
            cipher,
            cells: Mutex::new(HashMap::new()),
            decrypt_calls: AtomicU64::new(0),
            fallbacks: AtomicU64::new(0),
        }
    }

    pub async fn credential(&self, customer: &Customer) -> DecryptedCredential {
        let cell = {
            let mut cells = self.cells.lock().await;
            cells
                .entry(customer.customer_id.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };
        cell.get_or_init(|| async {
            let login = self
                .decrypt_field(&customer.customer_id, "login", customer.login.as_deref())
                .await;
            let password = self
                .decrypt_field(
                    &customer.customer_id,
                    "password",
                    customer.password.as_deref(),
                )
                .await;
            DecryptedCredential { login, password }
        })
        .await
        .clone()
    }

    pub async fn decrypt_all(&self, customers: &[Customer]) -> Vec<DecryptedCustomer> {
        let credentials = join_all(customers.iter().map(|c| self.credential(c))).await;
        customers
            .iter()
            .cloned()
            .zip(credentials)
            .map(|(record, credential)| DecryptedCustomer { record, credential })
            .collect()
    }

    /// Records whose stored value failed to decrypt and was used as-is.
    pub fn fallback_count(&self) -> u64 {
        self.fallbacks.load(Ordering::Relaxed)
    }

    pub fn decrypt_calls(&self) -> u64 {
        self.decrypt_calls.load(Ordering::Relaxed)
    }

    async fn decrypt_field(
        &self,
        customer_id: &str,
        field: &'static str,
        stored: Option<&str>,
    ) -> Option<String> {
        let stored = stored.filter(|v| !v.is_empty())?;
        self.decrypt_calls.fetch_add(1, Ordering::Relaxed);
        match self.cipher.decrypt(stored).await {
            Ok(plain) if plain.is_empty() => None,
            Ok(plain) => Some(plain),
            Err(err) => {
                self.fallbacks.fetch_add(1, Ordering::Relaxed);
                warn!(
                    customer_id,
                    field,
                    %err,
                    "credential decrypt failed; treating stored value as legacy plaintext"
                );
                Some(stored.to_string())
            }
        }
    }
}

/// Short, log-safe stand-in for a login.
pub fn fingerprint(login: &str) -> String {
    let digest = Sha256::digest(login.as_bytes());
    hex::encode(&digest[..6])
}


#[cfg(test)]
mod tests {
    use super::testing::FakeCipher;
    use super::*;

    use pretty_assertions::assert_eq;

    use crate::domain::ServiceClass;

    fn customer(id: &str, login: Option<&str>, password: Option<&str>) -> Customer {
        Customer {
            customer_id: id.to_string(),
            tenant_id: "t1".to_string(),
            server_id: "s1".to_string(),
            service_class: ServiceClass::A,
            login: login.map(str::to_string),
            password: password.map(str::to_string),
            expires_on: None,
            display_name: id.to_string(),
        }
    }

    #[tokio::test]
    async fn decrypts_sealed_values() {
        let cipher = FakeCipher::default();
        let pass = DecryptPass::new(&cipher);
        let c = customer(
            "c1",
            Some(&FakeCipher::seal("n1", "user@x")),
            Some(&FakeCipher::seal("n2", "pw")),
        );
        let cred = pass.credential(&c).await;
        assert_eq!(cred.login.as_deref(), Some("user@x"));
        assert_eq!(cred.password.as_deref(), Some("pw"));
        assert_eq!(pass.fallback_count(), 0);
    }

    #[tokio::test]
    async fn legacy_plaintext_falls_back_and_is_counted() {
        let cipher = FakeCipher::default();
        let pass = DecryptPass::new(&cipher);
        let c = customer("c1", Some("legacy-login"), Some("legacy-pw"));
        let cred = pass.credential(&c).await;
        assert_eq!(cred.login.as_deref(), Some("legacy-login"));
        assert_eq!(cred.password.as_deref(), Some("legacy-pw"));
        assert_eq!(pass.fallback_count(), 2);
    }

    #[tokio::test]
    async fn missing_or_empty_values_skip_the_cipher() {
        let cipher = FakeCipher::default();
        let pass = DecryptPass::new(&cipher);
        let cred = pass.credential(&customer("c1", None, Some(""))).await;
        assert_eq!(cred, DecryptedCredential::default());
        assert_eq!(cipher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn each_customer_is_decrypted_once_per_pass() {
        let cipher = FakeCipher::default();
        let pass = DecryptPass::new(&cipher);
        let c = customer("c1", Some(&FakeCipher::seal("n", "u")), None);
        let batch = vec![c.clone(), c.clone(), c.clone()];

        let (first, second) = tokio::join!(pass.decrypt_all(&batch), pass.credential(&c));
        assert_eq!(first.len(), 3);
        assert!(first.iter().all(|d| d.login() == Some("u")));
        assert_eq!(second.login.as_deref(), Some("u"));
        assert_eq!(cipher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(pass.decrypt_calls(), 1);

        // A fresh pass starts cold.
        let pass = DecryptPass::new(&cipher);
        pass.credential(&c).await;
        assert_eq!(cipher.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn fingerprint_is_stable_and_short() {
        assert_eq!(fingerprint("abc"), fingerprint("abc"));
        assert_ne!(fingerprint("abc"), fingerprint("abd"));
        assert_eq!(fingerprint("abc").len(), 12);
    }
}
