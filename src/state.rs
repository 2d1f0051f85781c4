use std::{
    collections::BTreeMap,
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::{
    domain::{
        ClassCounts, Customer, DomainError, Server, ServiceClass, validate_display_name,
        validate_monthly_price,
    },
    id::{new_customer_id, new_server_id},
};

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone)]
pub struct StoreInit {
    pub data_dir: PathBuf,
}

#[derive(Debug)]
pub enum StoreError {
    Io(io::Error),
    SerdeJson(serde_json::Error),
    Domain(DomainError),
    SchemaVersionMismatch { expected: u32, got: u32 },
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "io error: {e}"),
            Self::SerdeJson(e) => write!(f, "json error: {e}"),
            Self::Domain(e) => write!(f, "{e}"),
            Self::SchemaVersionMismatch { expected, got } => {
                write!(f, "schema_version mismatch: expected {expected}, got {got}")
            }
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::SerdeJson(e) => Some(e),
            Self::Domain(e) => Some(e),
            Self::SchemaVersionMismatch { .. } => None,
        }
    }
}

impl From<io::Error> for StoreError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        Self::SerdeJson(value)
    }
}

impl From<DomainError> for StoreError {
    fn from(value: DomainError) -> Self {
        Self::Domain(value)
    }
}

/// Which customer records a read may see.
///
/// `Global` crosses tenant boundaries and exists for the share-cap count; every call site
/// that passes it is a deliberate cross-tenant read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    Tenant(String),
    Global,
}

impl Scope {
    fn admits(&self, customer: &Customer) -> bool {
        match self {
            Self::Tenant(tenant_id) => &customer.tenant_id == tenant_id,
            Self::Global => true,
        }
    }
}

pub trait SnapshotSource {
    fn list_servers(&self, tenant_id: &str) -> Vec<Server>;
    fn get_server(&self, server_id: &str) -> Option<Server>;
    fn list_customers(&self, scope: &Scope) -> Vec<Customer>;
}

pub trait CustomerStore: SnapshotSource {
    fn insert_customer(&mut self, customer: Customer) -> Result<Customer, StoreError>;

    /// Removes every listed record or none of them; returns how many existed.
    fn delete_customers(&mut self, customer_ids: &[String]) -> Result<usize, StoreError>;

    /// Validates and stores a new record under a fresh id.
    ///
    /// The server must exist and belong to the record's tenant.
    fn create_customer(&mut self, new: NewCustomer) -> Result<Customer, StoreError> {
        validate_display_name(&new.display_name)?;
        if self
            .get_server(&new.server_id)
            .is_none_or(|s| s.tenant_id != new.tenant_id)
        {
            return Err(DomainError::MissingServer {
                server_id: new.server_id,
            }
            .into());
        }

        let customer = Customer {
            customer_id: new_customer_id(),
            tenant_id: new.tenant_id,
            server_id: new.server_id,
            service_class: new.service_class,
            login: new.login,
            password: new.password,
            expires_on: new.expires_on,
            display_name: new.display_name,
        };
        self.insert_customer(customer)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistedState {
    pub schema_version: u32,
    #[serde(default)]
    pub servers: BTreeMap<String, Server>,
    #[serde(default)]
    pub customers: BTreeMap<String, Customer>,
}

impl PersistedState {
    pub fn empty() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            servers: BTreeMap::new(),
            customers: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewCustomer {
    pub tenant_id: String,
    pub server_id: String,
    pub service_class: ServiceClass,
    pub login: Option<String>,
    pub password: Option<String>,
    pub expires_on: Option<NaiveDate>,
    pub display_name: String,
}

pub struct JsonSnapshotStore {
    state_path: PathBuf,
    state: PersistedState,
}

impl JsonSnapshotStore {
    pub fn load_or_init(init: StoreInit) -> Result<Self, StoreError> {
        fs::create_dir_all(&init.data_dir)?;

        let state_path = init.data_dir.join("state.json");
        let (state, is_new_state) = if state_path.exists() {
            let bytes = fs::read(&state_path)?;
            let state: PersistedState = serde_json::from_slice(&bytes)?;
            if state.schema_version != SCHEMA_VERSION {
                return Err(StoreError::SchemaVersionMismatch {
                    expected: SCHEMA_VERSION,
                    got: state.schema_version,
                });
            }
            (state, false)
        } else {
            (PersistedState::empty(), true)
        };

        let store = Self { state_path, state };
        if is_new_state {
            store.save()?;
        }
        Ok(store)
    }

    pub fn state(&self) -> &PersistedState {
        &self.state
    }

    pub fn save(&self) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(&self.state)?;
        write_atomic(&self.state_path, &bytes)?;
        Ok(())
    }

    pub fn create_server(
        &mut self,
        tenant_id: String,
        server_name: String,
        slots_per_credential: ClassCounts,
        monthly_price: Option<f64>,
    ) -> Result<Server, StoreError> {
        if let Some(price) = monthly_price {
            validate_monthly_price(price)?;
        }

        let server_id = new_server_id();
        let server = Server {
            server_id: server_id.clone(),
            tenant_id,
            server_name,
            slots_per_credential,
            monthly_price,
        };
        self.state.servers.insert(server_id, server.clone());
        self.save()?;
        Ok(server)
    }
}

impl SnapshotSource for JsonSnapshotStore {
    fn list_servers(&self, tenant_id: &str) -> Vec<Server> {
        self.state
            .servers
            .values()
            .filter(|s| s.tenant_id == tenant_id)
            .cloned()
            .collect()
    }

    fn get_server(&self, server_id: &str) -> Option<Server> {
        self.state.servers.get(server_id).cloned()
    }

    fn list_customers(&self, scope: &Scope) -> Vec<Customer> {
        self.state
            .customers
            .values()
            .filter(|c| scope.admits(c))
            .cloned()
            .collect()
    }
}

impl CustomerStore for JsonSnapshotStore {
    fn insert_customer(&mut self, customer: Customer) -> Result<Customer, StoreError> {
        let previous = self
            .state
            .customers
            .insert(customer.customer_id.clone(), customer.clone());
        if let Err(err) = self.save() {
            match previous {
                Some(prev) => self.state.customers.insert(prev.customer_id.clone(), prev),
                None => self.state.customers.remove(&customer.customer_id),
            };
            return Err(err);
        }
        Ok(customer)
    }

    fn delete_customers(&mut self, customer_ids: &[String]) -> Result<usize, StoreError> {
        let mut removed = Vec::new();
        for customer_id in customer_ids {
            if let Some(customer) = self.state.customers.remove(customer_id) {
                removed.push(customer);
            }
        }
        if removed.is_empty() {
            return Ok(0);
        }
        if let Err(err) = self.save() {
            // Put everything back so memory matches what is still on disk.
            for customer in removed {
                self.state
                    .customers
                    .insert(customer.customer_id.clone(), customer);
            }
            return Err(err);
        }
        Ok(removed.len())
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), io::Error> {
    let dir = path.parent().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "path has no parent directory")
    })?;
    let file_name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let tmp_path = dir.join(format!("{}.tmp", file_name.to_string_lossy()));
    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.write_all(b"\n")?;
        let _ = file.sync_all();
    }

    #[cfg(windows)]
    {
        if path.exists() {
            let _ = fs::remove_file(path);
        }
    }

    fs::rename(tmp_path, path)?;
    Ok(())
}
