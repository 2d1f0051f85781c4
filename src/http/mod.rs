use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, FromRequest, FromRequestParts, Query, Request},
    http::{StatusCode, request::Parts},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio::sync::Mutex;

use crate::{
    config::{Config, VERSION},
    credentials::CredentialCipher,
    domain::{Customer, DomainError, Server, ServiceClass, validate_monthly_price},
    engine::{
        AttachRequest, Attached, OfferQuery, OfferReport, Snapshot, attach_customer,
        compute_offers, register_customer,
    },
    pricing::{ProRataQuote, pro_rata_quote},
    revocation::{RevocationOutcome, RevocationTarget, revoke},
    state::{JsonSnapshotStore, NewCustomer, SnapshotSource, StoreError},
};

pub const TENANT_HEADER: &str = "x-tenant-id";

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<Mutex<JsonSnapshotStore>>,
    pub cipher: Arc<dyn CredentialCipher>,
}

impl AppState {
    fn today(&self, requested: Option<NaiveDate>) -> NaiveDate {
        requested.unwrap_or_else(|| self.config.today())
    }
}

#[derive(Debug)]
pub struct ApiError {
    code: &'static str,
    message: String,
    status: StatusCode,
    details: Map<String, Value>,
}

impl ApiError {
    fn new(code: &'static str, status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            status,
            details: Map::new(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new("invalid_request", StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("not_found", StatusCode::NOT_FOUND, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new("conflict", StatusCode::CONFLICT, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new("internal", StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }
}

impl From<DomainError> for ApiError {
    fn from(value: DomainError) -> Self {
        match value.code() {
            "not_found" => ApiError::not_found(value.to_string()),
            "conflict" => match &value {
                DomainError::NoSlotAvailable { service_class, .. } => {
                    let class = service_class.as_str();
                    ApiError::conflict(value.to_string()).with_detail("service_class", class)
                }
                _ => ApiError::conflict(value.to_string()),
            },
            _ => ApiError::invalid_request(value.to_string()),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Domain(domain) => domain.into(),
            StoreError::SchemaVersionMismatch { .. } => ApiError::internal(value.to_string()),
            StoreError::Io(_) | StoreError::SerdeJson(_) => ApiError::internal(value.to_string()),
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: String,
    message: String,
    details: Map<String, Value>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: ErrorBody {
                code: self.code.to_string(),
                message: self.message,
                details: self.details,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

pub struct ApiJson<T>(pub T);

#[axum::async_trait]
impl<S, T> FromRequest<S> for ApiJson<T>
where
    axum::Json<T>: FromRequest<S>,
    <axum::Json<T> as FromRequest<S>>::Rejection: std::fmt::Display,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = axum::Json::<T>::from_request(req, state)
            .await
            .map_err(|e| ApiError::invalid_request(e.to_string()))?;
        Ok(Self(value))
    }
}

/// Caller's tenant, from the `x-tenant-id` header.
pub struct Tenant(pub String);

#[axum::async_trait]
impl<S> FromRequestParts<S> for Tenant
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let tenant_id = parts
            .headers
            .get(TENANT_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ApiError::invalid_request(format!("missing {TENANT_HEADER} header")))?;
        Ok(Self(tenant_id.to_string()))
    }
}

#[derive(Serialize)]
struct Items<T> {
    items: Vec<T>,
}

pub fn build_router(
    config: Config,
    store: Arc<Mutex<JsonSnapshotStore>>,
    cipher: Arc<dyn CredentialCipher>,
) -> Router {
    let app_state = AppState {
        config: Arc::new(config),
        store,
        cipher,
    };

    let api = Router::new()
        .route("/health", get(health))
        .route("/servers", get(list_servers))
        .route("/offers", get(list_offers))
        .route("/pricing/pro-rata", get(get_pro_rata))
        .route("/customers", post(create_customer))
        .route("/attachments", post(create_attachment))
        .route("/revocations", post(create_revocation))
        .fallback(fallback_not_found);

    Router::new()
        .nest("/api", api)
        .layer(Extension(app_state))
}

async fn fallback_not_found() -> ApiError {
    ApiError::not_found("not found")
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "version": VERSION }))
}

async fn list_servers(
    Extension(state): Extension<AppState>,
    Tenant(tenant_id): Tenant,
) -> Json<Items<Server>> {
    let store = state.store.lock().await;
    Json(Items {
        items: store.list_servers(&tenant_id),
    })
}

#[derive(Debug, Deserialize)]
struct OffersParams {
    server_id: Option<String>,
    plan_days: Option<i64>,
    today: Option<NaiveDate>,
}

async fn list_offers(
    Extension(state): Extension<AppState>,
    Tenant(tenant_id): Tenant,
    Query(params): Query<OffersParams>,
) -> Result<Json<OfferReport>, ApiError> {
    if let Some(plan_days) = params.plan_days.filter(|d| *d < 0) {
        return Err(DomainError::InvalidPlanDays { plan_days }.into());
    }

    let snapshot = {
        let store = state.store.lock().await;
        Snapshot::read(&*store, &tenant_id)
    };
    let query = OfferQuery {
        server_id: params.server_id,
        plan_days: params.plan_days,
    };
    let report = compute_offers(
        &snapshot,
        state.cipher.as_ref(),
        &query,
        state.today(params.today),
    )
    .await;
    Ok(Json(report))
}

#[derive(Debug, Deserialize)]
struct ProRataParams {
    monthly_price: f64,
    today: Option<NaiveDate>,
}

async fn get_pro_rata(
    Extension(state): Extension<AppState>,
    Query(params): Query<ProRataParams>,
) -> Result<Json<ProRataQuote>, ApiError> {
    validate_monthly_price(params.monthly_price)?;
    Ok(Json(pro_rata_quote(
        params.monthly_price,
        state.today(params.today),
    )))
}

#[derive(Debug, Deserialize)]
struct CreateCustomerRequest {
    server_id: String,
    service_class: ServiceClass,
    #[serde(default)]
    login: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    expires_on: Option<NaiveDate>,
    display_name: String,
}

async fn create_customer(
    Extension(state): Extension<AppState>,
    Tenant(tenant_id): Tenant,
    ApiJson(req): ApiJson<CreateCustomerRequest>,
) -> Result<(StatusCode, Json<Customer>), ApiError> {
    let customer = register_customer(
        &state.store,
        state.cipher.as_ref(),
        NewCustomer {
            tenant_id,
            server_id: req.server_id,
            service_class: req.service_class,
            login: req.login,
            password: req.password,
            expires_on: req.expires_on,
            display_name: req.display_name,
        },
    )
    .await?;
    Ok((StatusCode::CREATED, Json(customer)))
}

#[derive(Debug, Deserialize)]
struct CreateAttachmentRequest {
    server_id: String,
    login: String,
    #[serde(default)]
    password: Option<String>,
    service_class: ServiceClass,
    display_name: String,
    #[serde(default)]
    today: Option<NaiveDate>,
}

async fn create_attachment(
    Extension(state): Extension<AppState>,
    Tenant(tenant_id): Tenant,
    ApiJson(req): ApiJson<CreateAttachmentRequest>,
) -> Result<(StatusCode, Json<Attached>), ApiError> {
    let today = state.today(req.today);
    let attached = attach_customer(
        &state.store,
        state.cipher.as_ref(),
        AttachRequest {
            tenant_id,
            server_id: req.server_id,
            login: req.login,
            password: req.password,
            service_class: req.service_class,
            display_name: req.display_name,
        },
        today,
    )
    .await?;
    Ok((StatusCode::CREATED, Json(attached)))
}

async fn create_revocation(
    Extension(state): Extension<AppState>,
    Tenant(tenant_id): Tenant,
    ApiJson(target): ApiJson<RevocationTarget>,
) -> Result<Json<RevocationOutcome>, ApiError> {
    {
        let store = state.store.lock().await;
        store
            .get_server(&target.server_id)
            .filter(|s| s.tenant_id == tenant_id)
            .ok_or_else(|| DomainError::MissingServer {
                server_id: target.server_id.clone(),
            })?;
    }

    let outcome = revoke(&state.store, state.cipher.as_ref(), &tenant_id, &target).await?;
    Ok(Json(outcome))
}
