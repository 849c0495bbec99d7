use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Query, Request, State};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::{Router, routing::get};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::response::{ApiError, ApiResponse};
use crate::auth::{AuthGate, RequireSession, Usage, account_usage};
use crate::cache::SessionCache;
use crate::error::{Code, Error, Forward};
use crate::flags::Flag;
use crate::store::{Store, blocking};
use crate::types::{LayoutAmounts, PropertyAddress};

pub struct AppState {
    pub store: Arc<dyn Store>,
    pub cache: Arc<dyn SessionCache>,
    pub gate: AuthGate,
}

impl AppState {
    pub fn new(store: Arc<dyn Store>, cache: Arc<dyn SessionCache>) -> Self {
        let gate = AuthGate::new(store.clone(), cache.clone());
        Self { store, cache, gate }
    }
}

async fn health() -> &'static str {
    "OK"
}

async fn log_request(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = Instant::now();

    let response = next.run(request).await;

    let latency = start.elapsed();
    let status = response.status();

    tracing::info!(
        "{} {} {} {}ms",
        method,
        uri.path(),
        status.as_u16(),
        latency.as_millis()
    );

    response
}

#[derive(Debug, Serialize)]
struct SessionView {
    id: Uuid,
    organization_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    key_id: Option<Uuid>,
    role_name: String,
    timezone: String,
    flags: Vec<&'static str>,
}

/// Echoes the caller's session. Costs the base unit.
async fn get_session(RequireSession(session): RequireSession) -> Response {
    let view = SessionView {
        id: session.id,
        organization_id: session.organization_id,
        key_id: session.key_id,
        role_name: session.role_name.clone(),
        timezone: session.timezone.clone(),
        flags: session.flags.iter().map(|f| f.name()).collect(),
    };

    let mut response = ApiResponse::success(view).into_response();
    response.extensions_mut().insert(Usage {
        session,
        amounts: LayoutAmounts::default(),
        description: Some("GET /api/v1/session".into()),
    });
    response
}

#[derive(Debug, Deserialize)]
struct AddressQuery {
    fips: String,
    after: Option<Uuid>,
    limit: Option<usize>,
}

const MAX_ADDRESS_PAGE: usize = 100;

/// Lists canonical addresses of a county. Costs one address unit per row.
async fn list_addresses(
    State(state): State<Arc<AppState>>,
    RequireSession(session): RequireSession,
    Query(query): Query<AddressQuery>,
) -> Result<Response, ApiError> {
    session.flags.require(Flag::ApiAddressLayoutEnabled)?;

    if query.fips.is_empty() {
        return Err(Error::new("49fd12d8-4be8-4771-81d8-21b2cd00e850", Code::InvalidArgument, "Missing fips.").into());
    }

    let limit = query.limit.unwrap_or(MAX_ADDRESS_PAGE).clamp(1, MAX_ADDRESS_PAGE);
    let store = state.store.clone();
    let addresses: Vec<PropertyAddress> =
        blocking(move || store.select_addresses_by_fips(&query.fips, query.after, limit))
            .await
            .forward("7e01a7c1-3284-4f4e-ae95-d683773d2934")?;

    // At most MAX_ADDRESS_PAGE rows.
    let amounts = LayoutAmounts {
        address: addresses.len() as i32,
        ..Default::default()
    };

    let mut response = ApiResponse::success(addresses).into_response();
    response.extensions_mut().insert(Usage {
        session,
        amounts,
        description: Some("GET /api/v1/addresses".into()),
    });
    Ok(response)
}

pub fn create_router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/session", get(get_session))
        .route("/addresses", get(list_addresses))
        .layer(middleware::from_fn_with_state(state.clone(), account_usage));

    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", api)
        .layer(middleware::from_fn(log_request))
        .with_state(state)
}
