use std::sync::Arc;

use axum::{
    extract::{FromRequestParts, Request, State},
    http::{header::AUTHORIZATION, request::Parts},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::cache::ServerSession;
use crate::error::{Code, Error, Forward};
use crate::server::AppState;
use crate::server::response::ApiError;
use crate::types::LayoutAmounts;

/// Extractor that requires a valid api credential.
pub struct RequireSession(pub ServerSession);

/// What a handler served, attached to its response for metering.
#[derive(Debug, Clone)]
pub struct Usage {
    pub session: ServerSession,
    pub amounts: LayoutAmounts,
    pub description: Option<String>,
}

impl FromRequestParts<Arc<AppState>> for RequireSession {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|h| h.to_str().ok())
            .map(str::to_string);

        let gate = state.gate.clone();
        let session = tokio::task::spawn_blocking(move || gate.authenticate(header.as_deref()))
            .await
            .map_err(|e| Error::new("2cafdaa8-dd46-451a-9387-c33b3861919a", Code::Internal, "Auth task failed.").with_cause(e))?
            .forward("6b6b219b-ad88-4d3d-bd7b-702a8f75b0e6")?;

        Ok(RequireSession(session))
    }
}

/// Records the quota transaction for every response that reports [`Usage`].
///
/// A request that turns out to be over budget is answered with the quota
/// error instead of the handler's body.
pub async fn account_usage(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let mut response = next.run(request).await;

    let Some(usage) = response.extensions_mut().remove::<Usage>() else {
        return response;
    };

    if !response.status().is_success() {
        return response;
    }

    let gate = state.gate.clone();
    let recorded = tokio::task::spawn_blocking(move || {
        gate.record_transaction(&usage.session, usage.amounts, usage.description)
    })
    .await;

    match recorded {
        Ok(Ok(_)) => response,
        Ok(Err(e)) => ApiError::from(e.forward("565c3c93-077c-4007-b3a6-9fcea34001ff")).into_response(),
        Err(e) => ApiError::from(
            Error::new("8a67c101-8a95-4f8c-819e-cd4259cbbc5e", Code::Internal, "Accounting task failed.").with_cause(e),
        )
        .into_response(),
    }
}
