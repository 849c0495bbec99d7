use axum::{
    Json,
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use serde_json::json;

use crate::error::{Code, Error, ErrorObject};

/// Standard API response wrapper
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub data: Option<T>,
    pub error: Option<ErrorObject>,
}

impl<T: Serialize> ApiResponse<T> {
    #[must_use]
    pub fn success(data: T) -> Self {
        Self {
            data: Some(data),
            error: None,
        }
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        Json(self).into_response()
    }
}

/// API error that converts to a proper HTTP response.
///
/// Only the sanitized form of the error chain reaches the caller.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub error: ErrorObject,
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let clean = err.sanitize();
        if clean.code == Code::Internal {
            tracing::error!(error = %err, "Request failed");
        }
        Self {
            status: StatusCode::from_u16(clean.code.http_status())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            error: clean,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({ "data": null, "error": self.error });
        let mut response = (self.status, Json(body)).into_response();

        if self.status == StatusCode::UNAUTHORIZED {
            response.headers_mut().insert(
                "WWW-Authenticate",
                HeaderValue::from_static("Bearer realm=\"propline\""),
            );
        }

        response
    }
}
