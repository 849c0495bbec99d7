use std::fmt;

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

/// Semantic error kinds shared by every layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Code {
    Canceled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

impl Code {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Code::Canceled => "CANCELED",
            Code::Unknown => "UNKNOWN",
            Code::InvalidArgument => "INVALID_ARGUMENT",
            Code::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Code::NotFound => "NOT_FOUND",
            Code::AlreadyExists => "ALREADY_EXISTS",
            Code::PermissionDenied => "PERMISSION_DENIED",
            Code::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Code::FailedPrecondition => "FAILED_PRECONDITION",
            Code::Aborted => "ABORTED",
            Code::OutOfRange => "OUT_OF_RANGE",
            Code::Unimplemented => "UNIMPLEMENTED",
            Code::Internal => "INTERNAL",
            Code::Unavailable => "UNAVAILABLE",
            Code::DataLoss => "DATA_LOSS",
            Code::Unauthenticated => "UNAUTHENTICATED",
        }
    }

    /// HTTP status used when the error reaches the public surface.
    #[must_use]
    pub fn http_status(self) -> u16 {
        match self {
            Code::Canceled => 499,
            Code::Unknown => 500,
            Code::InvalidArgument => 400,
            Code::DeadlineExceeded => 504,
            Code::NotFound => 404,
            Code::AlreadyExists => 409,
            Code::PermissionDenied => 403,
            Code::ResourceExhausted => 429,
            Code::FailedPrecondition => 400,
            Code::Aborted => 409,
            Code::OutOfRange => 400,
            Code::Unimplemented => 501,
            Code::Internal => 500,
            Code::Unavailable => 503,
            Code::DataLoss => 500,
            Code::Unauthenticated => 401,
        }
    }

    fn is_internal(self) -> bool {
        matches!(self, Code::Internal | Code::Unknown)
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured error raised at a single origin site.
///
/// `id` is a UUID literal unique to the site that built the error, so an
/// incident report can be traced back to one line of code.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorObject {
    pub id: &'static str,
    pub code: Code,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<&'static str>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub meta: Map<String, Value>,
}

impl fmt::Display for ErrorObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "id:{} code:{}", self.id, self.code)?;
        if let Some(label) = self.label {
            write!(f, " label:{label}")?;
        }
        if !self.detail.is_empty() {
            write!(f, " detail:{}", self.detail)?;
        }
        if let Some(cause) = &self.cause {
            write!(f, " cause:{cause}")?;
        }
        if !self.meta.is_empty() {
            write!(f, " meta:{}", Value::Object(self.meta.clone()))?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Object(Box<ErrorObject>),

    #[error("id:{id} > {source}")]
    Forwarded {
        id: &'static str,
        source: Box<Error>,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn new(id: &'static str, code: Code, detail: impl Into<String>) -> Self {
        Error::Object(Box::new(ErrorObject {
            id,
            code,
            label: None,
            detail: detail.into(),
            cause: None,
            meta: Map::new(),
        }))
    }

    /// Attaches a stable machine-readable label. No-op unless this is an origin object.
    #[must_use]
    pub fn with_label(mut self, label: &'static str) -> Self {
        if let Error::Object(obj) = &mut self {
            obj.label = Some(label);
        }
        self
    }

    #[must_use]
    pub fn with_cause(mut self, cause: impl fmt::Display) -> Self {
        if let Error::Object(obj) = &mut self {
            obj.cause = Some(cause.to_string());
        }
        self
    }

    #[must_use]
    pub fn with_meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        if let Error::Object(obj) = &mut self {
            obj.meta.insert(key.to_string(), value.into());
        }
        self
    }

    /// Wraps this error with the id of the site that is passing it up.
    #[must_use]
    pub fn forward(self, id: &'static str) -> Self {
        Error::Forwarded {
            id,
            source: Box::new(self),
        }
    }

    /// The innermost error of a forward chain.
    #[must_use]
    pub fn first(&self) -> &Error {
        let mut current = self;
        while let Error::Forwarded { source, .. } = current {
            current = source;
        }
        current
    }

    /// Id of the outermost site that touched this error.
    #[must_use]
    pub fn last_id(&self) -> Option<&'static str> {
        match self {
            Error::Forwarded { id, .. } => Some(id),
            Error::Object(obj) => Some(obj.id),
            _ => None,
        }
    }

    /// Id of the site that raised this error.
    #[must_use]
    pub fn origin_id(&self) -> Option<&'static str> {
        match self.first() {
            Error::Object(obj) => Some(obj.id),
            _ => None,
        }
    }

    #[must_use]
    pub fn code(&self) -> Code {
        match self.first() {
            Error::Object(obj) => obj.code,
            _ => Code::Unknown,
        }
    }

    #[must_use]
    pub fn label(&self) -> Option<&'static str> {
        match self.first() {
            Error::Object(obj) => obj.label,
            _ => None,
        }
    }

    #[must_use]
    pub fn is(&self, code: Code) -> bool {
        self.code() == code
    }

    /// Reduces the chain to something safe to show a caller.
    ///
    /// Client-facing kinds pass through with their detail and label. Internal
    /// failures collapse into a generic object that only carries the origin id.
    #[must_use]
    pub fn sanitize(&self) -> ErrorObject {
        match self.first() {
            Error::Object(obj) if !obj.code.is_internal() => ErrorObject {
                id: obj.id,
                code: obj.code,
                label: obj.label,
                detail: obj.detail.clone(),
                cause: None,
                meta: Map::new(),
            },
            other => ErrorObject {
                id: other.origin_id().unwrap_or("00000000-0000-0000-0000-000000000000"),
                code: Code::Internal,
                label: None,
                detail: "Internal error.".to_string(),
                cause: None,
                meta: Map::new(),
            },
        }
    }
}

/// `?`-friendly forwarding for any result whose error converts into [`Error`].
pub trait Forward<T> {
    fn forward(self, id: &'static str) -> Result<T>;
}

impl<T, E: Into<Error>> Forward<T> for std::result::Result<T, E> {
    fn forward(self, id: &'static str) -> Result<T> {
        self.map_err(|e| e.into().forward(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_keeps_origin_code_and_label() {
        let err = Error::new("a", Code::ResourceExhausted, "Too many requests.")
            .with_label("DAILY_QUOTA_EXHAUSTED")
            .forward("b")
            .forward("c");

        assert_eq!(err.code(), Code::ResourceExhausted);
        assert_eq!(err.label(), Some("DAILY_QUOTA_EXHAUSTED"));
        assert_eq!(err.origin_id(), Some("a"));
        assert_eq!(err.last_id(), Some("c"));
    }

    #[test]
    fn test_display_renders_parts() {
        let err = Error::new("x", Code::InvalidArgument, "Bad value.")
            .with_cause("parse failure")
            .with_meta("field", "zip5");

        assert_eq!(
            err.to_string(),
            r#"id:x code:INVALID_ARGUMENT detail:Bad value. cause:parse failure meta:{"field":"zip5"}"#
        );
    }

    #[test]
    fn test_database_errors_are_unknown() {
        let err: Error = rusqlite::Error::QueryReturnedNoRows.into();
        assert_eq!(err.code(), Code::Unknown);
        assert_eq!(err.sanitize().code, Code::Internal);
    }

    #[test]
    fn test_sanitize_passes_client_errors() {
        let err = Error::new("q", Code::Unauthenticated, "Unauthorized.").forward("r");
        let clean = err.sanitize();
        assert_eq!(clean.code, Code::Unauthenticated);
        assert_eq!(clean.id, "q");
        assert_eq!(Code::Unauthenticated.http_status(), 401);
    }

    #[test]
    fn test_result_forward() {
        let res: std::result::Result<(), std::io::Error> =
            Err(std::io::Error::other("boom"));
        let err = res.forward("site").unwrap_err();
        assert_eq!(err.last_id(), Some("site"));
        assert!(matches!(err.first(), Error::Io(_)));
    }
}
