use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;

use crate::error::{Code, Error, Result};
use crate::types::ApiKeyType;

/// Wire marker of legacy api keys.
pub const LEGACY_MARKER: &str = "AM.p.";

const SECRET_BYTES: usize = 32;

/// A credential reduced to what the store and cache are keyed by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub key_type: ApiKeyType,
    pub key_hash: String,
}

fn key_type_for(raw: &str) -> Option<(ApiKeyType, &str)> {
    raw.strip_prefix(LEGACY_MARKER)
        .map(|secret| (ApiKeyType::Legacy, secret))
}

/// Parses an `Authorization` header value. Everything after `Bearer ` is the
/// key hash as stored; the marker only selects the key type.
pub fn parse_credential(header: &str) -> Result<Credential> {
    let raw = header.strip_prefix("Bearer ").unwrap_or(header);
    if raw.is_empty() {
        return Err(Error::new("cfbaa72a-a846-415c-9c86-fe138a4bcbac", Code::InvalidArgument, "Missing auth header."));
    }

    let Some((key_type, secret)) = key_type_for(raw) else {
        return Err(Error::new("d970215d-7765-4f6c-8af0-9374fab024e2", Code::InvalidArgument, "Invalid api key."));
    };

    if secret.is_empty() {
        return Err(Error::new("443d4047-ff49-4902-8565-4e307440cab6", Code::InvalidArgument, "Invalid api key."));
    }

    Ok(Credential {
        key_type,
        key_hash: raw.to_string(),
    })
}

/// Generates a fresh legacy credential. Returns the raw value to hand out
/// once, and what gets stored.
#[must_use]
pub fn generate_credential() -> (String, Credential) {
    let mut secret = [0u8; SECRET_BYTES];
    rand::thread_rng().fill_bytes(&mut secret);

    let raw = format!("{LEGACY_MARKER}{}", URL_SAFE_NO_PAD.encode(secret));
    let credential = Credential {
        key_type: ApiKeyType::Legacy,
        key_hash: raw.clone(),
    };
    (raw, credential)
}
