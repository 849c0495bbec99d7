//! Session and token cache.
//!
//! Every operation is one atomic script against a key/value store: payload,
//! quota and TTL always change together.

pub mod envelope;
mod memory;
mod session;
mod token;

use std::fmt;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use uuid::Uuid;

pub use memory::MemoryCache;
pub use session::{
    NewServerSession, ServerSession, SessionType, create_server_session, delete_server_session,
    select_server_session,
};
pub use token::{
    CreatedToken, NewToken, Token, TokenType, create_token, delete_token, select_token,
    type_key,
};

use crate::types::ApiKeyType;

/// Sentinel failures a cache script can report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptError {
    KeyNotFound,
    InsufficientQuota,
    KeyExists,
    Failed(String),
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptError::KeyNotFound => f.write_str("KEY_NOT_FOUND"),
            ScriptError::InsufficientQuota => f.write_str("INSUFFICIENT_QUOTA"),
            ScriptError::KeyExists => f.write_str("KEY_EXISTS"),
            ScriptError::Failed(msg) => f.write_str(msg),
        }
    }
}

pub type ScriptResult<T> = std::result::Result<T, ScriptError>;

/// Which budget short-circuits an api key at the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaExhausted {
    Daily,
    Monthly,
}

impl QuotaExhausted {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            QuotaExhausted::Daily => "daily",
            QuotaExhausted::Monthly => "monthly",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "daily" => Some(QuotaExhausted::Daily),
            "monthly" => Some(QuotaExhausted::Monthly),
            _ => None,
        }
    }
}

/// The three states cached for an api key. At most one is meaningful:
/// `invalid` wins over `quota_exhausted`, which wins over `session`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApiSessionEntry {
    pub invalid: bool,
    pub quota_exhausted: Option<QuotaExhausted>,
    pub session: Option<Vec<u8>>,
}

/// Script surface of the shared key/value store.
pub trait SessionCache: Send + Sync {
    /// Stores `payload` only if `key` is absent.
    fn create_session(&self, key: &str, ttl: Duration, payload: &[u8]) -> ScriptResult<()>;

    fn select_session(&self, key: &str) -> ScriptResult<Vec<u8>>;

    fn delete_session(&self, key: &str) -> ScriptResult<()>;

    fn create_token(&self, key: &str, ttl: Duration, payload: &[u8], quota: u32)
    -> ScriptResult<()>;

    /// Reads a token, consuming `decrement` units of its quota. The entry is
    /// removed in the same step once its quota reaches zero.
    fn select_token(
        &self,
        key: &str,
        decrement: u32,
        return_quota: bool,
    ) -> ScriptResult<(Vec<u8>, Option<u32>)>;

    fn delete_token(&self, key: &str) -> ScriptResult<()>;

    fn select_api_session(&self, key: &str) -> ScriptResult<ApiSessionEntry>;

    fn update_api_session(&self, key: &str, entry: &ApiSessionEntry, ttl: Duration)
    -> ScriptResult<()>;
}

/// Big-endian u16 in unpadded standard base64, always three characters.
#[must_use]
pub fn u16_raw_base64(v: u16) -> String {
    STANDARD_NO_PAD.encode(v.to_be_bytes())
}

pub fn u16_from_raw_base64(s: &str) -> Option<u16> {
    let bytes = STANDARD_NO_PAD.decode(s).ok()?;
    let arr: [u8; 2] = bytes.try_into().ok()?;
    Some(u16::from_be_bytes(arr))
}

fn short_id(id: Uuid) -> String {
    let mut s = STANDARD.encode(id.as_bytes());
    s.truncate(22);
    s
}

/// Cluster hash tag shared by every key of an organization.
fn org_tag(org: Uuid) -> String {
    format!("{{{}}}", short_id(org))
}

#[must_use]
pub fn session_key(org: Uuid, session_type: SessionType, id: Uuid) -> String {
    format!(
        "{}:sess:{}:{}",
        org_tag(org),
        u16_raw_base64(session_type.code()),
        short_id(id)
    )
}

#[must_use]
pub fn token_key(org: Option<Uuid>, token_type: TokenType, id: Uuid) -> String {
    let tail = format!("tokn:{}:{}", u16_raw_base64(token_type.code()), short_id(id));
    match org.filter(|o| !o.is_nil()) {
        Some(org) => format!("{}:{tail}", org_tag(org)),
        None => tail,
    }
}

#[must_use]
pub fn api_session_key(key_type: ApiKeyType, key_hash: &str) -> String {
    let code = u16::try_from(key_type.code()).unwrap_or_default();
    format!("apik:{}:{key_hash}", u16_raw_base64(code))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_u16_base64() {
        assert_eq!(u16_raw_base64(1), "AAE");
        assert_eq!(u16_raw_base64(100), "AGQ");
        assert_eq!(u16_from_raw_base64("AGQ"), Some(100));
        assert_eq!(u16_from_raw_base64("!!"), None);
    }

    #[test]
    fn test_keys_share_org_tag() {
        let org = Uuid::new_v4();
        let sess = session_key(org, SessionType::ApiServer, Uuid::new_v4());
        let tokn = token_key(Some(org), TokenType::TokenExchange, Uuid::new_v4());

        let tag = &sess[..24];
        assert!(tag.starts_with('{') && tag.ends_with('}'));
        assert!(tokn.starts_with(tag));
        assert!(sess[24..].starts_with(":sess:AGQ:"));
    }

    #[test]
    fn test_token_key_without_org() {
        let key = token_key(None, TokenType::TokenExchange, Uuid::nil());
        assert_eq!(key, "tokn:AGQ:AAAAAAAAAAAAAAAAAAAAAA");
        assert_eq!(
            token_key(Some(Uuid::nil()), TokenType::TokenExchange, Uuid::nil()),
            key
        );
    }

    #[test]
    fn test_api_session_key() {
        assert_eq!(api_session_key(ApiKeyType::Legacy, "abc"), "apik:AGQ:abc");
    }
}
