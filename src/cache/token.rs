use std::time::Duration;

use uuid::Uuid;

use super::envelope::{Decoded, Fields};
use super::{ScriptError, SessionCache, token_key};
use crate::auth::paseto;
use crate::error::{Code, Error, Forward, Result};

// Persisted CBOR tags. Never renumber or reuse.
const TAG_ID: u8 = 1;
const TAG_ORGANIZATION_ID: u8 = 2;
const TAG_TOKEN_TYPE: u8 = 4;
const TAG_BODY: u8 = 5;

/// Claim key under which encoded tokens carry their type.
const TYPE_KEY: u16 = 1;

#[must_use]
pub fn type_key() -> String {
    super::u16_raw_base64(TYPE_KEY)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenType {
    TokenExchange,
}

impl TokenType {
    #[must_use]
    pub fn code(self) -> u16 {
        match self {
            TokenType::TokenExchange => 100,
        }
    }

    #[must_use]
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            100 => Some(TokenType::TokenExchange),
            _ => None,
        }
    }
}

/// A cached token. `quota` travels beside the payload, never inside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub id: Uuid,
    pub organization_id: Option<Uuid>,
    pub token_type: TokenType,
    pub body: Vec<u8>,
    pub quota: u32,
}

impl Token {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Fields::new()
            .uuid(TAG_ID, Some(self.id))
            .uuid(TAG_ORGANIZATION_ID, self.organization_id)
            .uint(TAG_TOKEN_TYPE, u64::from(self.token_type.code()))
            .bytes(TAG_BODY, &self.body)
            .seal()
            .forward("144c4103-49bb-4295-aa9f-be4294f86acf")
    }

    pub fn from_bytes(data: &[u8], quota: u32) -> Result<Self> {
        let d = Decoded::open(data).forward("129d56b2-e5f3-4953-a101-4d73b0a505df")?;

        let token_type = u16::try_from(d.uint(TAG_TOKEN_TYPE)?)
            .ok()
            .and_then(TokenType::from_code)
            .ok_or_else(|| Error::new("1263ad7b-7fd7-4f8f-b651-7666ddf5847c", Code::DataLoss, "Unsupported TokenType in payload."))?;

        Ok(Self {
            id: d.uuid(TAG_ID)?.unwrap_or_default(),
            organization_id: d.uuid(TAG_ORGANIZATION_ID)?,
            token_type,
            body: d.bytes(TAG_BODY)?,
            quota,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewToken {
    pub organization_id: Option<Uuid>,
    pub token_type: u16,
    pub body: Vec<u8>,
    pub quota: u32,
    pub ttl: Duration,

    /// When set, the token is also encoded for the wire with this key.
    pub encode_key: Option<[u8; 32]>,
}

#[derive(Debug, Clone)]
pub struct CreatedToken {
    pub token: Token,
    pub encoded: Option<String>,
}

pub fn create_token(cache: &dyn SessionCache, input: NewToken) -> Result<CreatedToken> {
    let Some(token_type) = TokenType::from_code(input.token_type) else {
        return Err(
            Error::new("f63e07fe-f7af-44a0-a233-e83d29fa4796", Code::InvalidArgument, "Unsupported TokenType.")
                .with_meta("token_type", input.token_type),
        );
    };

    if input.ttl.is_zero() {
        return Err(Error::new("641655e6-4fbe-4215-aa8a-eeb48a51d6ea", Code::InvalidArgument, "TTL is required."));
    }

    let token = Token {
        id: Uuid::new_v4(),
        organization_id: input.organization_id.filter(|o| !o.is_nil()),
        token_type,
        body: input.body,
        quota: input.quota,
    };

    // Encode before touching the cache so a failure leaves nothing behind.
    let encoded = match input.encode_key {
        Some(key) => Some(
            paseto::encode_token(
                &key,
                &paseto::TokenIdentity {
                    id: token.id,
                    organization_id: token.organization_id,
                    token_type: token_type.code(),
                },
                input.ttl,
            )
            .forward("862207a5-e677-46fb-97b1-fbf67a09eb3d")?
            .value,
        ),
        None => None,
    };

    let payload = token.to_bytes().forward("5f969795-e32c-4d0a-973e-89ace56c9f10")?;
    let key = token_key(token.organization_id, token_type, token.id);

    cache
        .create_token(&key, input.ttl, &payload, token.quota)
        .map_err(|e| match e {
            ScriptError::KeyExists => {
                Error::new("a1ce91b9-c13b-458a-8bbc-b418fd6c98ba", Code::Internal, "Failed to create token.")
            }
            other => Error::new("a9a3caa0-07d3-45ba-a2ca-98bafc1f1a9a", Code::Unknown, "Failed to execute script.")
                .with_cause(other),
        })?;

    Ok(CreatedToken { token, encoded })
}

/// Reads a token and consumes `decrement` units of its quota.
pub fn select_token(
    cache: &dyn SessionCache,
    organization_id: Option<Uuid>,
    token_type: TokenType,
    id: Uuid,
    decrement: u32,
    return_quota: bool,
) -> Result<Token> {
    if id.is_nil() {
        return Err(Error::new("5688020d-e995-4682-b2d8-34ba4eb0f5e6", Code::InvalidArgument, "Missing Id."));
    }

    let key = token_key(organization_id, token_type, id);
    let (payload, remaining) =
        cache
            .select_token(&key, decrement, return_quota)
            .map_err(|e| match e {
                ScriptError::KeyNotFound => {
                    Error::new("630bb780-9ccf-4132-bcda-af926ff59cd7", Code::NotFound, "Token not found.")
                }
                ScriptError::InsufficientQuota => {
                    Error::new("9358a5dd-3bd1-4b30-8c7f-b0db7af01c9a", Code::ResourceExhausted, "Insufficient quota.")
                        .with_label("INSUFFICIENT_QUOTA")
                }
                other => Error::new("e42f1177-b4d0-48a7-95ac-36ba278019ae", Code::Unknown, "Failed to execute script.")
                    .with_cause(other),
            })?;

    Token::from_bytes(&payload, remaining.unwrap_or(0)).forward("58ac9fa1-ce15-44f6-b76c-f8fca938a996")
}

pub fn delete_token(
    cache: &dyn SessionCache,
    organization_id: Option<Uuid>,
    token_type: TokenType,
    id: Uuid,
) -> Result<()> {
    if id.is_nil() {
        return Err(Error::new("7fa4aa00-3373-4133-8b86-75c62b8ad4a1", Code::InvalidArgument, "Missing Id."));
    }

    let key = token_key(organization_id, token_type, id);
    cache.delete_token(&key).map_err(|e| {
        Error::new("73e47a27-1a1f-491f-b1be-dd3f066fe96d", Code::Unknown, "Failed to execute script.").with_cause(e)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;

    #[test]
    fn test_create_rejects_bad_input() {
        let cache = MemoryCache::new();

        let err = create_token(
            &cache,
            NewToken {
                token_type: 7,
                ttl: Duration::from_secs(60),
                ..Default::default()
            },
        )
        .unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);

        let err = create_token(
            &cache,
            NewToken {
                token_type: TokenType::TokenExchange.code(),
                ..Default::default()
            },
        )
        .unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[test]
    fn test_payload_round_trip() {
        let token = Token {
            id: Uuid::new_v4(),
            organization_id: None,
            token_type: TokenType::TokenExchange,
            body: vec![1, 2, 3],
            quota: 9,
        };

        let decoded = Token::from_bytes(&token.to_bytes().unwrap(), 9).unwrap();
        assert_eq!(decoded, token);
    }

    #[test]
    fn test_insufficient_quota_keeps_token() {
        let cache = MemoryCache::new();
        let org = Some(Uuid::new_v4());
        let created = create_token(
            &cache,
            NewToken {
                organization_id: org,
                token_type: TokenType::TokenExchange.code(),
                body: b"exchange".to_vec(),
                quota: 1,
                ttl: Duration::from_secs(60),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(created.encoded.is_none());

        let id = created.token.id;
        let err = select_token(&cache, org, TokenType::TokenExchange, id, 2, true).unwrap_err();
        assert_eq!(err.code(), Code::ResourceExhausted);

        let token = select_token(&cache, org, TokenType::TokenExchange, id, 0, true).unwrap();
        assert_eq!(token.quota, 1);
        assert_eq!(token.body, b"exchange");
    }

    #[test]
    fn test_create_with_encoding() {
        let cache = MemoryCache::new();
        let key = [7u8; 32];
        let created = create_token(
            &cache,
            NewToken {
                organization_id: Some(Uuid::new_v4()),
                token_type: TokenType::TokenExchange.code(),
                quota: 1,
                ttl: Duration::from_secs(60),
                encode_key: Some(key),
                ..Default::default()
            },
        )
        .unwrap();

        let wire = created.encoded.unwrap();
        let identity =
            paseto::decode_token(&key, &wire, TokenType::TokenExchange.code()).unwrap();
        assert_eq!(identity.id, created.token.id);
        assert_eq!(identity.organization_id, created.token.organization_id);
    }
}
