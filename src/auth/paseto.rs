//! Wire encoding of cached tokens.
//!
//! A token on the wire is a three character version header (a big-endian u16
//! in unpadded url-safe base64) followed by the versioned body.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, SecondsFormat, Utc};
use pasetors::claims::{Claims, ClaimsValidationRules};
use pasetors::keys::SymmetricKey;
use pasetors::token::UntrustedToken;
use pasetors::version4::V4;
use pasetors::{Local, local};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cache::{type_key, u16_from_raw_base64, u16_raw_base64};
use crate::error::{Code, Error, Result};

/// PASETO v4.local with its `v4.local.` prefix stripped.
pub const VERSION_PASETO_V4_LOCAL: u16 = 1;

const V4_LOCAL_PREFIX: &str = "v4.local.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenIdentity {
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<Uuid>,
    pub token_type: u16,
}

#[derive(Debug, Clone)]
pub struct EncodedToken {
    pub value: String,
    pub expires_at: DateTime<Utc>,
}

fn symmetric_key(key: &[u8; 32]) -> Result<SymmetricKey<V4>> {
    SymmetricKey::<V4>::from(key).map_err(|e| {
        Error::new("bdee9799-f3ca-41f1-9574-ab38bc205d8f", Code::FailedPrecondition, "Invalid symmetric key.").with_cause(e)
    })
}

fn version_header(version: u16) -> String {
    URL_SAFE_NO_PAD.encode(version.to_be_bytes())
}

fn claims_error(e: pasetors::errors::Error) -> Error {
    Error::new("0913ef99-c77f-4ceb-a55f-c9d671db51c1", Code::Unknown, "Failed to set token claims.").with_cause(e)
}

pub fn encode_token(
    key: &[u8; 32],
    identity: &TokenIdentity,
    expire: Duration,
) -> Result<EncodedToken> {
    if expire.is_zero() {
        return Err(Error::new("cc402751-7d7c-4836-9e92-1ae97abc923b", Code::InvalidArgument, "Expire is required."));
    }

    let expire = chrono::Duration::from_std(expire).map_err(|e| {
        Error::new("d16a2226-af3f-4a4c-8f3b-b42e266df4c2", Code::InvalidArgument, "Expire out of range.").with_cause(e)
    })?;
    let now = Utc::now();
    let expires_at = now + expire;

    let type_str = u16_raw_base64(identity.token_type);
    let body = serde_json::to_value(identity).map_err(|e| {
        Error::new("40ed7605-2197-42a5-a68c-c9d6427bf911", Code::Unknown, "Failed to marshal token body.").with_cause(e)
    })?;

    let mut claims = Claims::new().map_err(claims_error)?;
    claims
        .issued_at(&now.to_rfc3339_opts(SecondsFormat::Secs, true))
        .map_err(claims_error)?;
    claims
        .not_before(&now.to_rfc3339_opts(SecondsFormat::Secs, true))
        .map_err(claims_error)?;
    claims
        .expiration(&expires_at.to_rfc3339_opts(SecondsFormat::Secs, true))
        .map_err(claims_error)?;
    claims
        .add_additional(&type_key(), type_str.clone())
        .map_err(claims_error)?;
    claims.add_additional(&type_str, body).map_err(claims_error)?;

    let sk = symmetric_key(key)?;
    let token = local::encrypt(&sk, &claims, None, None).map_err(|e| {
        Error::new("4f2cf926-5f1b-478c-95fb-f5f8448be048", Code::Unknown, "Failed to encrypt token.").with_cause(e)
    })?;

    let body = token.strip_prefix(V4_LOCAL_PREFIX).unwrap_or(&token);
    Ok(EncodedToken {
        value: format!("{}{body}", version_header(VERSION_PASETO_V4_LOCAL)),
        expires_at,
    })
}

pub fn decode_token(key: &[u8; 32], value: &str, token_type: u16) -> Result<TokenIdentity> {
    let (Some(header), Some(body)) = (value.get(..3), value.get(3..)) else {
        return Err(Error::new("042a4cb3-276c-4c8a-aa0e-eb02d32e28fe", Code::InvalidArgument, "Missing value."));
    };

    let version = URL_SAFE_NO_PAD
        .decode(header)
        .ok()
        .and_then(|b| <[u8; 2]>::try_from(b).ok())
        .map(u16::from_be_bytes)
        .ok_or_else(|| Error::new("803b6290-dd9c-4ca7-8c8a-b22029e5be32", Code::InvalidArgument, "Invalid version."))?;

    if version != VERSION_PASETO_V4_LOCAL {
        return Err(
            Error::new("b17692c8-f8c6-4473-853d-dee4ae1f7f1c", Code::InvalidArgument, "Unsupported token version.")
                .with_meta("version", version),
        );
    }

    let sk = symmetric_key(key)?;
    let wire = format!("{V4_LOCAL_PREFIX}{body}");

    let untrusted = UntrustedToken::<Local, V4>::try_from(wire.as_str()).map_err(|e| {
        Error::new("d2c7227d-fb86-412d-a3b3-a35f2ee93973", Code::InvalidArgument, "Invalid auth token.").with_cause(e)
    })?;
    let trusted = local::decrypt(&sk, &untrusted, &ClaimsValidationRules::new(), None, None)
        .map_err(|e| {
            Error::new("f508a9a1-6e6b-47fd-b80f-61a28ccf2804", Code::InvalidArgument, "Invalid auth token.").with_cause(e)
        })?;

    let Some(claims) = trusted.payload_claims() else {
        return Err(Error::new("54a195e0-d2ee-44bc-9fd8-1ef8fbc875b6", Code::Internal, "Token claims not found."));
    };

    let type_str = claims
        .get_claim(&type_key())
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::new("b804b51c-2e96-4d44-a9b2-593639122c7f", Code::Internal, "Token type not found."))?;

    let found = u16_from_raw_base64(type_str)
        .ok_or_else(|| Error::new("2f6351b7-9b55-4aa0-acd5-496808f0aff4", Code::Internal, "Invalid token type."))?;

    if found != token_type {
        return Err(Error::new("202da08d-b717-4681-93b7-d48bd42c4bfd", Code::InvalidArgument, "Token type mismatch."));
    }

    let body = claims
        .get_claim(type_str)
        .cloned()
        .ok_or_else(|| Error::new("94f87bc7-f4c6-4344-9849-ea5a74493dde", Code::Internal, "Token body not found."))?;

    serde_json::from_value(body).map_err(|e| {
        Error::new("ce55e65d-0ed6-4881-89e7-726eb4545640", Code::Internal, "Token body not found.").with_cause(e)
    })
}
