use std::time::Duration;

use uuid::Uuid;

use super::envelope::{Decoded, Fields};
use super::{ScriptError, SessionCache, session_key};
use crate::error::{Code, Error, Forward, Result};
use crate::flags::Flags;
use crate::types::ApiKeyType;

// Persisted CBOR tags. Never renumber or reuse.
const TAG_ID: u8 = 1;
const TAG_ORGANIZATION_ID: u8 = 2;
const TAG_USER_ID: u8 = 3;
const TAG_KEY_ID: u8 = 4;
const TAG_ROLE_NAME: u8 = 5;
const TAG_SESSION_TYPE: u8 = 6;
const TAG_TIMEZONE: u8 = 7;
const TAG_USERNAME: u8 = 8;
const TAG_FLAGS: u8 = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionType {
    System,
    ApiServer,
    SaasServer,
    SaasWebClient,
}

impl SessionType {
    #[must_use]
    pub fn code(self) -> u16 {
        match self {
            SessionType::System => 1,
            SessionType::ApiServer => 100,
            SessionType::SaasServer => 200,
            SessionType::SaasWebClient => 201,
        }
    }

    #[must_use]
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            1 => Some(SessionType::System),
            100 => Some(SessionType::ApiServer),
            200 => Some(SessionType::SaasServer),
            201 => Some(SessionType::SaasWebClient),
            _ => None,
        }
    }
}

/// A server-side session, cached under its organization's hash tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSession {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub user_id: Option<Uuid>,
    pub key_id: Option<Uuid>,
    pub role_name: String,
    pub session_type: SessionType,
    pub timezone: String,
    pub username: String,
    pub flags: Flags,

    // Carried by the cache key, not the payload.
    pub key_hash: String,
    pub key_type: Option<ApiKeyType>,
}

impl ServerSession {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let flags: Vec<&str> = self.flags.iter().map(|f| f.name()).collect();

        Fields::new()
            .uuid(TAG_ID, Some(self.id))
            .uuid(TAG_ORGANIZATION_ID, Some(self.organization_id))
            .uuid(TAG_USER_ID, self.user_id)
            .uuid(TAG_KEY_ID, self.key_id)
            .text(TAG_ROLE_NAME, &self.role_name)
            .uint(TAG_SESSION_TYPE, u64::from(self.session_type.code()))
            .text(TAG_TIMEZONE, &self.timezone)
            .text(TAG_USERNAME, &self.username)
            .texts(TAG_FLAGS, &flags)
            .seal()
            .forward("f1040303-8cf6-4cd4-9a3d-3eaf5c4c304f")
    }

    /// Decodes a cached payload, re-attaching the key it was stored under.
    pub fn from_bytes(
        data: &[u8],
        key_hash: &str,
        key_type: Option<ApiKeyType>,
    ) -> Result<Self> {
        let d = Decoded::open(data).forward("abc9add4-0141-4f40-b00c-a326a67dd7be")?;

        let session_type = u16::try_from(d.uint(TAG_SESSION_TYPE)?)
            .ok()
            .and_then(SessionType::from_code)
            .ok_or_else(|| {
                Error::new("00d9cef6-abb7-4ce9-81b5-5946b57a8170", Code::DataLoss, "Unsupported SessionType in payload.")
            })?;

        // Flags this build no longer knows are dropped.
        let flag_names = d.texts(TAG_FLAGS)?;
        let flags = flag_names
            .iter()
            .filter_map(|n| crate::flags::Flag::select(n))
            .collect();

        Ok(Self {
            id: d.uuid(TAG_ID)?.unwrap_or_default(),
            organization_id: d.uuid(TAG_ORGANIZATION_ID)?.unwrap_or_default(),
            user_id: d.uuid(TAG_USER_ID)?,
            key_id: d.uuid(TAG_KEY_ID)?,
            role_name: d.text(TAG_ROLE_NAME)?,
            session_type,
            timezone: d.text(TAG_TIMEZONE)?,
            username: d.text(TAG_USERNAME)?,
            flags,
            key_hash: key_hash.to_string(),
            key_type,
        })
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self.id.is_nil()
    }
}

#[derive(Debug, Clone)]
pub struct NewServerSession {
    pub organization_id: Uuid,
    pub user_id: Option<Uuid>,
    pub key_id: Option<Uuid>,
    pub key_hash: String,
    pub key_type: Option<ApiKeyType>,
    pub role_name: String,
    pub session_type: u16,
    pub timezone: String,
    pub username: String,
    pub ttl: Duration,
    pub flags: Flags,

    /// Build the session without writing it to the cache.
    pub do_not_save: bool,
}

impl Default for NewServerSession {
    fn default() -> Self {
        Self {
            organization_id: Uuid::nil(),
            user_id: None,
            key_id: None,
            key_hash: String::new(),
            key_type: None,
            role_name: String::new(),
            session_type: 0,
            timezone: String::new(),
            username: String::new(),
            ttl: Duration::ZERO,
            flags: Flags::empty(),
            do_not_save: false,
        }
    }
}

pub fn create_server_session(
    cache: &dyn SessionCache,
    input: NewServerSession,
) -> Result<ServerSession> {
    if input.organization_id.is_nil() {
        return Err(Error::new("bd4e0b19-832f-491c-8cd8-8d28fbdb60e1", Code::InvalidArgument, "Missing OrganizationId."));
    }

    if input.user_id.is_none_or(|id| id.is_nil()) && input.key_id.is_none_or(|id| id.is_nil()) {
        return Err(Error::new(
            "f7b78524-5ccd-480e-89c6-00dd50a604f7",
            Code::InvalidArgument,
            "One of UserId or ApiKeyId must be provided.",
        ));
    }

    let Some(session_type) = SessionType::from_code(input.session_type) else {
        return Err(
            Error::new("fbc4ff25-b84b-42cd-92b7-b99b6e6b2f0f", Code::InvalidArgument, "Unsupported SessionType.")
                .with_meta("session_type", input.session_type),
        );
    };

    if input.ttl.is_zero() {
        return Err(Error::new("f386edc9-1909-4643-9ddc-66f2f93b6f8d", Code::InvalidArgument, "TTL is required."));
    }

    let session = ServerSession {
        id: Uuid::new_v4(),
        organization_id: input.organization_id,
        user_id: input.user_id,
        key_id: input.key_id,
        role_name: input.role_name,
        session_type,
        timezone: input.timezone,
        username: input.username,
        flags: input.flags,
        key_hash: input.key_hash,
        key_type: input.key_type,
    };

    if input.do_not_save {
        return Ok(session);
    }

    let payload = session.to_bytes().forward("5f813494-d59c-493c-9cfb-5d6a91d0f3df")?;
    let key = session_key(session.organization_id, session_type, session.id);

    cache
        .create_session(&key, input.ttl, &payload)
        .map_err(|e| match e {
            ScriptError::KeyExists => {
                Error::new("643088d3-a000-4126-8db7-dc116f427c44", Code::Internal, "Failed to create session.")
            }
            other => Error::new("f72d69ce-9477-4540-b079-59858cbb8099", Code::Unknown, "Failed to execute script.")
                .with_cause(other),
        })?;

    Ok(session)
}

fn require_ids(organization_id: Uuid, id: Uuid) -> Result<()> {
    if organization_id.is_nil() {
        return Err(Error::new("392d8ae2-66bc-41fd-bab4-4df9c19d5256", Code::InvalidArgument, "Missing OrganizationId."));
    }
    if id.is_nil() {
        return Err(Error::new("e3a34f33-b076-4427-af97-2c3852ac035a", Code::InvalidArgument, "Missing Id."));
    }
    Ok(())
}

pub fn select_server_session(
    cache: &dyn SessionCache,
    organization_id: Uuid,
    session_type: SessionType,
    id: Uuid,
) -> Result<ServerSession> {
    require_ids(organization_id, id)?;

    let key = session_key(organization_id, session_type, id);
    let payload = cache.select_session(&key).map_err(|e| match e {
        ScriptError::KeyNotFound => Error::new("720b9e71-9b16-432a-84cd-15d4c74e8661", Code::NotFound, "Session not found."),
        other => {
            Error::new("ca499beb-d428-4fab-a570-738a765773cf", Code::Unknown, "Failed to execute script.").with_cause(other)
        }
    })?;

    ServerSession::from_bytes(&payload, "", None).forward("ff7a64d5-de28-4bfd-a86f-c6f9cea5781a")
}

pub fn delete_server_session(
    cache: &dyn SessionCache,
    organization_id: Uuid,
    session_type: SessionType,
    id: Uuid,
) -> Result<()> {
    require_ids(organization_id, id)?;

    let key = session_key(organization_id, session_type, id);
    cache.delete_session(&key).map_err(|e| {
        Error::new("7d4678ba-ef26-4165-a47e-788495963c7c", Code::Unknown, "Failed to execute script.").with_cause(e)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::cache::envelope::COMPRESS_ABOVE;
    use crate::flags::Flag;

    fn input() -> NewServerSession {
        NewServerSession {
            organization_id: Uuid::new_v4(),
            key_id: Some(Uuid::new_v4()),
            role_name: "api_default".into(),
            session_type: SessionType::ApiServer.code(),
            timezone: "UTC".into(),
            ttl: Duration::from_secs(300),
            flags: Flags::empty().with(Flag::ApiAddressLayoutEnabled),
            ..Default::default()
        }
    }

    #[test]
    fn test_create_select_delete() {
        let cache = MemoryCache::new();
        let created = create_server_session(&cache, input()).unwrap();

        let selected = select_server_session(
            &cache,
            created.organization_id,
            SessionType::ApiServer,
            created.id,
        )
        .unwrap();
        assert_eq!(selected, created);

        delete_server_session(&cache, created.organization_id, SessionType::ApiServer, created.id)
            .unwrap();
        let err = select_server_session(
            &cache,
            created.organization_id,
            SessionType::ApiServer,
            created.id,
        )
        .unwrap_err();
        assert_eq!(err.code(), Code::NotFound);
    }

    #[test]
    fn test_create_validates_input() {
        let cache = MemoryCache::new();

        let mut no_principal = input();
        no_principal.key_id = None;
        assert_eq!(
            create_server_session(&cache, no_principal).unwrap_err().code(),
            Code::InvalidArgument
        );

        let mut bad_type = input();
        bad_type.session_type = 42;
        assert_eq!(
            create_server_session(&cache, bad_type).unwrap_err().code(),
            Code::InvalidArgument
        );

        let mut no_ttl = input();
        no_ttl.ttl = Duration::ZERO;
        assert_eq!(
            create_server_session(&cache, no_ttl).unwrap_err().code(),
            Code::InvalidArgument
        );
    }

    #[test]
    fn test_do_not_save() {
        let cache = MemoryCache::new();
        let mut req = input();
        req.do_not_save = true;
        let created = create_server_session(&cache, req).unwrap();

        let err = select_server_session(
            &cache,
            created.organization_id,
            SessionType::ApiServer,
            created.id,
        )
        .unwrap_err();
        assert_eq!(err.code(), Code::NotFound);
    }

    #[test]
    fn test_round_trip_compressed() {
        let mut req = input();
        req.do_not_save = true;
        req.username = "x".repeat(COMPRESS_ABOVE * 2);
        let session = create_server_session(&MemoryCache::new(), req).unwrap();

        let bytes = session.to_bytes().unwrap();
        assert_eq!(bytes[0], 1);

        let decoded =
            ServerSession::from_bytes(&bytes, "hash", Some(ApiKeyType::Legacy)).unwrap();
        assert_eq!(decoded.username, session.username);
        assert_eq!(decoded.key_hash, "hash");
        assert!(decoded.flags.contains(Flag::ApiAddressLayoutEnabled));
    }
}
