use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use super::key::{Credential, parse_credential};
use crate::cache::{
    ApiSessionEntry, NewServerSession, QuotaExhausted, ScriptError, ServerSession, SessionCache,
    SessionType, api_session_key, create_server_session,
};
use crate::error::{Code, Error, Forward, Result};
use crate::store::Store;
use crate::types::{ApiQuotaTransaction, LayoutAmounts, QuotaCheck};

/// How long any api key state stays cached.
pub const API_SESSION_TTL: Duration = Duration::from_secs(300);

fn exhausted(reason: QuotaExhausted) -> Error {
    match reason {
        QuotaExhausted::Daily => Error::new(
            "81274ad2-27fc-4ba6-93ba-dd9517d936ac",
            Code::ResourceExhausted,
            "Not enough daily quota to complete the request.",
        )
        .with_label("DAILY_QUOTA_EXHAUSTED"),
        QuotaExhausted::Monthly => Error::new(
            "750aa32c-f58a-4d8e-892b-589d3a7aa718",
            Code::ResourceExhausted,
            "Not enough monthly quota to complete the request.",
        )
        .with_label("MONTHLY_QUOTA_EXHAUSTED"),
    }
}

fn insufficient(reason: QuotaExhausted) -> Error {
    match reason {
        QuotaExhausted::Daily => Error::new(
            "1144c805-a9e7-40ec-8b33-01ef5177dd2c",
            Code::ResourceExhausted,
            "Not enough daily quota to complete the request.",
        )
        .with_label("INSUFFICIENT_DAILY_QUOTA"),
        QuotaExhausted::Monthly => Error::new(
            "8da8bc35-d87d-4df1-8d38-b1793af5eb72",
            Code::ResourceExhausted,
            "Not enough monthly quota to complete the request.",
        )
        .with_label("INSUFFICIENT_MONTHLY_QUOTA"),
    }
}

/// Validates api credentials and meters each request against the
/// organization's budgets.
#[derive(Clone)]
pub struct AuthGate {
    store: Arc<dyn Store>,
    cache: Arc<dyn SessionCache>,
}

impl AuthGate {
    pub fn new(store: Arc<dyn Store>, cache: Arc<dyn SessionCache>) -> Self {
        Self { store, cache }
    }

    /// Resolves an `Authorization` header value to a session.
    pub fn authenticate(&self, header: Option<&str>) -> Result<ServerSession> {
        let Some(header) = header else {
            return Err(Error::new("a99ff37a-13b2-4ee9-96a9-8df19a4850c8", Code::Unauthenticated, "Missing auth header."));
        };

        let credential = parse_credential(header).forward("13e17553-5a5e-4067-b42b-04841153389d")?;

        if let Some(session) = self.from_cache(&credential).forward("4a790db8-271b-4c83-9cb3-0d704e0211c4")? {
            return Ok(session);
        }

        let now = Utc::now();
        let Some(record) = self
            .store
            .select_active_api_key(credential.key_type, &credential.key_hash, now)
            .forward("eb0831a6-65b7-42bc-bf81-218d2ff82d69")?
        else {
            self.update_api_session(
                &credential,
                &ApiSessionEntry {
                    invalid: true,
                    ..Default::default()
                },
                API_SESSION_TTL,
            )
            .forward("4a687773-aec7-467d-94c3-d6acab030a47")?;

            return Err(Error::new("61ebfab9-843c-4488-9689-1e094027bd31", Code::Unauthenticated, "Invalid api key."));
        };

        let availability = self
            .store
            .select_quota_availability(record.organization_id, now)
            .forward("265e8f52-3ad2-4239-8ad9-ffbf20a85234")?;

        let reason = if !availability.has_daily_quota {
            Some(QuotaExhausted::Daily)
        } else if !availability.has_monthly_quota {
            Some(QuotaExhausted::Monthly)
        } else {
            None
        };

        if let Some(reason) = reason {
            self.update_api_session(
                &credential,
                &ApiSessionEntry {
                    quota_exhausted: Some(reason),
                    ..Default::default()
                },
                API_SESSION_TTL,
            )
            .forward("c885abe5-f9d0-466f-a8c1-8698e2634f81")?;

            return Err(exhausted(reason));
        }

        // Never cache past the key's own expiry.
        let ttl = match record.expires_at {
            None => API_SESSION_TTL,
            Some(expires_at) => (expires_at - now)
                .to_std()
                .unwrap_or(Duration::ZERO)
                .min(API_SESSION_TTL)
                .max(Duration::from_secs(1)),
        };

        let session = create_server_session(
            self.cache.as_ref(),
            NewServerSession {
                organization_id: record.organization_id,
                user_id: record.user_id,
                key_id: Some(record.id),
                key_hash: credential.key_hash.clone(),
                key_type: Some(credential.key_type),
                role_name: record.role_name,
                session_type: SessionType::ApiServer.code(),
                timezone: "UTC".to_string(),
                ttl: Duration::from_secs(1),
                flags: availability.enabled.flags(),
                do_not_save: true,
                ..Default::default()
            },
        )
        .forward("af1ac6e7-4c31-4f99-8506-5ef354b1ec66")?;

        self.update_api_session(
            &credential,
            &ApiSessionEntry {
                session: Some(session.to_bytes().forward("33d33eee-2efc-4d1d-ad44-19e3f02a823e")?),
                ..Default::default()
            },
            ttl,
        )
        .forward("6e439095-ff88-4c6b-ae2a-2a68a489acc1")?;

        info!(
            organization_id = %session.organization_id,
            key_id = %record.id,
            "Api session created"
        );

        Ok(session)
    }

    fn from_cache(&self, credential: &Credential) -> Result<Option<ServerSession>> {
        let key = api_session_key(credential.key_type, &credential.key_hash);

        let entry = match self.cache.select_api_session(&key) {
            Ok(entry) => entry,
            Err(ScriptError::KeyNotFound) => return Ok(None),
            Err(e) => {
                return Err(
                    Error::new("4e1503cd-544b-4f25-a211-d2ff77648e8a", Code::Unknown, "Failed to execute script.").with_cause(e),
                );
            }
        };

        if entry.invalid {
            debug!("Api key rejected from cache");
            return Err(Error::new("054a7887-a1f7-4c09-9f81-e73b900110d5", Code::Unauthenticated, "Invalid api key."));
        }

        if let Some(reason) = entry.quota_exhausted {
            return Err(exhausted(reason));
        }

        match entry.session {
            Some(payload) => ServerSession::from_bytes(
                &payload,
                &credential.key_hash,
                Some(credential.key_type),
            )
            .map(Some)
            .forward("9e667b39-3dda-4a3b-bbbc-963cab8f157c"),
            None => Ok(None),
        }
    }

    fn update_api_session(
        &self,
        credential: &Credential,
        entry: &ApiSessionEntry,
        ttl: Duration,
    ) -> Result<()> {
        let key = api_session_key(credential.key_type, &credential.key_hash);
        self.cache.update_api_session(&key, entry, ttl).map_err(|e| {
            Error::new("ed2b72b1-9ec4-4828-8827-4b343974cbe0", Code::Unknown, "Failed to execute script.").with_cause(e)
        })
    }

    /// Appends the ledger row for a served request.
    ///
    /// An over-budget request is stored as an all-zero marker and rejected.
    /// When the budget is fully spent the cached session is replaced so
    /// later requests stop at the cache.
    pub fn record_transaction(
        &self,
        session: &ServerSession,
        amounts: LayoutAmounts,
        description: Option<String>,
    ) -> Result<QuotaCheck> {
        let trx = ApiQuotaTransaction {
            id: Uuid::now_v7(),
            organization_id: session.organization_id,
            api_key_id: session.key_id,
            trx_timestamp: Utc::now(),
            description,
            base_req_amount: 0,
            amounts,
        };

        let check = self.store.insert_quota_transaction(&trx).forward("ec5bf125-1efb-433e-8e91-ece1e6adda99")?;

        let reason = if !check.has_daily_quota {
            if check.daily_quota - check.daily_usage + check.trx_layout_sum > 0 {
                return Err(insufficient(QuotaExhausted::Daily));
            }
            QuotaExhausted::Daily
        } else if !check.has_monthly_quota {
            if check.monthly_quota - check.monthly_usage + check.trx_layout_sum > 0 {
                return Err(insufficient(QuotaExhausted::Monthly));
            }
            QuotaExhausted::Monthly
        } else {
            return Ok(check);
        };

        if let Some(key_type) = session.key_type {
            let credential = Credential {
                key_type,
                key_hash: session.key_hash.clone(),
            };
            self.update_api_session(
                &credential,
                &ApiSessionEntry {
                    quota_exhausted: Some(reason),
                    ..Default::default()
                },
                API_SESSION_TTL,
            )
            .forward("e7d9faa1-5c41-45c2-a40e-9c54e8cb50d2")?;
        }

        info!(
            organization_id = %session.organization_id,
            reason = reason.as_str(),
            "Quota exhausted"
        );

        Err(exhausted(reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::key::generate_credential;
    use crate::cache::MemoryCache;
    use crate::store::SqliteStore;
    use crate::types::{ApiKey, ApiKeyStatus, ApiKeyType, ApiQuota, Layouts};
    use tempfile::TempDir;

    struct Fixture {
        gate: AuthGate,
        store: Arc<SqliteStore>,
        cache: Arc<MemoryCache>,
        org: Uuid,
        _temp: TempDir,
    }

    fn fixture(daily: i64, monthly: i64) -> (Fixture, String) {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(SqliteStore::new(temp.path().join("test.db")).unwrap());
        store.initialize().unwrap();
        let cache = Arc::new(MemoryCache::new());

        let org = Uuid::new_v4();
        store
            .upsert_api_quota(&ApiQuota {
                organization_id: org,
                daily_quota: daily,
                monthly_quota: monthly,
                enabled: Layouts::ADDRESS.union(Layouts::ASSESSOR),
            })
            .unwrap();

        let (raw, credential) = generate_credential();
        let now = Utc::now();
        store
            .create_api_key(&ApiKey {
                id: Uuid::now_v7(),
                created_at: now,
                updated_at: now,
                organization_id: org,
                user_id: None,
                role_name: "api_default".into(),
                key_type: credential.key_type,
                key_hash: credential.key_hash,
                key_status: ApiKeyStatus::Active,
                expires_at: None,
                last_used_at: None,
            })
            .unwrap();

        let gate = AuthGate::new(store.clone(), cache.clone());
        (
            Fixture {
                gate,
                store,
                cache,
                org,
                _temp: temp,
            },
            format!("Bearer {raw}"),
        )
    }

    #[test]
    fn test_authenticate_caches_session() {
        let (f, header) = fixture(10, 100);

        let session = f.gate.authenticate(Some(&header)).unwrap();
        assert_eq!(session.organization_id, f.org);
        assert_eq!(session.session_type, SessionType::ApiServer);
        assert_eq!(session.timezone, "UTC");
        assert!(session.flags.contains(crate::flags::Flag::ApiAssessorLayoutEnabled));
        assert_eq!(f.cache.len(), 1);

        // Served from the cache even after the key is revoked.
        f.store
            .update_api_key_status(session.key_id.unwrap(), ApiKeyStatus::Revoked)
            .unwrap();
        let again = f.gate.authenticate(Some(&header)).unwrap();
        assert_eq!(again.id, session.id);
    }

    #[test]
    fn test_authenticate_matches_stored_key_verbatim() {
        let (f, _) = fixture(10, 100);
        let now = Utc::now();
        f.store
            .create_api_key(&ApiKey {
                id: Uuid::now_v7(),
                created_at: now,
                updated_at: now,
                organization_id: f.org,
                user_id: None,
                role_name: "api_default".into(),
                key_type: ApiKeyType::Legacy,
                key_hash: "AM.p.issued-before-migration".into(),
                key_status: ApiKeyStatus::Active,
                expires_at: None,
                last_used_at: None,
            })
            .unwrap();

        let session = f
            .gate
            .authenticate(Some("Bearer AM.p.issued-before-migration"))
            .unwrap();
        assert_eq!(session.organization_id, f.org);
    }

    #[test]
    fn test_unknown_key_poisons_cache() {
        let (f, _) = fixture(10, 100);
        let (raw, credential) = generate_credential();
        let header = format!("Bearer {raw}");

        let err = f.gate.authenticate(Some(&header)).unwrap_err();
        assert_eq!(err.code(), Code::Unauthenticated);

        let key = api_session_key(credential.key_type, &credential.key_hash);
        assert!(f.cache.select_api_session(&key).unwrap().invalid);

        let err = f.gate.authenticate(Some(&header)).unwrap_err();
        assert_eq!(err.code(), Code::Unauthenticated);
        assert_eq!(f.gate.authenticate(None).unwrap_err().code(), Code::Unauthenticated);
    }

    #[test]
    fn test_exhausted_budget_rejected_at_authenticate() {
        let (f, header) = fixture(0, 100);
        let err = f.gate.authenticate(Some(&header)).unwrap_err();
        assert_eq!(err.code(), Code::ResourceExhausted);
        assert_eq!(err.label(), Some("DAILY_QUOTA_EXHAUSTED"));

        let err = f.gate.authenticate(Some(&header)).unwrap_err();
        assert_eq!(err.label(), Some("DAILY_QUOTA_EXHAUSTED"));
    }

    #[test]
    fn test_monthly_insufficient_does_not_poison() {
        let (f, header) = fixture(100, 2);
        let session = f.gate.authenticate(Some(&header)).unwrap();

        let amounts = LayoutAmounts {
            address: 3,
            ..Default::default()
        };
        let err = f.gate.record_transaction(&session, amounts, None).unwrap_err();
        assert_eq!(err.label(), Some("INSUFFICIENT_MONTHLY_QUOTA"));

        let again = f.gate.authenticate(Some(&header)).unwrap();
        assert_eq!(again.id, session.id);
    }
}
