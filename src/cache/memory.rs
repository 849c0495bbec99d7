use std::fmt;
use std::time::{Duration, Instant};

use moka::Expiry;
use moka::ops::compute::{CompResult, Op};
use moka::sync::Cache;

use super::{ApiSessionEntry, ScriptError, ScriptResult, SessionCache};

#[derive(Debug, Clone)]
enum Stored {
    Session(Vec<u8>),
    Token { payload: Vec<u8>, quota: u32 },
    ApiSession(ApiSessionEntry),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Stored,
    expires_at: Instant,
}

/// Expires each entry at its own deadline. Updates keep the deadline they
/// carry, so a token decrement does not extend its life.
struct EntryExpiry;

impl Expiry<String, Entry> for EntryExpiry {
    fn expire_after_create(&self, _key: &String, value: &Entry, created_at: Instant) -> Option<Duration> {
        Some(value.expires_at.saturating_duration_since(created_at))
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Entry,
        updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.expires_at.saturating_duration_since(updated_at))
    }
}

/// In-process cache backed by moka. Compound scripts run inside
/// `and_compute_with`, which serializes writers per key.
pub struct MemoryCache {
    entries: Cache<String, Entry>,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self {
            entries: Cache::builder().expire_after(EntryExpiry).build(),
        }
    }
}

impl fmt::Debug for MemoryCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryCache")
            .field("entries", &self.entries.entry_count())
            .finish()
    }
}

impl MemoryCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn deadline(ttl: Duration) -> ScriptResult<Instant> {
        if ttl.is_zero() {
            return Err(ScriptError::Failed("ERR invalid expire time".into()));
        }
        Ok(Instant::now() + ttl)
    }

    /// Stores `value` unless a live entry already holds `key`.
    fn insert_new(&self, key: &str, value: Stored, ttl: Duration) -> ScriptResult<()> {
        let expires_at = Self::deadline(ttl)?;
        let result = self
            .entries
            .entry(key.to_string())
            .and_compute_with(|current| match current {
                Some(_) => Op::Nop,
                None => Op::Put(Entry { value, expires_at }),
            });
        match result {
            CompResult::Inserted(_) => Ok(()),
            _ => Err(ScriptError::KeyExists),
        }
    }

    /// Live entries, after moka has evicted the expired ones.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.run_pending_tasks();
        usize::try_from(self.entries.entry_count()).unwrap_or(usize::MAX)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }
}

impl SessionCache for MemoryCache {
    fn create_session(&self, key: &str, ttl: Duration, payload: &[u8]) -> ScriptResult<()> {
        self.insert_new(key, Stored::Session(payload.to_vec()), ttl)
    }

    fn select_session(&self, key: &str) -> ScriptResult<Vec<u8>> {
        match self.entries.get(key).map(|e| e.value) {
            Some(Stored::Session(payload)) => Ok(payload),
            Some(_) => Err(ScriptError::Failed("WRONGTYPE".into())),
            None => Err(ScriptError::KeyNotFound),
        }
    }

    fn delete_session(&self, key: &str) -> ScriptResult<()> {
        self.entries.invalidate(key);
        Ok(())
    }

    fn create_token(
        &self,
        key: &str,
        ttl: Duration,
        payload: &[u8],
        quota: u32,
    ) -> ScriptResult<()> {
        let value = Stored::Token {
            payload: payload.to_vec(),
            quota,
        };
        self.insert_new(key, value, ttl)
    }

    fn select_token(
        &self,
        key: &str,
        decrement: u32,
        return_quota: bool,
    ) -> ScriptResult<(Vec<u8>, Option<u32>)> {
        let mut out = Err(ScriptError::KeyNotFound);
        self.entries
            .entry(key.to_string())
            .and_compute_with(|current| {
                let Some(current) = current else {
                    return Op::Nop;
                };
                let mut entry = current.into_value();
                let Stored::Token { payload, quota } = &mut entry.value else {
                    out = Err(ScriptError::Failed("WRONGTYPE".into()));
                    return Op::Nop;
                };

                if decrement == 0 {
                    out = Ok((payload.clone(), return_quota.then_some(*quota)));
                    return Op::Nop;
                }
                if *quota < decrement {
                    out = Err(ScriptError::InsufficientQuota);
                    return Op::Nop;
                }

                *quota -= decrement;
                out = Ok((payload.clone(), return_quota.then_some(*quota)));
                if *quota == 0 {
                    Op::Remove
                } else {
                    Op::Put(entry)
                }
            });
        out
    }

    fn delete_token(&self, key: &str) -> ScriptResult<()> {
        self.entries.invalidate(key);
        Ok(())
    }

    fn select_api_session(&self, key: &str) -> ScriptResult<ApiSessionEntry> {
        match self.entries.get(key).map(|e| e.value) {
            Some(Stored::ApiSession(entry)) => Ok(entry),
            Some(_) => Err(ScriptError::Failed("WRONGTYPE".into())),
            None => Err(ScriptError::KeyNotFound),
        }
    }

    fn update_api_session(
        &self,
        key: &str,
        entry: &ApiSessionEntry,
        ttl: Duration,
    ) -> ScriptResult<()> {
        let expires_at = Self::deadline(ttl)?;

        // Only the winning state is kept.
        let stored = if entry.invalid {
            ApiSessionEntry {
                invalid: true,
                ..Default::default()
            }
        } else if entry.quota_exhausted.is_some() {
            ApiSessionEntry {
                quota_exhausted: entry.quota_exhausted,
                ..Default::default()
            }
        } else {
            entry.clone()
        };

        self.entries.insert(
            key.to_string(),
            Entry {
                value: Stored::ApiSession(stored),
                expires_at,
            },
        );
        Ok(())
    }
}
