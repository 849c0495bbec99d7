//! Named collaborators handed to the domains.
//!
//! Built once by the binary from [`AppConfig`](crate::config::AppConfig), or by
//! hand in tests. Lookups fail with `not_found` instead of panicking so a
//! missing piece of wiring surfaces as an ordinary error.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::SessionCache;
use crate::error::{Code, Error, Result};
use crate::lease::LeaseTable;
use crate::store::Store;
use crate::synth::SearchCluster;

pub const PRIMARY: &str = "primary";

#[derive(Default, Clone)]
pub struct Registry {
    stores: HashMap<String, Arc<dyn Store>>,
    lease_tables: HashMap<String, Arc<dyn LeaseTable>>,
    caches: HashMap<String, Arc<dyn SessionCache>>,
    searches: HashMap<String, Arc<dyn SearchCluster>>,
    symmetric_keys: HashMap<String, [u8; 32]>,
    durations: HashMap<String, Duration>,
}

fn missing(kind: &'static str, key: &str) -> Error {
    Error::new("5fa4c190-98b8-4eab-bbb8-013a6add11ef", Code::NotFound, format!("No {kind} registered."))
        .with_meta("key", key)
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_store(mut self, name: &str, store: Arc<dyn Store>) -> Self {
        self.stores.insert(name.to_string(), store);
        self
    }

    #[must_use]
    pub fn with_lease_table(mut self, name: &str, table: Arc<dyn LeaseTable>) -> Self {
        self.lease_tables.insert(name.to_string(), table);
        self
    }

    #[must_use]
    pub fn with_cache(mut self, name: &str, cache: Arc<dyn SessionCache>) -> Self {
        self.caches.insert(name.to_string(), cache);
        self
    }

    #[must_use]
    pub fn with_search(mut self, name: &str, search: Arc<dyn SearchCluster>) -> Self {
        self.searches.insert(name.to_string(), search);
        self
    }

    #[must_use]
    pub fn with_symmetric_key(mut self, name: &str, key: [u8; 32]) -> Self {
        self.symmetric_keys.insert(name.to_string(), key);
        self
    }

    #[must_use]
    pub fn with_duration(mut self, name: &str, duration: Duration) -> Self {
        self.durations.insert(name.to_string(), duration);
        self
    }

    pub fn select_store(&self, name: &str) -> Result<Arc<dyn Store>> {
        self.stores
            .get(name)
            .cloned()
            .ok_or_else(|| missing("store", name))
    }

    pub fn select_lease_table(&self, name: &str) -> Result<Arc<dyn LeaseTable>> {
        self.lease_tables
            .get(name)
            .cloned()
            .ok_or_else(|| missing("lease table", name))
    }

    pub fn select_cache(&self, name: &str) -> Result<Arc<dyn SessionCache>> {
        self.caches
            .get(name)
            .cloned()
            .ok_or_else(|| missing("cache", name))
    }

    pub fn select_search(&self, name: &str) -> Result<Arc<dyn SearchCluster>> {
        self.searches
            .get(name)
            .cloned()
            .ok_or_else(|| missing("search cluster", name))
    }

    pub fn select_symmetric_key(&self, name: &str) -> Result<[u8; 32]> {
        self.symmetric_keys
            .get(name)
            .copied()
            .ok_or_else(|| missing("symmetric key", name))
    }

    pub fn select_duration(&self, name: &str) -> Result<Duration> {
        self.durations
            .get(name)
            .copied()
            .ok_or_else(|| missing("duration", name))
    }
}
