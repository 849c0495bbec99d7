pub mod path;
mod schema;
mod sqlite;

pub use schema::LEASE_SCHEMA;
pub use sqlite::SqliteStore;

use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{Code, Error, Result};
use crate::types::*;

/// Insert-or-read request for a catalog object.
#[derive(Debug, Clone)]
pub struct NewDataFileObject {
    pub directory_id: Uuid,
    pub parent_file_id: Option<Uuid>,
    pub file_type: i32,
    pub hash: [u8; 16],
    pub file_dir: String,
    pub file_name: String,
    pub file_size: i64,
    pub priorities: Vec<i32>,
    pub meta: Option<Value>,
}

/// Narrows which catalog objects a worker may lease.
#[derive(Debug, Clone, Default)]
pub struct LeaseFilter {
    pub partner_id: Uuid,
    pub priority_group: Option<i32>,
    /// Directory meta entries that must match exactly.
    pub meta: Map<String, Value>,
}

/// One atomic data write flushed together with a checkpoint advance.
pub enum BatchWrite<'a> {
    Insert {
        table: &'a str,
        columns: &'a [String],
        rows: &'a [Vec<SqlValue>],
    },
    Delete {
        table: &'a str,
        column: &'a str,
        keys: &'a [SqlValue],
    },
    Func(&'a mut dyn FnMut(&rusqlite::Connection) -> Result<()>),
}

/// Called with the addresses created by a sync batch before it commits.
pub type Publish<'a> = &'a mut dyn FnMut(&[PropertyAddress]) -> Result<()>;

/// Store defines the relational database interface.
pub trait Store: Send + Sync {
    fn initialize(&self) -> Result<()>;

    // API key operations
    fn create_api_key(&self, key: &ApiKey) -> Result<()>;
    /// Stamps `last_used_at`, expires the key when past due, then returns it
    /// only if it is still active.
    fn select_active_api_key(
        &self,
        key_type: ApiKeyType,
        key_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ApiKey>>;
    fn update_api_key_status(&self, id: Uuid, status: ApiKeyStatus) -> Result<bool>;

    // Quota operations
    fn upsert_api_quota(&self, quota: &ApiQuota) -> Result<()>;
    fn get_api_quota(&self, organization_id: Uuid) -> Result<Option<ApiQuota>>;
    fn select_quota_availability(
        &self,
        organization_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<QuotaAvailability>;
    /// Appends the transaction, zeroing its amounts when either budget would
    /// be exceeded.
    fn insert_quota_transaction(&self, trx: &ApiQuotaTransaction) -> Result<QuotaCheck>;
    fn list_quota_transactions(&self, organization_id: Uuid) -> Result<Vec<ApiQuotaTransaction>>;

    // Catalog directory operations
    /// Oldest directory at `path` whose meta contains `meta`.
    fn select_directory(
        &self,
        partner_id: Uuid,
        path: &str,
        meta: Option<&Value>,
    ) -> Result<Option<DataFileDirectory>>;
    fn insert_directory(&self, dir: &DataFileDirectory) -> Result<()>;
    fn update_directory_status(&self, id: Uuid, status: DataFileStatus) -> Result<()>;

    // Catalog object operations
    fn ensure_object(&self, obj: &NewDataFileObject) -> Result<DataFileObject>;
    fn get_object(&self, id: Uuid) -> Result<Option<DataFileObject>>;
    fn update_object_status(&self, id: Uuid, status: DataFileStatus) -> Result<()>;
    fn update_object_priorities(&self, id: Uuid, priorities: &[i32]) -> Result<()>;
    fn set_record_count(&self, id: Uuid, record_count: i64) -> Result<()>;
    /// Counts top-level objects still to do or in progress.
    fn count_objects_to_load(&self, filter: &LeaseFilter) -> Result<i64>;
    /// Leases rank-1 objects per priority group to `worker_id`.
    fn lease_objects(
        &self,
        filter: &LeaseFilter,
        worker_id: Uuid,
        limit: usize,
    ) -> Result<Vec<DataFileObject>>;
    /// Runs `write` and sets the object's `record_count` in one transaction.
    fn flush_batch(&self, object_id: Uuid, record_count: i64, write: BatchWrite<'_>)
    -> Result<()>;

    // Reconciliation operations
    fn upsert_fips(&self, fips: &Fips) -> Result<()>;
    fn list_fips(&self) -> Result<Vec<Fips>>;
    /// Unions the distinct zip codes seen in both vendor tables.
    fn refresh_zip5(&self) -> Result<usize>;
    fn list_zip5(&self) -> Result<Vec<String>>;
    /// Reconciles up to `limit` matches in `zip5`. `publish` runs without the
    /// connection held, and the batch is written in one transaction only after
    /// it succeeds.
    fn sync_zip5_batch(
        &self,
        zip5: &str,
        batch_id: Uuid,
        limit: usize,
        publish: Publish<'_>,
    ) -> Result<usize>;
    fn select_addresses_by_fips(
        &self,
        fips: &str,
        after: Option<Uuid>,
        limit: usize,
    ) -> Result<Vec<PropertyAddress>>;

    fn close(&self) -> Result<()>;
}

/// Runs a blocking store or search call on the blocking pool.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| {
        Error::new("7a46f5c2-60ae-497c-83fe-264ec6e81f15", Code::Internal, "Blocking task failed.").with_cause(e)
    })?
}

/// Largest row count a single parameterized statement may carry.
#[must_use]
pub fn batch_size(columns: usize) -> usize {
    if columns == 0 {
        return 1000;
    }
    (65535 / columns).min(1000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_size() {
        assert_eq!(batch_size(1), 1000);
        assert_eq!(batch_size(65), 1000);
        assert_eq!(batch_size(100), 655);
        assert_eq!(batch_size(0), 1000);
    }
}
