//! Property sync under search-cluster backpressure.

mod common;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use propline::error::{Code, Error, Result};
use propline::lease::Backoff;
use propline::store::SqliteStore;
use propline::synth::{
    MemorySearch, SearchCluster, SyncOptions, address_index_body, sync_properties,
};
use propline::types::PropertyAddress;
use serde_json::Value;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Rejects the first bulk write after checking nothing was committed yet.
struct FirstWriteThrottled {
    inner: MemorySearch,
    db_path: PathBuf,
    attempts: AtomicUsize,
    visible_on_reject: AtomicUsize,
}

impl SearchCluster for FirstWriteThrottled {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn index_exists(&self, index: &str) -> Result<bool> {
        self.inner.index_exists(index)
    }

    fn create_index(&self, index: &str, body: &Value) -> Result<()> {
        self.inner.create_index(index, body)
    }

    fn put_documents(&self, index: &str, docs: &[PropertyAddress]) -> Result<()> {
        if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
            let reader = SqliteStore::new(&self.db_path)?;
            let visible = common::count(&reader, "SELECT count(*) FROM addresses");
            self.visible_on_reject
                .store(usize::try_from(visible).unwrap_or(usize::MAX), Ordering::SeqCst);
            return Err(Error::new(
                "test",
                Code::ResourceExhausted,
                "Too many requests.",
            ));
        }
        self.inner.put_documents(index, docs)
    }
}

fn seed(store: &SqliteStore, zip5: &str, count: i64) {
    let mut conn = store.connection();
    let tx = conn.transaction().unwrap();
    tx.execute(
        "INSERT OR IGNORE INTO fips (fips, county, state, state_full_name)
         VALUES ('06075', 'San Francisco', 'CA', 'California')",
        [],
    )
    .unwrap();
    for i in 0..count {
        let address = format!("{} mission st", 1 + i);
        tx.execute(
            "INSERT INTO ad_df_assessor VALUES (?1, ?2, ?3, 37.76, -122.42)",
            rusqlite::params![10_000 + i, address.to_uppercase(), zip5],
        )
        .unwrap();
        tx.execute(
            "INSERT INTO fa_df_assessor (property_id, fips, situs_full_street_address,
                situs_house_nbr, situs_street, situs_mode, situs_city, situs_state,
                situs_zip5, situs_latitude, situs_longitude)
             VALUES (?1, '06075', ?2, ?3, 'MISSION', 'ST', 'SAN FRANCISCO', 'CA', ?4, 37.76, -122.42)",
            rusqlite::params![50_000 + i, address, (1 + i).to_string(), zip5],
        )
        .unwrap();
    }
    tx.commit().unwrap();
}

#[tokio::test]
async fn test_backpressure_defers_commit_until_publish() {
    let temp = TempDir::new().unwrap();
    let store = common::store(&temp);
    seed(&store, "94103", 1000);

    let search = Arc::new(FirstWriteThrottled {
        inner: MemorySearch::new("memory"),
        db_path: temp.path().join("propline.db"),
        attempts: AtomicUsize::new(0),
        visible_on_reject: AtomicUsize::new(usize::MAX),
    });
    search
        .create_index("addresses", &address_index_body())
        .unwrap();

    let opts = SyncOptions {
        batch_size: 1000,
        backoff: Backoff::new(Duration::from_millis(5), Duration::from_millis(20), 20),
        lock: common::fast_lock(),
        ..Default::default()
    };
    let stats = sync_properties(
        &common::locker(&temp),
        store.clone(),
        search.clone(),
        &opts,
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(search.visible_on_reject.load(Ordering::SeqCst), 0);
    assert!(search.attempts.load(Ordering::SeqCst) >= 2);

    assert_eq!(stats.matched, 1000);
    assert_eq!(common::count(&store, "SELECT count(*) FROM addresses"), 1000);
    assert_eq!(
        common::count(
            &store,
            "SELECT count(*) FROM properties WHERE address_id IS NOT NULL"
        ),
        1000
    );
    assert_eq!(search.inner.document_count("addresses"), 1000);
}
