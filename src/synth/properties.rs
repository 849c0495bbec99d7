use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::search::SearchCluster;
use crate::error::{Code, Error, Forward, Result};
use crate::ingest::partner::ABODEMINE_ID;
use crate::lease::{Backoff, LockOptions, Locker, Role, with_lock};
use crate::store::{Store, blocking};
use crate::types::PropertyAddress;

pub const SYNC_BATCH_SIZE: usize = 1000;
pub const SYNC_CONCURRENCY: usize = 6;

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub index: String,
    pub batch_size: usize,
    pub concurrency: usize,
    /// Cloned per zip; resets whenever a publish succeeds.
    pub backoff: Backoff,
    pub lock: LockOptions,
    pub no_lock: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            index: "addresses".to_string(),
            batch_size: SYNC_BATCH_SIZE,
            concurrency: SYNC_CONCURRENCY,
            backoff: Backoff::search_default(),
            lock: LockOptions::default(),
            no_lock: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub zip5_count: usize,
    pub matched: usize,
    pub batches: usize,
}

/// Reconciles vendor assessor rows into canonical properties and pushes
/// the new addresses to the search cluster.
pub async fn sync_properties(
    locker: &Locker,
    store: Arc<dyn Store>,
    search: Arc<dyn SearchCluster>,
    opts: &SyncOptions,
    cancel: &CancellationToken,
) -> Result<SyncStats> {
    if opts.index.trim().is_empty() {
        return Err(Error::new("115d5ed0-d966-4987-90af-b7d7d8b34b57", Code::InvalidArgument, "Index name is required."));
    }

    let lock_id = (!opts.no_lock).then(|| Role::Synther.lock_id(ABODEMINE_ID));
    with_lock(locker, lock_id.as_deref(), &opts.lock, cancel, |work| {
        run(store, search, opts, work)
    })
    .await
}

async fn run(
    store: Arc<dyn Store>,
    search: Arc<dyn SearchCluster>,
    opts: &SyncOptions,
    cancel: CancellationToken,
) -> Result<SyncStats> {
    tracing::info!("Syncing properties");

    let zips = {
        let store = store.clone();
        blocking(move || {
            store.refresh_zip5().forward("afd34643-6fbf-4908-89e5-8a62c013b44f")?;
            store.list_zip5()
        })
        .await
        .forward("bf6a1637-1b2c-4c21-bfd5-ac03885d8f10")?
    };

    let total = zips.len();
    tracing::info!(zip5_count = total, "Zip codes to sync");

    let mut stats = SyncStats {
        zip5_count: total,
        ..Default::default()
    };
    let mut tasks: JoinSet<Result<(usize, usize)>> = JoinSet::new();
    let mut failure: Option<Error> = None;
    let concurrency = opts.concurrency.max(1);

    for (i, zip5) in zips.into_iter().enumerate() {
        while tasks.len() >= concurrency {
            if let Some(joined) = tasks.join_next().await {
                collect(joined, &mut stats, &mut failure);
            }
        }
        if failure.is_some() || cancel.is_cancelled() {
            break;
        }

        tracing::info!(remaining = total - i, zip5 = %zip5, "Processing zip5");

        let store = store.clone();
        let search = search.clone();
        let index = opts.index.clone();
        let batch_size = opts.batch_size.max(1);
        let backoff = opts.backoff.clone();
        let cancel = cancel.clone();
        tasks.spawn_blocking(move || {
            sync_zip5(
                store.as_ref(),
                search.as_ref(),
                &index,
                &zip5,
                batch_size,
                backoff,
                &cancel,
            )
        });
    }

    while let Some(joined) = tasks.join_next().await {
        collect(joined, &mut stats, &mut failure);
    }

    if let Some(err) = failure {
        return Err(err.forward("2fc32006-5b15-4840-978f-1463761b357f"));
    }
    if cancel.is_cancelled() {
        return Err(Error::new("c488bc1a-1401-47df-852d-49b4f1c67b93", Code::Canceled, "Sync was canceled."));
    }

    tracing::info!(matched = stats.matched, batches = stats.batches, "Properties synced");
    Ok(stats)
}

fn collect(
    joined: std::result::Result<Result<(usize, usize)>, tokio::task::JoinError>,
    stats: &mut SyncStats,
    failure: &mut Option<Error>,
) {
    let result = joined.map_err(|e| {
        Error::new("296ac4d3-c1b4-4f7f-8ec3-4f7ad882a9c7", Code::Internal, "Sync worker failed.").with_cause(e)
    });
    match result.and_then(|r| r) {
        Ok((matched, batches)) => {
            stats.matched += matched;
            stats.batches += batches;
        }
        Err(err) => {
            tracing::error!(error = %err, "Failed to sync zip5");
            if failure.is_none() {
                *failure = Some(err);
            }
        }
    }
}

/// Loops batches for one zip until a batch comes back short.
fn sync_zip5(
    store: &dyn Store,
    search: &dyn SearchCluster,
    index: &str,
    zip5: &str,
    batch_size: usize,
    mut backoff: Backoff,
    cancel: &CancellationToken,
) -> Result<(usize, usize)> {
    let mut matched = 0;
    let mut batches = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(Error::new("04a0f332-26b9-47a1-9a3a-52efd4f49c4e", Code::Canceled, "Sync was canceled.")
                .with_meta("zip5", zip5));
        }

        let batch_id = Uuid::new_v4();
        let mut publish = |addresses: &[PropertyAddress]| {
            publish_with_backoff(search, index, addresses, &mut backoff, cancel)
        };
        let count = store
            .sync_zip5_batch(zip5, batch_id, batch_size, &mut publish)
            .forward("5f283de9-ee4a-4b84-ae10-c64fab77ea0b")?;

        matched += count;
        batches += 1;
        tracing::info!(
            zip5,
            batch_id = %batch_id,
            batch_count = batches,
            match_count = count,
            "Synced batch"
        );

        if count < batch_size {
            return Ok((matched, batches));
        }
    }
}

/// Retries backpressure on the calling thread. Any other error fails the
/// batch before it is written.
pub(crate) fn publish_with_backoff(
    search: &dyn SearchCluster,
    index: &str,
    docs: &[PropertyAddress],
    backoff: &mut Backoff,
    cancel: &CancellationToken,
) -> Result<()> {
    loop {
        match search.put_documents(index, docs) {
            Ok(()) => {
                backoff.reset();
                return Ok(());
            }
            Err(err) if err.is(Code::ResourceExhausted) => {
                if cancel.is_cancelled() {
                    return Err(err.forward("b442a71b-05f0-41eb-9a36-f3f9d8cb0df9"));
                }
                let delay = backoff.next().forward("d5eb3c41-da2c-47fe-a1e7-89af23b20fac")?;
                tracing::warn!(
                    index,
                    retries = backoff.retries(),
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "Search cluster backpressure, sleeping before retry"
                );
                std::thread::sleep(delay);
            }
            Err(err) => return Err(err.forward("27cfd776-3f20-405e-8bc6-7368b21baabc")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::{LeaseTable, SqliteLeaseTable};
    use crate::store::SqliteStore;
    use crate::synth::search::{MemorySearch, address_index_body};
    use std::time::Duration;
    use tempfile::TempDir;

    fn seed(store: &SqliteStore, zip5: &str, count: i64) {
        let conn = store.connection();
        conn.execute(
            "INSERT OR IGNORE INTO fips (fips, county, state, state_full_name)
             VALUES ('06075', 'San Francisco', 'CA', 'California')",
            [],
        )
        .unwrap();
        for i in 0..count {
            let address = format!("{} market st", 100 + i);
            conn.execute(
                "INSERT INTO ad_df_assessor VALUES (?1, ?2, ?3, 37.77, -122.41)",
                rusqlite::params![1_000 + i, address.to_uppercase(), zip5],
            )
            .unwrap();
            conn.execute(
                "INSERT INTO fa_df_assessor (property_id, fips, situs_full_street_address,
                    situs_house_nbr, situs_street, situs_mode, situs_city, situs_state,
                    situs_zip5, situs_latitude, situs_longitude)
                 VALUES (?1, '06075', ?2, ?3, 'MARKET', 'ST', 'SAN FRANCISCO', 'CA', ?4, 37.77, -122.41)",
                rusqlite::params![5_000 + i, address, (100 + i).to_string(), zip5],
            )
            .unwrap();
        }
    }

    fn setup(temp: &TempDir) -> (Arc<SqliteStore>, Arc<MemorySearch>, Locker) {
        let store = Arc::new(SqliteStore::new(temp.path().join("test.db")).unwrap());
        store.initialize().unwrap();

        let search = Arc::new(MemorySearch::new("memory"));
        search.create_index("addresses", &address_index_body()).unwrap();

        let table = SqliteLeaseTable::new(temp.path().join("lease.db")).unwrap();
        table.initialize().unwrap();
        (store, search, Locker::new(Arc::new(table)))
    }

    fn fast_backoff() -> Backoff {
        Backoff::new(Duration::from_millis(1), Duration::from_millis(5), 20)
    }

    fn count(store: &SqliteStore, sql: &str) -> i64 {
        store.connection().query_row(sql, [], |r| r.get(0)).unwrap()
    }

    #[tokio::test]
    async fn test_sync_reconciles_in_batches() {
        let temp = TempDir::new().unwrap();
        let (store, search, locker) = setup(&temp);
        seed(&store, "94103", 5);

        let opts = SyncOptions {
            batch_size: 2,
            backoff: fast_backoff(),
            ..Default::default()
        };
        let stats = sync_properties(
            &locker,
            store.clone(),
            search.clone(),
            &opts,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(stats.zip5_count, 1);
        assert_eq!(stats.matched, 5);
        assert_eq!(stats.batches, 3);
        assert_eq!(count(&store, "SELECT count(*) FROM addresses"), 5);
        assert_eq!(
            count(&store, "SELECT count(*) FROM properties WHERE address_id IS NOT NULL"),
            5
        );
        assert_eq!(count(&store, "SELECT count(*) FROM ad_geom WHERE x_3857 IS NOT NULL"), 5);
        assert_eq!(search.document_count("addresses"), 5);

        // Already reconciled rows are not matched again.
        let stats = sync_properties(&locker, store.clone(), search.clone(), &opts, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(stats.matched, 0);
    }

    #[tokio::test]
    async fn test_sync_retries_backpressure() {
        let temp = TempDir::new().unwrap();
        let (store, search, locker) = setup(&temp);
        seed(&store, "94103", 3);
        search.fail_next(2);

        let opts = SyncOptions {
            backoff: fast_backoff(),
            ..Default::default()
        };
        let stats = sync_properties(&locker, store.clone(), search.clone(), &opts, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(stats.matched, 3);
        assert_eq!(count(&store, "SELECT count(*) FROM addresses"), 3);
        assert_eq!(search.document_count("addresses"), 3);
    }

    #[tokio::test]
    async fn test_sync_rolls_back_when_publish_fails() {
        let temp = TempDir::new().unwrap();
        let (store, search, locker) = setup(&temp);
        seed(&store, "94103", 2);
        search.fail_next(10);

        let opts = SyncOptions {
            backoff: Backoff::new(Duration::from_millis(1), Duration::from_millis(2), 3),
            ..Default::default()
        };
        let err = sync_properties(&locker, store.clone(), search.clone(), &opts, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::ResourceExhausted);
        assert_eq!(count(&store, "SELECT count(*) FROM addresses"), 0);
        assert_eq!(count(&store, "SELECT count(*) FROM properties"), 0);
        assert_eq!(search.document_count("addresses"), 0);
    }

    #[test]
    fn test_store_is_usable_while_publishing() {
        let temp = TempDir::new().unwrap();
        let (store, _search, _locker) = setup(&temp);
        seed(&store, "94103", 3);
        store.refresh_zip5().unwrap();

        let mut publish = |docs: &[PropertyAddress]| {
            assert_eq!(docs.len(), 3);
            let (tx, rx) = std::sync::mpsc::channel();
            let other = store.clone();
            std::thread::spawn(move || {
                let _ = tx.send(other.list_zip5().map(|z| z.len()));
            });
            let zips = rx.recv_timeout(Duration::from_secs(2)).unwrap().unwrap();
            assert_eq!(zips, 1);
            assert_eq!(count(&store, "SELECT count(*) FROM addresses"), 0);
            Ok::<(), Error>(())
        };
        let matched = store
            .sync_zip5_batch("94103", Uuid::new_v4(), 10, &mut publish)
            .unwrap();

        assert_eq!(matched, 3);
        assert_eq!(count(&store, "SELECT count(*) FROM addresses"), 3);
    }

    #[tokio::test]
    async fn test_sync_requires_index() {
        let temp = TempDir::new().unwrap();
        let (store, search, locker) = setup(&temp);
        let opts = SyncOptions {
            index: " ".to_string(),
            ..Default::default()
        };
        let err = sync_properties(&locker, store, search, &opts, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }
}
