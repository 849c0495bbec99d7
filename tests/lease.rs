//! Lease extension and loss of the coordination store.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use propline::error::{Code, Error, Result};
use propline::lease::{
    AcquireOutcome, Lease, LeaseRequest, LeaseTable, LockStatus, Locker, SqliteLeaseTable,
    with_lock,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Lease table whose connectivity can be cut.
struct Flaky {
    inner: Arc<SqliteLeaseTable>,
    offline: AtomicBool,
}

impl Flaky {
    fn check(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::new("test", Code::Unavailable, "Connection refused."));
        }
        Ok(())
    }
}

impl LeaseTable for Flaky {
    fn initialize(&self) -> Result<()> {
        self.inner.initialize()
    }

    fn try_acquire(&self, req: &LeaseRequest) -> Result<AcquireOutcome> {
        self.check()?;
        self.inner.try_acquire(req)
    }

    fn extend(&self, lock_id: &str, owner_token: Uuid, ttl: Duration) -> Result<()> {
        self.check()?;
        self.inner.extend(lock_id, owner_token, ttl)
    }

    fn release(&self, lock_id: &str, owner_token: Uuid) -> Result<bool> {
        self.check()?;
        self.inner.release(lock_id, owner_token)
    }

    fn status(&self, lock_id: &str) -> Result<LockStatus> {
        self.inner.status(lock_id)
    }

    fn get(&self, lock_id: &str, owner_token: Uuid) -> Result<Option<Lease>> {
        self.inner.get(lock_id, owner_token)
    }
}

#[tokio::test]
async fn test_extension_moves_deadline() {
    let temp = TempDir::new().unwrap();
    let table = common::lease_table(&temp);
    let locker = Locker::new(table.clone());

    let guard = locker
        .acquire("partner:loader", &common::fast_lock(), &CancellationToken::new())
        .await
        .unwrap();
    let before = table
        .get("partner:loader", guard.owner_token())
        .unwrap()
        .unwrap()
        .expires_at;

    // ttl is 400ms; the ticker fires every 200ms.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let after = table
        .get("partner:loader", guard.owner_token())
        .unwrap()
        .unwrap()
        .expires_at;
    assert!(after > before);
    assert!(guard.check().is_ok());

    guard.release().await.unwrap();
    assert_eq!(table.status("partner:loader").unwrap(), LockStatus::NotPresent);
}

#[tokio::test]
async fn test_lost_connectivity_stops_critical_section() {
    let temp = TempDir::new().unwrap();
    let flaky = Arc::new(Flaky {
        inner: common::lease_table(&temp),
        offline: AtomicBool::new(false),
    });
    let locker = Locker::new(flaky.clone());
    let writes = Arc::new(AtomicUsize::new(0));

    let err = with_lock(
        &locker,
        Some("partner:synther"),
        &common::fast_lock(),
        &CancellationToken::new(),
        |work| {
            let flaky = flaky.clone();
            let writes = writes.clone();
            async move {
                loop {
                    if work.is_cancelled() {
                        return Err::<(), _>(Error::new("test", Code::Canceled, "Stopped."));
                    }
                    writes.fetch_add(1, Ordering::SeqCst);
                    if writes.load(Ordering::SeqCst) == 3 {
                        flaky.offline.store(true, Ordering::SeqCst);
                    }
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        },
    )
    .await
    .unwrap_err();

    assert_eq!(err.code(), Code::Aborted);
    assert_eq!(err.label(), Some("LEASE_LOST"));

    // No writes after the stop.
    let stopped_at = writes.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(writes.load(Ordering::SeqCst), stopped_at);
}
