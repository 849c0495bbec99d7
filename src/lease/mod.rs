//! Lease-based distributed mutual exclusion.
//!
//! A [`Locker`] acquires one lease at a time on a shared [`LeaseTable`]. The
//! returned [`LeaseGuard`] keeps the lease alive from a background task and
//! signals through [`LeaseGuard::lost`] when an extension fails.

mod backoff;
mod sqlite;

pub use backoff::Backoff;
pub use sqlite::SqliteLeaseTable;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Code, Error, Forward, Result};
use crate::store::blocking;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Read,
    Write,
}

impl LockMode {
    #[must_use]
    pub fn code(self) -> i64 {
        match self {
            LockMode::Read => 0,
            LockMode::Write => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStatus {
    NotPresent,
    AcquiredRead,
    AcquiredWrite,
    ExpiredRead,
    ExpiredWrite,
}

impl fmt::Display for LockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LockStatus::NotPresent => "NOT_PRESENT",
            LockStatus::AcquiredRead => "ACQUIRED_READ",
            LockStatus::AcquiredWrite => "ACQUIRED_WRITE",
            LockStatus::ExpiredRead => "EXPIRED_READ",
            LockStatus::ExpiredWrite => "EXPIRED_WRITE",
        })
    }
}

/// Pipeline stages that are serialized per partner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Fetcher,
    Loader,
    OsLoader,
    Synther,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Fetcher => "fetcher",
            Role::Loader => "loader",
            Role::OsLoader => "osloader",
            Role::Synther => "synther",
        }
    }

    #[must_use]
    pub fn lock_id(self, partner_id: Uuid) -> String {
        format!("{partner_id}:{}", self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct Lease {
    pub lock_id: String,
    pub owner_token: Uuid,
    pub mode: LockMode,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct LeaseRequest {
    pub lock_id: String,
    pub owner_token: Uuid,
    pub mode: LockMode,
    pub ttl: Duration,
    pub no_readers: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired,
    /// The row was written but this many foreign readers are still live.
    WaitingForReaders(i64),
    Conflict,
}

/// Conditional writes over the shared coordination table.
pub trait LeaseTable: Send + Sync {
    fn initialize(&self) -> Result<()>;
    /// Inserts or refreshes the caller's row when no live row conflicts.
    fn try_acquire(&self, req: &LeaseRequest) -> Result<AcquireOutcome>;
    /// Pushes the deadline of the caller's row out by `ttl`.
    fn extend(&self, lock_id: &str, owner_token: Uuid, ttl: Duration) -> Result<()>;
    fn release(&self, lock_id: &str, owner_token: Uuid) -> Result<bool>;
    fn status(&self, lock_id: &str) -> Result<LockStatus>;
    fn get(&self, lock_id: &str, owner_token: Uuid) -> Result<Option<Lease>>;
}

#[derive(Debug, Clone)]
pub struct LockOptions {
    pub mode: LockMode,
    pub ttl: Duration,
    pub poll_interval: Duration,
    pub timeout: Duration,
    /// Fail immediately instead of waiting for a conflicting lease.
    pub no_polling: bool,
    pub no_readers: bool,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            mode: LockMode::Write,
            ttl: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
            timeout: Duration::from_secs(60),
            no_polling: false,
            no_readers: true,
        }
    }
}

/// Holds at most one lease at a time.
pub struct Locker {
    table: Arc<dyn LeaseTable>,
    in_use: Arc<AtomicBool>,
}

impl Locker {
    pub fn new(table: Arc<dyn LeaseTable>) -> Self {
        Self {
            table,
            in_use: Arc::new(AtomicBool::new(false)),
        }
    }

    pub async fn acquire(
        &self,
        lock_id: &str,
        opts: &LockOptions,
        cancel: &CancellationToken,
    ) -> Result<LeaseGuard> {
        if lock_id.is_empty() {
            return Err(Error::new("1a3c98a4-3846-46c5-81da-cb3ba3caf235", Code::InvalidArgument, "Lock id is required."));
        }

        if self.in_use.swap(true, Ordering::SeqCst) {
            return Err(Error::new(
                "f112bb3a-e093-41b6-8655-2a05617912a9",
                Code::FailedPrecondition,
                "Locker already in use.",
            ));
        }

        let req = LeaseRequest {
            lock_id: lock_id.to_string(),
            owner_token: Uuid::new_v4(),
            mode: opts.mode,
            ttl: opts.ttl,
            no_readers: opts.no_readers,
        };

        let result = self.poll_acquire(&req, opts, cancel).await;

        if let Err(err) = result {
            // A waiting writer may have left its row behind.
            if let Err(release_err) = release_row(&self.table, &req.lock_id, req.owner_token).await {
                tracing::warn!(lock_id, error = %release_err, "Failed to clear lock row");
            }
            self.in_use.store(false, Ordering::SeqCst);
            return Err(err.forward("a239ae14-fefb-48e7-9b2d-530b92de3e55"));
        }

        tracing::info!(lock_id, mode = ?opts.mode, "Lock acquired");
        Ok(LeaseGuard::start(
            self.table.clone(),
            req,
            self.in_use.clone(),
        ))
    }

    /// Polls until acquired. Cancel and timeout are checked between attempts
    /// so no table call is ever left running behind the caller.
    async fn poll_acquire(
        &self,
        req: &LeaseRequest,
        opts: &LockOptions,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let deadline = tokio::time::Instant::now() + opts.timeout;
        loop {
            if cancel.is_cancelled() {
                return Err(canceled(&req.lock_id));
            }

            let table = self.table.clone();
            let attempt = req.clone();
            let outcome = blocking(move || table.try_acquire(&attempt))
                .await
                .forward("5e8dabe0-b993-4bd2-a836-511a08e6e5c3")?;

            match outcome {
                AcquireOutcome::Acquired => return Ok(()),
                AcquireOutcome::WaitingForReaders(readers) => {
                    if opts.no_polling {
                        return Err(Error::new("17edcc61-444f-48f3-9e43-efd2610c2129", Code::Aborted, "Lock condition failed.")
                            .with_meta("reader_count", readers));
                    }
                    tracing::info!(
                        lock_id = %req.lock_id,
                        reader_count = readers,
                        "Waiting for readers to release lock"
                    );
                }
                AcquireOutcome::Conflict => {
                    if opts.no_polling {
                        return Err(
                            Error::new("31d0b8d0-dcc8-442f-b5cc-7af865ac5f19", Code::Aborted, "Lock condition failed.")
                                .with_meta("lock_id", req.lock_id.as_str()),
                        );
                    }
                    tracing::debug!(lock_id = %req.lock_id, "Lock busy, polling");
                }
            }

            tokio::select! {
                () = cancel.cancelled() => return Err(canceled(&req.lock_id)),
                () = tokio::time::sleep_until(deadline) => {
                    return Err(
                        Error::new("bcd79d58-494b-4e29-9985-cc7b8853cf84", Code::DeadlineExceeded, "Timed out acquiring lock.")
                            .with_meta("lock_id", req.lock_id.as_str()),
                    );
                }
                () = tokio::time::sleep(opts.poll_interval) => {}
            }
        }
    }

    pub async fn status(&self, lock_id: &str) -> Result<LockStatus> {
        let table = self.table.clone();
        let lock_id = lock_id.to_string();
        blocking(move || table.status(&lock_id))
            .await
            .forward("bf93f0fb-2a45-44d5-87ec-850ff9386f5c")
    }
}

/// A held lease. The extension task stops and the row is deleted on
/// [`LeaseGuard::release`] or drop.
pub struct LeaseGuard {
    table: Arc<dyn LeaseTable>,
    lock_id: String,
    owner_token: Uuid,
    ttl: Duration,
    lost: CancellationToken,
    stop: CancellationToken,
    ticker: Option<JoinHandle<()>>,
    in_use: Arc<AtomicBool>,
}

impl std::fmt::Debug for LeaseGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseGuard")
            .field("lock_id", &self.lock_id)
            .field("owner_token", &self.owner_token)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl LeaseGuard {
    fn start(table: Arc<dyn LeaseTable>, req: LeaseRequest, in_use: Arc<AtomicBool>) -> Self {
        let lost = CancellationToken::new();
        let stop = CancellationToken::new();

        let ticker = tokio::spawn(extend_loop(
            table.clone(),
            req.lock_id.clone(),
            req.owner_token,
            req.ttl,
            lost.clone(),
            stop.clone(),
        ));

        Self {
            table,
            lock_id: req.lock_id,
            owner_token: req.owner_token,
            ttl: req.ttl,
            lost,
            stop,
            ticker: Some(ticker),
            in_use,
        }
    }

    #[must_use]
    pub fn lock_id(&self) -> &str {
        &self.lock_id
    }

    #[must_use]
    pub fn owner_token(&self) -> Uuid {
        self.owner_token
    }

    /// Fires once the lease can no longer be trusted.
    #[must_use]
    pub fn lost(&self) -> CancellationToken {
        self.lost.clone()
    }

    /// Fails with `aborted` when the lease was already lost.
    pub fn check(&self) -> Result<()> {
        if self.lost.is_cancelled() {
            return Err(Error::new("2f51583a-21c9-42b5-abf9-6fa60cbbdee1", Code::Aborted, "Lease lost.")
                .with_label("LEASE_LOST")
                .with_meta("lock_id", self.lock_id.as_str()));
        }
        Ok(())
    }

    pub async fn extend(&self) -> Result<()> {
        let table = self.table.clone();
        let lock_id = self.lock_id.clone();
        let (owner_token, ttl) = (self.owner_token, self.ttl);
        blocking(move || table.extend(&lock_id, owner_token, ttl))
            .await
            .forward("41f05860-c61f-47f6-abb2-958d3d81e55a")
    }

    pub async fn release(mut self) -> Result<()> {
        self.stop.cancel();
        if let Some(ticker) = self.ticker.take() {
            if let Err(e) = ticker.await {
                tracing::error!(lock_id = %self.lock_id, error = %e, "Lock extender failed");
            }
        }
        self.in_use.store(false, Ordering::SeqCst);
        release_row(&self.table, &self.lock_id, self.owner_token)
            .await
            .forward("4bc23121-1c74-418c-bd25-5c2211e5816d")?;
        tracing::info!(lock_id = %self.lock_id, "Lock released");
        Ok(())
    }
}

/// Runs `f` while holding `lock_id`, or unlocked when `lock_id` is `None`.
///
/// The token handed to `f` fires on `cancel` and when the lease is lost. A
/// lost lease is reported as `aborted` in place of whatever `f` returned.
pub async fn with_lock<T, F, Fut>(
    locker: &Locker,
    lock_id: Option<&str>,
    opts: &LockOptions,
    cancel: &CancellationToken,
    f: F,
) -> Result<T>
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let guard = match lock_id {
        Some(id) => Some(locker.acquire(id, opts, cancel).await.forward("32c28679-b115-4ce3-b195-bfb157a1b58c")?),
        None => None,
    };

    let work = cancel.child_token();
    if let Some(guard) = &guard {
        let lost = guard.lost();
        let work = work.clone();
        let lock_id = guard.lock_id().to_string();
        tokio::spawn(async move {
            tokio::select! {
                () = lost.cancelled() => {
                    tracing::error!(lock_id = %lock_id, "Lease lost, stopping work");
                    work.cancel();
                }
                () = work.cancelled() => {}
            }
        });
    }

    let result = f(work.clone()).await;
    work.cancel();

    let Some(guard) = guard else {
        return result;
    };
    let lost = guard.check();
    let released = guard.release().await;
    lost.forward("1dc6b21e-276d-42be-a5f3-10eadb0725d4")?;
    released.forward("bf15c304-d59f-4f73-8a75-efa2c59d6a08")?;
    result
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if self.ticker.is_some() {
            // Not released explicitly: the extender deletes the row on stop.
            self.stop.cancel();
            self.in_use.store(false, Ordering::SeqCst);
        }
    }
}

fn canceled(lock_id: &str) -> Error {
    Error::new("bd8864d0-768c-4c3f-addd-1b21b7874955", Code::Canceled, "Context was canceled.")
        .with_meta("lock_id", lock_id)
}

async fn release_row(table: &Arc<dyn LeaseTable>, lock_id: &str, owner_token: Uuid) -> Result<bool> {
    let table = table.clone();
    let lock_id = lock_id.to_string();
    blocking(move || table.release(&lock_id, owner_token)).await
}

async fn extend_loop(
    table: Arc<dyn LeaseTable>,
    lock_id: String,
    owner_token: Uuid,
    ttl: Duration,
    lost: CancellationToken,
    stop: CancellationToken,
) {
    let mut interval = tokio::time::interval(ttl / 2);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = stop.cancelled() => {
                if let Err(e) = release_row(&table, &lock_id, owner_token).await {
                    tracing::warn!(lock_id = %lock_id, error = %e, "Failed to release lock");
                }
                return;
            }
            _ = interval.tick() => {
                let extended = {
                    let table = table.clone();
                    let lock_id = lock_id.clone();
                    blocking(move || table.extend(&lock_id, owner_token, ttl)).await
                };
                if let Err(e) = extended {
                    tracing::error!(lock_id = %lock_id, error = %e, "Lock extension failed, lease lost");
                    lost.cancel();
                    return;
                }
                tracing::debug!(lock_id = %lock_id, "Lock extended");
            }
        }
    }
}
