use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use uuid::Uuid;

use super::{AcquireOutcome, Lease, LeaseRequest, LeaseTable, LockMode, LockStatus};
use crate::error::{Code, Error, Forward, Result};
use crate::store::LEASE_SCHEMA;

/// Lease rows kept in a coordination database shared by every worker.
pub struct SqliteLeaseTable {
    conn: Mutex<Connection>,
}

impl SqliteLeaseTable {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path)?;

        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(Duration::from_secs(5))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[cfg(test)]
    pub(crate) fn conn_for_tests(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn()
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn ttl_millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}

impl LeaseTable for SqliteLeaseTable {
    fn initialize(&self) -> Result<()> {
        self.conn().execute_batch(LEASE_SCHEMA)?;
        Ok(())
    }

    fn try_acquire(&self, req: &LeaseRequest) -> Result<AcquireOutcome> {
        let now = now_millis();
        let owner = req.owner_token.to_string();

        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute(
            "DELETE FROM leases WHERE lock_id = ?1 AND expires_at <= ?2",
            params![req.lock_id, now],
        )
        .forward("e37e056a-e2d0-4de0-8561-abb886d38d08")?;

        let (writers, readers): (i64, i64) = tx
            .query_row(
                "SELECT
                    COALESCE(SUM(mode = 1), 0),
                    COALESCE(SUM(mode = 0), 0)
                 FROM leases WHERE lock_id = ?1 AND owner_token <> ?2",
                params![req.lock_id, owner],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .forward("056f069b-398f-40a9-80b2-d765c5ad103c")?;

        let admitted = writers == 0 && !(req.no_readers && readers > 0);
        if !admitted {
            tx.commit()?;
            return Ok(AcquireOutcome::Conflict);
        }

        tx.execute(
            "INSERT INTO leases (lock_id, owner_token, mode, expires_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (lock_id, owner_token) DO UPDATE SET
                mode = excluded.mode,
                expires_at = excluded.expires_at",
            params![req.lock_id, owner, req.mode.code(), now + ttl_millis(req.ttl)],
        )
        .forward("081ff880-fb3d-4865-9d2e-c8bec8fc7ecd")?;
        tx.commit()?;

        // A writer's row now blocks new readers; it still has to wait out the
        // readers that were already in.
        if req.mode == LockMode::Write && readers > 0 {
            return Ok(AcquireOutcome::WaitingForReaders(readers));
        }
        Ok(AcquireOutcome::Acquired)
    }

    fn extend(&self, lock_id: &str, owner_token: Uuid, ttl: Duration) -> Result<()> {
        let rows = self
            .conn()
            .execute(
                "UPDATE leases SET expires_at = ?1 WHERE lock_id = ?2 AND owner_token = ?3",
                params![now_millis() + ttl_millis(ttl), lock_id, owner_token.to_string()],
            )
            .forward("5057a99d-8f77-4ca8-b4b1-fba491bba6f5")?;

        if rows == 0 {
            return Err(Error::new("6d137c8b-d44f-448f-9021-e7b6a1f7aec7", Code::Aborted, "Lease lost.")
                .with_label("LEASE_LOST")
                .with_meta("lock_id", lock_id));
        }
        Ok(())
    }

    fn release(&self, lock_id: &str, owner_token: Uuid) -> Result<bool> {
        let rows = self.conn().execute(
            "DELETE FROM leases WHERE lock_id = ?1 AND owner_token = ?2",
            params![lock_id, owner_token.to_string()],
        )?;
        Ok(rows > 0)
    }

    fn status(&self, lock_id: &str) -> Result<LockStatus> {
        let now = now_millis();
        let conn = self.conn();
        let (live_writers, live_readers, writers, readers): (i64, i64, i64, i64) = conn
            .query_row(
                "SELECT
                    COALESCE(SUM(mode = 1 AND expires_at > ?2), 0),
                    COALESCE(SUM(mode = 0 AND expires_at > ?2), 0),
                    COALESCE(SUM(mode = 1), 0),
                    COALESCE(SUM(mode = 0), 0)
                 FROM leases WHERE lock_id = ?1",
                params![lock_id, now],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .forward("d32af867-fcfd-4128-9fb7-ff20d851b2f5")?;

        Ok(if live_writers > 0 {
            LockStatus::AcquiredWrite
        } else if live_readers > 0 {
            LockStatus::AcquiredRead
        } else if writers > 0 {
            LockStatus::ExpiredWrite
        } else if readers > 0 {
            LockStatus::ExpiredRead
        } else {
            LockStatus::NotPresent
        })
    }

    fn get(&self, lock_id: &str, owner_token: Uuid) -> Result<Option<Lease>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT mode, expires_at FROM leases WHERE lock_id = ?1 AND owner_token = ?2",
            params![lock_id, owner_token.to_string()],
            |row| {
                let mode: i64 = row.get(0)?;
                let expires_at: i64 = row.get(1)?;
                Ok(Lease {
                    lock_id: lock_id.to_string(),
                    owner_token,
                    mode: if mode == 1 {
                        LockMode::Write
                    } else {
                        LockMode::Read
                    },
                    expires_at: DateTime::from_timestamp_millis(expires_at)
                        .unwrap_or_else(Utc::now),
                })
            },
        )
        .optional()
        .map_err(Error::from)
    }
}
