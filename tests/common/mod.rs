//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use propline::lease::{LeaseTable, LockOptions, Locker, SqliteLeaseTable};
use propline::store::{SqliteStore, Store};
use tempfile::TempDir;

pub fn store(temp: &TempDir) -> Arc<SqliteStore> {
    let store = Arc::new(SqliteStore::new(temp.path().join("propline.db")).expect("open store"));
    store.initialize().expect("initialize store");
    store
}

pub fn lease_table(temp: &TempDir) -> Arc<SqliteLeaseTable> {
    let table =
        Arc::new(SqliteLeaseTable::new(temp.path().join("coordination.db")).expect("open leases"));
    table.initialize().expect("initialize leases");
    table
}

pub fn locker(temp: &TempDir) -> Locker {
    Locker::new(lease_table(temp))
}

pub fn fast_lock() -> LockOptions {
    LockOptions {
        ttl: Duration::from_millis(400),
        poll_interval: Duration::from_millis(20),
        timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

pub fn count(store: &SqliteStore, sql: &str) -> i64 {
    store
        .connection()
        .query_row(sql, [], |r| r.get(0))
        .expect("count query")
}

/// Pipe-separated text body with an `ID|NAME` header.
pub fn rows_body(range: std::ops::Range<usize>) -> String {
    let mut body = String::from("ID|NAME\n");
    for i in range {
        body.push_str(&format!("{i}|name {i}\n"));
    }
    body
}

pub fn write_zip(path: &Path, members: &[(&str, &[u8])]) {
    use std::io::Write;

    let file = std::fs::File::create(path).expect("create zip");
    let mut zip = zip::ZipWriter::new(file);
    for (name, body) in members {
        zip.start_file(*name, zip::write::SimpleFileOptions::default())
            .expect("start member");
        zip.write_all(body).expect("write member");
    }
    zip.finish().expect("finish zip");
}
