//! Ingestion resume and priority ordering across workers.

mod common;

use std::sync::Arc;

use propline::config::{FileRuleConfig, PartnerConfig};
use propline::ingest::{
    ConfiguredPartner, DataSource, Discovery, DispatchOptions, LocalBackend, Pipeline,
    ProcessOptions, process_data_source,
};
use propline::store::path::object_hash;
use propline::store::{BatchWrite, LeaseFilter, NewDataFileObject, Store};
use propline::types::DataFileStatus;
use rusqlite::types::Value as SqlValue;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn rule(pattern: &str, priorities: Vec<i32>) -> FileRuleConfig {
    FileRuleConfig {
        pattern: pattern.to_string(),
        file_type: 41,
        priorities,
        table: Some("rows".to_string()),
        columns: vec!["id".to_string(), "name".to_string()],
        ..Default::default()
    }
}

fn partner(rules: Vec<FileRuleConfig>) -> ConfiguredPartner {
    let config = PartnerConfig {
        id: Some(Uuid::new_v4()),
        rules,
        ..Default::default()
    };
    ConfiguredPartner::new("acme", &config).unwrap()
}

fn create_rows_table(store: &propline::store::SqliteStore) {
    store
        .connection()
        .execute_batch("CREATE TABLE rows (id INTEGER PRIMARY KEY, name TEXT)")
        .unwrap();
}

#[tokio::test]
async fn test_killed_load_resumes_from_checkpoint() {
    let temp = TempDir::new().unwrap();
    let store = common::store(&temp);
    create_rows_table(&store);

    let drop = temp.path().join("drop");
    std::fs::create_dir_all(&drop).unwrap();
    let body = common::rows_body(0..1500);
    common::write_zip(&drop.join("x.zip"), &[("x.txt", body.as_bytes())]);

    let source = partner(vec![rule("*.zip", vec![1])]);
    let backend = LocalBackend::new(&drop);

    Discovery {
        store: store.as_ref(),
        backend: &backend,
        source: &source,
        meta: None,
    }
    .run("")
    .unwrap();

    // The first worker leased the archive and flushed two batches of 500.
    let filter = LeaseFilter {
        partner_id: source.partner_id(),
        ..Default::default()
    };
    let leased = store.lease_objects(&filter, Uuid::new_v4(), 1).unwrap();
    assert_eq!(leased.len(), 1);
    let archive = &leased[0];

    let member = store
        .ensure_object(&NewDataFileObject {
            directory_id: archive.directory_id.unwrap(),
            parent_file_id: Some(archive.id),
            file_type: archive.file_type,
            hash: object_hash(&format!("{}/x.txt", archive.path())),
            file_dir: archive.path(),
            file_name: "x.txt".to_string(),
            file_size: 0,
            priorities: Vec::new(),
            meta: None,
        })
        .unwrap();
    store
        .update_object_status(member.id, DataFileStatus::InProgress)
        .unwrap();

    let columns = vec!["id".to_string(), "name".to_string()];
    for batch in 0..2 {
        let rows: Vec<Vec<SqlValue>> = (batch * 500..(batch + 1) * 500)
            .map(|i| vec![SqlValue::Integer(i), SqlValue::Text(format!("name {i}"))])
            .collect();
        store
            .flush_batch(
                member.id,
                (batch + 1) * 500,
                BatchWrite::Insert {
                    table: "rows",
                    columns: &columns,
                    rows: &rows,
                },
            )
            .unwrap();
    }

    let restarted = store.get_object(archive.id).unwrap().unwrap();
    assert_eq!(restarted.status, DataFileStatus::InProgress);
    assert_eq!(store.get_object(member.id).unwrap().unwrap().record_count, 1000);

    // A new worker picks it up.
    let pipeline = Pipeline {
        store: store.clone(),
        backend: Arc::new(LocalBackend::new(&drop)),
        source: Arc::new(source),
    };
    let opts = ProcessOptions {
        dispatch: DispatchOptions {
            batch_size: Some(500),
            ..Default::default()
        },
        lock: common::fast_lock(),
        ..Default::default()
    };
    let stats = process_data_source(
        &common::locker(&temp),
        &pipeline,
        &opts,
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(stats.dispatch.objects, 1);
    assert_eq!(stats.dispatch.records.skipped_records, 1000);
    assert_eq!(stats.dispatch.records.processed_records, 500);
    assert_eq!(common::count(&store, "SELECT count(*) FROM rows"), 1500);

    let member = store.get_object(member.id).unwrap().unwrap();
    assert_eq!(member.record_count, 1500);
    assert_eq!(member.status, DataFileStatus::Done);
    assert_eq!(
        store.get_object(archive.id).unwrap().unwrap().status,
        DataFileStatus::Done
    );
}

#[test]
fn test_priority_groups_gate_leasing() {
    let temp = TempDir::new().unwrap();
    let store = common::store(&temp);

    let drop = temp.path().join("drop");
    std::fs::create_dir_all(&drop).unwrap();
    for name in ["a.txt", "b.txt", "c.txt"] {
        std::fs::write(drop.join(name), common::rows_body(0..1)).unwrap();
    }

    let source = partner(vec![
        rule("a.txt", vec![1, 1]),
        rule("b.txt", vec![1, 2]),
        rule("c.txt", vec![2, 1]),
    ]);
    let backend = LocalBackend::new(&drop);
    let to_load = Discovery {
        store: store.as_ref(),
        backend: &backend,
        source: &source,
        meta: None,
    }
    .run("")
    .unwrap();
    assert_eq!(to_load, 3);

    let filter = LeaseFilter {
        partner_id: source.partner_id(),
        ..Default::default()
    };
    let worker = Uuid::new_v4();

    // Three slots, but B waits behind A in group 1.
    let first = store.lease_objects(&filter, worker, 3).unwrap();
    let names: Vec<&str> = first.iter().map(|o| o.file_name.as_str()).collect();
    assert_eq!(names, ["a.txt", "c.txt"]);
    assert!(store.lease_objects(&filter, worker, 3).unwrap().is_empty());

    store
        .update_object_status(first[0].id, DataFileStatus::Done)
        .unwrap();
    let next = store.lease_objects(&filter, worker, 3).unwrap();
    let names: Vec<&str> = next.iter().map(|o| o.file_name.as_str()).collect();
    assert_eq!(names, ["b.txt"]);

    // Ignored unblocks the group the same way.
    let grouped = LeaseFilter {
        priority_group: Some(2),
        ..filter
    };
    store
        .update_object_status(first[1].id, DataFileStatus::Ignored)
        .unwrap();
    assert!(store.lease_objects(&grouped, worker, 3).unwrap().is_empty());
}

#[tokio::test]
async fn test_rerun_under_new_meta_loads_what_it_discovers() {
    let temp = TempDir::new().unwrap();
    let store = common::store(&temp);
    create_rows_table(&store);

    let drop = temp.path().join("drop");
    std::fs::create_dir_all(&drop).unwrap();
    std::fs::write(drop.join("a.txt"), common::rows_body(0..4)).unwrap();

    let source = Arc::new(partner(vec![rule("*.txt", vec![1])]));
    let backend = Arc::new(LocalBackend::new(&drop));

    let first = serde_json::json!({ "run": "a" });
    Discovery {
        store: store.as_ref(),
        backend: backend.as_ref(),
        source: source.as_ref(),
        meta: Some(&first),
    }
    .run("")
    .unwrap();

    let pipeline = Pipeline {
        store: store.clone(),
        backend,
        source,
    };
    let opts = ProcessOptions {
        meta: Some(serde_json::json!({ "run": "b" })),
        lock: common::fast_lock(),
        ..Default::default()
    };
    let stats = process_data_source(
        &common::locker(&temp),
        &pipeline,
        &opts,
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(stats.objects_to_load, 1);
    assert_eq!(stats.dispatch.objects, stats.objects_to_load);
    assert_eq!(common::count(&store, "SELECT count(*) FROM rows"), 4);
    assert_eq!(
        common::count(&store, "SELECT count(*) FROM data_file_directories"),
        2
    );
}
