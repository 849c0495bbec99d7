//! CLI integration tests for the propline binary.
//!
//! Each test uses an isolated temp directory for the databases and the
//! partner drop, so tests can run in parallel safely.

#![allow(deprecated)] // Command::cargo_bin deprecation only affects custom build dirs

use assert_cmd::Command;
use assert_fs::TempDir;
use assert_fs::prelude::*;
use predicates::prelude::*;
use propline::store::SqliteStore;
use uuid::Uuid;

struct TestContext {
    temp_dir: TempDir,
}

impl TestContext {
    fn new() -> Self {
        let ctx = Self {
            temp_dir: TempDir::new().expect("failed to create temp dir"),
        };
        let data_dir = ctx.temp_dir.child("data");
        let drop_dir = ctx.temp_dir.child("drop");
        drop_dir.create_dir_all().unwrap();

        ctx.temp_dir
            .child("propline.toml")
            .write_str(&format!(
                r#"data_dir = "{data}"

[worker]
poll_interval_ms = 20
lock_ttl_secs = 5
acquire_timeout_secs = 5

[partners.acme]
id = "{id}"
root = "{root}"

[[partners.acme.rules]]
pattern = "*.txt"
file_type = 9
priorities = [1]
table = "rows"
columns = ["id", "name"]
"#,
                data = data_dir.path().display(),
                id = Uuid::new_v4(),
                root = drop_dir.path().display(),
            ))
            .unwrap();
        ctx
    }

    fn config_path(&self) -> String {
        self.temp_dir
            .child("propline.toml")
            .path()
            .to_string_lossy()
            .to_string()
    }

    fn cmd(&self) -> Command {
        let mut cmd = Command::cargo_bin("propline").expect("failed to find binary");
        cmd.env("NO_COLOR", "1").env_remove("PROPLINE_CONFIG");
        cmd
    }

    fn run(&self, args: &[&str]) -> assert_cmd::assert::Assert {
        let config = self.config_path();
        self.cmd()
            .args(["--config", config.as_str()])
            .args(args)
            .assert()
    }

    fn store(&self) -> SqliteStore {
        SqliteStore::new(self.temp_dir.child("data").child("propline.db").path()).unwrap()
    }
}

#[test]
fn test_init_creates_databases() {
    let ctx = TestContext::new();

    ctx.run(&["init"])
        .success()
        .stdout(predicate::str::contains("propline.db"))
        .stdout(predicate::str::contains("coordination.db"));

    ctx.temp_dir
        .child("data")
        .child("propline.db")
        .assert(predicate::path::exists());

    // Idempotent.
    ctx.run(&["init"]).success();
}

#[test]
fn test_missing_config_fails() {
    let ctx = TestContext::new();
    ctx.cmd()
        .arg("init")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Missing config file path"));
}

#[test]
fn test_key_create_prints_credential() {
    let ctx = TestContext::new();
    let org = Uuid::new_v4().to_string();

    ctx.run(&[
        "key", "create", "--org", &org, "--daily", "10", "--monthly", "100", "--layouts",
        "address,assessor",
    ])
    .success()
    .stdout(predicate::str::contains("AM.p."));

    let keys: i64 = ctx
        .store()
        .connection()
        .query_row("SELECT count(*) FROM api_keys", [], |r| r.get(0))
        .unwrap();
    assert_eq!(keys, 1);
}

#[test]
fn test_key_create_rejects_unknown_layout() {
    let ctx = TestContext::new();
    let org = Uuid::new_v4().to_string();

    ctx.run(&[
        "key", "create", "--org", &org, "--daily", "1", "--monthly", "1", "--layouts", "gold",
    ])
    .failure()
    .stderr(predicate::str::contains("unknown layout"));
}

#[test]
fn test_load_configured_partner() {
    let ctx = TestContext::new();
    ctx.run(&["init"]).success();
    ctx.store()
        .connection()
        .execute_batch("CREATE TABLE rows (id TEXT PRIMARY KEY, name TEXT)")
        .unwrap();

    ctx.temp_dir
        .child("drop")
        .child("part_1.txt")
        .write_str("ID|NAME\n1|one\n2|two\n3|three\n")
        .unwrap();

    ctx.run(&["load", "--partner", "acme", "--meta", "run=1"])
        .success()
        .stdout(predicate::str::contains("Loaded 1 objects (3 records"));

    let rows: i64 = ctx
        .store()
        .connection()
        .query_row("SELECT count(*) FROM rows", [], |r| r.get(0))
        .unwrap();
    assert_eq!(rows, 3);
}

#[test]
fn test_load_unknown_partner_fails() {
    let ctx = TestContext::new();
    ctx.run(&["load", "--partner", "nobody"])
        .failure()
        .stderr(predicate::str::contains("Unknown partner"));
}

#[test]
fn test_load_rejects_malformed_meta() {
    let ctx = TestContext::new();
    ctx.run(&["load", "--partner", "acme", "--meta", "novalue"])
        .failure()
        .stderr(predicate::str::contains("expected key=value"));
}
