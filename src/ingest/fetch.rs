use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Code, Error, Forward, Result};
use crate::lease::{LockOptions, Locker, Role, with_lock};

/// Log line rclone writes when source and destination already match.
pub const NOTHING_TO_TRANSFER: &str = "There was nothing to transfer";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    NothingToTransfer,
    Transferred,
}

#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub source: String,
    pub destination: String,
    /// Used for both `--checkers` and `--transfers`.
    pub parallelism: usize,
    pub program: String,
}

impl FetchRequest {
    pub fn new(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            parallelism: 8,
            program: "rclone".to_string(),
        }
    }
}

/// Only the first line is checked; rclone prints the sentinel there.
#[must_use]
pub fn scan_log(log: &str) -> FetchOutcome {
    match log.lines().next() {
        Some(line) if line.contains(NOTHING_TO_TRANSFER) => FetchOutcome::NothingToTransfer,
        _ => FetchOutcome::Transferred,
    }
}

/// Mirrors `source` into `destination`, comparing by size only.
pub async fn fetch(req: &FetchRequest) -> Result<FetchOutcome> {
    if req.source.is_empty() {
        return Err(Error::new("b4b76cdd-246e-4856-8a01-ff34c621c3c2", Code::InvalidArgument, "Missing source."));
    }
    if req.destination.is_empty() {
        return Err(Error::new("93221ea7-b3f2-4b3d-9f08-43c4f9f15883", Code::InvalidArgument, "Missing destination."));
    }

    let log_path = std::env::temp_dir().join(format!("propline-fetch-{}.log", Uuid::new_v4()));
    let result = run_copy(req, &log_path).await;

    let log = tokio::fs::read_to_string(&log_path).await.unwrap_or_default();
    if let Err(e) = tokio::fs::remove_file(&log_path).await {
        tracing::debug!(path = %log_path.display(), error = %e, "Failed to remove fetch log");
    }
    result.forward("5806cfce-24eb-4c94-88f0-bf417ce72fd7")?;

    let outcome = scan_log(&log);
    tracing::info!(
        source = %req.source,
        destination = %req.destination,
        outcome = ?outcome,
        "Fetch finished"
    );
    Ok(outcome)
}

async fn run_copy(req: &FetchRequest, log_path: &Path) -> Result<()> {
    let parallelism = req.parallelism.max(1).to_string();

    let output = Command::new(&req.program)
        .arg("copy")
        .arg("--size-only")
        .arg(format!("--checkers={parallelism}"))
        .arg(format!("--transfers={parallelism}"))
        .arg(&req.source)
        .arg(&req.destination)
        .arg("--log-file")
        .arg(log_path)
        .args(["--log-level", "INFO"])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| {
            Error::new("9fd15283-e2b0-4822-8ac9-03e19a7079a3", Code::FailedPrecondition, "Failed to run copy tool.")
                .with_cause(e)
                .with_meta("program", req.program.as_str())
        })?;

    if !output.status.success() {
        return Err(
            Error::new("28767fcc-7321-4a53-b951-a917f13ef27a", Code::Unknown, "Copy tool failed.")
                .with_meta("status", output.status.code().unwrap_or(-1))
                .with_meta("stderr", String::from_utf8_lossy(&output.stderr).into_owned()),
        );
    }

    Ok(())
}

/// Runs [`fetch`] under the partner's fetcher lock.
pub async fn fetch_data_source(
    locker: &Locker,
    partner_id: Uuid,
    req: &FetchRequest,
    lock: &LockOptions,
    cancel: &CancellationToken,
) -> Result<FetchOutcome> {
    let lock_id = Role::Fetcher.lock_id(partner_id);
    with_lock(locker, Some(&lock_id), lock, cancel, |work| async move {
        tokio::select! {
            res = fetch(req) => res,
            () = work.cancelled() => Err(Error::new("8f13b4b9-4399-4bb9-92a8-00a634d9f8ad", Code::Canceled, "Fetch was canceled.")),
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_log() {
        let log = "2025/01/02 10:00:00 INFO  : There was nothing to transfer\nmore";
        assert_eq!(scan_log(log), FetchOutcome::NothingToTransfer);
        assert_eq!(scan_log(""), FetchOutcome::Transferred);
        assert_eq!(
            scan_log("INFO : a.zip: Copied (new)\nThere was nothing to transfer"),
            FetchOutcome::Transferred
        );
    }

    #[tokio::test]
    async fn test_fetch_requires_uris() {
        let err = fetch(&FetchRequest::new("", "/dst")).await.unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
        let err = fetch(&FetchRequest::new("/src", "")).await.unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[cfg(unix)]
    fn fake_rclone(dir: &Path, first_line: &str, exit: i32) -> String {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join(format!("rclone-{}", Uuid::new_v4()));
        let script = format!(
            "#!/bin/sh\nwhile [ $# -gt 0 ]; do\n  if [ \"$1\" = \"--log-file\" ]; then shift; echo \"{first_line}\" > \"$1\"; fi\n  shift\ndone\necho boom >&2\nexit {exit}\n"
        );
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.display().to_string()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_fetch_runs_copy_tool() {
        let temp = tempfile::TempDir::new().unwrap();

        let mut req = FetchRequest::new("remote:drop", "/data/drop");
        req.program = fake_rclone(temp.path(), "INFO : There was nothing to transfer", 0);
        assert_eq!(fetch(&req).await.unwrap(), FetchOutcome::NothingToTransfer);

        req.program = fake_rclone(temp.path(), "INFO : a.zip: Copied (new)", 0);
        assert_eq!(fetch(&req).await.unwrap(), FetchOutcome::Transferred);

        req.program = fake_rclone(temp.path(), "ERROR : quota", 3);
        let err = fetch(&req).await.unwrap_err();
        assert_eq!(err.code(), Code::Unknown);
        match err.first() {
            Error::Object(obj) => assert_eq!(obj.meta["stderr"], "boom\n"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_fetch_missing_program() {
        let mut req = FetchRequest::new("a", "b");
        req.program = "/nonexistent/rclone".to_string();
        let err = fetch(&req).await.unwrap_err();
        assert_eq!(err.code(), Code::FailedPrecondition);
    }
}
