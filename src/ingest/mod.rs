//! Partner drop ingestion: discovery, dispatch, decoding and fetch.
//!
//! [`process_data_source`] is the entry point a loader worker runs. It holds
//! the partner's loader lock for the whole pass. Losing the lease cancels
//! every running load at its next flush.

pub mod backend;
mod decode;
mod discover;
mod dispatch;
pub mod fetch;
pub mod partner;

pub use backend::{ListOptions, LocalBackend, ObjectBackend, ReadSeek, StorageObject};
pub use decode::{LoadStats, Loader};
pub use discover::{DEFAULT_PRIORITIES, Discovery};
pub use dispatch::{DispatchOptions, DispatchStats, Pipeline, dispatch};
pub use fetch::{FetchOutcome, FetchRequest, fetch_data_source};
pub use partner::{
    ConfiguredPartner, DataFileEntry, DataRecord, DataSource, LoadFunc, LoadMode, LoadParams,
};

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{Forward, Result};
use crate::lease::{LockOptions, Locker, Role, with_lock};
use crate::store::{LeaseFilter, blocking};

#[derive(Debug, Clone, Default)]
pub struct ProcessOptions {
    /// Backend-relative directory to walk.
    pub root: String,
    /// Stamped on new catalog rows and required on leased ones.
    pub meta: Option<Value>,
    pub priority_group: Option<i32>,
    pub dispatch: DispatchOptions,
    pub lock: LockOptions,
    /// Skip the loader lock. Only for single-process runs.
    pub no_lock: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessStats {
    pub objects_to_load: i64,
    pub dispatch: DispatchStats,
}

/// Catalogs the partner's drop and loads everything still to do.
pub async fn process_data_source(
    locker: &Locker,
    pipeline: &Pipeline,
    opts: &ProcessOptions,
    cancel: &CancellationToken,
) -> Result<ProcessStats> {
    let lock_id = (!opts.no_lock).then(|| Role::Loader.lock_id(pipeline.source.partner_id()));

    with_lock(locker, lock_id.as_deref(), &opts.lock, cancel, |work| async move {
        run(pipeline, opts, &work).await
    })
    .await
}

async fn run(
    pipeline: &Pipeline,
    opts: &ProcessOptions,
    cancel: &CancellationToken,
) -> Result<ProcessStats> {
    let objects_to_load = {
        let pipeline = pipeline.clone();
        let root = opts.root.clone();
        let meta = opts.meta.clone();
        blocking(move || {
            Discovery {
                store: pipeline.store.as_ref(),
                backend: pipeline.backend.as_ref(),
                source: pipeline.source.as_ref(),
                meta: meta.as_ref(),
            }
            .run(&root)
        })
        .await
        .forward("00e3b17d-4e20-4cf5-9bbe-13381f63827a")?
    };

    tracing::info!(
        partner_id = %pipeline.source.partner_id(),
        objects_to_load,
        "Discovery finished"
    );

    let filter = LeaseFilter {
        partner_id: pipeline.source.partner_id(),
        priority_group: opts.priority_group,
        meta: match &opts.meta {
            Some(Value::Object(map)) => map.clone(),
            _ => serde_json::Map::new(),
        },
    };

    let dispatch = dispatch(pipeline, &filter, &opts.dispatch, cancel)
        .await
        .forward("f4eefb3f-4dc2-4dbd-b85c-d944b1aa59ac")?;

    Ok(ProcessStats {
        objects_to_load,
        dispatch,
    })
}
