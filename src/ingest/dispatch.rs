use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::backend::ObjectBackend;
use super::decode::{LoadStats, Loader};
use super::partner::DataSource;
use crate::error::{Code, Error, Forward, Result};
use crate::store::{LeaseFilter, Store, blocking};
use crate::types::DataFileObject;

#[derive(Debug, Clone)]
pub struct DispatchOptions {
    pub worker_id: Uuid,
    /// Objects loaded at the same time.
    pub file_buffer_size: usize,
    /// Rows leased per round. Defaults to the free slots in the pool.
    pub limit: Option<usize>,
    pub max_idle_polls: u32,
    pub poll_interval: Duration,
    pub batch_size: Option<usize>,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            worker_id: Uuid::new_v4(),
            file_buffer_size: 4,
            limit: None,
            max_idle_polls: 2400,
            poll_interval: Duration::from_millis(250),
            batch_size: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub objects: i64,
    pub records: LoadStats,
}

/// Shared handles a load task needs.
#[derive(Clone)]
pub struct Pipeline {
    pub store: Arc<dyn Store>,
    pub backend: Arc<dyn ObjectBackend>,
    pub source: Arc<dyn DataSource>,
}

async fn count_remaining(store: &Arc<dyn Store>, filter: &LeaseFilter) -> Result<i64> {
    let store = store.clone();
    let filter = filter.clone();
    blocking(move || store.count_objects_to_load(&filter)).await
}

/// Leases and loads catalog objects until none remain for `filter`.
///
/// Finished tasks are reaped between rounds. The first failing load stops
/// further leasing; running loads drain before the error is returned.
pub async fn dispatch(
    pipeline: &Pipeline,
    filter: &LeaseFilter,
    opts: &DispatchOptions,
    cancel: &CancellationToken,
) -> Result<DispatchStats> {
    let pool_size = opts.file_buffer_size.max(1);
    let mut tasks: JoinSet<Result<LoadStats>> = JoinSet::new();
    let mut stats = DispatchStats::default();
    let mut failure: Option<Error> = None;
    let mut stop_processing = false;

    loop {
        while let Some(joined) = tasks.try_join_next() {
            reap(joined, &mut stats, &mut failure, &mut stop_processing);
        }

        if cancel.is_cancelled() && failure.is_none() {
            failure = Some(Error::new("bf5f5c8f-4f1a-4337-80d2-7e670afe6de6", Code::Canceled, "Dispatch was canceled."));
        }
        if failure.is_some() || stop_processing {
            break;
        }

        if tasks.len() >= pool_size {
            if let Some(joined) = tasks.join_next().await {
                reap(joined, &mut stats, &mut failure, &mut stop_processing);
            }
            continue;
        }

        let remaining = count_remaining(&pipeline.store, filter).await.forward("ae44651e-16fd-4658-8181-fd4172f36ab6")?;
        if remaining == 0 {
            break;
        }

        let free = pool_size - tasks.len();
        let limit = opts.limit.unwrap_or(free).min(free);
        let objects = {
            let store = pipeline.store.clone();
            let filter = filter.clone();
            let worker_id = opts.worker_id;
            blocking(move || store.lease_objects(&filter, worker_id, limit))
                .await
                .forward("9fef41e9-2c18-452e-a948-36fd07a08f04")?
        };

        if objects.is_empty() {
            wait_for_progress(
                pipeline,
                filter,
                opts,
                cancel,
                remaining,
                &mut tasks,
                &mut stats,
                &mut failure,
                &mut stop_processing,
            )
            .await?;
            continue;
        }

        tracing::info!(
            count = objects.len(),
            remaining,
            worker_id = %opts.worker_id,
            "Leased data file objects"
        );

        for object in objects {
            spawn_load(&mut tasks, pipeline, object, opts.batch_size, cancel.clone());
        }
    }

    while let Some(joined) = tasks.join_next().await {
        reap(joined, &mut stats, &mut failure, &mut stop_processing);
    }

    if let Some(err) = failure {
        return Err(err.forward("bed0154e-d8a8-434d-9d06-6531609e1987"));
    }
    if stop_processing {
        return Err(Error::new("68279800-63cd-4aff-83ae-b16bb759887c", Code::Internal, "Load worker panicked."));
    }

    tracing::info!(
        objects = stats.objects,
        processed_records = stats.records.processed_records,
        skipped_records = stats.records.skipped_records,
        "Dispatch finished"
    );
    Ok(stats)
}

fn spawn_load(
    tasks: &mut JoinSet<Result<LoadStats>>,
    pipeline: &Pipeline,
    object: DataFileObject,
    batch_size: Option<usize>,
    cancel: CancellationToken,
) {
    let pipeline = pipeline.clone();
    tasks.spawn_blocking(move || {
        let loader = Loader {
            store: pipeline.store.as_ref(),
            backend: pipeline.backend.as_ref(),
            source: pipeline.source.as_ref(),
            cancel: &cancel,
            batch_size,
        };
        loader.load_object(&object).map_err(|e| {
            tracing::error!(path = %object.path(), id = %object.id, error = %e, "Failed to load object");
            e.forward("d2f84f8e-c3e6-460f-b7df-8237f9894c2d")
        })
    });
}

fn reap(
    joined: std::result::Result<Result<LoadStats>, tokio::task::JoinError>,
    stats: &mut DispatchStats,
    failure: &mut Option<Error>,
    stop_processing: &mut bool,
) {
    match joined {
        Ok(Ok(loaded)) => {
            stats.objects += 1;
            stats.records += loaded;
        }
        Ok(Err(err)) => {
            if failure.is_none() {
                *failure = Some(err);
            }
        }
        Err(join_err) => {
            if join_err.is_panic() {
                let panic = join_err.into_panic();
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_default();
                tracing::error!(panic = %message, "Load worker panicked");
                *stop_processing = true;
            } else if failure.is_none() {
                *failure = Some(
                    Error::new("57cf09d1-861d-4536-a1c7-ecfaac4691c6", Code::Canceled, "Load task was aborted.")
                        .with_cause(join_err),
                );
            }
        }
    }
}

/// Polls the remaining count until it moves. Running loads are reaped on
/// each tick since they are what usually moves it.
#[allow(clippy::too_many_arguments)]
async fn wait_for_progress(
    pipeline: &Pipeline,
    filter: &LeaseFilter,
    opts: &DispatchOptions,
    cancel: &CancellationToken,
    remaining: i64,
    tasks: &mut JoinSet<Result<LoadStats>>,
    stats: &mut DispatchStats,
    failure: &mut Option<Error>,
    stop_processing: &mut bool,
) -> Result<()> {
    let mut idle_polls = 0u32;

    loop {
        tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            () = tokio::time::sleep(opts.poll_interval) => {}
        }

        while let Some(joined) = tasks.try_join_next() {
            reap(joined, stats, failure, stop_processing);
        }
        if failure.is_some() || *stop_processing {
            return Ok(());
        }

        let current = count_remaining(&pipeline.store, filter).await.forward("eac6ce8d-1e2b-42b6-83a7-451c0cbee3e0")?;
        if current != remaining {
            return Ok(());
        }

        // Own loads still running will move the count eventually.
        if !tasks.is_empty() {
            continue;
        }

        idle_polls += 1;
        if idle_polls >= opts.max_idle_polls {
            tracing::error!(
                remaining,
                idle_polls,
                worker_id = %opts.worker_id,
                "Remaining objects did not change, dispatch stalled"
            );
            return Err(Error::new("427171d3-488a-4f9c-9396-f0eab37ac3b1", Code::Aborted, "Dispatch stalled.")
                .with_meta("remaining", remaining)
                .with_meta("idle_polls", idle_polls));
        }
    }
}
