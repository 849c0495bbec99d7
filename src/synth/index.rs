use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::search::{SearchCluster, address_index_body};
use crate::error::{Code, Error, Forward, Result};
use crate::ingest::partner::{ABODEMINE_ID, FILE_TYPE_SEARCH_ADDRESS};
use crate::lease::{Backoff, LockOptions, Locker, Role, with_lock};
use crate::store::path::object_hash;
use crate::store::{NewDataFileObject, Store, blocking};
use crate::types::{DataFileDirectory, DataFileStatus};

#[derive(Debug, Clone)]
pub struct IndexOptions {
    pub index: String,
    pub batch_size: usize,
    /// FIPS codes streamed at the same time.
    pub file_buffer_size: usize,
    pub backoff: Backoff,
    pub lock: LockOptions,
    pub no_lock: bool,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            index: "addresses".to_string(),
            batch_size: 1000,
            file_buffer_size: 4,
            backoff: Backoff::search_default(),
            lock: LockOptions::default(),
            no_lock: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexStats {
    pub fips_count: usize,
    pub documents: i64,
    pub retries: u32,
}

/// Where a FIPS code stands across retry rounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cursor {
    Start,
    After(Uuid),
    Done,
}

impl Cursor {
    fn after(self) -> Option<Uuid> {
        match self {
            Cursor::After(id) => Some(id),
            _ => None,
        }
    }
}

struct FipsRun {
    fips: String,
    cursor: Cursor,
    result: Result<i64>,
}

/// Directory path recording an index's load progress.
#[must_use]
pub fn index_directory_path(cluster: &str, index: &str) -> String {
    format!("search:{cluster}/{index}")
}

/// Streams every canonical address into `opts.index`, one catalog object
/// per FIPS code.
pub async fn load_search_index(
    locker: &Locker,
    store: Arc<dyn Store>,
    search: Arc<dyn SearchCluster>,
    opts: &IndexOptions,
    cancel: &CancellationToken,
) -> Result<IndexStats> {
    let index = opts.index.trim().to_string();
    if index.is_empty() {
        return Err(Error::new("7418ef67-f783-4920-b2b8-10a063822240", Code::InvalidArgument, "Index name is required."));
    }

    let lock_id = (!opts.no_lock).then(|| Role::OsLoader.lock_id(ABODEMINE_ID));
    with_lock(locker, lock_id.as_deref(), &opts.lock, cancel, |work| {
        run(store, search, index, opts, work)
    })
    .await
}

async fn run(
    store: Arc<dyn Store>,
    search: Arc<dyn SearchCluster>,
    index: String,
    opts: &IndexOptions,
    cancel: CancellationToken,
) -> Result<IndexStats> {
    let prepared = {
        let store = store.clone();
        let search = search.clone();
        let index = index.clone();
        blocking(move || prepare(store.as_ref(), search.as_ref(), &index))
            .await
            .forward("f62aba39-1099-4be3-93e2-4c9f31281dbc")?
    };
    let Some(directory_id) = prepared else {
        return Ok(IndexStats::default());
    };

    let fips_codes: Vec<String> = {
        let store = store.clone();
        blocking(move || store.list_fips())
            .await
            .forward("225df58a-b138-4a16-97fc-3416412de3fb")?
            .into_iter()
            .map(|f| f.fips)
            .collect()
    };

    tracing::info!(index = %index, fips_count = fips_codes.len(), "Loading search index");

    let mut stats = IndexStats {
        fips_count: fips_codes.len(),
        ..Default::default()
    };
    let mut cursors: HashMap<String, Cursor> = HashMap::new();
    let mut backoff = opts.backoff.clone();
    let pool_size = opts.file_buffer_size.max(1);

    loop {
        let mut tasks: JoinSet<FipsRun> = JoinSet::new();
        let mut failure: Option<Error> = None;

        for fips in &fips_codes {
            let cursor = cursors.get(fips).copied().unwrap_or(Cursor::Start);
            if cursor == Cursor::Done {
                continue;
            }

            while tasks.len() >= pool_size {
                if let Some(joined) = tasks.join_next().await {
                    record(joined, &mut cursors, &mut stats, &mut backoff, &mut failure);
                }
            }

            let store = store.clone();
            let search = search.clone();
            let index = index.clone();
            let fips = fips.clone();
            let batch_size = opts.batch_size.max(1);
            let cancel = cancel.clone();
            tasks.spawn_blocking(move || {
                load_fips(
                    store.as_ref(),
                    search.as_ref(),
                    directory_id,
                    &index,
                    fips,
                    cursor,
                    batch_size,
                    &cancel,
                )
            });
        }

        while let Some(joined) = tasks.join_next().await {
            record(joined, &mut cursors, &mut stats, &mut backoff, &mut failure);
        }

        let Some(err) = failure else {
            break;
        };
        if !err.is(Code::ResourceExhausted) || cancel.is_cancelled() {
            return Err(err.forward("fc81b965-8cbc-417a-982d-862705ffa80f"));
        }

        let delay = backoff.next().forward("5c95622d-74d4-4e7d-b415-f061f51ee234")?;
        stats.retries += 1;
        tracing::warn!(
            retries = backoff.retries(),
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Sleeping before retry due to resource exhaustion"
        );
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = cancel.cancelled() => {
                return Err(Error::new("115c5e26-ce00-43ff-b24b-fa1d71a3660b", Code::Canceled, "Index load was canceled."));
            }
        }
    }

    tracing::info!(index = %index, documents = stats.documents, "Search index loaded");
    Ok(stats)
}

/// Creates the index if needed and returns the directory tracking it, or
/// `None` when that directory is already finished.
fn prepare(store: &dyn Store, search: &dyn SearchCluster, index: &str) -> Result<Option<Uuid>> {
    if !search.index_exists(index).forward("a7124585-659c-4f5d-b0d0-56ab1d18c67f")? {
        tracing::info!(index, "Creating index");
        search
            .create_index(index, &address_index_body())
            .forward("427e8225-27f8-42fd-845b-fc84a29532bc")?;
    }

    let path = index_directory_path(search.name(), index);
    let directory = match store.select_directory(ABODEMINE_ID, &path, None).forward("a0fe3025-0cb6-4df3-8285-a8ba5a5d7448")? {
        Some(dir) => dir,
        None => {
            let now = Utc::now();
            let dir = DataFileDirectory {
                id: Uuid::now_v7(),
                created_at: now,
                updated_at: now,
                partner_id: ABODEMINE_ID,
                parent_id: None,
                status: DataFileStatus::ToDo,
                path,
                name: index.to_string(),
                meta: None,
            };
            store.insert_directory(&dir).forward("960526ef-e8dd-4baf-8e5a-9d03f80e6a34")?;
            dir
        }
    };

    if directory.status.is_finished() {
        tracing::debug!(path = %directory.path, "Directory is already processed");
        return Ok(None);
    }

    store
        .update_directory_status(directory.id, DataFileStatus::InProgress)
        .forward("1584a50f-36cf-4155-9050-349e217b2126")?;
    Ok(Some(directory.id))
}

fn record(
    joined: std::result::Result<FipsRun, tokio::task::JoinError>,
    cursors: &mut HashMap<String, Cursor>,
    stats: &mut IndexStats,
    backoff: &mut Backoff,
    failure: &mut Option<Error>,
) {
    let run = match joined {
        Ok(run) => run,
        Err(e) => {
            if failure.is_none() {
                *failure = Some(
                    Error::new("84fe488a-fc76-47df-a0f2-382c1d6e9129", Code::Internal, "Index worker failed.").with_cause(e),
                );
            }
            return;
        }
    };

    cursors.insert(run.fips.clone(), run.cursor);
    match run.result {
        Ok(documents) => {
            stats.documents += documents;
            backoff.reset();
        }
        Err(err) => {
            tracing::warn!(fips = %run.fips, error = %err, "Failed to load fips");
            // Backpressure wins so the round is retried.
            let replace = match failure {
                None => true,
                Some(existing) => {
                    existing.is(Code::ResourceExhausted) && !err.is(Code::ResourceExhausted)
                }
            };
            if replace {
                *failure = Some(err);
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn load_fips(
    store: &dyn Store,
    search: &dyn SearchCluster,
    directory_id: Uuid,
    index: &str,
    fips: String,
    cursor: Cursor,
    batch_size: usize,
    cancel: &CancellationToken,
) -> FipsRun {
    let mut after = cursor.after();
    let result = stream_fips(
        store,
        search,
        directory_id,
        index,
        &fips,
        &mut after,
        batch_size,
        cancel,
    );

    let cursor = match (&result, after) {
        (Ok(_), _) => Cursor::Done,
        (Err(_), Some(id)) => Cursor::After(id),
        (Err(_), None) => Cursor::Start,
    };
    FipsRun {
        fips,
        cursor,
        result,
    }
}

#[allow(clippy::too_many_arguments)]
fn stream_fips(
    store: &dyn Store,
    search: &dyn SearchCluster,
    directory_id: Uuid,
    index: &str,
    fips: &str,
    after: &mut Option<Uuid>,
    batch_size: usize,
    cancel: &CancellationToken,
) -> Result<i64> {
    if fips.is_empty() {
        return Err(Error::new("98316a30-4518-4a6b-ba26-a64e9f5668d4", Code::InvalidArgument, "Fips is required."));
    }

    let object = store
        .ensure_object(&NewDataFileObject {
            directory_id,
            parent_file_id: None,
            file_type: FILE_TYPE_SEARCH_ADDRESS,
            hash: object_hash(fips),
            file_dir: String::new(),
            file_name: fips.to_string(),
            file_size: 0,
            priorities: Vec::new(),
            meta: None,
        })
        .forward("b892916a-060c-450b-a6cf-7931bd99bea9")?;

    if object.status.is_finished() {
        tracing::info!(fips, "Object already processed");
        return Ok(0);
    }

    tracing::info!(fips, "Loading search object");
    store
        .update_object_status(object.id, DataFileStatus::InProgress)
        .forward("4b1dace9-c782-4304-b458-5f579b1774e0")?;
    // Documents before the cursor are rewritten idempotently.
    store.set_record_count(object.id, 0).forward("364dfbbb-6844-4e78-98d0-9b8ec5b7e869")?;

    let mut record_count = 0i64;
    loop {
        if cancel.is_cancelled() {
            return Err(Error::new("881d6e69-c392-4954-82ca-e64e1ba495dc", Code::Canceled, "Index load was canceled.")
                .with_meta("fips", fips));
        }

        let addresses = store
            .select_addresses_by_fips(fips, *after, batch_size)
            .forward("422e8e9e-c24a-45bf-9251-08489fee6325")?;
        let Some(last) = addresses.last().and_then(|a| a.id) else {
            break;
        };

        search.put_documents(index, &addresses).forward("9615d317-2dc0-493e-a08c-bfa6b6b1028f")?;

        record_count += addresses.len() as i64;
        store
            .set_record_count(object.id, record_count)
            .forward("2efab537-a313-420e-8da9-a4f7f9e55484")?;
        *after = Some(last);
    }

    store
        .update_object_status(object.id, DataFileStatus::Done)
        .forward("9cfd040b-903f-48cb-b319-687e98a2686f")?;
    Ok(record_count)
}
