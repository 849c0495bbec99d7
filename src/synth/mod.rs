//! Property synchronization and search-index loading.
//!
//! Both jobs hold an Abodemine-wide lock for their whole run and publish to a
//! [`SearchCluster`]. Backpressure from the cluster is retried with a
//! [`crate::lease::Backoff`].

mod index;
mod properties;
pub mod search;

pub use index::{IndexOptions, IndexStats, index_directory_path, load_search_index};
pub use properties::{SYNC_BATCH_SIZE, SYNC_CONCURRENCY, SyncOptions, SyncStats, sync_properties};
pub use search::{BACKPRESSURE, HttpSearch, MemorySearch, SearchCluster, address_index_body};
