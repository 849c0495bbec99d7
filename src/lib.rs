//! # Propline
//!
//! Property-data platform: partner file ingestion, cross-vendor property
//! reconciliation, search mirroring and API quota gating. Usable both as a
//! standalone binary and as a library.
//!
//! ## Library Usage
//!
//! ```toml
//! [dependencies]
//! propline = { version = "0.0.1", default-features = false }
//! ```
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use propline::ingest::{LocalBackend, Pipeline, ProcessOptions, process_data_source};
//! use propline::lease::{LeaseTable, Locker, SqliteLeaseTable};
//! use propline::store::{SqliteStore, Store};
//!
//! let store = Arc::new(SqliteStore::new("./data/propline.db")?);
//! store.initialize()?;
//! let table = SqliteLeaseTable::new("./data/coordination.db")?;
//! table.initialize()?;
//!
//! let pipeline = Pipeline {
//!     store,
//!     backend: Arc::new(LocalBackend::new("./drop/attom")),
//!     source: Arc::new(propline::ingest::partner::resolve("attom-data", &Default::default())?),
//! };
//! let locker = Locker::new(Arc::new(table));
//! process_data_source(&locker, &pipeline, &ProcessOptions::default(), &cancel).await?;
//! ```
//!
//! ## Feature Flags
//!
//! - `cli` (default): Builds the `propline` binary. Disable with `default-features = false`.

pub mod auth;
pub mod cache;
pub mod config;
pub mod error;
pub mod flags;
pub mod ingest;
pub mod lease;
pub mod registry;
pub mod server;
pub mod store;
pub mod synth;
pub mod types;
