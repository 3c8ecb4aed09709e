//! # nrtbench
//!
//! A near-real-time coordinator for a segment-based index: records are
//! ingested continuously, a refresher periodically publishes point-in-time
//! snapshots, and task workers replay read-only queries against whatever
//! snapshot is current.
//!
//! ## Components
//!
//! - [`writer::MutableWriter`]: buffers records, flushes immutable segments
//!   and commits merges
//! - [`merge::Compactor`]: bounded merge scheduling with backpressure
//! - [`snapshot::SnapshotManager`]: reference-counted snapshots with safe
//!   reclamation of retired segment files
//! - [`refresh::RefreshLoop`], [`ingest::IngestionPool`],
//!   [`task::TaskWorkers`]: the threads driving a run
//! - [`coordinator::Coordinator`]: starts and stops everything in order

pub mod cli;
pub mod config;
pub mod coordinator;
pub mod document;
pub mod error;
pub mod ingest;
pub mod merge;
pub mod metrics;
pub mod refresh;
pub mod segment;
pub mod snapshot;
pub mod storage;
pub mod task;
pub mod util;
pub mod writer;

pub mod prelude {
    pub use crate::config::CoordinatorConfig;
    pub use crate::coordinator::{Collaborators, Coordinator, RunReport};
    pub use crate::document::{DocumentSource, Record};
    pub use crate::error::{NrtError, Result};
    pub use crate::snapshot::{SnapshotManager, SnapshotRef};
    pub use crate::storage::{Storage, StorageConfig, StorageFactory};
    pub use crate::task::{TaskLog, TaskScheduler};
    pub use crate::writer::{MutableWriter, WriterConfig};
}

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
