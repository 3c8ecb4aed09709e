//! Concurrent ingestion of records into the writer.
//!
//! An [`IngestionPool`] runs a fixed number of actor threads. Every actor pulls
//! records from one shared [`DocumentSource`](crate::document::DocumentSource),
//! paces itself with a [`RatePacer`] and hands the records to the
//! [`MutableWriter`](crate::writer::MutableWriter). Errors are contained per
//! record: a bad record or a rejected write is logged and counted, and the
//! actor moves on.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{NrtError, Result};

pub mod pool;
pub mod rate;

pub use pool::IngestionPool;
pub use rate::RatePacer;

/// How records reach the writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestMode {
    /// Append every record.
    #[default]
    Add,
    /// Replace any live record with the same id.
    Update,
}

impl std::str::FromStr for IngestMode {
    type Err = NrtError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "add" => Ok(IngestMode::Add),
            "update" => Ok(IngestMode::Update),
            other => Err(NrtError::invalid_config(format!("unknown ingest mode {other:?}"))),
        }
    }
}

/// Configuration for an ingestion pool.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Number of actor threads.
    pub thread_count: usize,

    /// Target rate of each actor. Zero means unthrottled.
    pub records_per_second_per_thread: f64,

    /// Add or update.
    pub mode: IngestMode,

    /// Total records across all actors, if bounded.
    pub max_records: Option<u64>,

    /// Wall time after which actors stop, if bounded.
    pub max_duration: Option<Duration>,

    /// Stop every actor at the first error and report it from `join`.
    pub fail_fast: bool,

    /// Attempts to resubmit a rejected record before giving up on it.
    pub max_write_retries: u32,

    /// Initial wait before resubmitting; doubles per attempt.
    pub retry_backoff: Duration,
}

impl Default for IngestConfig {
    fn default() -> Self {
        IngestConfig {
            thread_count: 1,
            records_per_second_per_thread: 0.0,
            mode: IngestMode::Add,
            max_records: None,
            max_duration: None,
            fail_fast: false,
            max_write_retries: 10,
            retry_backoff: Duration::from_millis(1),
        }
    }
}

impl IngestConfig {
    /// Check the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.thread_count == 0 {
            return Err(NrtError::invalid_config("ingestion needs at least one thread"));
        }
        if !self.records_per_second_per_thread.is_finite() || self.records_per_second_per_thread < 0.0 {
            return Err(NrtError::invalid_config(
                "records_per_second_per_thread must be a non-negative number",
            ));
        }
        Ok(())
    }
}

/// Counters describing ingestion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestStats {
    /// Records accepted by the writer.
    pub submitted: u64,
    /// Resubmissions after `WriteRejected`.
    pub retries: u64,
    /// Records dropped after exhausting retries.
    pub rejected: u64,
    /// Records the source failed to produce.
    pub source_errors: u64,
    /// Records the writer failed on for other reasons.
    pub write_errors: u64,
    /// Seconds since the pool started.
    pub elapsed_secs: f64,
    /// Accepted records per second since start.
    pub records_per_second: f64,
}
