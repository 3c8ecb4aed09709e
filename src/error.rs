//! Error types for nrtbench.
//!
//! All errors are represented by the [`NrtError`] enum. Each variant belongs to
//! exactly one component boundary: a rejected write never escapes the ingestion
//! actor that issued it, a failed merge never escapes its compaction unit, and a
//! failed task never stops the scheduler.
//!
//! # Examples
//!
//! ```
//! use nrtbench::error::{NrtError, Result};
//!
//! fn example_operation() -> Result<()> {
//!     Err(NrtError::write_rejected("buffer full"))
//! }
//!
//! match example_operation() {
//!     Err(e) if e.is_retryable() => println!("retry later: {e}"),
//!     Err(e) => eprintln!("Error: {e}"),
//!     Ok(_) => println!("Success"),
//! }
//! ```

use std::io;

use thiserror::Error;

/// The main error type for nrtbench operations.
#[derive(Error, Debug)]
pub enum NrtError {
    /// I/O errors (file operations, mmap, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The writer refused a record because a resource limit was hit.
    /// The caller may retry.
    #[error("Write rejected: {0}")]
    WriteRejected(String),

    /// The component was already closed.
    #[error("Already closed: {0}")]
    AlreadyClosed(String),

    /// A record produced by a document source could not be parsed.
    #[error("Malformed record: {0}")]
    MalformedRecord(String),

    /// A single merge failed. Its source segments are untouched.
    #[error("Merge failed: {0}")]
    MergeFailed(String),

    /// A single task invocation failed.
    #[error("Task execution failed: {0}")]
    TaskExecutionFailed(String),

    /// The storage backend could not be read while building a snapshot.
    #[error("Snapshot unavailable: {0}")]
    SnapshotUnavailable(String),

    /// Unrecoverable corruption detected in a segment.
    #[error("Corruption: {0}")]
    Corruption(String),

    /// Storage-related errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Query-related errors (parsing, invalid queries, etc.)
    #[error("Query error: {0}")]
    Query(String),

    /// Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Timeout waiting for a resource
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Thread join errors
    #[error("Thread join error: {0}")]
    ThreadJoinError(String),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error for other cases
    #[error("Error: {0}")]
    Other(String),

    /// Generic anyhow error
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
}

/// Result type alias for operations that may fail with NrtError.
pub type Result<T> = std::result::Result<T, NrtError>;

impl NrtError {
    /// Create a new write rejected error.
    pub fn write_rejected<S: Into<String>>(msg: S) -> Self {
        NrtError::WriteRejected(msg.into())
    }

    /// Create a new already closed error.
    pub fn already_closed<S: Into<String>>(msg: S) -> Self {
        NrtError::AlreadyClosed(msg.into())
    }

    /// Create a new malformed record error.
    pub fn malformed_record<S: Into<String>>(msg: S) -> Self {
        NrtError::MalformedRecord(msg.into())
    }

    /// Create a new merge failed error.
    pub fn merge_failed<S: Into<String>>(msg: S) -> Self {
        NrtError::MergeFailed(msg.into())
    }

    /// Create a new task execution error.
    pub fn task_failed<S: Into<String>>(msg: S) -> Self {
        NrtError::TaskExecutionFailed(msg.into())
    }

    /// Create a new snapshot unavailable error.
    pub fn snapshot_unavailable<S: Into<String>>(msg: S) -> Self {
        NrtError::SnapshotUnavailable(msg.into())
    }

    /// Create a new corruption error.
    pub fn corruption<S: Into<String>>(msg: S) -> Self {
        NrtError::Corruption(msg.into())
    }

    /// Create a new storage error.
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        NrtError::Storage(msg.into())
    }

    /// Create a new query error.
    pub fn query<S: Into<String>>(msg: S) -> Self {
        NrtError::Query(msg.into())
    }

    /// Create a new invalid config error.
    pub fn invalid_config<S: Into<String>>(msg: S) -> Self {
        NrtError::InvalidConfig(msg.into())
    }

    /// Create a new timeout error.
    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        NrtError::Timeout(msg.into())
    }

    /// Create a new generic error.
    pub fn other<S: Into<String>>(msg: S) -> Self {
        NrtError::Other(msg.into())
    }

    /// Create a new internal error.
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        NrtError::Other(format!("Internal error: {}", msg.into()))
    }

    /// Whether the caller can reasonably retry the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            NrtError::WriteRejected(_) | NrtError::SnapshotUnavailable(_) | NrtError::Timeout(_)
        )
    }
}
