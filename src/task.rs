//! Replayable read-only tasks.
//!
//! Tasks come from a [`TaskLog`], are parsed into [`TaskQuery`]s once, and
//! are handed out per category in a reproducible order by the
//! [`TaskScheduler`]. [`TaskWorkers`] run them continuously against whatever
//! snapshot is current and record per-category metrics.

use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::{NrtError, Result};
use crate::snapshot::{Snapshot, SnapshotManager};

pub mod task_log;
pub mod query;
pub mod scheduler;
pub mod workers;

pub use task_log::{TaskEntry, TaskLog};
pub use query::{Clause, ClauseKind, Hit, QueryResult, TaskQuery};
pub use scheduler::TaskScheduler;
pub use workers::{TaskWorkerConfig, TaskWorkers};

/// A parsed task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    category: String,
    text: String,
    query: TaskQuery,
}

/// Result of one task invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutcome {
    /// Task category.
    pub category: String,
    /// Query text.
    pub text: String,
    /// Generation of the snapshot the task ran against.
    pub snapshot_generation: u64,
    /// Query result.
    pub result: QueryResult,
    /// Time spent executing, excluding acquire and release.
    pub took: Duration,
}

impl Task {
    /// Parse `text` as a task of `category`.
    pub fn new<C: Into<String>, T: Into<String>>(category: C, text: T) -> Result<Self> {
        let category = category.into();
        let text = text.into();
        let query = TaskQuery::parse(&category, &text)?;
        Ok(Task {
            category,
            text,
            query,
        })
    }

    /// Task category.
    pub fn category(&self) -> &str {
        &self.category
    }

    /// Query text as written in the log.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Parsed query.
    pub fn query(&self) -> &TaskQuery {
        &self.query
    }

    /// Acquire the current snapshot, run the query and release it.
    ///
    /// The snapshot is released by a guard, so it is given back on every
    /// path out of this function. A panicking query becomes
    /// [`NrtError::TaskExecutionFailed`].
    pub fn run(&self, manager: &SnapshotManager, top_n: usize) -> Result<TaskOutcome> {
        self.run_with(manager, |snapshot| self.query.execute(snapshot, top_n))
    }

    fn run_with<F>(&self, manager: &SnapshotManager, execute: F) -> Result<TaskOutcome>
    where
        F: FnOnce(&Snapshot) -> QueryResult,
    {
        let snapshot = manager.acquire()?;

        let view: &Snapshot = &snapshot;
        let started = Instant::now();
        let result = panic::catch_unwind(AssertUnwindSafe(|| execute(view)))
            .map_err(|_| NrtError::task_failed(format!("{self} panicked")))?;
        let took = started.elapsed();

        Ok(TaskOutcome {
            category: self.category.clone(),
            text: self.text.clone(),
            snapshot_generation: snapshot.generation(),
            result,
            took,
        })
    }
}

impl std::fmt::Display for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.category, self.text)
    }
}
