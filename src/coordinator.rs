//! Wiring of a complete near-real-time run.
//!
//! A [`Coordinator`] owns one writer, one snapshot manager, the ingestion
//! pool, the refresh loop and the task workers. It starts them in dependency
//! order and shuts them down in reverse:
//!
//! 1. stop producers (ingestion)
//! 2. stop the refresher
//! 3. stop task workers and wait for readers to give back their snapshots
//! 4. close the writer
//! 5. close storage

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::CoordinatorConfig;
use crate::document::DocumentSource;
use crate::error::{NrtError, Result};
use crate::ingest::{IngestStats, IngestionPool};
use crate::metrics::{CategoryReport, MetricsRegistry};
use crate::refresh::{RefreshLoop, RefreshStats};
use crate::snapshot::{SnapshotManager, SnapshotManagerStats};
use crate::storage::{Storage, StorageFactory};
use crate::task::{TaskLog, TaskScheduler, TaskWorkers};
use crate::writer::{MutableWriter, WriterStats};

/// Everything a run needs besides configuration.
pub struct Collaborators {
    /// Storage to write segments to. Built from the configuration when
    /// absent.
    pub storage: Option<Arc<dyn Storage>>,
    /// Where records come from.
    pub source: Box<dyn DocumentSource>,
    /// Tasks to replay.
    pub task_log: TaskLog,
}

/// Summary of a finished run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    /// Identifier of the run.
    pub run_id: String,
    /// Seconds from start to the end of shutdown.
    pub elapsed_secs: f64,
    /// Ingestion counters.
    pub ingest: IngestStats,
    /// Refresh loop counters.
    pub refresh: RefreshStats,
    /// Snapshot manager counters.
    pub snapshots: SnapshotManagerStats,
    /// Writer counters after the final flush.
    pub writer: WriterStats,
    /// Tasks attempted, failed ones included.
    pub tasks_executed: u64,
    /// Per-category task metrics, ordered by category.
    pub tasks: Vec<CategoryReport>,
}

/// A running coordinator.
pub struct Coordinator {
    run_id: Uuid,
    config: CoordinatorConfig,
    started: Instant,
    storage: Arc<dyn Storage>,
    writer: MutableWriter,
    snapshots: Arc<SnapshotManager>,
    scheduler: Arc<TaskScheduler>,
    metrics: Arc<MetricsRegistry>,
    workers: TaskWorkers,
    refresher: RefreshLoop,
    ingestion: IngestionPool,
    outcome: Mutex<Option<std::result::Result<RunReport, String>>>,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("run_id", &self.run_id)
            .field("config", &self.config)
            .field("writer", &self.writer)
            .finish()
    }
}

impl Coordinator {
    /// Validate `config` and start every component.
    ///
    /// Components that already started are shut down again if a later one
    /// fails to start.
    pub fn start(config: CoordinatorConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;
        let Collaborators {
            storage,
            source,
            task_log,
        } = collaborators;

        let run_id = Uuid::new_v4();
        let started = Instant::now();
        let scheduler = Arc::new(TaskScheduler::new(
            &task_log,
            config.random_seed,
            config.tasks_per_category,
        )?);

        let storage = match storage {
            Some(storage) => storage,
            None => StorageFactory::create(&config.storage)?,
        };
        let writer = MutableWriter::open(Arc::clone(&storage), config.writer_config())?;

        let snapshots = match SnapshotManager::open(writer.clone(), config.snapshot_config()) {
            Ok(manager) => Arc::new(manager),
            Err(e) => {
                let _ = writer.close();
                return Err(e);
            }
        };
        let abort = |e: NrtError| {
            let _ = snapshots.close_timeout(config.shutdown_timeout());
            let _ = writer.close();
            e
        };

        let metrics = Arc::new(MetricsRegistry::new());
        let workers = TaskWorkers::start(
            config.worker_config(),
            Arc::clone(&scheduler),
            Arc::clone(&snapshots),
            Arc::clone(&metrics),
        )
        .map_err(abort)?;
        let refresher =
            RefreshLoop::start(Arc::clone(&snapshots), config.refresh_interval()).map_err(|e| {
                let _ = workers.shutdown();
                abort(e)
            })?;
        let ingestion = IngestionPool::start(config.ingest_config(), source, writer.clone())
            .map_err(|e| {
                let _ = refresher.stop();
                let _ = workers.shutdown();
                abort(e)
            })?;

        info!(
            "run {run_id} started: ingestion_threads={} task_workers={} refresh_interval={:.3}s categories={:?}",
            config.ingestion_thread_count,
            config.task_worker_count,
            config.refresh_interval_secs,
            scheduler.categories()
        );
        Ok(Coordinator {
            run_id,
            config,
            started,
            storage,
            writer,
            snapshots,
            scheduler,
            metrics,
            workers,
            refresher,
            ingestion,
            outcome: Mutex::new(None),
        })
    }

    /// Identifier of this run.
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// The active configuration.
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// The writer records are ingested into.
    pub fn writer(&self) -> &MutableWriter {
        &self.writer
    }

    /// The snapshot manager readers acquire from.
    pub fn snapshots(&self) -> &Arc<SnapshotManager> {
        &self.snapshots
    }

    /// The task scheduler.
    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    /// Live per-category task metrics.
    pub fn metrics(&self) -> Arc<MetricsRegistry> {
        Arc::clone(&self.metrics)
    }

    /// Whether every ingestion thread has exited.
    pub fn ingestion_finished(&self) -> bool {
        self.ingestion.is_finished()
    }

    /// Block until `duration` elapsed or ingestion finished, logging progress
    /// every `progress_every`.
    pub fn wait(&self, duration: Duration, progress_every: Duration) {
        let deadline = Instant::now() + duration;
        let step = progress_every.max(Duration::from_millis(10));
        let mut next_progress = Instant::now() + step;

        loop {
            let now = Instant::now();
            if now >= deadline || self.ingestion.is_finished() {
                break;
            }
            if now >= next_progress {
                self.log_progress();
                next_progress += step;
            }
            let until = next_progress.min(deadline);
            thread::sleep(until.saturating_duration_since(now).min(Duration::from_millis(50)));
        }
    }

    fn log_progress(&self) {
        let writer = self.writer.stats();
        let snapshots = self.snapshots.stats();
        let tasks: u64 = self.metrics.report().iter().map(|r| r.count).sum();
        info!(
            "{:.1}s: max_doc={} num_docs={} segments={} snapshot_generation={} tasks={}",
            self.started.elapsed().as_secs_f64(),
            writer.max_doc,
            writer.num_docs,
            writer.segment_count,
            snapshots.current_generation,
            tasks
        );
    }

    /// Shut every component down and report on the run.
    ///
    /// Every step runs even if an earlier one failed; the first failure is
    /// returned. Calling `stop` again repeats the outcome of the first call
    /// without doing any work.
    pub fn stop(&self) -> Result<RunReport> {
        let mut outcome = self.outcome.lock();
        if outcome.is_none() {
            *outcome = Some(self.shutdown().map_err(|e| e.to_string()));
        }
        match outcome.as_ref() {
            Some(Ok(report)) => Ok(report.clone()),
            Some(Err(message)) => Err(NrtError::other(message.clone())),
            None => Err(NrtError::internal("shutdown produced no outcome")),
        }
    }

    fn shutdown(&self) -> Result<RunReport> {
        let mut first_error: Option<NrtError> = None;
        let mut note = |step: &str, result: Result<()>| {
            if let Err(e) = result {
                warn!("run {}: {step} failed: {e}", self.run_id);
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        };

        let ingest = match self.ingestion.shutdown() {
            Ok(stats) => stats,
            Err(e) => {
                note("stopping ingestion", Err(e));
                self.ingestion.stats()
            }
        };
        note("stopping refresh", self.refresher.stop());
        note("stopping task workers", self.workers.shutdown());
        note(
            "draining readers",
            self.snapshots.close_timeout(self.config.shutdown_timeout()),
        );
        note("closing writer", self.writer.close());
        note("syncing storage", self.storage.sync());
        note("closing storage", self.storage.close());

        let report = RunReport {
            run_id: self.run_id.to_string(),
            elapsed_secs: self.started.elapsed().as_secs_f64(),
            ingest,
            refresh: self.refresher.stats(),
            snapshots: self.snapshots.stats(),
            writer: self.writer.stats(),
            tasks_executed: self.workers.executed(),
            tasks: self.metrics.report(),
        };
        match first_error {
            Some(e) => Err(e),
            None => {
                info!(
                    "run {} stopped after {:.1}s: max_doc={} num_docs={} tasks={}",
                    self.run_id,
                    report.elapsed_secs,
                    report.writer.max_doc,
                    report.writer.num_docs,
                    report.tasks_executed
                );
                Ok(report)
            }
        }
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        if self.outcome.lock().is_none() {
            let _ = self.stop();
        }
    }
}
