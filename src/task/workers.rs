//! Threads replaying tasks against the current snapshot.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Instant;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, bounded};
use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::error::{NrtError, Result};
use crate::ingest::RatePacer;
use crate::metrics::MetricsRegistry;
use crate::snapshot::SnapshotManager;
use crate::task::TaskScheduler;

/// Configuration of the task workers.
#[derive(Debug, Clone)]
pub struct TaskWorkerConfig {
    /// Number of worker threads.
    pub worker_count: usize,
    /// Categories to run. Empty means every category of the scheduler.
    pub categories: Vec<String>,
    /// Hits kept per query.
    pub top_n: usize,
    /// Target task rate of each worker. Zero means as fast as possible.
    pub tasks_per_second_per_worker: f64,
}

impl Default for TaskWorkerConfig {
    fn default() -> Self {
        TaskWorkerConfig {
            worker_count: 1,
            categories: Vec::new(),
            top_n: 10,
            tasks_per_second_per_worker: 0.0,
        }
    }
}

/// A running set of task workers.
#[derive(Debug)]
pub struct TaskWorkers {
    stop: Mutex<Option<Sender<()>>>,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
    executed: Arc<AtomicU64>,
}

impl TaskWorkers {
    /// Spawn the workers.
    pub fn start(
        config: TaskWorkerConfig,
        scheduler: Arc<TaskScheduler>,
        manager: Arc<SnapshotManager>,
        metrics: Arc<MetricsRegistry>,
    ) -> Result<Self> {
        let categories = if config.categories.is_empty() {
            scheduler.categories().to_vec()
        } else {
            for category in &config.categories {
                if !scheduler.categories().contains(category) {
                    return Err(NrtError::invalid_config(format!(
                        "no tasks for category {category:?}"
                    )));
                }
            }
            config.categories.clone()
        };
        if categories.is_empty() {
            return Err(NrtError::invalid_config("no task categories to run"));
        }
        let categories = Arc::new(categories);

        let (stop_tx, stop_rx) = bounded::<()>(0);
        let executed = Arc::new(AtomicU64::new(0));
        let started = Instant::now();

        let mut handles = Vec::with_capacity(config.worker_count);
        for worker_id in 0..config.worker_count {
            let worker = Worker {
                id: worker_id,
                top_n: config.top_n,
                tasks_per_second: config.tasks_per_second_per_worker,
                categories: Arc::clone(&categories),
                scheduler: Arc::clone(&scheduler),
                manager: Arc::clone(&manager),
                metrics: Arc::clone(&metrics),
                executed: Arc::clone(&executed),
                stop: stop_rx.clone(),
                started,
            };
            let handle = thread::Builder::new()
                .name(format!("nrt-task-{worker_id}"))
                .spawn(move || worker.run());
            match handle {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    drop(stop_tx);
                    for handle in handles {
                        let _ = handle.join();
                    }
                    return Err(e.into());
                }
            }
        }

        info!(
            "task workers started: workers={} categories={:?}",
            config.worker_count, categories
        );
        Ok(TaskWorkers {
            stop: Mutex::new(Some(stop_tx)),
            handles: Mutex::new(handles),
            executed,
        })
    }

    /// Ask every worker to stop after its current task. Does not wait.
    pub fn stop(&self) {
        self.stop.lock().take();
    }

    /// Wait for every worker to exit.
    pub fn join(&self) -> Result<()> {
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        let panicked = handles
            .into_iter()
            .map(|handle| handle.join())
            .filter(|joined| joined.is_err())
            .count();
        if panicked > 0 {
            return Err(NrtError::ThreadJoinError(format!(
                "{panicked} task workers panicked"
            )));
        }
        Ok(())
    }

    /// Stop the workers and wait for them.
    pub fn shutdown(&self) -> Result<()> {
        self.stop();
        self.join()
    }

    /// Tasks attempted so far, failed ones included.
    pub fn executed(&self) -> u64 {
        self.executed.load(Ordering::Relaxed)
    }
}

impl Drop for TaskWorkers {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

struct Worker {
    id: usize,
    top_n: usize,
    tasks_per_second: f64,
    categories: Arc<Vec<String>>,
    scheduler: Arc<TaskScheduler>,
    manager: Arc<SnapshotManager>,
    metrics: Arc<MetricsRegistry>,
    executed: Arc<AtomicU64>,
    stop: Receiver<()>,
    started: Instant,
}

impl Worker {
    fn run(self) {
        let mut pacer = RatePacer::starting_at(self.tasks_per_second, self.started);
        let mut position = self.id % self.categories.len();

        loop {
            if !matches!(self.stop.try_recv(), Err(TryRecvError::Empty)) {
                break;
            }
            if let Some(wait) = pacer.delay_at(Instant::now()) {
                if !matches!(self.stop.recv_timeout(wait), Err(RecvTimeoutError::Timeout)) {
                    break;
                }
            }
            pacer.advance();

            let category = &self.categories[position];
            position = (position + 1) % self.categories.len();
            if !self.run_one(category) {
                break;
            }
        }
        debug!("task worker {} stopped after {} tasks", self.id, pacer.issued());
    }

    /// Run one task of `category`. Returns false once the snapshots are gone.
    fn run_one(&self, category: &str) -> bool {
        let metrics = self.metrics.category(category);
        let task = match self.scheduler.next_task(category) {
            Ok(task) => task,
            Err(e) => {
                metrics.record_failure();
                warn!("task worker {}: {e}", self.id);
                return true;
            }
        };

        self.executed.fetch_add(1, Ordering::Relaxed);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            task.run(&self.manager, self.top_n)
        }))
        .unwrap_or_else(|_| Err(NrtError::task_failed(format!("{task} panicked"))));
        match outcome {
            Ok(outcome) => {
                metrics.record_success(outcome.took, outcome.result.total_hits);
                true
            }
            Err(NrtError::AlreadyClosed(_)) => false,
            Err(e) => {
                metrics.record_failure();
                warn!("task worker {}: task {task} failed: {e}", self.id);
                true
            }
        }
    }
}
