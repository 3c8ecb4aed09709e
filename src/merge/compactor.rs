//! Bounded background execution of merges.
//!
//! Two independent limits apply. `max_concurrent_merges` is the number of
//! worker threads, so at most that many merges run at once. `max_queued_merges`
//! bounds merges that were accepted but not yet picked up by a worker; once it
//! is reached [`Compactor::schedule_merge`] blocks the caller. The caller is
//! normally a flushing ingestion thread, which is how merge pressure turns
//! into ingestion backpressure.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};
use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::error::{NrtError, Result};
use crate::merge::{MergeOutcome, MergeSpec};

/// Performs the actual work of a merge on behalf of the compactor.
pub trait MergeExecutor: Send + Sync {
    /// Run one attempt of `spec`. A failed attempt must leave no trace.
    fn execute(&self, spec: &MergeSpec) -> Result<MergeOutcome>;

    /// Give up on `spec`; its sources become eligible for merging again.
    fn abandon(&self, spec: &MergeSpec);
}

/// Configuration for the compactor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactorConfig {
    /// Merges that may run at the same time.
    pub max_concurrent_merges: usize,

    /// Merges that may wait for a worker before callers block.
    pub max_queued_merges: usize,

    /// Extra attempts after a failed merge.
    pub max_merge_retries: u32,
}

impl Default for CompactorConfig {
    fn default() -> Self {
        CompactorConfig {
            max_concurrent_merges: num_cpus::get().clamp(1, 4),
            max_queued_merges: 4,
            max_merge_retries: 2,
        }
    }
}

impl CompactorConfig {
    /// Check the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_merges == 0 {
            return Err(NrtError::invalid_config("max_concurrent_merges must be positive"));
        }
        if self.max_queued_merges == 0 {
            return Err(NrtError::invalid_config("max_queued_merges must be positive"));
        }
        Ok(())
    }
}

/// Counters describing compactor activity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompactorStats {
    /// Merges accepted by `schedule_merge`.
    pub scheduled: u64,
    /// Merges committed.
    pub completed: u64,
    /// Merges that failed every attempt.
    pub failed: u64,
    /// Queued merges dropped by `close`.
    pub abandoned: u64,
    /// Failed attempts that were retried.
    pub retries: u64,
    /// Times a caller had to wait for a queue slot.
    pub admission_stalls: u64,
    /// Merges waiting for a worker.
    pub queued: usize,
    /// Merges running.
    pub running: usize,
}

#[derive(Debug, Default)]
struct Admission {
    queued: usize,
    running: usize,
    closed: bool,
}

#[derive(Debug, Default)]
struct Counters {
    scheduled: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    abandoned: AtomicU64,
    retries: AtomicU64,
    admission_stalls: AtomicU64,
}

#[derive(Debug, Default)]
struct Shared {
    admission: Mutex<Admission>,
    changed: Condvar,
    counters: Counters,
}

struct MergeJob {
    spec: MergeSpec,
    executor: Arc<dyn MergeExecutor>,
    reply: Sender<Result<MergeOutcome>>,
}

/// Handle to a scheduled merge.
#[derive(Debug)]
pub struct MergeHandle {
    spec: MergeSpec,
    reply: Receiver<Result<MergeOutcome>>,
}

impl MergeHandle {
    /// The scheduled merge.
    pub fn spec(&self) -> &MergeSpec {
        &self.spec
    }

    /// Whether a result is ready.
    pub fn is_finished(&self) -> bool {
        !self.reply.is_empty()
    }

    /// Block until the merge commits, fails or is abandoned.
    pub fn wait(self) -> Result<MergeOutcome> {
        self.reply
            .recv()
            .map_err(|_| NrtError::merge_failed("merge was abandoned"))?
    }

    /// Like [`MergeHandle::wait`] but gives up after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<MergeOutcome> {
        match self.reply.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(NrtError::timeout("merge still running")),
            Err(RecvTimeoutError::Disconnected) => {
                Err(NrtError::merge_failed("merge was abandoned"))
            }
        }
    }
}

/// Runs merges on a fixed pool of worker threads.
pub struct Compactor {
    config: CompactorConfig,
    shared: Arc<Shared>,
    sender: Mutex<Option<Sender<MergeJob>>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl std::fmt::Debug for Compactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compactor")
            .field("config", &self.config)
            .field("admission", &*self.shared.admission.lock())
            .finish()
    }
}

impl Compactor {
    /// Start `max_concurrent_merges` worker threads.
    pub fn new(config: CompactorConfig) -> Result<Self> {
        config.validate()?;

        let shared = Arc::new(Shared::default());
        let (sender, receiver) = unbounded::<MergeJob>();

        let mut workers = Vec::with_capacity(config.max_concurrent_merges);
        for worker_id in 0..config.max_concurrent_merges {
            let receiver = receiver.clone();
            let shared = Arc::clone(&shared);
            let retries = config.max_merge_retries;
            let handle = thread::Builder::new()
                .name(format!("nrt-merge-{worker_id}"))
                .spawn(move || Self::worker_loop(receiver, shared, retries))?;
            workers.push(handle);
        }

        Ok(Compactor {
            config,
            shared,
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        })
    }

    /// The active configuration.
    pub fn config(&self) -> &CompactorConfig {
        &self.config
    }

    /// Queue `spec` for execution, blocking while the queue is full.
    ///
    /// Fails with [`NrtError::AlreadyClosed`] once [`Compactor::close`] has
    /// been called, including for callers that were blocked at the time.
    pub fn schedule_merge(
        &self,
        spec: MergeSpec,
        executor: Arc<dyn MergeExecutor>,
    ) -> Result<MergeHandle> {
        {
            let mut admission = self.shared.admission.lock();
            if admission.queued >= self.config.max_queued_merges && !admission.closed {
                self.shared
                    .counters
                    .admission_stalls
                    .fetch_add(1, Ordering::Relaxed);
                let stalled_at = Instant::now();
                while admission.queued >= self.config.max_queued_merges && !admission.closed {
                    self.shared.changed.wait(&mut admission);
                }
                debug!(
                    "merge admission stalled for {} msec",
                    stalled_at.elapsed().as_millis()
                );
            }
            if admission.closed {
                return Err(NrtError::already_closed("compactor is closed"));
            }
            admission.queued += 1;
        }

        let (reply_tx, reply_rx) = bounded(1);
        let job = MergeJob {
            spec: spec.clone(),
            executor,
            reply: reply_tx,
        };

        let sent = match self.sender.lock().as_ref() {
            Some(sender) => sender.send(job).is_ok(),
            None => false,
        };
        if !sent {
            self.shared.admission.lock().queued -= 1;
            self.shared.changed.notify_all();
            return Err(NrtError::already_closed("compactor is closed"));
        }

        self.shared.counters.scheduled.fetch_add(1, Ordering::Relaxed);
        debug!(
            "scheduled merge of {:?} into seg_{}",
            spec.source_generations(),
            spec.output_generation
        );
        Ok(MergeHandle {
            spec,
            reply: reply_rx,
        })
    }

    fn worker_loop(receiver: Receiver<MergeJob>, shared: Arc<Shared>, retries: u32) {
        while let Ok(job) = receiver.recv() {
            let closed = {
                let mut admission = shared.admission.lock();
                admission.queued -= 1;
                if !admission.closed {
                    admission.running += 1;
                }
                admission.closed
            };
            shared.changed.notify_all();

            if closed {
                debug!("abandoning queued merge into seg_{}", job.spec.output_generation);
                job.executor.abandon(&job.spec);
                shared.counters.abandoned.fetch_add(1, Ordering::Relaxed);
                // Dropping the reply sender tells the handle it was abandoned.
                continue;
            }

            let result = Self::run_with_retries(&job, &shared, retries);

            shared.admission.lock().running -= 1;
            shared.changed.notify_all();
            let _ = job.reply.send(result);
        }
    }

    fn run_with_retries(job: &MergeJob, shared: &Shared, retries: u32) -> Result<MergeOutcome> {
        let max_attempts = retries + 1;
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            match job.executor.execute(&job.spec) {
                Ok(mut outcome) => {
                    outcome.attempts = attempt;
                    shared.counters.completed.fetch_add(1, Ordering::Relaxed);
                    return Ok(outcome);
                }
                Err(e) => {
                    warn!(
                        "merge into seg_{} failed (attempt {attempt}/{max_attempts}): {e}",
                        job.spec.output_generation
                    );
                    last_error = Some(e);
                    if attempt == max_attempts || shared.admission.lock().closed {
                        break;
                    }
                    shared.counters.retries.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        job.executor.abandon(&job.spec);
        shared.counters.failed.fetch_add(1, Ordering::Relaxed);
        let reason = last_error.map(|e| e.to_string()).unwrap_or_default();
        Err(NrtError::merge_failed(format!(
            "merge of {:?} gave up: {reason}",
            job.spec.source_generations()
        )))
    }

    /// Current counters.
    pub fn stats(&self) -> CompactorStats {
        let counters = &self.shared.counters;
        let admission = self.shared.admission.lock();
        CompactorStats {
            scheduled: counters.scheduled.load(Ordering::Relaxed),
            completed: counters.completed.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            abandoned: counters.abandoned.load(Ordering::Relaxed),
            retries: counters.retries.load(Ordering::Relaxed),
            admission_stalls: counters.admission_stalls.load(Ordering::Relaxed),
            queued: admission.queued,
            running: admission.running,
        }
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.shared.admission.lock().closed
    }

    /// Abandon queued merges, wait for running ones and stop the workers.
    ///
    /// Blocked `schedule_merge` callers are woken and fail. Idempotent.
    pub fn close(&self) -> Result<()> {
        {
            let mut admission = self.shared.admission.lock();
            if admission.closed && self.workers.lock().is_empty() {
                return Ok(());
            }
            admission.closed = true;
        }
        self.shared.changed.notify_all();

        self.sender.lock().take();

        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        let current = thread::current().id();
        let mut panicked = 0;
        for worker in workers {
            // The last owner may be dropped on a worker, which cannot join itself.
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                panicked += 1;
            }
        }

        let stats = self.stats();
        info!(
            "compactor closed: {} completed, {} failed, {} abandoned",
            stats.completed, stats.failed, stats.abandoned
        );
        if panicked > 0 {
            return Err(NrtError::ThreadJoinError(format!(
                "{panicked} merge worker(s) panicked"
            )));
        }
        Ok(())
    }
}

impl Drop for Compactor {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("error closing compactor: {e}");
        }
    }
}
