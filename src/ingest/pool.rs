//! Ingestion actor threads.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, bounded};
use log::{debug, error, info, warn};
use parking_lot::Mutex;

use crate::document::{DocumentSource, Record};
use crate::error::{NrtError, Result};
use crate::ingest::{IngestConfig, IngestMode, IngestStats, RatePacer};
use crate::writer::MutableWriter;

type SharedSource = Arc<Mutex<Box<dyn DocumentSource>>>;

#[derive(Debug, Default)]
struct Counters {
    claimed: AtomicU64,
    submitted: AtomicU64,
    retries: AtomicU64,
    rejected: AtomicU64,
    source_errors: AtomicU64,
    write_errors: AtomicU64,
}

#[derive(Debug, Default)]
struct Shared {
    counters: Counters,
    aborted: AtomicBool,
    first_error: Mutex<Option<NrtError>>,
}

impl Shared {
    fn fail(&self, error: NrtError) {
        let mut first = self.first_error.lock();
        if first.is_none() {
            *first = Some(error);
        }
        self.aborted.store(true, Ordering::SeqCst);
    }
}

/// Why an actor left its loop.
enum Exit {
    Stopped,
    Exhausted,
    Failed,
}

/// A running set of ingestion actors.
#[derive(Debug)]
pub struct IngestionPool {
    config: IngestConfig,
    started: Instant,
    shared: Arc<Shared>,
    stop: Mutex<Option<Sender<()>>>,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl IngestionPool {
    /// Spawn `thread_count` actors feeding `writer` from `source`.
    pub fn start(
        config: IngestConfig,
        source: Box<dyn DocumentSource>,
        writer: MutableWriter,
    ) -> Result<Self> {
        config.validate()?;

        let source: SharedSource = Arc::new(Mutex::new(source));
        let shared = Arc::new(Shared::default());
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let started = Instant::now();

        let mut handles = Vec::with_capacity(config.thread_count);
        for actor_id in 0..config.thread_count {
            let actor = Actor {
                id: actor_id,
                config: config.clone(),
                source: Arc::clone(&source),
                writer: writer.clone(),
                shared: Arc::clone(&shared),
                stop: stop_rx.clone(),
                started,
            };
            let handle = thread::Builder::new()
                .name(format!("nrt-ingest-{actor_id}"))
                .spawn(move || actor.run());
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
            "ingestion started: threads={} records_per_second_per_thread={} mode={:?}",
            config.thread_count, config.records_per_second_per_thread, config.mode
        );
        Ok(IngestionPool {
            config,
            started,
            shared,
            stop: Mutex::new(Some(stop_tx)),
            handles: Mutex::new(handles),
        })
    }

    /// The active configuration.
    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    /// Ask every actor to stop. Does not wait.
    pub fn stop(&self) {
        self.stop.lock().take();
    }

    /// Whether every actor has exited.
    pub fn is_finished(&self) -> bool {
        self.handles.lock().iter().all(|handle| handle.is_finished())
    }

    /// Wait for every actor to exit.
    ///
    /// Returns the first error when `fail_fast` is set and an actor failed.
    /// Waiting again after the actors exited returns the same result.
    pub fn join(&self) -> Result<IngestStats> {
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        let mut panicked = 0;
        for handle in handles {
            if handle.join().is_err() {
                panicked += 1;
            }
        }
        if panicked > 0 {
            return Err(NrtError::ThreadJoinError(format!(
                "{panicked} ingestion threads panicked"
            )));
        }

        if self.config.fail_fast {
            if let Some(e) = self.shared.first_error.lock().as_ref() {
                return Err(NrtError::other(format!("ingestion aborted: {e}")));
            }
        }
        Ok(self.stats())
    }

    /// Stop the actors and wait for them.
    pub fn shutdown(&self) -> Result<IngestStats> {
        self.stop();
        self.join()
    }

    /// Current counters.
    pub fn stats(&self) -> IngestStats {
        let counters = &self.shared.counters;
        let submitted = counters.submitted.load(Ordering::Relaxed);
        let elapsed = self.started.elapsed().as_secs_f64();
        IngestStats {
            submitted,
            retries: counters.retries.load(Ordering::Relaxed),
            rejected: counters.rejected.load(Ordering::Relaxed),
            source_errors: counters.source_errors.load(Ordering::Relaxed),
            write_errors: counters.write_errors.load(Ordering::Relaxed),
            elapsed_secs: elapsed,
            records_per_second: if elapsed > 0.0 {
                submitted as f64 / elapsed
            } else {
                0.0
            },
        }
    }
}

impl Drop for IngestionPool {
    fn drop(&mut self) {
        self.stop();
        let _ = self.join();
    }
}

struct Actor {
    id: usize,
    config: IngestConfig,
    source: SharedSource,
    writer: MutableWriter,
    shared: Arc<Shared>,
    stop: Receiver<()>,
    started: Instant,
}

impl Actor {
    fn run(self) {
        let mut pacer = RatePacer::starting_at(self.config.records_per_second_per_thread, self.started);
        let exit = self.ingest(&mut pacer);
        let reason = match exit {
            Exit::Stopped => "stopped",
            Exit::Exhausted => "done",
            Exit::Failed => "failed",
        };
        debug!(
            "ingestion thread {} {reason} after {} records",
            self.id,
            pacer.issued()
        );
    }

    fn stop_requested(&self) -> bool {
        if self.shared.aborted.load(Ordering::SeqCst) {
            return true;
        }
        !matches!(self.stop.try_recv(), Err(TryRecvError::Empty))
    }

    /// Sleep for `wait` unless stopped first. Returns whether stopped.
    fn sleep(&self, wait: Duration) -> bool {
        match self.stop.recv_timeout(wait) {
            Err(RecvTimeoutError::Timeout) => self.shared.aborted.load(Ordering::SeqCst),
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
        }
    }

    fn claim(&self) -> bool {
        let Some(max) = self.config.max_records else {
            return true;
        };
        self.shared
            .counters
            .claimed
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |claimed| {
                (claimed < max).then_some(claimed + 1)
            })
            .is_ok()
    }

    fn ingest(&self, pacer: &mut RatePacer) -> Exit {
        loop {
            if self.stop_requested() {
                return Exit::Stopped;
            }
            if let Some(max) = self.config.max_duration {
                if self.started.elapsed() >= max {
                    return Exit::Exhausted;
                }
            }
            if !self.claim() {
                return Exit::Exhausted;
            }
            if let Some(wait) = pacer.delay_at(Instant::now()) {
                if self.sleep(wait) {
                    return Exit::Stopped;
                }
            }
            pacer.advance();

            let next = self.source.lock().next_record();
            let record = match next {
                Ok(Some(record)) => record,
                Ok(None) => return Exit::Exhausted,
                Err(e) => {
                    self.shared.counters.source_errors.fetch_add(1, Ordering::Relaxed);
                    warn!("ingestion thread {}: skipping record: {e}", self.id);
                    if self.config.fail_fast {
                        self.shared.fail(e);
                        return Exit::Failed;
                    }
                    continue;
                }
            };

            match self.write(record) {
                Ok(()) => {
                    self.shared.counters.submitted.fetch_add(1, Ordering::Relaxed);
                }
                Err(NrtError::AlreadyClosed(_)) => return Exit::Stopped,
                Err(e) => {
                    let fatal = matches!(e, NrtError::Corruption(_));
                    if matches!(e, NrtError::WriteRejected(_)) {
                        self.shared.counters.rejected.fetch_add(1, Ordering::Relaxed);
                    } else {
                        self.shared.counters.write_errors.fetch_add(1, Ordering::Relaxed);
                    }
                    if fatal {
                        error!("ingestion thread {}: writer failed: {e}", self.id);
                    } else {
                        warn!("ingestion thread {}: record dropped: {e}", self.id);
                    }
                    if self.config.fail_fast || fatal {
                        self.shared.fail(e);
                        return Exit::Failed;
                    }
                }
            }
        }
    }

    /// Hand `record` to the writer, retrying rejections with backoff.
    fn write(&self, record: Record) -> Result<()> {
        let mut backoff = self.config.retry_backoff;
        let mut attempt = 0;
        loop {
            let result = match self.config.mode {
                IngestMode::Add => self.writer.submit(record.clone()),
                IngestMode::Update => self.writer.update(record.clone()),
            };
            match result {
                Err(e) if e.is_retryable() && attempt < self.config.max_write_retries => {
                    attempt += 1;
                    self.shared.counters.retries.fetch_add(1, Ordering::Relaxed);
                    if self.sleep(backoff) {
                        return Err(e);
                    }
                    backoff = (backoff * 2).min(Duration::from_millis(100));
                }
                other => return other,
            }
        }
    }
}
