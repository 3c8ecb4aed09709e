//! Periodic refresh of the current snapshot.
//!
//! A dedicated thread calls [`SnapshotManager::maybe_refresh`] on a fixed
//! schedule anchored at start time: the n-th refresh is due at
//! `start + n * interval`, so time spent refreshing does not make the
//! schedule drift. When a refresh runs past the next deadline the loop logs
//! how far behind it is, refreshes once right away and re-anchors the
//! schedule instead of firing the missed refreshes back to back.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, bounded};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{NrtError, Result};
use crate::snapshot::SnapshotManager;

/// Counters describing the refresh loop.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RefreshStats {
    /// Refreshes that installed a new snapshot.
    pub reopens: u64,
    /// Refreshes that found nothing new.
    pub unchanged: u64,
    /// Refreshes that failed.
    pub errors: u64,
    /// Times the loop missed a deadline.
    pub fell_behind: u64,
    /// Largest lag behind schedule observed, in milliseconds.
    pub max_lag_ms: u64,
}

#[derive(Debug, Default)]
struct Counters {
    reopens: AtomicU64,
    unchanged: AtomicU64,
    errors: AtomicU64,
    fell_behind: AtomicU64,
    max_lag_ms: AtomicU64,
}

/// Handle to the running refresh thread.
#[derive(Debug)]
pub struct RefreshLoop {
    interval: Duration,
    stop: Mutex<Option<Sender<()>>>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
    counters: Arc<Counters>,
}

impl RefreshLoop {
    /// Start refreshing `manager` every `interval`.
    pub fn start(manager: Arc<SnapshotManager>, interval: Duration) -> Result<Self> {
        if interval.is_zero() {
            return Err(NrtError::invalid_config("refresh interval must be positive"));
        }

        let (stop_tx, stop_rx) = bounded::<()>(0);
        let counters = Arc::new(Counters::default());
        let loop_counters = Arc::clone(&counters);
        let handle = thread::Builder::new()
            .name("nrt-refresh".to_string())
            .spawn(move || Self::run(manager, interval, stop_rx, loop_counters))?;

        info!("refresh loop started: interval={} msec", interval.as_millis());
        Ok(RefreshLoop {
            interval,
            stop: Mutex::new(Some(stop_tx)),
            handle: Mutex::new(Some(handle)),
            counters,
        })
    }

    /// The refresh interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Current counters.
    pub fn stats(&self) -> RefreshStats {
        RefreshStats {
            reopens: self.counters.reopens.load(Ordering::Relaxed),
            unchanged: self.counters.unchanged.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            fell_behind: self.counters.fell_behind.load(Ordering::Relaxed),
            max_lag_ms: self.counters.max_lag_ms.load(Ordering::Relaxed),
        }
    }

    /// Interrupt the sleep and join the thread. Safe to call repeatedly.
    pub fn stop(&self) -> Result<()> {
        // Dropping the sender wakes the thread out of its timed wait.
        self.stop.lock().take();
        if let Some(handle) = self.handle.lock().take() {
            handle
                .join()
                .map_err(|_| NrtError::ThreadJoinError("refresh thread panicked".to_string()))?;
            debug!("refresh loop stopped");
        }
        Ok(())
    }

    fn run(
        manager: Arc<SnapshotManager>,
        interval: Duration,
        stop: Receiver<()>,
        counters: Arc<Counters>,
    ) {
        let started = Instant::now();
        let mut anchor = started;
        let mut ticks: u32 = 1;

        loop {
            let deadline = anchor + interval * ticks;
            let now = Instant::now();
            match deadline.checked_duration_since(now) {
                Some(wait) => {
                    match stop.recv_timeout(wait) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                    ticks += 1;
                }
                None => {
                    let lag = now.duration_since(deadline);
                    warn!("reopen fell behind by {} ms", lag.as_millis());
                    counters.fell_behind.fetch_add(1, Ordering::Relaxed);
                    counters
                        .max_lag_ms
                        .fetch_max(lag.as_millis() as u64, Ordering::Relaxed);
                    match stop.try_recv() {
                        Err(TryRecvError::Empty) => {}
                        Ok(()) | Err(TryRecvError::Disconnected) => break,
                    }
                    anchor = now;
                    ticks = 1;
                }
            }

            match manager.maybe_refresh() {
                Ok(installed) => {
                    if installed {
                        counters.reopens.fetch_add(1, Ordering::Relaxed);
                    } else {
                        counters.unchanged.fetch_add(1, Ordering::Relaxed);
                    }
                    Self::log_reopen(&manager, started);
                }
                Err(NrtError::AlreadyClosed(_)) => break,
                Err(e) => {
                    counters.errors.fetch_add(1, Ordering::Relaxed);
                    warn!("reopen failed: {e}");
                }
            }
        }
    }

    fn log_reopen(manager: &SnapshotManager, started: Instant) {
        let writer_max_doc = manager.writer().map_or(0, |writer| writer.max_doc());
        match manager.acquire() {
            Ok(snapshot) => info!(
                "{:.1}s: done reopen; writer.max_doc={}; snapshot.max_doc={}; snapshot.num_docs={}",
                started.elapsed().as_secs_f64(),
                writer_max_doc,
                snapshot.max_doc(),
                snapshot.num_docs()
            ),
            Err(e) => debug!("cannot report reopen: {e}"),
        }
    }
}

impl Drop for RefreshLoop {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Record;
    use crate::merge::MergePolicyConfig;
    use crate::snapshot::SnapshotManagerConfig;
    use crate::storage::MemoryStorage;
    use crate::writer::{MutableWriter, WriterConfig};

    fn manager() -> (MutableWriter, Arc<SnapshotManager>) {
        let config = WriterConfig {
            merge_policy: MergePolicyConfig::None,
            warm_on_merge: false,
            ..WriterConfig::default()
        };
        let writer = MutableWriter::open(Arc::new(MemoryStorage::new()), config).unwrap();
        let manager = Arc::new(
            SnapshotManager::open(writer.clone(), SnapshotManagerConfig::default()).unwrap(),
        );
        (writer, manager)
    }

    #[test]
    fn test_refresh_loop_publishes_records() {
        let (writer, manager) = manager();
        let refresher = RefreshLoop::start(Arc::clone(&manager), Duration::from_millis(10)).unwrap();

        writer.submit(Record::builder("1").add_text("body", "x").build()).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while manager.acquire().unwrap().num_docs() == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(manager.acquire().unwrap().num_docs(), 1);

        refresher.stop().unwrap();
        refresher.stop().unwrap();
        assert!(refresher.stats().reopens >= 1);
    }

    #[test]
    fn test_stop_interrupts_long_sleep() {
        let (_writer, manager) = manager();
        let refresher = RefreshLoop::start(manager, Duration::from_secs(3600)).unwrap();

        let started = Instant::now();
        refresher.stop().unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(refresher.stats().reopens, 0);
    }

    #[test]
    fn test_zero_interval_is_rejected() {
        let (_writer, manager) = manager();
        assert!(matches!(
            RefreshLoop::start(manager, Duration::ZERO),
            Err(NrtError::InvalidConfig(_))
        ));
    }
}
