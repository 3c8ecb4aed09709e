//! Ownership of the current snapshot and the refresh protocol.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::error::{NrtError, Result};
use crate::segment::{LiveDocs, ReaderPool};
use crate::snapshot::{RefTracker, SegmentView, Snapshot, SnapshotRef};
use crate::storage::Storage;
use crate::writer::{CommitPoint, MutableWriter};

/// Configuration for the snapshot manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotManagerConfig {
    /// Flush the writer at the start of every refresh, so buffered records
    /// become visible without waiting for the buffer to fill.
    pub flush_on_refresh: bool,
}

impl Default for SnapshotManagerConfig {
    fn default() -> Self {
        SnapshotManagerConfig {
            flush_on_refresh: true,
        }
    }
}

/// Counters describing refresh activity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotManagerStats {
    /// Refreshes that installed a new snapshot.
    pub refreshes: u64,
    /// Refreshes that found nothing new.
    pub unchanged: u64,
    /// Refreshes skipped because storage could not be read.
    pub failures: u64,
    /// Generation of the current snapshot.
    pub current_generation: u64,
    /// References currently held by readers.
    pub outstanding_refs: usize,
}

#[derive(Debug, Default)]
struct Counters {
    refreshes: AtomicU64,
    unchanged: AtomicU64,
    failures: AtomicU64,
}

/// Hands out the current snapshot and replaces it on refresh.
///
/// `acquire` and the swap in `maybe_refresh` synchronise on the `current`
/// lock: a reader increments the count of whatever snapshot is current while
/// holding the read side, and a refresh retires the old snapshot only after
/// installing the new one under the write side. A reader therefore always
/// gets a snapshot that is either current or about to be retired with its
/// reference already counted.
pub struct SnapshotManager {
    config: SnapshotManagerConfig,
    writer: Option<MutableWriter>,
    pool: Arc<ReaderPool>,
    current: RwLock<Arc<Snapshot>>,
    refresh_lock: Mutex<()>,
    next_generation: AtomicU64,
    tracker: Arc<RefTracker>,
    closed: AtomicBool,
    counters: Counters,
}

impl std::fmt::Debug for SnapshotManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotManager")
            .field("config", &self.config)
            .field("current", &*self.current.read())
            .field("static", &self.writer.is_none())
            .finish()
    }
}

impl SnapshotManager {
    /// Track `writer`, starting from its current committed segments.
    pub fn open(writer: MutableWriter, config: SnapshotManagerConfig) -> Result<Self> {
        let pool = Arc::clone(writer.reader_pool());
        let commit = writer.capture_commit();
        let initial = Self::build(&pool, &writer, 0, commit)?;
        initial.mark_live();
        info!(
            "snapshot manager opened at version {} with {} docs",
            initial.version(),
            initial.num_docs()
        );

        Ok(SnapshotManager {
            config,
            writer: Some(writer),
            pool,
            current: RwLock::new(Arc::new(initial)),
            refresh_lock: Mutex::new(()),
            next_generation: AtomicU64::new(1),
            tracker: Arc::new(RefTracker::default()),
            closed: AtomicBool::new(false),
            counters: Counters::default(),
        })
    }

    /// Serve a fixed snapshot of whatever segments `storage` holds.
    ///
    /// There is no writer: [`SnapshotManager::maybe_refresh`] never finds
    /// anything new and segment files are never deleted.
    pub fn fixed(storage: Arc<dyn Storage>) -> Result<Self> {
        let pool = Arc::new(ReaderPool::new(storage));
        let segments = pool
            .open_existing()
            .map_err(|e| NrtError::snapshot_unavailable(e.to_string()))?
            .into_iter()
            .map(|reader| {
                let live_docs = LiveDocs::all_live(reader.doc_count());
                SegmentView::new(reader, live_docs)
            })
            .collect();
        let snapshot = Snapshot::new(0, 0, segments, None);
        snapshot.mark_live();
        info!(
            "opened static snapshot: {} segments, {} docs",
            snapshot.segments().len(),
            snapshot.num_docs()
        );

        Ok(SnapshotManager {
            config: SnapshotManagerConfig {
                flush_on_refresh: false,
            },
            writer: None,
            pool,
            current: RwLock::new(Arc::new(snapshot)),
            refresh_lock: Mutex::new(()),
            next_generation: AtomicU64::new(1),
            tracker: Arc::new(RefTracker::default()),
            closed: AtomicBool::new(false),
            counters: Counters::default(),
        })
    }

    fn build(
        pool: &ReaderPool,
        writer: &MutableWriter,
        generation: u64,
        commit: CommitPoint,
    ) -> Result<Snapshot> {
        let infos: Vec<_> = commit.segments.iter().map(|(info, _)| info.clone()).collect();
        match pool.get_all(&infos) {
            Ok(readers) => {
                let segments = readers
                    .into_iter()
                    .zip(commit.segments)
                    .map(|(reader, (_, live_docs))| SegmentView::new(reader, live_docs))
                    .collect();
                Ok(Snapshot::new(
                    generation,
                    commit.version,
                    segments,
                    Some(Arc::clone(writer.file_deleter())),
                ))
            }
            Err(e) => {
                writer.file_deleter().dec_ref(commit.generations());
                Err(NrtError::snapshot_unavailable(format!(
                    "opening segments of version {}: {e}",
                    commit.version
                )))
            }
        }
    }

    /// The writer being tracked, if any.
    pub fn writer(&self) -> Option<&MutableWriter> {
        self.writer.as_ref()
    }

    /// Whether this is a static manager.
    pub fn is_static(&self) -> bool {
        self.writer.is_none()
    }

    /// Reference the current snapshot.
    pub fn acquire(&self) -> Result<SnapshotRef> {
        let current = self.current.read();
        if self.closed.load(Ordering::SeqCst) {
            return Err(NrtError::already_closed("snapshot manager is closed"));
        }
        Ok(SnapshotRef::new(Arc::clone(&current), Arc::clone(&self.tracker)))
    }

    /// Give a reference back. Equivalent to dropping it.
    pub fn release(&self, snapshot: SnapshotRef) {
        drop(snapshot);
    }

    /// Install a new snapshot if the writer committed anything since the
    /// current one was built.
    ///
    /// Returns whether a new snapshot was installed. Calling this twice with
    /// no intervening commit installs at most one snapshot. When storage
    /// cannot be read the refresh is skipped, the current snapshot stays, and
    /// [`NrtError::SnapshotUnavailable`] is returned.
    pub fn maybe_refresh(&self) -> Result<bool> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(NrtError::already_closed("snapshot manager is closed"));
        }
        let Some(writer) = &self.writer else {
            return Ok(false);
        };

        let _refreshing = self.refresh_lock.lock();
        let current_version = self.current.read().version();
        if self.config.flush_on_refresh {
            match writer.flush() {
                Ok(_) => {}
                Err(e @ (NrtError::AlreadyClosed(_) | NrtError::Corruption(_))) => return Err(e),
                Err(e) => {
                    self.counters.failures.fetch_add(1, Ordering::Relaxed);
                    warn!("refresh skipped, keeping snapshot version {current_version}: {e}");
                    return Err(NrtError::snapshot_unavailable(format!("flushing failed: {e}")));
                }
            }
        }

        if writer.committed_version() == current_version {
            self.counters.unchanged.fetch_add(1, Ordering::Relaxed);
            return Ok(false);
        }

        let started = Instant::now();
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let commit = writer.capture_commit();
        let snapshot = match Self::build(&self.pool, writer, generation, commit) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                warn!("refresh skipped, keeping snapshot version {current_version}: {e}");
                return Err(e);
            }
        };

        let previous = {
            let mut current = self.current.write();
            if self.closed.load(Ordering::SeqCst) {
                drop(current);
                snapshot.discard();
                return Err(NrtError::already_closed("snapshot manager is closed"));
            }
            snapshot.mark_live();
            std::mem::replace(&mut *current, Arc::new(snapshot))
        };
        previous.retire();
        self.counters.refreshes.fetch_add(1, Ordering::Relaxed);

        debug!(
            "installed snapshot {generation} (version {} -> {}) in {} msec",
            current_version,
            self.current.read().version(),
            started.elapsed().as_millis()
        );
        Ok(true)
    }

    /// Version of the current snapshot.
    pub fn current_version(&self) -> u64 {
        self.current.read().version()
    }

    /// References currently held by readers.
    pub fn outstanding_refs(&self) -> usize {
        self.tracker.outstanding()
    }

    /// Counters.
    pub fn stats(&self) -> SnapshotManagerStats {
        SnapshotManagerStats {
            refreshes: self.counters.refreshes.load(Ordering::Relaxed),
            unchanged: self.counters.unchanged.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            current_generation: self.current.read().generation(),
            outstanding_refs: self.tracker.outstanding(),
        }
    }

    /// Whether the manager has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop handing out snapshots and wait for every reader to let go.
    ///
    /// Closing again is allowed and waits for the remaining readers, so a
    /// close that timed out can be retried.
    pub fn close(&self) -> Result<()> {
        self.shutdown(None)
    }

    /// Like [`SnapshotManager::close`] but fails with [`NrtError::Timeout`]
    /// if readers still hold references after `timeout`. The manager stays
    /// closed either way.
    pub fn close_timeout(&self, timeout: Duration) -> Result<()> {
        self.shutdown(Some(timeout))
    }

    fn shutdown(&self, timeout: Option<Duration>) -> Result<()> {
        let retiring = {
            let current = self.current.write();
            let already_closed = self.closed.swap(true, Ordering::SeqCst);
            (!already_closed).then(|| Arc::clone(&current))
        };
        // Only the first close gives up the manager's reference; a repeated
        // close just waits for readers again.
        if let Some(current) = retiring {
            current.retire();
        }

        let outstanding = self.tracker.outstanding();
        if outstanding > 0 {
            debug!("waiting for {outstanding} snapshot references to drain");
        }
        self.tracker.wait_drained(timeout)
    }
}

impl Drop for SnapshotManager {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            self.current.read().retire();
        }
    }
}
