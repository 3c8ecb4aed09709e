//! Immutable, reference counted point-in-time views of the index.
//!
//! A [`Snapshot`] is built from one committed version of the writer and never
//! changes afterwards. Queries hold it through a [`SnapshotRef`] guard; the
//! [`SnapshotManager`] holds one more reference for as long as the snapshot is
//! current. A snapshot is reclaimed, and its segment files released, exactly
//! when it is no longer current and its count reaches zero.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use log::{debug, error};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::document::Record;
use crate::error::{NrtError, Result};
use crate::segment::{FileDeleter, LiveDocs, SegmentReader};

pub mod manager;

pub use manager::{SnapshotManager, SnapshotManagerConfig, SnapshotManagerStats};

/// Lifecycle of a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotState {
    /// Being assembled by a refresh. Not visible to readers.
    Building,
    /// The current snapshot.
    Live,
    /// Superseded, still referenced by readers.
    Retiring,
    /// Superseded and unreferenced. Its files have been released.
    Reclaimed,
}

/// One segment as seen by a snapshot.
#[derive(Debug, Clone)]
pub struct SegmentView {
    reader: Arc<SegmentReader>,
    live_docs: LiveDocs,
}

impl SegmentView {
    /// Pair a reader with the deletions visible to the snapshot.
    pub fn new(reader: Arc<SegmentReader>, live_docs: LiveDocs) -> Self {
        SegmentView { reader, live_docs }
    }

    /// The segment reader.
    pub fn reader(&self) -> &SegmentReader {
        &self.reader
    }

    /// Deletions as of the snapshot.
    pub fn live_docs(&self) -> &LiveDocs {
        &self.live_docs
    }

    /// Whether `doc` is visible.
    pub fn is_live(&self, doc: u32) -> bool {
        self.live_docs.is_live(doc)
    }
}

/// A point-in-time, read-only view of the committed segments.
pub struct Snapshot {
    generation: u64,
    version: u64,
    segments: Vec<SegmentView>,
    max_doc: u64,
    num_docs: u64,
    created: Instant,
    refs: AtomicUsize,
    state: Mutex<SnapshotState>,
    files: Option<Arc<FileDeleter>>,
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("generation", &self.generation)
            .field("version", &self.version)
            .field("segments", &self.segments.len())
            .field("max_doc", &self.max_doc)
            .field("num_docs", &self.num_docs)
            .field("refs", &self.ref_count())
            .field("state", &self.state())
            .finish()
    }
}

impl Snapshot {
    /// Assemble a snapshot in the `Building` state with one reference, owned
    /// by whoever installs it.
    ///
    /// When `files` is given, reclaiming the snapshot drops one file
    /// reference per segment.
    pub(crate) fn new(
        generation: u64,
        version: u64,
        segments: Vec<SegmentView>,
        files: Option<Arc<FileDeleter>>,
    ) -> Self {
        let max_doc = segments.iter().map(|s| s.reader.doc_count() as u64).sum();
        let num_docs = segments.iter().map(|s| s.live_docs.live_count() as u64).sum();
        Snapshot {
            generation,
            version,
            segments,
            max_doc,
            num_docs,
            created: Instant::now(),
            refs: AtomicUsize::new(1),
            state: Mutex::new(SnapshotState::Building),
            files,
        }
    }

    /// Sequence number assigned by the manager.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Writer committed version the snapshot was built from.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Segments, in committed order.
    pub fn segments(&self) -> &[SegmentView] {
        &self.segments
    }

    /// Stored records, deleted ones included.
    pub fn max_doc(&self) -> u64 {
        self.max_doc
    }

    /// Visible records.
    pub fn num_docs(&self) -> u64 {
        self.num_docs
    }

    /// Time since the snapshot was built.
    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    /// Current reference count.
    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::SeqCst)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SnapshotState {
        *self.state.lock()
    }

    /// Generations of the segments.
    pub fn segment_generations(&self) -> Vec<u64> {
        self.segments.iter().map(|s| s.reader.generation()).collect()
    }

    /// Number of visible records containing `term`.
    pub fn doc_freq(&self, term: &str) -> u64 {
        self.segments
            .iter()
            .map(|view| {
                view.reader
                    .postings(term)
                    .iter()
                    .filter(|&&doc| view.is_live(doc))
                    .count() as u64
            })
            .sum()
    }

    /// Visible records with `id`, oldest first.
    pub fn find(&self, id: &str) -> Vec<&Record> {
        self.segments
            .iter()
            .flat_map(|view| {
                view.reader
                    .records()
                    .iter()
                    .enumerate()
                    .filter(move |(doc, record)| view.is_live(*doc as u32) && record.id() == id)
                    .map(|(_, record)| record)
            })
            .collect()
    }

    pub(crate) fn mark_live(&self) {
        *self.state.lock() = SnapshotState::Live;
    }

    pub(crate) fn inc_ref(&self) {
        self.refs.fetch_add(1, Ordering::SeqCst);
    }

    /// Drop one reference, reclaiming a retired snapshot at zero.
    pub(crate) fn dec_ref(&self) {
        let previous = self
            .refs
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |refs| refs.checked_sub(1));
        match previous {
            Ok(1) => self.reclaim(),
            Ok(_) => {}
            Err(_) => error!(
                "snapshot {} released more often than acquired",
                self.generation
            ),
        }
    }

    /// Stop being current and drop the installer's reference.
    pub(crate) fn retire(&self) {
        {
            let mut state = self.state.lock();
            if matches!(*state, SnapshotState::Retiring | SnapshotState::Reclaimed) {
                return;
            }
            *state = SnapshotState::Retiring;
        }
        self.dec_ref();
    }

    /// Release a snapshot that was built but never installed.
    pub(crate) fn discard(self) {
        if let Some(files) = &self.files {
            files.dec_ref(self.segment_generations());
        }
    }

    fn reclaim(&self) {
        {
            let mut state = self.state.lock();
            if *state != SnapshotState::Retiring {
                error!(
                    "snapshot {} reached zero references while {:?}",
                    self.generation, *state
                );
                return;
            }
            *state = SnapshotState::Reclaimed;
        }
        if let Some(files) = &self.files {
            files.dec_ref(self.segment_generations());
        }
        debug!(
            "reclaimed snapshot {} (version {}, {} segments, age {} msec)",
            self.generation,
            self.version,
            self.segments.len(),
            self.age().as_millis()
        );
    }
}

/// Counts references handed out to readers across all snapshots.
#[derive(Debug, Default)]
pub(crate) struct RefTracker {
    outstanding: Mutex<usize>,
    drained: Condvar,
}

impl RefTracker {
    fn acquired(&self) {
        *self.outstanding.lock() += 1;
    }

    fn released(&self) {
        let mut outstanding = self.outstanding.lock();
        *outstanding = outstanding.saturating_sub(1);
        if *outstanding == 0 {
            self.drained.notify_all();
        }
    }

    pub(crate) fn outstanding(&self) -> usize {
        *self.outstanding.lock()
    }

    /// Wait until no reader holds a reference, or until `timeout`.
    pub(crate) fn wait_drained(&self, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut outstanding = self.outstanding.lock();
        while *outstanding > 0 {
            match deadline {
                Some(deadline) => {
                    if self.drained.wait_until(&mut outstanding, deadline).timed_out()
                        && *outstanding > 0
                    {
                        return Err(NrtError::timeout(format!(
                            "{} snapshot references still held",
                            *outstanding
                        )));
                    }
                }
                None => self.drained.wait(&mut outstanding),
            }
        }
        Ok(())
    }
}

/// A reader's reference to a snapshot.
///
/// Dereferences to the [`Snapshot`]. The reference is released when the guard
/// is dropped, including during unwinding.
pub struct SnapshotRef {
    snapshot: Arc<Snapshot>,
    tracker: Arc<RefTracker>,
}

impl SnapshotRef {
    pub(crate) fn new(snapshot: Arc<Snapshot>, tracker: Arc<RefTracker>) -> Self {
        snapshot.inc_ref();
        tracker.acquired();
        SnapshotRef { snapshot, tracker }
    }
}

impl Deref for SnapshotRef {
    type Target = Snapshot;

    fn deref(&self) -> &Snapshot {
        &self.snapshot
    }
}

impl fmt::Debug for SnapshotRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SnapshotRef").field(&*self.snapshot).finish()
    }
}

impl Drop for SnapshotRef {
    fn drop(&mut self) {
        self.snapshot.dec_ref();
        self.tracker.released();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::{SegmentInfo, SegmentOrigin};

    fn view(generation: u64, ids: &[&str]) -> SegmentView {
        let records: Vec<Record> = ids
            .iter()
            .map(|id| Record::builder(*id).add_text("body", "shared text").build())
            .collect();
        let info = SegmentInfo {
            generation,
            doc_count: records.len() as u32,
            size_bytes: 0,
            origin: SegmentOrigin::Flush,
        };
        let live_docs = LiveDocs::all_live(info.doc_count);
        SegmentView::new(Arc::new(SegmentReader::from_records(info, records)), live_docs)
    }

    #[test]
    fn test_counts_and_lookup() {
        let mut second = view(2, &["c", "a"]);
        second.live_docs.delete(1);
        let snapshot = Snapshot::new(0, 3, vec![view(1, &["a", "b"]), second], None);

        assert_eq!(snapshot.max_doc(), 4);
        assert_eq!(snapshot.num_docs(), 3);
        assert_eq!(snapshot.doc_freq("shared"), 3);
        assert_eq!(snapshot.find("a").len(), 1);
        assert!(snapshot.find("zzz").is_empty());
        assert_eq!(snapshot.state(), SnapshotState::Building);
    }

    #[test]
    fn test_reclaimed_only_when_retired_and_unreferenced() {
        let tracker = Arc::new(RefTracker::default());
        let snapshot = Arc::new(Snapshot::new(0, 0, vec![view(1, &["a"])], None));
        snapshot.mark_live();

        let reader = SnapshotRef::new(Arc::clone(&snapshot), Arc::clone(&tracker));
        assert_eq!(snapshot.ref_count(), 2);
        assert_eq!(tracker.outstanding(), 1);

        snapshot.retire();
        assert_eq!(snapshot.state(), SnapshotState::Retiring);
        assert_eq!(snapshot.ref_count(), 1);

        drop(reader);
        assert_eq!(snapshot.state(), SnapshotState::Reclaimed);
        assert_eq!(snapshot.ref_count(), 0);
        assert_eq!(tracker.outstanding(), 0);

        // Counts never go negative.
        snapshot.dec_ref();
        assert_eq!(snapshot.ref_count(), 0);
    }

    #[test]
    fn test_wait_drained_times_out() {
        let tracker = Arc::new(RefTracker::default());
        let snapshot = Arc::new(Snapshot::new(0, 0, Vec::new(), None));
        let reader = SnapshotRef::new(snapshot, Arc::clone(&tracker));

        assert!(matches!(
            tracker.wait_drained(Some(Duration::from_millis(20))),
            Err(NrtError::Timeout(_))
        ));
        drop(reader);
        tracker.wait_drained(Some(Duration::from_millis(20))).unwrap();
    }
}
