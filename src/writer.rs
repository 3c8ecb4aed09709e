//! The single mutable writer.
//!
//! Records accumulate in an in-memory buffer. A flush turns the buffer into a
//! new immutable segment and publishes it, together with every deletion that
//! was pending, as one atomic change of the committed segment set. Published
//! segments are merged in the background by the [`Compactor`]; a merge commit
//! is the only other way the committed set changes.
//!
//! Every change of the committed set bumps [`MutableWriter::committed_version`],
//! which is what refresh compares to decide whether a new snapshot is needed.

use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use ahash::{AHashMap, AHashSet};
use bit_vec::BitVec;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::document::Record;
use crate::error::{NrtError, Result};
use crate::merge::{
    Compactor, CompactorConfig, CompactorStats, MergeExecutor, MergeHandle, MergeOutcome,
    MergePolicy, MergePolicyConfig, MergeSpec, TermLookupWarmer, Warmer,
};
use crate::segment::{
    FileDeleter, LiveDocs, ReaderPool, SegmentInfo, SegmentOrigin, SegmentReader, segment_file_name,
    write_segment,
};
use crate::storage::Storage;

/// Configuration for the mutable writer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Buffered records that trigger an automatic flush.
    pub max_buffered_records: usize,

    /// Estimated buffered bytes above which submissions are rejected until
    /// a flush makes room.
    pub max_buffered_bytes: usize,

    /// Re-read every flushed segment before publishing it.
    pub verify_flush: bool,

    /// Warm merged segments before they are committed.
    pub warm_on_merge: bool,

    /// Term looked up by the default warmer.
    pub warm_term: String,

    /// Which segments get merged.
    pub merge_policy: MergePolicyConfig,

    /// Merge concurrency and queueing.
    pub compactor: CompactorConfig,
}

impl Default for WriterConfig {
    fn default() -> Self {
        WriterConfig {
            max_buffered_records: 10_000,
            max_buffered_bytes: 64 * 1024 * 1024,
            verify_flush: false,
            warm_on_merge: true,
            warm_term: TermLookupWarmer::DEFAULT_TERM.to_string(),
            merge_policy: MergePolicyConfig::default(),
            compactor: CompactorConfig::default(),
        }
    }
}

impl WriterConfig {
    /// Check the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.max_buffered_records == 0 {
            return Err(NrtError::invalid_config("max_buffered_records must be positive"));
        }
        if self.max_buffered_bytes == 0 {
            return Err(NrtError::invalid_config("max_buffered_bytes must be positive"));
        }
        self.compactor.validate()?;
        self.merge_policy.build().map(|_| ())
    }
}

/// Point-in-time view of writer activity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WriterStats {
    /// Records ever accepted.
    pub max_doc: u64,
    /// Records accepted and not deleted.
    pub num_docs: u64,
    /// Records waiting in the buffer.
    pub buffered_records: usize,
    /// Estimated size of the buffer.
    pub buffered_bytes: usize,
    /// Deletions waiting for the next flush.
    pub pending_deletes: usize,
    /// Records of failed flushes waiting to be written again.
    pub parked_records: usize,
    /// Segments in the committed set.
    pub segment_count: usize,
    /// Version of the committed set.
    pub committed_version: u64,
    /// Flushes that published a segment.
    pub flushes: u64,
    /// Merges committed.
    pub merges_committed: u64,
    /// Submissions refused with `WriteRejected`.
    pub rejected: u64,
    /// Compactor counters.
    pub compactor: CompactorStats,
}

/// Segments of one committed version, referenced on behalf of a snapshot.
///
/// Capturing takes one file reference per segment; whoever ends up owning
/// the commit point is responsible for releasing them.
#[derive(Debug, Clone)]
pub struct CommitPoint {
    /// Committed version the segments belong to.
    pub version: u64,
    /// Segments with the deletions visible at that version.
    pub segments: Vec<(SegmentInfo, LiveDocs)>,
}

impl CommitPoint {
    /// Generations of the captured segments.
    pub fn generations(&self) -> Vec<u64> {
        self.segments.iter().map(|(info, _)| info.generation).collect()
    }

    /// Stored records, deleted ones included.
    pub fn max_doc(&self) -> u64 {
        self.segments.iter().map(|(info, _)| info.doc_count as u64).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DocAddress {
    generation: u64,
    doc: u32,
}

#[derive(Debug)]
struct CommittedSegment {
    info: SegmentInfo,
    live_docs: LiveDocs,
}

/// Deletions that were pending when a buffer was swapped out for flushing.
#[derive(Debug, Default)]
struct FlushingSegment {
    deletes: Vec<DocAddress>,
}

/// A swapped-out buffer whose segment has not been written yet.
#[derive(Debug)]
struct FlushBatch {
    generation: u64,
    records: Vec<Record>,
    live: BitVec,
}

#[derive(Debug)]
struct WriterState {
    buffer: Vec<Record>,
    buffer_live: BitVec,
    buffer_bytes: usize,
    buffer_generation: u64,
    next_generation: u64,
    flushing: AHashMap<u64, FlushingSegment>,
    parked: Vec<FlushBatch>,
    segments: Vec<CommittedSegment>,
    merging: AHashSet<u64>,
    pending_deletes: Vec<DocAddress>,
    locations: AHashMap<String, Vec<DocAddress>>,
    live_count: u64,
}

impl WriterState {
    fn allocate_generation(&mut self) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        generation
    }

    fn segment_position(&self, generation: u64) -> Option<usize> {
        self.segments
            .iter()
            .position(|segment| segment.info.generation == generation)
    }

    fn append(&mut self, record: Record, bytes: usize) {
        let address = DocAddress {
            generation: self.buffer_generation,
            doc: self.buffer.len() as u32,
        };
        self.locations
            .entry(record.id().to_string())
            .or_default()
            .push(address);
        self.buffer.push(record);
        self.buffer_live.push(true);
        self.buffer_bytes += bytes;
        self.live_count += 1;
    }

    /// Delete every live record with `id`. Returns how many there were.
    fn delete_id(&mut self, id: &str) -> usize {
        let Some(addresses) = self.locations.remove(id) else {
            return 0;
        };
        for address in &addresses {
            if address.generation == self.buffer_generation {
                self.buffer_live.set(address.doc as usize, false);
            } else {
                self.pending_deletes.push(*address);
            }
        }
        self.live_count -= addresses.len() as u64;
        addresses.len()
    }

    fn apply_deletes(&mut self, deletes: Vec<DocAddress>) {
        for address in deletes {
            match self.segment_position(address.generation) {
                Some(position) => {
                    self.segments[position].live_docs.delete(address.doc);
                }
                None => debug!(
                    "dropping delete of doc {} in retired seg_{}",
                    address.doc, address.generation
                ),
            }
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    flushes: AtomicU64,
    merges_committed: AtomicU64,
    rejected: AtomicU64,
}

struct WriterInner {
    config: WriterConfig,
    storage: Arc<dyn Storage>,
    pool: Arc<ReaderPool>,
    deleter: Arc<FileDeleter>,
    policy: Arc<dyn MergePolicy>,
    warmer: Option<Arc<dyn Warmer>>,
    compactor: Compactor,
    state: Mutex<WriterState>,
    flush_lock: Mutex<()>,
    merge_handles: Mutex<Vec<MergeHandle>>,
    version: AtomicU64,
    max_doc: AtomicU64,
    closed: AtomicBool,
    tragedy: Mutex<Option<String>>,
    counters: Counters,
}

/// The single writer of an index.
///
/// Cloning is cheap and yields another handle to the same writer, so it can
/// be shared between ingestion threads, the refresher and the snapshot
/// manager.
#[derive(Clone)]
pub struct MutableWriter {
    inner: Arc<WriterInner>,
}

impl std::fmt::Debug for MutableWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutableWriter")
            .field("config", &self.inner.config)
            .field("committed_version", &self.committed_version())
            .field("max_doc", &self.max_doc())
            .finish()
    }
}

impl MutableWriter {
    /// Open a writer over `storage`.
    ///
    /// Segments already present in storage become the initial committed
    /// set. When `warm_on_merge` is set a [`TermLookupWarmer`] for
    /// `warm_term` is installed.
    pub fn open(storage: Arc<dyn Storage>, config: WriterConfig) -> Result<Self> {
        let warmer: Option<Arc<dyn Warmer>> = if config.warm_on_merge {
            Some(Arc::new(TermLookupWarmer::new(config.warm_term.clone(), 10)))
        } else {
            None
        };
        Self::open_with_warmer(storage, config, warmer)
    }

    /// Open a writer with an explicit warmer, or none.
    pub fn open_with_warmer(
        storage: Arc<dyn Storage>,
        config: WriterConfig,
        warmer: Option<Arc<dyn Warmer>>,
    ) -> Result<Self> {
        config.validate()?;
        let policy = config.merge_policy.build()?;
        let compactor = Compactor::new(config.compactor.clone())?;

        let pool = Arc::new(ReaderPool::new(Arc::clone(&storage)));
        let deleter = Arc::new(FileDeleter::new(Arc::clone(&pool)));

        for name in storage.list_files()? {
            if name.ends_with(".tmp") {
                warn!("removing leftover {name}");
                storage.delete_file(&name)?;
            }
        }

        let existing = pool.open_existing()?;
        let mut segments = Vec::with_capacity(existing.len());
        let mut locations: AHashMap<String, Vec<DocAddress>> = AHashMap::new();
        let mut live_count = 0;
        for reader in &existing {
            for (doc, record) in reader.records().iter().enumerate() {
                locations
                    .entry(record.id().to_string())
                    .or_default()
                    .push(DocAddress {
                        generation: reader.generation(),
                        doc: doc as u32,
                    });
            }
            live_count += reader.doc_count() as u64;
            segments.push(CommittedSegment {
                info: reader.info().clone(),
                live_docs: LiveDocs::all_live(reader.doc_count()),
            });
        }
        deleter.inc_ref(segments.iter().map(|segment| segment.info.generation));

        let next_generation = existing.last().map_or(1, |reader| reader.generation() + 1);
        if !segments.is_empty() {
            info!(
                "opened writer over {} existing segments with {} docs",
                segments.len(),
                live_count
            );
        }

        let state = WriterState {
            buffer: Vec::new(),
            buffer_live: BitVec::new(),
            buffer_bytes: 0,
            buffer_generation: next_generation,
            next_generation: next_generation + 1,
            flushing: AHashMap::new(),
            parked: Vec::new(),
            segments,
            merging: AHashSet::new(),
            pending_deletes: Vec::new(),
            locations,
            live_count,
        };

        Ok(MutableWriter {
            inner: Arc::new(WriterInner {
                config,
                storage,
                pool,
                deleter,
                policy,
                warmer,
                compactor,
                state: Mutex::new(state),
                flush_lock: Mutex::new(()),
                merge_handles: Mutex::new(Vec::new()),
                version: AtomicU64::new(0),
                max_doc: AtomicU64::new(live_count),
                closed: AtomicBool::new(false),
                tragedy: Mutex::new(None),
                counters: Counters::default(),
            }),
        })
    }

    /// The active configuration.
    pub fn config(&self) -> &WriterConfig {
        &self.inner.config
    }

    /// The storage segments are written to.
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.inner.storage
    }

    /// Accept one record into the buffer.
    ///
    /// Flushes automatically once `max_buffered_records` are buffered; the
    /// flush runs on the calling thread. Fails with
    /// [`NrtError::WriteRejected`] while the buffer is over
    /// `max_buffered_bytes` and another thread is already flushing.
    pub fn submit(&self, record: Record) -> Result<()> {
        self.inner.add(record, false)
    }

    /// Replace every live record sharing `record`'s id with `record`.
    ///
    /// The deletion and the addition become visible in the same flush.
    pub fn update(&self, record: Record) -> Result<()> {
        self.inner.add(record, true)
    }

    /// Delete every live record with `id`. Returns whether any existed.
    ///
    /// Deletions of flushed records become visible with the next flush.
    pub fn delete(&self, id: &str) -> Result<bool> {
        self.inner.ensure_open()?;
        let mut state = self.inner.state.lock();
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(NrtError::already_closed("writer is closed"));
        }
        Ok(state.delete_id(id) > 0)
    }

    /// Publish the buffer and pending deletions.
    ///
    /// Returns the newest published segment, or `None` when nothing was
    /// buffered. When storage fails the records are kept and written by the
    /// next flush. Only a segment that fails `verify_flush` is fatal: every
    /// later call then fails with [`NrtError::Corruption`].
    pub fn flush(&self) -> Result<Option<SegmentInfo>> {
        self.inner.ensure_open()?;
        let _flushing = self.inner.flush_lock.lock();
        self.inner.flush_locked()
    }

    /// Version of the committed segment set.
    pub fn committed_version(&self) -> u64 {
        self.inner.version.load(Ordering::SeqCst)
    }

    /// Records ever accepted. Never decreases.
    pub fn max_doc(&self) -> u64 {
        self.inner.max_doc.load(Ordering::SeqCst)
    }

    /// Records accepted and not deleted, whether flushed or not.
    pub fn num_docs(&self) -> u64 {
        self.inner.state.lock().live_count
    }

    /// Infos of the committed segments, in order.
    pub fn segment_infos(&self) -> Vec<SegmentInfo> {
        let state = self.inner.state.lock();
        state.segments.iter().map(|segment| segment.info.clone()).collect()
    }

    /// Reference the committed segments for a new snapshot.
    ///
    /// The caller owns one file reference per returned segment and must
    /// release them through [`MutableWriter::file_deleter`].
    pub fn capture_commit(&self) -> CommitPoint {
        let state = self.inner.state.lock();
        let commit = CommitPoint {
            version: self.inner.version.load(Ordering::SeqCst),
            segments: state
                .segments
                .iter()
                .map(|segment| (segment.info.clone(), segment.live_docs.clone()))
                .collect(),
        };
        self.inner.deleter.inc_ref(commit.generations());
        commit
    }

    /// Pool snapshots open their readers from.
    pub fn reader_pool(&self) -> &Arc<ReaderPool> {
        &self.inner.pool
    }

    /// Reference counts of segment files.
    pub fn file_deleter(&self) -> &Arc<FileDeleter> {
        &self.inner.deleter
    }

    /// Block until every merge scheduled so far has finished.
    ///
    /// Merges triggered by flushes that happen meanwhile are waited for too.
    pub fn wait_for_merges(&self) -> Vec<Result<MergeOutcome>> {
        let mut results = Vec::new();
        loop {
            let handles: Vec<MergeHandle> = mem::take(&mut *self.inner.merge_handles.lock());
            if handles.is_empty() {
                return results;
            }
            results.extend(handles.into_iter().map(MergeHandle::wait));
        }
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> WriterStats {
        let state = self.inner.state.lock();
        WriterStats {
            max_doc: self.max_doc(),
            num_docs: state.live_count,
            buffered_records: state.buffer.len(),
            buffered_bytes: state.buffer_bytes,
            pending_deletes: state.pending_deletes.len(),
            parked_records: state.parked.iter().map(|batch| batch.records.len()).sum(),
            segment_count: state.segments.len(),
            committed_version: self.committed_version(),
            flushes: self.inner.counters.flushes.load(Ordering::Relaxed),
            merges_committed: self.inner.counters.merges_committed.load(Ordering::Relaxed),
            rejected: self.inner.counters.rejected.load(Ordering::Relaxed),
            compactor: self.inner.compactor.stats(),
        }
    }

    /// Whether [`MutableWriter::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Flush, wait for running merges and stop accepting records.
    ///
    /// Queued merges that have not started are abandoned. Committed segment
    /// files stay in storage. A second call fails with
    /// [`NrtError::AlreadyClosed`].
    pub fn close(&self) -> Result<()> {
        {
            let _state = self.inner.state.lock();
            if self.inner.closed.swap(true, Ordering::SeqCst) {
                return Err(NrtError::already_closed("writer is already closed"));
            }
        }

        let flushed = {
            let _flushing = self.inner.flush_lock.lock();
            if self.inner.tragedy.lock().is_some() {
                Ok(None)
            } else {
                self.inner.flush_locked()
            }
        };

        let compactor_closed = self.inner.compactor.close();
        self.inner.merge_handles.lock().clear();

        let stats = self.stats();
        info!(
            "writer closed: max_doc={} num_docs={} segments={} flushes={} merges={}",
            stats.max_doc, stats.num_docs, stats.segment_count, stats.flushes, stats.merges_committed
        );
        flushed?;
        compactor_closed
    }
}

impl WriterInner {
    fn ensure_open(&self) -> Result<()> {
        self.check_tragedy()?;
        if self.closed.load(Ordering::SeqCst) {
            return Err(NrtError::already_closed("writer is closed"));
        }
        Ok(())
    }

    fn add(self: &Arc<Self>, record: Record, replace: bool) -> Result<()> {
        self.ensure_open()?;
        let bytes = record.estimated_bytes();
        let mut record = Some(record);

        let buffered = loop {
            {
                let mut state = self.state.lock();
                if self.closed.load(Ordering::SeqCst) {
                    return Err(NrtError::already_closed("writer is closed"));
                }
                let fits = state.buffer.is_empty()
                    || state.buffer_bytes + bytes <= self.config.max_buffered_bytes;
                if fits {
                    if let Some(record) = record.take() {
                        if replace {
                            state.delete_id(record.id());
                        }
                        state.append(record, bytes);
                    }
                    self.max_doc.fetch_add(1, Ordering::SeqCst);
                    break state.buffer.len();
                }
            }

            // Over the byte ceiling: make room ourselves, or let the caller
            // back off while someone else does.
            match self.flush_lock.try_lock() {
                Some(_flushing) => match self.flush_locked() {
                    Ok(_) => {}
                    Err(e @ NrtError::Corruption(_)) => return Err(e),
                    Err(e) => {
                        self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                        return Err(NrtError::write_rejected(format!(
                            "buffer holds more than {} bytes and flushing failed: {e}",
                            self.config.max_buffered_bytes
                        )));
                    }
                },
                None => {
                    self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                    return Err(NrtError::write_rejected(format!(
                        "buffer holds more than {} bytes and a flush is in progress",
                        self.config.max_buffered_bytes
                    )));
                }
            }
        };

        if buffered >= self.config.max_buffered_records {
            let _flushing = self.flush_lock.lock();
            // Another thread may have flushed while we waited.
            if self.state.lock().buffer.len() >= self.config.max_buffered_records {
                // The record is buffered either way; a failed flush is retried
                // by the next one.
                match self.flush_locked() {
                    Err(e @ NrtError::Corruption(_)) => return Err(e),
                    Err(e) => debug!("flush after submit deferred: {e}"),
                    Ok(_) => {}
                }
            }
        }
        Ok(())
    }

    fn check_tragedy(&self) -> Result<()> {
        match self.tragedy.lock().as_ref() {
            Some(reason) => Err(NrtError::corruption(format!(
                "writer hit an unrecoverable error: {reason}"
            ))),
            None => Ok(()),
        }
    }

    /// Caller holds `flush_lock`.
    ///
    /// Batches whose earlier flush failed are written first, oldest first, so
    /// segments are published in generation order.
    fn flush_locked(self: &Arc<Self>) -> Result<Option<SegmentInfo>> {
        self.check_tragedy()?;

        let mut published = None;
        let mut parked = mem::take(&mut self.state.lock().parked).into_iter();
        while let Some(batch) = parked.next() {
            match self.write_batch(batch) {
                Ok(info) => published = Some(info),
                Err(e) => {
                    self.state.lock().parked.extend(parked);
                    return Err(e);
                }
            }
        }

        let batch = {
            let mut state = self.state.lock();
            if state.buffer.is_empty() {
                if !state.pending_deletes.is_empty() {
                    let deletes = mem::take(&mut state.pending_deletes);
                    debug!("publishing {} deletes without new records", deletes.len());
                    state.apply_deletes(deletes);
                    self.version.fetch_add(1, Ordering::SeqCst);
                }
                return Ok(published);
            }

            let generation = state.buffer_generation;
            state.buffer_generation = state.allocate_generation();
            let records = mem::take(&mut state.buffer);
            let live = mem::take(&mut state.buffer_live);
            state.buffer_bytes = 0;
            let deletes = mem::take(&mut state.pending_deletes);
            state.flushing.insert(generation, FlushingSegment { deletes });
            FlushBatch {
                generation,
                records,
                live,
            }
        };

        self.write_batch(batch).map(Some)
    }

    /// Write and publish one swapped-out buffer.
    ///
    /// A storage failure parks the batch for the next flush and leaves the
    /// writer usable. A segment that does not read back after being written
    /// is corruption and fatal for the writer.
    fn write_batch(self: &Arc<Self>, batch: FlushBatch) -> Result<SegmentInfo> {
        let generation = batch.generation;
        let started = Instant::now();

        let info = match write_segment(
            self.storage.as_ref(),
            generation,
            SegmentOrigin::Flush,
            &batch.records,
        ) {
            Ok(info) => info,
            Err(e) => {
                warn!(
                    "flush of seg_{generation} failed, keeping {} records for the next flush: {e}",
                    batch.records.len()
                );
                self.discard_file(generation);
                self.state.lock().parked.push(batch);
                return Err(NrtError::storage(format!("flush of seg_{generation} failed: {e}")));
            }
        };

        if self.config.verify_flush {
            if let Err(e) = SegmentReader::open(self.storage.as_ref(), &info) {
                error!("seg_{generation} does not read back after flush: {e}");
                *self.tragedy.lock() = Some(e.to_string());
                self.state.lock().flushing.remove(&generation);
                self.discard_file(generation);
                return Err(NrtError::corruption(format!(
                    "seg_{generation} does not read back after flush: {e}"
                )));
            }
        }

        {
            let mut state = self.state.lock();
            let flushing = state.flushing.remove(&generation).unwrap_or_default();
            state.segments.push(CommittedSegment {
                info: info.clone(),
                live_docs: LiveDocs::from_bits(batch.live),
            });
            self.deleter.inc_ref([generation]);
            state.apply_deletes(flushing.deletes);
            self.version.fetch_add(1, Ordering::SeqCst);
        }
        self.counters.flushes.fetch_add(1, Ordering::Relaxed);
        debug!(
            "flushed {info}: took {} msec",
            started.elapsed().as_millis()
        );

        self.maybe_merge();
        Ok(info)
    }

    fn discard_file(&self, generation: u64) {
        if self.storage.file_exists(&segment_file_name(generation)) {
            self.deleter.delete_now(generation);
        }
    }

    /// Register and schedule whatever the policy wants merged.
    ///
    /// Runs with `flush_lock` held, so blocking admission stalls the flushing
    /// thread and every ingestion thread waiting to flush behind it.
    fn maybe_merge(self: &Arc<Self>) {
        if self.compactor.is_closed() {
            return;
        }

        let specs: Vec<MergeSpec> = {
            let mut state = self.state.lock();
            let infos: Vec<SegmentInfo> =
                state.segments.iter().map(|segment| segment.info.clone()).collect();
            let candidates = self.policy.find_merges(&infos, &state.merging);
            candidates
                .into_iter()
                .map(|candidate| {
                    for info in &candidate.segments {
                        state.merging.insert(info.generation);
                    }
                    MergeSpec {
                        sources: candidate.segments,
                        output_generation: state.allocate_generation(),
                    }
                })
                .collect()
        };

        for spec in specs {
            let executor: Arc<dyn MergeExecutor> = Arc::clone(self) as Arc<dyn MergeExecutor>;
            match self.compactor.schedule_merge(spec.clone(), executor) {
                Ok(handle) => {
                    let mut handles = self.merge_handles.lock();
                    handles.retain(|handle| !handle.is_finished());
                    handles.push(handle);
                }
                Err(e) => {
                    debug!("merge into seg_{} not scheduled: {e}", spec.output_generation);
                    self.abandon(&spec);
                }
            }
        }
    }

    fn merge_records(
        &self,
        spec: &MergeSpec,
        captured: &[LiveDocs],
    ) -> Result<(Vec<Record>, Vec<(usize, u32)>)> {
        let readers = self.pool.get_all(&spec.sources)?;
        let mut records = Vec::new();
        let mut doc_map = Vec::new();
        for (source, reader) in readers.iter().enumerate() {
            for (doc, record) in reader.records().iter().enumerate() {
                let doc = doc as u32;
                if captured[source].is_live(doc) {
                    records.push(record.clone());
                    doc_map.push((source, doc));
                }
            }
        }
        Ok((records, doc_map))
    }

    fn warm(&self, info: &SegmentInfo) -> bool {
        let Some(warmer) = &self.warmer else {
            return false;
        };
        let started = Instant::now();
        match self.pool.get(info).and_then(|reader| warmer.warm(&reader)) {
            Ok(()) => {
                info!(
                    "warm segment={} num_docs={}: took {} msec",
                    info.file_name(),
                    info.doc_count,
                    started.elapsed().as_millis()
                );
                true
            }
            Err(e) => {
                warn!("warming {} failed: {e}", info.file_name());
                false
            }
        }
    }

    /// Swap the merged segment in for its sources.
    ///
    /// Returns the number of deletions carried over from sources.
    fn commit_merge(
        &self,
        spec: &MergeSpec,
        output: Option<&SegmentInfo>,
        captured: &[LiveDocs],
        records: &[Record],
        doc_map: &[(usize, u32)],
    ) -> Result<u32> {
        let sources = spec.source_generations();
        let output_generation = spec.output_generation;

        let carried = {
            let mut state = self.state.lock();

            let positions = sources
                .iter()
                .map(|&generation| state.segment_position(generation))
                .collect::<Option<Vec<usize>>>()
                .ok_or_else(|| NrtError::merge_failed("a source segment is no longer committed"))?;

            let mut reverse: Vec<Vec<Option<u32>>> = spec
                .sources
                .iter()
                .map(|info| vec![None; info.doc_count as usize])
                .collect();
            for (new_doc, &(source, doc)) in doc_map.iter().enumerate() {
                reverse[source][doc as usize] = Some(new_doc as u32);
            }
            let remap = |address: DocAddress| -> Option<DocAddress> {
                match sources.iter().position(|&g| g == address.generation) {
                    Some(source) => reverse[source]
                        .get(address.doc as usize)
                        .copied()
                        .flatten()
                        .map(|doc| DocAddress {
                            generation: output_generation,
                            doc,
                        }),
                    None => Some(address),
                }
            };

            // Deletions applied to the sources since the merge captured them.
            let mut live_docs = output.map(|info| LiveDocs::all_live(info.doc_count));
            let mut carried = 0;
            for (source, &position) in positions.iter().enumerate() {
                let current = &state.segments[position].live_docs;
                for doc in current.deleted_since(&captured[source]) {
                    if let (Some(live_docs), Some(new_doc)) =
                        (live_docs.as_mut(), reverse[source][doc as usize])
                    {
                        live_docs.delete(new_doc);
                        carried += 1;
                    }
                }
            }

            for (new_doc, &(source, doc)) in doc_map.iter().enumerate() {
                let old = DocAddress {
                    generation: sources[source],
                    doc,
                };
                if let Some(addresses) = state.locations.get_mut(records[new_doc].id()) {
                    for address in addresses.iter_mut().filter(|address| **address == old) {
                        *address = DocAddress {
                            generation: output_generation,
                            doc: new_doc as u32,
                        };
                    }
                }
            }

            let pending = mem::take(&mut state.pending_deletes);
            state.pending_deletes = pending.into_iter().filter_map(remap).collect();
            for flushing in state.flushing.values_mut() {
                let deletes = mem::take(&mut flushing.deletes);
                flushing.deletes = deletes.into_iter().filter_map(remap).collect();
            }

            let insert_at = positions.iter().copied().min().unwrap_or(state.segments.len());
            state
                .segments
                .retain(|segment| !sources.contains(&segment.info.generation));
            if let (Some(info), Some(live_docs)) = (output, live_docs) {
                state.segments.insert(
                    insert_at,
                    CommittedSegment {
                        info: info.clone(),
                        live_docs,
                    },
                );
                self.deleter.inc_ref([info.generation]);
            }
            for generation in &sources {
                state.merging.remove(generation);
            }
            self.version.fetch_add(1, Ordering::SeqCst);
            carried
        };

        self.deleter.dec_ref(sources);
        Ok(carried)
    }
}

impl MergeExecutor for WriterInner {
    fn execute(&self, spec: &MergeSpec) -> Result<MergeOutcome> {
        let started = Instant::now();

        let captured = {
            let state = self.state.lock();
            spec.sources
                .iter()
                .map(|info| {
                    state
                        .segment_position(info.generation)
                        .map(|position| state.segments[position].live_docs.clone())
                })
                .collect::<Option<Vec<LiveDocs>>>()
                .ok_or_else(|| NrtError::merge_failed("a source segment is no longer committed"))?
        };

        let (records, doc_map) = self
            .merge_records(spec, &captured)
            .map_err(|e| NrtError::merge_failed(format!("reading sources: {e}")))?;

        let output = if records.is_empty() {
            None
        } else {
            let info = write_segment(
                self.storage.as_ref(),
                spec.output_generation,
                SegmentOrigin::Merge,
                &records,
            )
            .map_err(|e| NrtError::merge_failed(format!("writing output: {e}")))?;
            Some(info)
        };

        let warmed = output.as_ref().is_some_and(|info| self.warm(info));

        let carried = match self.commit_merge(spec, output.as_ref(), &captured, &records, &doc_map) {
            Ok(carried) => carried,
            Err(e) => {
                if output.is_some() {
                    self.deleter.delete_now(spec.output_generation);
                }
                return Err(e);
            }
        };
        self.counters.merges_committed.fetch_add(1, Ordering::Relaxed);

        let took = started.elapsed();
        info!(
            "merged {:?} into seg_{}: {} docs, {} deletes carried over, took {} msec",
            spec.source_generations(),
            spec.output_generation,
            records.len(),
            carried,
            took.as_millis()
        );

        Ok(MergeOutcome {
            output,
            merged_generations: spec.source_generations(),
            copied_docs: records.len() as u32,
            carried_deletes: carried,
            warmed,
            attempts: 1,
            took,
        })
    }

    fn abandon(&self, spec: &MergeSpec) {
        let mut state = self.state.lock();
        for info in &spec.sources {
            state.merging.remove(&info.generation);
        }
        if self.storage.file_exists(&segment_file_name(spec.output_generation))
            && state.segment_position(spec.output_generation).is_none()
        {
            drop(state);
            self.deleter.delete_now(spec.output_generation);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::TieredMergePolicy;
    use crate::storage::MemoryStorage;
    use crossbeam_channel::{Receiver, Sender, unbounded};

    fn record(id: &str, body: &str) -> Record {
        Record::builder(id).add_text("body", body).build()
    }

    fn config(max_buffered_records: usize) -> WriterConfig {
        WriterConfig {
            max_buffered_records,
            merge_policy: MergePolicyConfig::None,
            warm_on_merge: false,
            ..WriterConfig::default()
        }
    }

    fn open(config: WriterConfig) -> (Arc<MemoryStorage>, MutableWriter) {
        let storage = Arc::new(MemoryStorage::new());
        let writer = MutableWriter::open(storage.clone(), config).unwrap();
        (storage, writer)
    }

    #[test]
    fn test_flush_publishes_segment_and_bumps_version() {
        let (storage, writer) = open(config(100));
        writer.submit(record("1", "alpha")).unwrap();
        writer.submit(record("2", "beta")).unwrap();
        assert_eq!(writer.committed_version(), 0);
        assert_eq!(writer.max_doc(), 2);

        let info = writer.flush().unwrap().unwrap();
        assert_eq!(info.doc_count, 2);
        assert_eq!(writer.committed_version(), 1);
        assert!(storage.file_exists(&info.file_name()));
        assert_eq!(writer.segment_infos(), vec![info]);

        // Nothing buffered: no new segment, no new version.
        assert!(writer.flush().unwrap().is_none());
        assert_eq!(writer.committed_version(), 1);
    }

    #[test]
    fn test_auto_flush_at_record_limit() {
        let (_storage, writer) = open(config(3));
        for i in 0..7 {
            writer.submit(record(&i.to_string(), "x")).unwrap();
        }
        let stats = writer.stats();
        assert_eq!(stats.flushes, 2);
        assert_eq!(stats.buffered_records, 1);
        assert_eq!(stats.segment_count, 2);
    }

    #[test]
    fn test_update_replaces_previous_version() {
        let (_storage, writer) = open(config(100));
        writer.submit(record("a", "one")).unwrap();
        writer.flush().unwrap();

        writer.update(record("a", "two")).unwrap();
        assert_eq!(writer.max_doc(), 2);
        assert_eq!(writer.num_docs(), 1);

        writer.flush().unwrap();
        let commit = writer.capture_commit();
        let live: u32 = commit.segments.iter().map(|(_, live)| live.live_count()).sum();
        assert_eq!(live, 1);
        assert_eq!(commit.max_doc(), 2);
        writer.file_deleter().dec_ref(commit.generations());
    }

    #[test]
    fn test_delete_in_buffer_and_in_segment() {
        let (_storage, writer) = open(config(100));
        writer.submit(record("a", "x")).unwrap();
        writer.flush().unwrap();
        writer.submit(record("b", "y")).unwrap();

        assert!(writer.delete("a").unwrap());
        assert!(writer.delete("b").unwrap());
        assert!(!writer.delete("missing").unwrap());
        assert_eq!(writer.num_docs(), 0);
        assert_eq!(writer.stats().pending_deletes, 1);

        writer.flush().unwrap();
        let commit = writer.capture_commit();
        assert!(commit.segments.iter().all(|(_, live)| live.live_count() == 0));
        writer.file_deleter().dec_ref(commit.generations());
    }

    #[test]
    fn test_pending_deletes_without_records_still_publish() {
        let (_storage, writer) = open(config(100));
        writer.submit(record("a", "x")).unwrap();
        writer.flush().unwrap();
        let version = writer.committed_version();

        writer.delete("a").unwrap();
        assert!(writer.flush().unwrap().is_none());
        assert_eq!(writer.committed_version(), version + 1);
    }

    #[test]
    fn test_commit_point_keeps_files_alive() {
        let mut config = config(1);
        config.merge_policy = MergePolicyConfig::Tiered(TieredMergePolicy::new(2, 100).unwrap());
        config.compactor.max_concurrent_merges = 1;
        let (storage, writer) = open(config);

        writer.submit(record("1", "x")).unwrap();
        let commit = writer.capture_commit();
        writer.submit(record("2", "x")).unwrap();
        for result in writer.wait_for_merges() {
            result.unwrap();
        }

        // seg_1 was merged away but the commit point still references it.
        assert_eq!(writer.segment_infos().len(), 1);
        assert!(storage.file_exists("seg_1.nrt"));
        writer.file_deleter().dec_ref(commit.generations());
        assert!(!storage.file_exists("seg_1.nrt"));
    }

    /// Signals when warming starts, then blocks until released.
    #[derive(Debug)]
    struct GateWarmer {
        entered: Sender<()>,
        release: Receiver<()>,
    }

    impl Warmer for GateWarmer {
        fn warm(&self, _reader: &SegmentReader) -> Result<()> {
            let _ = self.entered.send(());
            let _ = self.release.recv();
            Ok(())
        }
    }

    #[test]
    fn test_merge_carries_over_concurrent_deletes() {
        let mut config = config(100);
        config.merge_policy = MergePolicyConfig::Tiered(TieredMergePolicy::new(2, 100).unwrap());
        config.compactor.max_concurrent_merges = 1;
        let (entered_tx, entered_rx) = unbounded();
        let (release_tx, release_rx) = unbounded();
        let warmer = GateWarmer {
            entered: entered_tx,
            release: release_rx,
        };
        let storage = Arc::new(MemoryStorage::new());
        let writer =
            MutableWriter::open_with_warmer(storage.clone(), config, Some(Arc::new(warmer))).unwrap();

        writer.submit(record("a", "x")).unwrap();
        writer.submit(record("b", "x")).unwrap();
        writer.flush().unwrap();
        writer.submit(record("c", "x")).unwrap();
        writer.submit(record("d", "x")).unwrap();
        writer.flush().unwrap();

        // The merge has written its output and is parked in the warmer.
        entered_rx.recv().unwrap();
        writer.delete("a").unwrap();
        writer.flush().unwrap();
        release_tx.send(()).unwrap();

        let outcomes: Vec<MergeOutcome> =
            writer.wait_for_merges().into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].copied_docs, 4);
        assert_eq!(outcomes[0].carried_deletes, 1);
        assert!(outcomes[0].warmed);
        assert!(!storage.file_exists("seg_1.nrt"));
        assert!(!storage.file_exists("seg_2.nrt"));

        let commit = writer.capture_commit();
        assert_eq!(commit.segments.len(), 1);
        assert_eq!(commit.segments[0].1.live_count(), 3);
        writer.file_deleter().dec_ref(commit.generations());

        // The moved record is still found by id.
        writer.update(record("b", "y")).unwrap();
        writer.flush().unwrap();
        assert_eq!(writer.num_docs(), 3);
        let commit = writer.capture_commit();
        let live: u32 = commit.segments.iter().map(|(_, live)| live.live_count()).sum();
        assert_eq!(live, 3);
        writer.file_deleter().dec_ref(commit.generations());
    }

    #[test]
    fn test_byte_ceiling_flushes_when_uncontended() {
        let mut config = config(1000);
        config.max_buffered_bytes = 64;
        let (_storage, writer) = open(config);
        let body = "word ".repeat(8);
        for i in 0..4 {
            writer.submit(record(&i.to_string(), &body)).unwrap();
        }
        assert!(writer.stats().flushes >= 3);
        assert_eq!(writer.stats().rejected, 0);
    }

    #[test]
    fn test_close_flushes_and_rejects_further_calls() {
        let (storage, writer) = open(config(100));
        writer.submit(record("1", "x")).unwrap();
        writer.close().unwrap();

        assert!(storage.file_exists("seg_1.nrt"));
        assert!(matches!(writer.close(), Err(NrtError::AlreadyClosed(_))));
        assert!(matches!(
            writer.submit(record("2", "x")),
            Err(NrtError::AlreadyClosed(_))
        ));
        assert!(matches!(writer.flush(), Err(NrtError::AlreadyClosed(_))));
    }

    #[test]
    fn test_reopen_picks_up_existing_segments() {
        let (storage, writer) = open(config(100));
        writer.submit(record("1", "x")).unwrap();
        writer.submit(record("2", "x")).unwrap();
        writer.close().unwrap();

        let reopened = MutableWriter::open(storage.clone(), config(100)).unwrap();
        assert_eq!(reopened.max_doc(), 2);
        assert_eq!(reopened.num_docs(), 2);
        reopened.update(record("1", "y")).unwrap();
        let info = reopened.flush().unwrap().unwrap();
        assert_eq!(info.generation, 2);
        assert_eq!(reopened.num_docs(), 2);
    }
}
