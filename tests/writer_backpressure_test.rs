//! Integration tests for merge admission backpressure and failure handling.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;

use nrtbench::document::Record;
use nrtbench::error::{NrtError, Result};
use nrtbench::merge::{CompactorConfig, MergePolicyConfig, TieredMergePolicy, Warmer};
use nrtbench::segment::SegmentReader;
use nrtbench::snapshot::{SnapshotManager, SnapshotManagerConfig};
use nrtbench::storage::{MemoryStorage, Storage, StorageInput, StorageOutput};
use nrtbench::writer::{MutableWriter, WriterConfig};

fn record(id: u64) -> Record {
    Record::builder(id.to_string())
        .add_text("body", "united states")
        .build()
}

fn merging_config(max_buffered_records: usize) -> WriterConfig {
    WriterConfig {
        max_buffered_records,
        merge_policy: MergePolicyConfig::Tiered(TieredMergePolicy::new(2, 100).unwrap()),
        compactor: CompactorConfig {
            max_concurrent_merges: 1,
            max_queued_merges: 1,
            max_merge_retries: 1,
        },
        ..WriterConfig::default()
    }
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
fn test_flush_blocks_when_merge_queue_is_full() -> Result<()> {
    let (entered_tx, entered_rx) = unbounded();
    let (release_tx, release_rx) = unbounded();
    let warmer = GateWarmer {
        entered: entered_tx,
        release: release_rx,
    };
    let writer = MutableWriter::open_with_warmer(
        Arc::new(MemoryStorage::new()),
        merging_config(1),
        Some(Arc::new(warmer)),
    )?;

    // seg_1 + seg_2 start merging and park in the warmer.
    writer.submit(record(1))?;
    writer.submit(record(2))?;
    entered_rx.recv().unwrap();

    // The next merge fills the queue and the one after it has to wait.
    let done = Arc::new(AtomicBool::new(false));
    let producer = {
        let writer = writer.clone();
        let done = Arc::clone(&done);
        thread::spawn(move || {
            for id in 3..7 {
                writer.submit(record(id)).unwrap();
            }
            done.store(true, Ordering::SeqCst);
        })
    };

    thread::sleep(Duration::from_millis(200));
    assert!(!done.load(Ordering::SeqCst));
    assert_eq!(writer.stats().compactor.admission_stalls, 1);
    assert_eq!(writer.stats().compactor.queued, 1);

    for _ in 0..10 {
        release_tx.send(()).unwrap();
    }
    producer.join().unwrap();
    assert!(done.load(Ordering::SeqCst));
    for result in writer.wait_for_merges() {
        result?;
    }
    assert_eq!(writer.num_docs(), 6);
    writer.close()
}

#[test]
fn test_update_mode_counts() -> Result<()> {
    let writer = MutableWriter::open(Arc::new(MemoryStorage::new()), merging_config(3))?;
    let manager = SnapshotManager::open(writer.clone(), SnapshotManagerConfig::default())?;

    for round in 0..4 {
        for id in 0..5 {
            writer.update(
                Record::builder(id.to_string())
                    .add_text("body", format!("round{round}"))
                    .build(),
            )?;
        }
    }
    assert_eq!(writer.max_doc(), 20);
    assert_eq!(writer.num_docs(), 5);

    for result in writer.wait_for_merges() {
        result?;
    }
    manager.maybe_refresh()?;
    let snapshot = manager.acquire()?;
    assert_eq!(snapshot.num_docs(), 5);
    assert_eq!(snapshot.doc_freq("round3"), 5);
    assert_eq!(snapshot.doc_freq("round0"), 0);
    for id in 0..5 {
        assert_eq!(snapshot.find(&id.to_string()).len(), 1);
    }
    Ok(())
}

/// Memory storage that can refuse reads, or the creation of one file.
#[derive(Debug, Default)]
struct FaultyStorage {
    inner: MemoryStorage,
    fail_reads: AtomicBool,
    fail_create: Mutex<Option<String>>,
}

impl Storage for FaultyStorage {
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(NrtError::storage(format!("injected read failure: {name}")));
        }
        self.inner.open_input(name)
    }

    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        if self.fail_create.lock().as_deref() == Some(name) {
            return Err(NrtError::storage(format!("injected write failure: {name}")));
        }
        self.inner.create_output(name)
    }

    fn file_exists(&self, name: &str) -> bool {
        self.inner.file_exists(name)
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        self.inner.delete_file(name)
    }

    fn list_files(&self) -> Result<Vec<String>> {
        self.inner.list_files()
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        self.inner.file_size(name)
    }

    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()> {
        self.inner.rename_file(old_name, new_name)
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }

    fn close(&self) -> Result<()> {
        self.inner.close()
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

#[test]
fn test_unreadable_storage_keeps_current_snapshot() -> Result<()> {
    let storage = Arc::new(FaultyStorage::default());
    let writer = MutableWriter::open(
        storage.clone(),
        WriterConfig {
            merge_policy: MergePolicyConfig::None,
            warm_on_merge: false,
            ..WriterConfig::default()
        },
    )?;
    let manager = SnapshotManager::open(writer.clone(), SnapshotManagerConfig::default())?;

    writer.submit(record(1))?;
    manager.maybe_refresh()?;
    let version = manager.current_version();

    writer.submit(record(2))?;
    storage.fail_reads.store(true, Ordering::SeqCst);
    assert!(matches!(
        manager.maybe_refresh(),
        Err(NrtError::SnapshotUnavailable(_))
    ));
    assert_eq!(manager.current_version(), version);
    assert_eq!(manager.acquire()?.num_docs(), 1);
    assert_eq!(manager.stats().failures, 1);

    storage.fail_reads.store(false, Ordering::SeqCst);
    assert!(manager.maybe_refresh()?);
    assert_eq!(manager.acquire()?.num_docs(), 2);

    // The failed attempt released the file references it took.
    manager.close()?;
    for info in writer.segment_infos() {
        assert_eq!(writer.file_deleter().ref_count(info.generation), 1);
    }
    Ok(())
}

#[test]
fn test_failed_merge_leaves_sources_committed() -> Result<()> {
    let storage = Arc::new(FaultyStorage::default());
    *storage.fail_create.lock() = Some("seg_4.nrt.tmp".to_string());
    let mut config = merging_config(2);
    config.warm_on_merge = false;
    let writer = MutableWriter::open(storage.clone(), config)?;

    for id in 0..4 {
        writer.submit(record(id))?;
    }
    let results = writer.wait_for_merges();
    assert_eq!(results.len(), 1);
    assert!(matches!(results[0], Err(NrtError::MergeFailed(_))));

    let generations: Vec<u64> = writer.segment_infos().iter().map(|i| i.generation).collect();
    assert_eq!(generations, [1, 2]);
    assert!(storage.file_exists("seg_1.nrt"));
    assert!(storage.file_exists("seg_2.nrt"));
    assert!(!storage.file_exists("seg_4.nrt"));
    assert_eq!(writer.stats().compactor.failed, 1);
    assert_eq!(writer.stats().compactor.retries, 1);
    assert_eq!(writer.num_docs(), 4);
    writer.close()
}

#[test]
fn test_write_outage_during_refresh_is_recoverable() -> Result<()> {
    let storage = Arc::new(FaultyStorage::default());
    let writer = MutableWriter::open(
        storage.clone(),
        WriterConfig {
            merge_policy: MergePolicyConfig::None,
            warm_on_merge: false,
            ..WriterConfig::default()
        },
    )?;
    let manager = SnapshotManager::open(writer.clone(), SnapshotManagerConfig::default())?;

    writer.submit(record(1))?;
    assert!(manager.maybe_refresh()?);
    let version = manager.current_version();

    writer.submit(record(2))?;
    *storage.fail_create.lock() = Some("seg_2.nrt.tmp".to_string());
    assert!(matches!(
        manager.maybe_refresh(),
        Err(NrtError::SnapshotUnavailable(_))
    ));
    assert_eq!(manager.current_version(), version);
    assert_eq!(manager.acquire()?.num_docs(), 1);
    assert_eq!(writer.stats().parked_records, 1);
    assert!(!storage.file_exists("seg_2.nrt.tmp"));

    // The writer keeps accepting records while storage is down.
    writer.submit(record(3))?;
    assert_eq!(writer.num_docs(), 3);

    *storage.fail_create.lock() = None;
    assert!(manager.maybe_refresh()?);
    let snapshot = manager.acquire()?;
    assert_eq!(snapshot.num_docs(), 3);
    for id in 1..=3 {
        assert_eq!(snapshot.find(&id.to_string()).len(), 1);
    }
    drop(snapshot);

    let generations: Vec<u64> = writer.segment_infos().iter().map(|i| i.generation).collect();
    assert_eq!(generations, [1, 2, 3]);
    assert_eq!(writer.stats().parked_records, 0);

    manager.close()?;
    writer.close()
}

#[test]
fn test_segment_that_does_not_read_back_is_fatal() -> Result<()> {
    let storage = Arc::new(FaultyStorage::default());
    let writer = MutableWriter::open(
        storage.clone(),
        WriterConfig {
            merge_policy: MergePolicyConfig::None,
            warm_on_merge: false,
            verify_flush: true,
            ..WriterConfig::default()
        },
    )?;

    writer.submit(record(1))?;
    storage.fail_reads.store(true, Ordering::SeqCst);
    assert!(matches!(writer.flush(), Err(NrtError::Corruption(_))));
    assert!(!storage.file_exists("seg_1.nrt"));

    storage.fail_reads.store(false, Ordering::SeqCst);
    assert!(matches!(writer.submit(record(2)), Err(NrtError::Corruption(_))));
    assert!(matches!(writer.flush(), Err(NrtError::Corruption(_))));
    Ok(())
}
