//! Integration tests for snapshot reference counting and reclamation.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use nrtbench::document::Record;
use nrtbench::error::{NrtError, Result};
use nrtbench::merge::{MergePolicyConfig, TieredMergePolicy};
use nrtbench::snapshot::{SnapshotManager, SnapshotManagerConfig, SnapshotState};
use nrtbench::storage::{MemoryStorage, Storage};
use nrtbench::writer::{MutableWriter, WriterConfig};

fn record(id: u64, body: &str) -> Record {
    Record::builder(id.to_string()).add_text("body", body).build()
}

fn segment_files(storage: &dyn Storage) -> usize {
    storage
        .list_files()
        .unwrap()
        .iter()
        .filter(|name| name.starts_with("seg_") && name.ends_with(".nrt"))
        .count()
}

#[test]
fn test_readers_never_see_reclaimed_snapshots() -> Result<()> {
    let storage = Arc::new(MemoryStorage::new());
    let config = WriterConfig {
        max_buffered_records: 5,
        merge_policy: MergePolicyConfig::Tiered(TieredMergePolicy::new(2, 100)?),
        warm_on_merge: false,
        ..WriterConfig::default()
    };
    let writer = MutableWriter::open(storage.clone(), config)?;
    let manager = Arc::new(SnapshotManager::open(
        writer.clone(),
        SnapshotManagerConfig::default(),
    )?);
    let stop = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let manager = Arc::clone(&manager);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut last_generation = 0;
                let mut acquired = 0u64;
                while !stop.load(Ordering::SeqCst) {
                    let snapshot = manager.acquire().unwrap();
                    assert!(matches!(
                        snapshot.state(),
                        SnapshotState::Live | SnapshotState::Retiring
                    ));
                    assert!(snapshot.ref_count() >= 1);
                    assert!(snapshot.generation() >= last_generation);
                    assert!(snapshot.num_docs() <= snapshot.max_doc());
                    let stored: usize = snapshot
                        .segments()
                        .iter()
                        .map(|segment| segment.reader().records().len())
                        .sum();
                    assert_eq!(stored as u64, snapshot.max_doc());
                    last_generation = snapshot.generation();
                    acquired += 1;
                }
                acquired
            })
        })
        .collect();

    let refresher = {
        let manager = Arc::clone(&manager);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                manager.maybe_refresh().unwrap();
                thread::sleep(Duration::from_millis(1));
            }
        })
    };

    for i in 0..1_000 {
        writer.submit(record(i, "united states of america"))?;
    }
    for result in writer.wait_for_merges() {
        result?;
    }
    thread::sleep(Duration::from_millis(20));
    stop.store(true, Ordering::SeqCst);
    refresher.join().unwrap();
    for reader in readers {
        assert!(reader.join().unwrap() > 0);
    }

    manager.maybe_refresh()?;
    {
        let snapshot = manager.acquire()?;
        assert_eq!(snapshot.num_docs(), 1_000);
        assert_eq!(snapshot.doc_freq("united"), 1_000);
    }

    manager.close()?;
    assert_eq!(manager.outstanding_refs(), 0);
    writer.close()?;
    assert_eq!(segment_files(storage.as_ref()), writer.segment_infos().len());
    Ok(())
}

#[test]
fn test_flushed_records_are_visible_after_refresh() -> Result<()> {
    let writer = MutableWriter::open(
        Arc::new(MemoryStorage::new()),
        WriterConfig {
            merge_policy: MergePolicyConfig::None,
            warm_on_merge: false,
            ..WriterConfig::default()
        },
    )?;
    let manager = SnapshotManager::open(
        writer.clone(),
        SnapshotManagerConfig {
            flush_on_refresh: false,
        },
    )?;

    writer.submit(record(1, "alpha"))?;
    assert!(!manager.maybe_refresh()?);
    assert!(manager.acquire()?.find("1").is_empty());

    writer.flush()?;
    assert!(manager.maybe_refresh()?);
    assert!(!manager.maybe_refresh()?);
    let snapshot = manager.acquire()?;
    assert_eq!(snapshot.find("1").len(), 1);
    assert_eq!(snapshot.generation(), 1);
    assert_eq!(manager.stats().unchanged, 2);
    Ok(())
}

#[test]
fn test_old_snapshot_is_reclaimed_on_last_release() -> Result<()> {
    let writer = MutableWriter::open(
        Arc::new(MemoryStorage::new()),
        WriterConfig {
            merge_policy: MergePolicyConfig::None,
            warm_on_merge: false,
            ..WriterConfig::default()
        },
    )?;
    let manager = SnapshotManager::open(writer.clone(), SnapshotManagerConfig::default())?;

    writer.submit(record(1, "alpha"))?;
    manager.maybe_refresh()?;
    let first = manager.acquire()?;
    let second = manager.acquire()?;
    assert_eq!(first.ref_count(), 3);

    writer.submit(record(2, "beta"))?;
    manager.maybe_refresh()?;
    assert_eq!(first.state(), SnapshotState::Retiring);
    assert_eq!(first.ref_count(), 2);

    let observer = manager.acquire()?;
    assert_eq!(observer.state(), SnapshotState::Live);
    assert_eq!(observer.num_docs(), 2);

    manager.release(second);
    assert_eq!(first.state(), SnapshotState::Retiring);
    assert_eq!(first.num_docs(), 1);
    drop(first);
    assert_eq!(manager.outstanding_refs(), 1);
    drop(observer);
    assert_eq!(manager.outstanding_refs(), 0);
    Ok(())
}

#[test]
fn test_close_waits_for_readers() -> Result<()> {
    let writer = MutableWriter::open(Arc::new(MemoryStorage::new()), WriterConfig::default())?;
    let manager = Arc::new(SnapshotManager::open(writer, SnapshotManagerConfig::default())?);

    let held = manager.acquire()?;
    let releaser = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        drop(held);
    });

    manager.close_timeout(Duration::from_secs(5))?;
    assert_eq!(manager.outstanding_refs(), 0);
    releaser.join().unwrap();
    assert!(matches!(manager.acquire(), Err(NrtError::AlreadyClosed(_))));
    manager.close()?;
    Ok(())
}

#[test]
fn test_close_times_out_while_a_reader_holds_on() -> Result<()> {
    let writer = MutableWriter::open(Arc::new(MemoryStorage::new()), WriterConfig::default())?;
    let manager = SnapshotManager::open(writer, SnapshotManagerConfig::default())?;

    let held = manager.acquire()?;
    assert!(matches!(
        manager.close_timeout(Duration::from_millis(20)),
        Err(NrtError::Timeout(_))
    ));
    assert!(manager.is_closed());
    drop(held);
    assert_eq!(manager.outstanding_refs(), 0);
    Ok(())
}
