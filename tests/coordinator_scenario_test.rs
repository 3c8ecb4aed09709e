//! End-to-end runs of the coordinator.

use std::fs;
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use tempfile::TempDir;

use nrtbench::config::CoordinatorConfig;
use nrtbench::coordinator::{Collaborators, Coordinator};
use nrtbench::document::{GeneratedSource, GeneratedSourceConfig, LineFileSource};
use nrtbench::error::{NrtError, Result};
use nrtbench::ingest::IngestMode;
use nrtbench::snapshot::SnapshotManager;
use nrtbench::storage::{FileStorageConfig, MemoryStorage, Storage, StorageConfig, StorageFactory};
use nrtbench::task::{TaskLog, TaskScheduler};

const TASKS: &str = "\
# exercised by every scenario
Term: united
Term: states
AndHighHigh: +united +states
Prefix: stat*
Fuzzy1: unitde~1
Respell: staets
";

fn write_line_docs(dir: &TempDir, lines: usize) -> std::path::PathBuf {
    let path = dir.path().join("docs.txt");
    let mut file = fs::File::create(&path).unwrap();
    for i in 0..lines {
        writeln!(file, "title {i}\t2024-01-01\tunited states record number {i}").unwrap();
    }
    path
}

fn run_update_scenario(use_mmap: bool) -> Result<()> {
    let docs_dir = TempDir::new().unwrap();
    let index_dir = TempDir::new().unwrap();
    let docs = write_line_docs(&docs_dir, 200);

    let mut storage = FileStorageConfig::new(index_dir.path());
    storage.use_mmap = use_mmap;
    let config = CoordinatorConfig {
        ingestion_thread_count: 4,
        mode: IngestMode::Update,
        max_records: Some(1_000),
        max_buffered_records: 64,
        refresh_interval_secs: 0.02,
        task_worker_count: 2,
        storage: StorageConfig::File(storage),
        ..CoordinatorConfig::default()
    };

    let coordinator = Coordinator::start(
        config,
        Collaborators {
            storage: None,
            source: Box::new(LineFileSource::open(&docs, true)?),
            task_log: TaskLog::parse(TASKS)?,
        },
    )?;
    coordinator.wait(Duration::from_secs(20), Duration::from_secs(1));
    assert!(coordinator.ingestion_finished());
    thread::sleep(Duration::from_millis(200));
    let report = coordinator.stop()?;

    assert_eq!(report.ingest.submitted, 1_000);
    assert_eq!(report.writer.max_doc, 1_000);
    assert_eq!(report.writer.num_docs, 200);
    assert_eq!(report.snapshots.outstanding_refs, 0);
    assert_eq!(report.tasks.len(), 5);
    for category in &report.tasks {
        assert!(category.count > 0, "{} never ran", category.category);
        assert_eq!(category.failures, 0);
    }

    // Whatever reached storage can be served without a writer.
    let storage = StorageFactory::create(&StorageConfig::File(FileStorageConfig::new(
        index_dir.path(),
    )))?;
    let fixed = SnapshotManager::fixed(storage)?;
    let snapshot = fixed.acquire()?;
    assert!(snapshot.num_docs() >= 200);
    assert!(!snapshot.find("0").is_empty());
    assert!(!snapshot.find("199").is_empty());
    Ok(())
}

#[test]
fn test_update_scenario_on_file_storage() -> Result<()> {
    run_update_scenario(false)
}

#[test]
fn test_update_scenario_on_mmap_storage() -> Result<()> {
    run_update_scenario(true)
}

#[test]
fn test_paced_ingestion_scenario() -> Result<()> {
    // Three actors at ten records a second for two seconds: about sixty
    // records, visible in snapshots that never shrink.
    let config = CoordinatorConfig {
        ingestion_thread_count: 3,
        records_per_second_per_thread: 10.0,
        refresh_interval_secs: 0.5,
        task_worker_count: 1,
        random_seed: 0,
        ..CoordinatorConfig::default()
    };
    let coordinator = Coordinator::start(
        config,
        Collaborators {
            storage: None,
            source: Box::new(GeneratedSource::new(GeneratedSourceConfig::default())?),
            task_log: TaskLog::parse(TASKS)?,
        },
    )?;

    let snapshots = Arc::clone(coordinator.snapshots());
    let done = Arc::new(AtomicBool::new(false));
    let reader = {
        let done = Arc::clone(&done);
        thread::spawn(move || -> Result<Vec<u64>> {
            let mut seen = Vec::new();
            while !done.load(Ordering::SeqCst) {
                seen.push(snapshots.acquire()?.num_docs());
                thread::sleep(Duration::from_millis(10));
            }
            Ok(seen)
        })
    };

    thread::sleep(Duration::from_secs(2));
    let max_doc = coordinator.writer().max_doc();
    done.store(true, Ordering::SeqCst);
    let seen = reader.join().unwrap()?;
    let report = coordinator.stop()?;

    assert!((40..=75).contains(&max_doc), "max_doc={max_doc}");
    assert!(seen.windows(2).all(|pair| pair[0] <= pair[1]), "{seen:?}");
    assert!(seen.last().copied().unwrap_or(0) > 0);
    assert!(report.refresh.reopens >= 2);
    assert_eq!(report.snapshots.outstanding_refs, 0);
    Ok(())
}

#[test]
fn test_stop_releases_everything() -> Result<()> {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let config = CoordinatorConfig {
        ingestion_thread_count: 2,
        records_per_second_per_thread: 2_000.0,
        refresh_interval_secs: 0.01,
        task_worker_count: 3,
        ..CoordinatorConfig::default()
    };
    let coordinator = Coordinator::start(
        config,
        Collaborators {
            storage: Some(Arc::clone(&storage)),
            source: Box::new(GeneratedSource::new(GeneratedSourceConfig::default())?),
            task_log: TaskLog::parse(TASKS)?,
        },
    )?;
    thread::sleep(Duration::from_millis(300));
    assert!(!coordinator.ingestion_finished());

    let report = coordinator.stop()?;
    assert!(report.ingest.submitted > 0);
    assert_eq!(report.writer.max_doc, report.ingest.submitted);
    assert_eq!(report.snapshots.outstanding_refs, 0);
    assert!(report.refresh.reopens > 0);

    assert!(storage.is_closed());
    assert!(matches!(
        coordinator.snapshots().acquire(),
        Err(NrtError::AlreadyClosed(_))
    ));
    assert!(matches!(
        coordinator.writer().submit(nrtbench::document::Record::builder("x").build()),
        Err(NrtError::AlreadyClosed(_))
    ));
    let again = coordinator.stop()?;
    assert_eq!(again.run_id, report.run_id);
    Ok(())
}

#[test]
fn test_task_order_is_reproducible() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("tasks.txt");
    fs::write(&path, TASKS).unwrap();

    let log = TaskLog::load(&path)?;
    let first = TaskScheduler::new(&log, 1234, 5)?;
    let second = TaskScheduler::new(&log, 1234, 5)?;
    for category in first.categories() {
        for _ in 0..20 {
            assert_eq!(
                first.next_task(category)?.text(),
                second.next_task(category)?.text()
            );
        }
    }
    Ok(())
}
