//! Configuration of a coordinator run.
//!
//! A [`CoordinatorConfig`] is a flat set of knobs, loadable from JSON with
//! every field optional. The per-component configurations are derived from
//! it so that one file describes a whole run.
//!
//! ```
//! use nrtbench::config::CoordinatorConfig;
//!
//! let config = CoordinatorConfig::from_json(r#"{"ingestion_thread_count": 4}"#).unwrap();
//! assert_eq!(config.ingestion_thread_count, 4);
//! assert_eq!(config.tasks_per_category, 5);
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{NrtError, Result};
use crate::ingest::{IngestConfig, IngestMode};
use crate::merge::{CompactorConfig, MergePolicyConfig, TermLookupWarmer};
use crate::snapshot::SnapshotManagerConfig;
use crate::storage::StorageConfig;
use crate::task::TaskWorkerConfig;
use crate::task::scheduler::DEFAULT_TASKS_PER_CATEGORY;
use crate::writer::WriterConfig;

/// Configuration of a coordinator run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Ingestion threads.
    pub ingestion_thread_count: usize,

    /// Target records per second of each ingestion thread. Zero means
    /// unthrottled.
    pub records_per_second_per_thread: f64,

    /// Add or update records.
    pub mode: IngestMode,

    /// Stop ingesting after this many records.
    pub max_records: Option<u64>,

    /// Seconds between snapshot refreshes.
    pub refresh_interval_secs: f64,

    /// Flush the writer before every refresh.
    pub flush_on_refresh: bool,

    /// Buffered records that trigger a flush.
    pub max_buffered_records: usize,

    /// Buffered bytes above which submissions are rejected.
    pub max_buffered_bytes: usize,

    /// Re-read flushed segments before publishing them.
    pub verify_flush: bool,

    /// Merges running at once.
    pub max_concurrent_merges: usize,

    /// Merges waiting before the flushing thread blocks.
    pub max_queued_merges: usize,

    /// Extra attempts after a failed merge.
    pub max_merge_retries: u32,

    /// Which segments get merged.
    pub merge_policy: MergePolicyConfig,

    /// Warm merged segments before committing them.
    pub warm_on_merge: bool,

    /// Term looked up when warming.
    pub warm_term: String,

    /// Task worker threads.
    pub task_worker_count: usize,

    /// Target tasks per second of each worker. Zero means as fast as
    /// possible.
    pub tasks_per_second_per_worker: f64,

    /// Categories to run. Empty runs every category of the task log.
    pub task_categories: Vec<String>,

    /// Tasks kept per category.
    pub tasks_per_category: usize,

    /// Hits kept per query.
    pub top_n: usize,

    /// Seed of the per-category task order.
    pub random_seed: u64,

    /// Seconds to wait for readers to give back their snapshots on stop.
    pub shutdown_timeout_secs: f64,

    /// Storage backend.
    pub storage: StorageConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        let writer = WriterConfig::default();
        let compactor = CompactorConfig::default();
        CoordinatorConfig {
            ingestion_thread_count: 1,
            records_per_second_per_thread: 0.0,
            mode: IngestMode::Add,
            max_records: None,
            refresh_interval_secs: 1.0,
            flush_on_refresh: true,
            max_buffered_records: writer.max_buffered_records,
            max_buffered_bytes: writer.max_buffered_bytes,
            verify_flush: writer.verify_flush,
            max_concurrent_merges: compactor.max_concurrent_merges,
            max_queued_merges: compactor.max_queued_merges,
            max_merge_retries: compactor.max_merge_retries,
            merge_policy: MergePolicyConfig::default(),
            warm_on_merge: true,
            warm_term: TermLookupWarmer::DEFAULT_TERM.to_string(),
            task_worker_count: num_cpus::get().clamp(1, 4),
            tasks_per_second_per_worker: 0.0,
            task_categories: Vec::new(),
            tasks_per_category: DEFAULT_TASKS_PER_CATEGORY,
            top_n: 10,
            random_seed: 17,
            shutdown_timeout_secs: 30.0,
            storage: StorageConfig::Memory,
        }
    }
}

/// Longest accepted span of time, one year.
const MAX_SECS: f64 = 365.0 * 24.0 * 3600.0;

/// Convert a positive number of seconds of at most a year to a duration.
pub fn positive_secs(name: &str, secs: f64) -> Result<Duration> {
    if secs.is_nan() || secs <= 0.0 || secs > MAX_SECS {
        return Err(NrtError::invalid_config(format!(
            "{name} must be a positive number of seconds of at most {MAX_SECS}"
        )));
    }
    Duration::try_from_secs_f64(secs).map_err(|e| NrtError::invalid_config(format!("{name}: {e}")))
}

/// Clamp to what [`positive_secs`] accepts, for values that skipped validation.
fn clamped_secs(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs.clamp(0.0, MAX_SECS)).unwrap_or_default()
}

impl CoordinatorConfig {
    /// Parse a JSON document. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: CoordinatorConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|e| {
            NrtError::invalid_config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json(&json)
    }

    /// Check the configuration, including every derived configuration.
    pub fn validate(&self) -> Result<()> {
        positive_secs("refresh_interval_secs", self.refresh_interval_secs)?;
        positive_secs("shutdown_timeout_secs", self.shutdown_timeout_secs)?;
        if self.task_worker_count == 0 {
            return Err(NrtError::invalid_config("task_worker_count must be positive"));
        }
        if self.tasks_per_category == 0 {
            return Err(NrtError::invalid_config("tasks_per_category must be positive"));
        }
        if self.top_n == 0 {
            return Err(NrtError::invalid_config("top_n must be positive"));
        }
        if !self.tasks_per_second_per_worker.is_finite() || self.tasks_per_second_per_worker < 0.0 {
            return Err(NrtError::invalid_config(
                "tasks_per_second_per_worker must be a non-negative number",
            ));
        }
        self.ingest_config().validate()?;
        self.writer_config().validate()
    }

    /// Time between refreshes.
    pub fn refresh_interval(&self) -> Duration {
        clamped_secs(self.refresh_interval_secs)
    }

    /// Time allowed for readers to drain on stop.
    pub fn shutdown_timeout(&self) -> Duration {
        clamped_secs(self.shutdown_timeout_secs)
    }

    /// Writer part of the configuration.
    pub fn writer_config(&self) -> WriterConfig {
        WriterConfig {
            max_buffered_records: self.max_buffered_records,
            max_buffered_bytes: self.max_buffered_bytes,
            verify_flush: self.verify_flush,
            warm_on_merge: self.warm_on_merge,
            warm_term: self.warm_term.clone(),
            merge_policy: self.merge_policy.clone(),
            compactor: CompactorConfig {
                max_concurrent_merges: self.max_concurrent_merges,
                max_queued_merges: self.max_queued_merges,
                max_merge_retries: self.max_merge_retries,
            },
        }
    }

    /// Ingestion part of the configuration.
    pub fn ingest_config(&self) -> IngestConfig {
        IngestConfig {
            thread_count: self.ingestion_thread_count,
            records_per_second_per_thread: self.records_per_second_per_thread,
            mode: self.mode,
            max_records: self.max_records,
            ..IngestConfig::default()
        }
    }

    /// Snapshot manager part of the configuration.
    pub fn snapshot_config(&self) -> SnapshotManagerConfig {
        SnapshotManagerConfig {
            flush_on_refresh: self.flush_on_refresh,
        }
    }

    /// Task worker part of the configuration.
    pub fn worker_config(&self) -> TaskWorkerConfig {
        TaskWorkerConfig {
            worker_count: self.task_worker_count,
            categories: self.task_categories.clone(),
            top_n: self.top_n,
            tasks_per_second_per_worker: self.tasks_per_second_per_worker,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_is_valid() {
        let config = CoordinatorConfig::default();
        config.validate().unwrap();
        assert_eq!(config.refresh_interval(), Duration::from_secs(1));
        assert!(config.flush_on_refresh);
        assert_eq!(config.writer_config().compactor.max_queued_merges, 4);
    }

    #[test]
    fn test_partial_json() {
        let config = CoordinatorConfig::from_json(
            r#"{
                "ingestion_thread_count": 3,
                "mode": "update",
                "refresh_interval_secs": 0.25,
                "merge_policy": {"type": "none"},
                "storage": {"type": "file", "path": "/tmp/nrt", "use_mmap": true}
            }"#,
        )
        .unwrap();
        assert_eq!(config.ingest_config().thread_count, 3);
        assert_eq!(config.mode, IngestMode::Update);
        assert_eq!(config.refresh_interval(), Duration::from_millis(250));
        assert!(matches!(config.merge_policy, MergePolicyConfig::None));
        match &config.storage {
            StorageConfig::File(file) => assert!(file.use_mmap),
            other => panic!("unexpected storage {other:?}"),
        }
    }

    #[test]
    fn test_invalid_values() {
        let cases = [
            r#"{"ingestion_thread_count": 0}"#,
            r#"{"refresh_interval_secs": 0}"#,
            r#"{"task_worker_count": 0}"#,
            r#"{"max_queued_merges": 0}"#,
            r#"{"max_concurrent_merges": 0}"#,
            r#"{"records_per_second_per_thread": -1}"#,
            r#"{"max_buffered_records": 0}"#,
        ];
        for json in cases {
            assert!(
                matches!(CoordinatorConfig::from_json(json), Err(NrtError::InvalidConfig(_))),
                "{json}"
            );
        }
        for json in [
            r#"{"refresh_interval_secs": 1e20}"#,
            r#"{"shutdown_timeout_secs": 1e300}"#,
            r#"{"refresh_interval_secs": -0.5}"#,
        ] {
            assert!(
                matches!(CoordinatorConfig::from_json(json), Err(NrtError::InvalidConfig(_))),
                "{json}"
            );
        }
        assert!(matches!(
            CoordinatorConfig::from_json("{not json"),
            Err(NrtError::Json(_))
        ));
    }

    #[test]
    fn test_unvalidated_durations_do_not_panic() {
        let config = CoordinatorConfig {
            refresh_interval_secs: f64::NAN,
            shutdown_timeout_secs: 1e20,
            ..CoordinatorConfig::default()
        };
        assert_eq!(config.refresh_interval(), Duration::ZERO);
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(365 * 24 * 3600));
        assert!(positive_secs("x", f64::INFINITY).is_err());
        assert_eq!(positive_secs("x", 0.5).unwrap(), Duration::from_millis(500));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"random_seed": 99, "top_n": 3}}"#).unwrap();
        let config = CoordinatorConfig::load(file.path()).unwrap();
        assert_eq!(config.random_seed, 99);
        assert_eq!(config.worker_config().top_n, 3);

        assert!(CoordinatorConfig::load("/nonexistent/nrtbench.json").is_err());
    }
}
