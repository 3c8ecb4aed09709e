//! Per-category task metrics.
//!
//! Each task category gets a [`CategoryMetrics`] with a [`Meter`] for
//! throughput, a failure count and a [`LatencyHistogram`]. Everything is
//! updated with atomics so task workers never contend on a lock while
//! recording.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

pub mod ewma;
pub mod histogram;

pub use ewma::{Ewma, TICK_INTERVAL};
pub use histogram::{LatencyHistogram, LatencySummary};

/// Event counter with a mean rate and a one minute moving average.
///
/// The moving average is ticked lazily: whoever marks or reads the meter
/// first after a tick interval has elapsed applies the missed ticks.
#[derive(Debug)]
pub struct Meter {
    start: Instant,
    count: AtomicU64,
    last_tick_nanos: AtomicU64,
    one_minute: Ewma,
}

impl Default for Meter {
    fn default() -> Self {
        Meter {
            start: Instant::now(),
            count: AtomicU64::new(0),
            last_tick_nanos: AtomicU64::new(0),
            one_minute: Ewma::one_minute(),
        }
    }
}

impl Meter {
    /// Create a meter starting now.
    pub fn new() -> Self {
        Self::default()
    }

    fn tick_if_necessary(&self) {
        let interval = TICK_INTERVAL.as_nanos() as u64;
        let old = self.last_tick_nanos.load(Ordering::SeqCst);
        let now = self.start.elapsed().as_nanos() as u64;
        let age = now.saturating_sub(old);
        if age < interval {
            return;
        }
        let aligned = now - age % interval;
        if self
            .last_tick_nanos
            .compare_exchange(old, aligned, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            for _ in 0..age / interval {
                self.one_minute.tick();
            }
        }
    }

    /// Count `n` events.
    pub fn mark(&self, n: u64) {
        self.tick_if_necessary();
        self.count.fetch_add(n, Ordering::Relaxed);
        self.one_minute.update(n);
    }

    /// Events counted.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Events per second since the meter was created.
    pub fn mean_rate(&self) -> f64 {
        let elapsed = self.start.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        self.count() as f64 / elapsed
    }

    /// Events per second, averaged over roughly the last minute.
    pub fn one_minute_rate(&self) -> f64 {
        self.tick_if_necessary();
        self.one_minute.rate_per_second()
    }
}

/// Metrics of one task category.
#[derive(Debug, Default)]
pub struct CategoryMetrics {
    completed: Meter,
    failures: AtomicU64,
    hits: AtomicU64,
    latency: LatencyHistogram,
}

impl CategoryMetrics {
    /// Record a successful task.
    pub fn record_success(&self, latency: Duration, hits: u64) {
        self.completed.mark(1);
        self.hits.fetch_add(hits, Ordering::Relaxed);
        self.latency.record(latency);
    }

    /// Record a failed task. Failures are counted but do not add latency
    /// samples.
    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Successful tasks.
    pub fn count(&self) -> u64 {
        self.completed.count()
    }

    /// Failed tasks.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Report for `category`.
    pub fn report(&self, category: &str) -> CategoryReport {
        CategoryReport {
            category: category.to_string(),
            count: self.count(),
            failures: self.failures(),
            total_hits: self.hits.load(Ordering::Relaxed),
            mean_rate: self.completed.mean_rate(),
            one_minute_rate: self.completed.one_minute_rate(),
            latency: self.latency.summary(),
        }
    }
}

/// Serializable view of one category.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryReport {
    /// Task category.
    pub category: String,
    /// Successful tasks.
    pub count: u64,
    /// Failed tasks.
    pub failures: u64,
    /// Hits summed over successful tasks.
    pub total_hits: u64,
    /// Tasks per second since the category was first used.
    pub mean_rate: f64,
    /// Tasks per second over roughly the last minute.
    pub one_minute_rate: f64,
    /// Latency of successful tasks.
    pub latency: LatencySummary,
}

/// Metrics of every category, created on first use.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    categories: RwLock<BTreeMap<String, Arc<CategoryMetrics>>>,
}

impl MetricsRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Metrics for `category`.
    pub fn category(&self, category: &str) -> Arc<CategoryMetrics> {
        if let Some(metrics) = self.categories.read().get(category) {
            return Arc::clone(metrics);
        }
        Arc::clone(
            self.categories
                .write()
                .entry(category.to_string())
                .or_default(),
        )
    }

    /// Reports for every category, ordered by name.
    pub fn report(&self) -> Vec<CategoryReport> {
        self.categories
            .read()
            .iter()
            .map(|(category, metrics)| metrics.report(category))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_metrics() {
        let registry = MetricsRegistry::new();
        let term = registry.category("Term");
        term.record_success(Duration::from_micros(100), 3);
        term.record_success(Duration::from_micros(300), 1);
        registry.category("Term").record_failure();
        registry.category("Fuzzy1");

        let report = registry.report();
        assert_eq!(report.len(), 2);
        assert_eq!(report[0].category, "Fuzzy1");
        assert_eq!(report[0].count, 0);

        let term = &report[1];
        assert_eq!(term.count, 2);
        assert_eq!(term.failures, 1);
        assert_eq!(term.total_hits, 4);
        assert_eq!(term.latency.min_us, 100);
        assert_eq!(term.latency.max_us, 300);
        assert!(term.mean_rate > 0.0);
    }

    #[test]
    fn test_meter_counts() {
        let meter = Meter::new();
        meter.mark(2);
        meter.mark(3);
        assert_eq!(meter.count(), 5);
        // No tick interval has elapsed yet.
        assert_eq!(meter.one_minute_rate(), 0.0);
    }
}
