//! Lock-free latency histogram with power-of-two buckets.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

const BUCKETS: usize = 65;

/// Latency summary in microseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    /// Samples recorded.
    pub count: u64,
    /// Fastest sample.
    pub min_us: u64,
    /// Average sample.
    pub mean_us: f64,
    /// Slowest sample.
    pub max_us: u64,
    /// Median, to bucket resolution.
    pub p50_us: u64,
    /// 90th percentile, to bucket resolution.
    pub p90_us: u64,
    /// 99th percentile, to bucket resolution.
    pub p99_us: u64,
}

/// Records durations into buckets `[2^(b-1), 2^b)` microseconds.
///
/// Percentiles are reported as the upper bound of the bucket they fall in,
/// capped at the largest value seen.
#[derive(Debug)]
pub struct LatencyHistogram {
    buckets: [AtomicU64; BUCKETS],
    count: AtomicU64,
    sum_us: AtomicU64,
    min_us: AtomicU64,
    max_us: AtomicU64,
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        LatencyHistogram {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            count: AtomicU64::new(0),
            sum_us: AtomicU64::new(0),
            min_us: AtomicU64::new(u64::MAX),
            max_us: AtomicU64::new(0),
        }
    }
}

impl LatencyHistogram {
    /// Create an empty histogram.
    pub fn new() -> Self {
        Self::default()
    }

    fn bucket(micros: u64) -> usize {
        (u64::BITS - micros.leading_zeros()) as usize
    }

    fn upper_bound(bucket: usize) -> u64 {
        match bucket {
            0 => 0,
            64.. => u64::MAX,
            b => (1u64 << b) - 1,
        }
    }

    /// Record one sample.
    pub fn record(&self, latency: Duration) {
        let micros = latency.as_micros().min(u64::MAX as u128) as u64;
        self.buckets[Self::bucket(micros)].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_us.fetch_add(micros, Ordering::Relaxed);
        self.min_us.fetch_min(micros, Ordering::Relaxed);
        self.max_us.fetch_max(micros, Ordering::Relaxed);
    }

    /// Samples recorded.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Value below which fraction `q` of the samples fall.
    pub fn percentile(&self, q: f64) -> u64 {
        let counts: Vec<u64> = self
            .buckets
            .iter()
            .map(|bucket| bucket.load(Ordering::Relaxed))
            .collect();
        let total: u64 = counts.iter().sum();
        if total == 0 {
            return 0;
        }
        let rank = ((q.clamp(0.0, 1.0) * total as f64).ceil() as u64).max(1);
        let max = self.max_us.load(Ordering::Relaxed);

        let mut seen = 0;
        for (bucket, count) in counts.iter().enumerate() {
            seen += count;
            if seen >= rank {
                return Self::upper_bound(bucket).min(max);
            }
        }
        max
    }

    /// Summary of everything recorded so far.
    pub fn summary(&self) -> LatencySummary {
        let count = self.count();
        if count == 0 {
            return LatencySummary::default();
        }
        LatencySummary {
            count,
            min_us: self.min_us.load(Ordering::Relaxed),
            mean_us: self.sum_us.load(Ordering::Relaxed) as f64 / count as f64,
            max_us: self.max_us.load(Ordering::Relaxed),
            p50_us: self.percentile(0.50),
            p90_us: self.percentile(0.90),
            p99_us: self.percentile(0.99),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_summary() {
        assert_eq!(LatencyHistogram::new().summary(), LatencySummary::default());
    }

    #[test]
    fn test_summary() {
        let histogram = LatencyHistogram::new();
        for micros in 1..=100 {
            histogram.record(Duration::from_micros(micros));
        }

        let summary = histogram.summary();
        assert_eq!(summary.count, 100);
        assert_eq!(summary.min_us, 1);
        assert_eq!(summary.max_us, 100);
        assert!((summary.mean_us - 50.5).abs() < 1e-9);
        // 50 falls in [32, 64).
        assert_eq!(summary.p50_us, 63);
        // 90 and 99 fall in [64, 128), capped at the max.
        assert_eq!(summary.p90_us, 100);
        assert_eq!(summary.p99_us, 100);
    }

    #[test]
    fn test_zero_latency() {
        let histogram = LatencyHistogram::new();
        histogram.record(Duration::ZERO);
        assert_eq!(histogram.percentile(0.5), 0);
        assert_eq!(histogram.summary().min_us, 0);
    }
}
