//! Deadline based pacing of a single ingestion thread.

use std::time::{Duration, Instant};

/// Furthest a deadline is pushed out, for absurdly low rates.
const MAX_OFFSET: Duration = Duration::from_secs(365 * 24 * 3600);

/// Paces a thread to a target rate.
///
/// The n-th record is due at `start + n / rate`, so a thread that falls behind
/// catches up with a burst instead of losing throughput.
#[derive(Debug, Clone)]
pub struct RatePacer {
    per_second: Option<f64>,
    start: Instant,
    issued: u64,
}

impl RatePacer {
    /// Pace to `per_second` records. Zero or negative means unthrottled.
    pub fn new(per_second: f64) -> Self {
        Self::starting_at(per_second, Instant::now())
    }

    /// Pace with an explicit start time.
    pub fn starting_at(per_second: f64, start: Instant) -> Self {
        RatePacer {
            per_second: (per_second > 0.0 && per_second.is_finite()).then_some(per_second),
            start,
            issued: 0,
        }
    }

    /// Whether any pacing happens at all.
    pub fn is_throttled(&self) -> bool {
        self.per_second.is_some()
    }

    /// When the next record is due, or `None` when unthrottled.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.per_second.map(|rate| {
            let offset = Duration::try_from_secs_f64(self.issued as f64 / rate)
                .map_or(MAX_OFFSET, |offset| offset.min(MAX_OFFSET));
            self.start + offset
        })
    }

    /// How long to wait at `now` before the next record.
    pub fn delay_at(&self, now: Instant) -> Option<Duration> {
        self.next_deadline()
            .and_then(|deadline| deadline.checked_duration_since(now))
            .filter(|wait| !wait.is_zero())
    }

    /// Count one record as issued.
    pub fn advance(&mut self) {
        self.issued += 1;
    }

    /// Records issued so far.
    pub fn issued(&self) -> u64 {
        self.issued
    }
}
