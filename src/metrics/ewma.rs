//! Exponentially weighted moving average rates.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

/// Interval at which [`Ewma::tick`] is expected to be called.
pub const TICK_INTERVAL: Duration = Duration::from_secs(5);

const SECONDS_PER_MINUTE: f64 = 60.0;

fn alpha(minutes: f64) -> f64 {
    1.0 - (-TICK_INTERVAL.as_secs_f64() / SECONDS_PER_MINUTE / minutes).exp()
}

/// Moving average of an event rate, in the style of the classic
/// load-average calculation.
///
/// Events are added with [`Ewma::update`]; every [`TICK_INTERVAL`] the
/// events counted since the previous tick are folded into the average.
#[derive(Debug)]
pub struct Ewma {
    alpha: f64,
    uncounted: AtomicU64,
    rate: Mutex<Option<f64>>,
}

impl Ewma {
    /// Average over roughly the last minute.
    pub fn one_minute() -> Self {
        Self::with_alpha(alpha(1.0))
    }

    /// Average over roughly the last five minutes.
    pub fn five_minutes() -> Self {
        Self::with_alpha(alpha(5.0))
    }

    /// Average over roughly the last fifteen minutes.
    pub fn fifteen_minutes() -> Self {
        Self::with_alpha(alpha(15.0))
    }

    /// Create an average with smoothing factor `alpha`.
    pub fn with_alpha(alpha: f64) -> Self {
        Ewma {
            alpha,
            uncounted: AtomicU64::new(0),
            rate: Mutex::new(None),
        }
    }

    /// Count `n` events.
    pub fn update(&self, n: u64) {
        self.uncounted.fetch_add(n, Ordering::Relaxed);
    }

    /// Fold the events since the last tick into the average.
    pub fn tick(&self) {
        let count = self.uncounted.swap(0, Ordering::Relaxed);
        let instant_rate = count as f64 / TICK_INTERVAL.as_secs_f64();
        let mut rate = self.rate.lock();
        *rate = Some(match *rate {
            Some(old) => old + self.alpha * (instant_rate - old),
            None => instant_rate,
        });
    }

    /// Events per second.
    pub fn rate_per_second(&self) -> f64 {
        self.rate.lock().unwrap_or(0.0)
    }
}
