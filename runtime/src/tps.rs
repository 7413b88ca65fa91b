//! Throughput estimation.
//!
//! Each worker owns one [`TpsEstimator`]. Every handled event appends its
//! arrival time to a sliding window (15 minutes by default), the window's
//! average rate is computed as `count / window_seconds`, and the reported value
//! is an exponentially weighted moving average of that rate:
//!
//! ```text
//! tps ← α · (count / 900) + (1 − α) · tps
//! ```
//!
//! The estimator is mutated by its owning worker only, so it needs no locking.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Length of the sliding window.
pub const WINDOW: Duration = Duration::from_secs(15 * 60);

/// Smoothing factor used when none (or an invalid one) is configured.
pub const DEFAULT_ALPHA: f64 = 0.3;

/// Smoothing factor recommended for production dashboards.
pub const RECOMMENDED_ALPHA: f64 = 0.1;

/// EWMA of events per second over a sliding window.
#[derive(Debug, Clone)]
pub struct TpsEstimator {
    alpha: f64,
    window: Duration,
    arrivals: VecDeque<Instant>,
    tps: f64,
}

impl TpsEstimator {
    /// Estimator over the standard 15-minute window.
    ///
    /// `alpha` outside `(0, 1]` falls back to [`DEFAULT_ALPHA`].
    #[must_use]
    pub fn new(alpha: f64) -> Self {
        Self::with_window(alpha, WINDOW)
    }

    /// Estimator over a custom window.
    #[must_use]
    pub fn with_window(alpha: f64, window: Duration) -> Self {
        let alpha = if alpha > 0.0 && alpha <= 1.0 {
            alpha
        } else {
            DEFAULT_ALPHA
        };
        Self {
            alpha,
            window,
            arrivals: VecDeque::new(),
            tps: 0.0,
        }
    }

    /// Record an event arriving now and return the updated estimate.
    pub fn record(&mut self) -> f64 {
        self.record_at(Instant::now())
    }

    /// Record an event arriving at `now` and return the updated estimate.
    ///
    /// Arrivals must be recorded in non-decreasing time order.
    pub fn record_at(&mut self, now: Instant) -> f64 {
        self.arrivals.push_back(now);
        if let Some(cutoff) = now.checked_sub(self.window) {
            while self.arrivals.front().is_some_and(|&t| t < cutoff) {
                self.arrivals.pop_front();
            }
        }

        #[allow(clippy::cast_precision_loss)] // window counts stay far below 2^52
        let instant = self.arrivals.len() as f64 / self.window.as_secs_f64();
        self.tps = self.alpha.mul_add(instant, (1.0 - self.alpha) * self.tps);
        self.tps
    }

    /// Current estimate.
    #[must_use]
    pub const fn tps(&self) -> f64 {
        self.tps
    }

    /// Arrivals currently inside the window.
    #[must_use]
    pub fn window_len(&self) -> usize {
        self.arrivals.len()
    }

    /// Smoothing factor in effect.
    #[must_use]
    pub const fn alpha(&self) -> f64 {
        self.alpha
    }
}
