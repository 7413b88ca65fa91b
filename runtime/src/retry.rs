//! Retry policy with exponential backoff for listener reconnects.
//!
//! A listener that loses its cursor reconnects with delays `d, 2d, 4d, ...`
//! (capped at `max_delay`) until it either delivers an event again or runs out
//! of attempts. Invalidation is counted as an attempt but reconnects at once and
//! does not advance the exponent.
//!
//! # Example
//!
//! ```rust
//! use changefeed_runtime::retry::{Backoff, RetryPolicy};
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::builder()
//!     .max_attempts(5)
//!     .initial_delay(Duration::from_millis(100))
//!     .build();
//!
//! let mut backoff = Backoff::new(policy);
//! assert_eq!(backoff.record_failure(), Some(Duration::from_millis(100)));
//! assert_eq!(backoff.record_failure(), Some(Duration::from_millis(200)));
//! backoff.reset();
//! assert_eq!(backoff.record_failure(), Some(Duration::from_millis(100)));
//! ```

use std::time::Duration;

/// Default number of consecutive failed attempts before a listener gives up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default delay before the first reconnect.
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(1000);

/// Default cap on reconnect delays.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);

/// Retry policy configuration for exponential backoff.
///
/// # Default Values
///
/// - `max_attempts`: 5
/// - `initial_delay`: 1000ms
/// - `max_delay`: 60 seconds, raised to `initial_delay` when that is longer
/// - `multiplier`: 2.0 (delay doubles each retry)
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Consecutive failed attempts after which the listener terminates
    pub max_attempts: u32,
    /// Delay before the first reconnect
    pub initial_delay: Duration,
    /// Maximum delay between reconnects (cap for exponential backoff)
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_delay: DEFAULT_INITIAL_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Create a new policy builder.
    #[must_use]
    pub const fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            max_attempts: None,
            initial_delay: None,
            max_delay: None,
            multiplier: None,
        }
    }

    /// Calculate delay for a given backoff exponent.
    ///
    /// Uses exponential backoff: `initial_delay * multiplier ^ attempt`,
    /// capped at `max_delay`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return self.initial_delay.min(self.max_delay);
        }

        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);

        Duration::try_from_secs_f64(secs)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    max_attempts: Option<u32>,
    initial_delay: Option<Duration>,
    max_delay: Option<Duration>,
    multiplier: Option<f64>,
}

impl RetryPolicyBuilder {
    /// Set the attempt cap.
    #[must_use]
    pub const fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Set initial delay before first reconnect.
    #[must_use]
    pub const fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = Some(delay);
        self
    }

    /// Set maximum delay (cap for exponential backoff).
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = Some(delay);
        self
    }

    /// Set multiplier for exponential backoff.
    #[must_use]
    pub const fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = Some(multiplier);
        self
    }

    /// Build the [`RetryPolicy`].
    ///
    /// Without an explicit `max_delay`, the cap is [`DEFAULT_MAX_DELAY`] or the
    /// initial delay, whichever is longer, so the configured first delay is
    /// never shortened.
    #[must_use]
    pub fn build(self) -> RetryPolicy {
        let defaults = RetryPolicy::default();
        let initial_delay = self.initial_delay.unwrap_or(defaults.initial_delay);
        RetryPolicy {
            max_attempts: self.max_attempts.unwrap_or(defaults.max_attempts),
            initial_delay,
            max_delay: self
                .max_delay
                .unwrap_or_else(|| defaults.max_delay.max(initial_delay)),
            multiplier: self.multiplier.unwrap_or(defaults.multiplier),
        }
    }
}

/// Consecutive-failure tracker for one listener.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    attempts: u32,
    exponent: u32,
}

impl Backoff {
    /// Start a fresh tracker.
    #[must_use]
    pub const fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
            exponent: 0,
        }
    }

    /// Count a transient or unexpected failure.
    ///
    /// Returns the delay to wait before reconnecting, or `None` once the
    /// attempt cap is reached.
    pub fn record_failure(&mut self) -> Option<Duration> {
        self.attempts = self.attempts.saturating_add(1);
        if self.attempts >= self.policy.max_attempts {
            return None;
        }
        let delay = self.policy.delay_for_attempt(self.exponent);
        self.exponent = self.exponent.saturating_add(1);
        Some(delay)
    }

    /// Count an invalidation.
    ///
    /// Returns whether a reconnect is still allowed. No delay applies and the
    /// backoff exponent is left alone.
    pub fn record_invalidation(&mut self) -> bool {
        self.attempts = self.attempts.saturating_add(1);
        self.attempts < self.policy.max_attempts
    }

    /// Forget past failures after an event was delivered.
    pub const fn reset(&mut self) {
        self.attempts = 0;
        self.exponent = 0;
    }

    /// Consecutive failed attempts so far.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// The policy in effect.
    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}
