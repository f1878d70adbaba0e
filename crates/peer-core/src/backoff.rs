//! Reconnect timing for connection maintainers.

use std::time::Duration;

/// Smallest delay a backoff starts from. A zero delay would never grow.
pub const MIN_RETRY_DELAY: Duration = Duration::from_millis(1);

/// Timing knobs for a connection maintainer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Upper bound on a single dial attempt
    pub connection_timeout: Duration,
    /// Delay the backoff starts from (and returns to after a success)
    pub initial_delay: Duration,
    /// Multiplier applied to the delay after each failed attempt
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_millis(500),
            initial_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
        }
    }
}

/// Per-maintainer backoff state.
///
/// The delay is multiplied before each sleep, so the first sleep after a
/// failure is `initial_delay * backoff_factor`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    factor: f64,
    current: Duration,
    failures: u32,
}

impl Backoff {
    /// Delays below `MIN_RETRY_DELAY` are raised to it.
    pub fn new(policy: &RetryPolicy) -> Self {
        let initial = policy.initial_delay.max(MIN_RETRY_DELAY);
        Self {
            initial,
            factor: policy.backoff_factor,
            current: initial,
            failures: 0,
        }
    }

    /// Record a failed attempt and return how long to wait before the next one.
    pub fn fail(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        self.current = Duration::try_from_secs_f64(self.current.as_secs_f64() * self.factor)
            .unwrap_or(Duration::MAX);
        self.current
    }

    /// Record a successful attempt.
    pub fn reset(&mut self) {
        self.current = self.initial;
        self.failures = 0;
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    /// Consecutive failures since the last success.
    pub fn failures(&self) -> u32 {
        self.failures
    }
}
