//! Backoff policy for event redelivery.
use std::time::Duration;

/// Determines when a failed event may be retried and when it is given up on.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Coefficient to multiply `initial_interval` with for every past attempt.
    pub backoff_coefficient: u32,
    /// The backoff interval after the first failure.
    pub initial_interval: Duration,
    /// The maximum possible backoff between retries.
    pub maximum_interval: Duration,
    /// Number of delivery attempts (including the first one) after which an event is dropped.
    pub max_attempts: u32,
    /// Time since the first failure after which an event is dropped.
    pub max_elapsed: Duration,
}

impl RetryPolicy {
    /// Default value for [`RetryPolicy::backoff_coefficient`].
    pub const DEFAULT_BACKOFF_COEFFICIENT: u32 = 2;
    /// Default value for [`RetryPolicy::initial_interval`].
    pub const DEFAULT_INITIAL_INTERVAL: Duration = Duration::from_secs(1);
    /// Default value for [`RetryPolicy::maximum_interval`].
    pub const DEFAULT_MAXIMUM_INTERVAL: Duration = Duration::from_secs(5 * 60);
    /// Default value for [`RetryPolicy::max_attempts`].
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;
    /// Default value for [`RetryPolicy::max_elapsed`].
    pub const DEFAULT_MAX_ELAPSED: Duration = Duration::from_secs(24 * 60 * 60);

    /// Backoff to wait after the given failed attempt (1-based).
    pub fn retry_interval(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let candidate_interval = self
            .backoff_coefficient
            .checked_pow(exponent)
            .and_then(|multiplier| self.initial_interval.checked_mul(multiplier))
            .unwrap_or(self.maximum_interval);
        std::cmp::min(candidate_interval, self.maximum_interval)
    }

    /// Returns `true` if an event that failed `attempts` times, first `elapsed` ago, should be
    /// dropped.
    pub fn is_exhausted(&self, attempts: u32, elapsed: Duration) -> bool {
        attempts >= self.max_attempts || elapsed >= self.max_elapsed
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_coefficient: RetryPolicy::DEFAULT_BACKOFF_COEFFICIENT,
            initial_interval: RetryPolicy::DEFAULT_INITIAL_INTERVAL,
            maximum_interval: RetryPolicy::DEFAULT_MAXIMUM_INTERVAL,
            max_attempts: RetryPolicy::DEFAULT_MAX_ATTEMPTS,
            max_elapsed: RetryPolicy::DEFAULT_MAX_ELAPSED,
        }
    }
}
