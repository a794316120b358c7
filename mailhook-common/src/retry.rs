//! # Retry
//!
//! Module providing a `RetryPolicy` struct to configure delivery retrying.
use std::time;

/// Longest wait between attempts unless configured otherwise, including a consumer's `Retry-After`.
pub const DEFAULT_MAXIMUM_INTERVAL: time::Duration = time::Duration::from_secs(60);

#[derive(Clone, Debug, PartialEq, Eq)]
/// A retry policy to determine how often, and after how long, a failed delivery is attempted again.
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,
    /// Coefficient to multiply initial_interval with for every past attempt.
    pub backoff_coefficient: u32,
    /// The backoff interval for the first retry.
    pub initial_interval: time::Duration,
    /// The maximum possible backoff between retries.
    pub maximum_interval: Option<time::Duration>,
}

impl RetryPolicy {
    /// Initialize a `RetryPolicyBuilder`.
    pub fn build(backoff_coefficient: u32, initial_interval: time::Duration) -> RetryPolicyBuilder {
        RetryPolicyBuilder::new(backoff_coefficient, initial_interval)
    }

    /// Whether another attempt may follow attempt number `attempt` (1-based).
    pub fn can_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Determine the interval to wait after attempt number `attempt` (1-based) failed.
    /// If not `None`, this method will respect `preferred_retry_interval` as long as it falls within `candidate_interval <= preferred_retry_interval <= maximum_interval`.
    pub fn retry_interval(
        &self,
        attempt: u32,
        preferred_retry_interval: Option<time::Duration>,
    ) -> time::Duration {
        let candidate_interval = self.initial_interval
            * self
                .backoff_coefficient
                .saturating_pow(attempt.saturating_sub(1));

        match (preferred_retry_interval, self.maximum_interval) {
            (Some(duration), Some(max_interval)) => {
                let min_interval_allowed = std::cmp::min(candidate_interval, max_interval);

                if min_interval_allowed <= duration && duration <= max_interval {
                    duration
                } else {
                    min_interval_allowed
                }
            }
            (Some(duration), None) => std::cmp::max(candidate_interval, duration),
            (None, Some(max_interval)) => std::cmp::min(candidate_interval, max_interval),
            (None, None) => candidate_interval,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicyBuilder::default().provide()
    }
}

/// Builder pattern struct to provide a `RetryPolicy`.
pub struct RetryPolicyBuilder {
    pub max_attempts: u32,
    pub backoff_coefficient: u32,
    pub initial_interval: time::Duration,
    pub maximum_interval: Option<time::Duration>,
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_coefficient: 2,
            initial_interval: time::Duration::from_secs(2),
            maximum_interval: Some(DEFAULT_MAXIMUM_INTERVAL),
        }
    }
}

impl RetryPolicyBuilder {
    pub fn new(backoff_coefficient: u32, initial_interval: time::Duration) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            ..RetryPolicyBuilder::default()
        }
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> RetryPolicyBuilder {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn maximum_interval(mut self, interval: time::Duration) -> RetryPolicyBuilder {
        self.maximum_interval = Some(interval);
        self
    }

    /// Provide a `RetryPolicy` according to build parameters provided thus far.
    pub fn provide(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            backoff_coefficient: self.backoff_coefficient,
            initial_interval: self.initial_interval,
            maximum_interval: self.maximum_interval,
        }
    }
}
