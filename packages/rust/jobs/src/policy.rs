//! Retry policy: attempt limit and exponential backoff.

use std::time::Duration;

use lorepath_shared::{LorepathError, QueuesConfig};

/// How many times a job runs and how long it waits between runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub backoff_base: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &QueuesConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff_base: Duration::from_millis(config.backoff_base_ms),
        }
    }

    /// Delay after failed attempt `attempt` (1-based): base, 2x base, 4x base...
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.backoff_base.saturating_mul(1 << exponent)
    }

    /// Whether attempt `attempt` of `max_attempts` failing with `error`
    /// earns another attempt.
    pub fn should_retry(&self, attempt: u32, max_attempts: u32, error: &LorepathError) -> bool {
        error.is_retryable() && attempt < max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&QueuesConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_is_three_attempts_from_two_seconds() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(2), Duration::from_secs(4));
        assert_eq!(policy.backoff(3), Duration::from_secs(8));
    }

    #[test]
    fn only_transient_errors_retry_while_attempts_remain() {
        let policy = RetryPolicy::default();
        let transient = LorepathError::Network("timeout".into());
        let invalid = LorepathError::validation("missing nuggetId");
        assert!(policy.should_retry(1, 3, &transient));
        assert!(policy.should_retry(2, 3, &transient));
        assert!(!policy.should_retry(3, 3, &transient));
        assert!(!policy.should_retry(1, 3, &invalid));
        assert!(!policy.should_retry(1, 3, &LorepathError::EmptyEmbedding("n1".into())));
    }

    #[test]
    fn zero_attempts_config_still_runs_once() {
        let config = QueuesConfig {
            max_attempts: 0,
            ..QueuesConfig::default()
        };
        assert_eq!(RetryPolicy::from_config(&config).max_attempts, 1);
    }
}
