//! Exponential backoff with jitter for retryable steps.

use std::time::Duration;

use rand::Rng;

use repoqa_shared::{RetryConfig, ToolDescriptor, ToolResult};

/// Decides whether a failed attempt is retried, and how long to wait first.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub multiplier: u32,
    pub max_delay: Duration,
    pub max_jitter: Duration,
    /// Retries after the first attempt.
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.base_delay_ms),
            multiplier: config.multiplier.max(1),
            max_delay: Duration::from_millis(config.max_delay_ms),
            max_jitter: Duration::from_millis(config.max_jitter_ms),
            max_retries: config.max_retries,
        }
    }
}

impl RetryPolicy {
    /// Total attempts a step gets: one for non-retryable steps.
    pub fn max_attempts(&self, descriptor: &ToolDescriptor) -> u32 {
        if descriptor.retryable {
            self.max_retries + 1
        } else {
            1
        }
    }

    /// Whether to retry after `attempts` attempts produced `result`.
    ///
    /// A result with mixed errors is retried when any one of them is
    /// retryable.
    pub fn should_retry<T>(
        &self,
        descriptor: &ToolDescriptor,
        result: &ToolResult<T>,
        attempts: u32,
    ) -> bool {
        descriptor.retryable
            && !result.success
            && result.has_retryable_error()
            && attempts < self.max_attempts(descriptor)
    }

    /// Deterministic part of the wait before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1);
        let factor = self.multiplier.saturating_pow(exponent);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Backoff plus uniform jitter in `[0, max_jitter]`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let jitter_ms = u64::try_from(self.max_jitter.as_millis()).unwrap_or(u64::MAX);
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        self.backoff(retry) + Duration::from_millis(jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use repoqa_shared::{ToolError, ToolErrorKind};
    use serde_json::Value;

    fn descriptor(retryable: bool) -> ToolDescriptor {
        ToolDescriptor {
            name: "sample_step",
            description: "test step",
            input_schema: Value::Null,
            retryable,
            estimated_duration: Duration::from_millis(100),
        }
    }

    fn failure(retryable: bool) -> ToolResult<()> {
        ToolResult::failed(
            "failed",
            ToolError::new(ToolErrorKind::Network, "reset").retryable(retryable),
        )
    }

    #[test]
    fn attempts_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts(&descriptor(true)), 3);
        assert_eq!(policy.max_attempts(&descriptor(false)), 1);
    }

    #[test]
    fn retries_only_retryable_failures() {
        let policy = RetryPolicy::default();
        let step = descriptor(true);

        assert!(policy.should_retry(&step, &failure(true), 1));
        assert!(policy.should_retry(&step, &failure(true), 2));
        assert!(!policy.should_retry(&step, &failure(true), 3));
        assert!(!policy.should_retry(&step, &failure(false), 1));
        assert!(!policy.should_retry(&descriptor(false), &failure(true), 1));
        assert!(!policy.should_retry(&step, &ToolResult::ok((), "ok", 1.0), 1));
    }

    #[test]
    fn mixed_errors_permit_retry() {
        let policy = RetryPolicy::default();
        let mut result = failure(false);
        result
            .errors
            .push(ToolError::new(ToolErrorKind::ApiLimit, "429").retryable(true));
        assert!(policy.should_retry(&descriptor(true), &result, 1));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(1000));
        assert_eq!(policy.backoff(2), Duration::from_millis(2000));
        assert_eq!(policy.backoff(3), Duration::from_millis(4000));
        assert_eq!(policy.backoff(4), Duration::from_millis(8000));
        assert_eq!(policy.backoff(10), Duration::from_millis(8000));
        assert_eq!(policy.backoff(64), Duration::from_millis(8000));
    }

    #[test]
    fn jitter_stays_in_bounds() {
        let policy = RetryPolicy::default();
        for retry in 1..=5 {
            let base = policy.backoff(retry);
            for _ in 0..50 {
                let delay = policy.delay_for(retry);
                assert!(delay >= base);
                assert!(delay <= base + Duration::from_millis(1000));
                assert!(delay <= Duration::from_millis(9000));
            }
        }
    }
}
