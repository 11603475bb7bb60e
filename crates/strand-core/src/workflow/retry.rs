//! Retry decisions for workflow steps.
//!
//! Stateless: all logic is in associated functions that take the policy as a
//! parameter. Attempts are 1-based (the first execution is attempt 1).

use std::time::Duration;

use strand_types::workflow::{Backoff, RetryPolicy};

pub struct RetryHandler;

impl RetryHandler {
    /// Whether another attempt follows a failed `attempt`.
    pub fn should_retry(policy: &RetryPolicy, attempt: u32) -> bool {
        attempt < policy.max_attempts
    }

    /// Delay to wait after failed `attempt` before the next one.
    ///
    /// Fixed backoff always waits `initial_delay_ms`; exponential waits
    /// `initial_delay_ms * 2^(attempt - 1)`. Both are capped at `max_delay_ms`.
    pub fn delay_after(policy: &RetryPolicy, attempt: u32) -> Duration {
        let ms = match policy.backoff {
            Backoff::Fixed => policy.initial_delay_ms,
            Backoff::Exponential => {
                let shift = attempt.saturating_sub(1).min(63);
                policy
                    .initial_delay_ms
                    .saturating_mul(1u64.checked_shl(shift).unwrap_or(u64::MAX))
            }
        };
        Duration::from_millis(ms.min(policy.max_delay_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_retry_within_limit() {
        let policy = RetryPolicy::fixed(3, 10);
        assert!(RetryHandler::should_retry(&policy, 1));
        assert!(RetryHandler::should_retry(&policy, 2));
        assert!(!RetryHandler::should_retry(&policy, 3));
        assert!(!RetryHandler::should_retry(&policy, 4));
    }

    #[test]
    fn test_default_policy_never_retries() {
        assert!(!RetryHandler::should_retry(&RetryPolicy::none(), 1));
    }

    #[test]
    fn test_fixed_delay_is_constant() {
        let policy = RetryPolicy::fixed(5, 250);
        assert_eq!(RetryHandler::delay_after(&policy, 1), Duration::from_millis(250));
        assert_eq!(RetryHandler::delay_after(&policy, 4), Duration::from_millis(250));
    }

    #[test]
    fn test_exponential_delay_doubles_and_caps() {
        let mut policy = RetryPolicy::exponential(10, 100);
        policy.max_delay_ms = 1_000;
        assert_eq!(RetryHandler::delay_after(&policy, 1), Duration::from_millis(100));
        assert_eq!(RetryHandler::delay_after(&policy, 2), Duration::from_millis(200));
        assert_eq!(RetryHandler::delay_after(&policy, 3), Duration::from_millis(400));
        assert_eq!(RetryHandler::delay_after(&policy, 5), Duration::from_millis(1_000));
        assert_eq!(RetryHandler::delay_after(&policy, 200), Duration::from_millis(1_000));
    }
}
