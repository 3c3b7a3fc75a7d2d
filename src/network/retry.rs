//! Reconnect-and-retry decisions for the connection pool.
//!
//! Only transport failures qualify: the request never got a response, so a
//! fresh connection may get one. Anything the server actually answered is
//! the job's business (status errors, `Retry-After`).

use std::time::Duration;

use rand::Rng;
use tracing::debug;

use super::NetworkError;

/// Attempts per request, including the first.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

const DEFAULT_FIRST_DELAY: Duration = Duration::from_millis(250);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(4);
const MAX_JITTER_MS: u64 = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Reconnect and send again after `delay`.
    Retry {
        delay: Duration,
        /// The attempt about to be made (1-indexed).
        attempt: u32,
    },
    DoNotRetry { reason: String },
}

/// Doubling backoff between reconnects, capped, plus up to 100 ms of jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    first_delay: Duration,
    max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            first_delay: DEFAULT_FIRST_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new(max_attempts: u32, first_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            first_delay,
            max_delay: max_delay.max(first_delay),
        }
    }

    /// Every failure surfaces immediately.
    #[must_use]
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decides what to do after attempt number `attempt` failed with `error`.
    #[must_use]
    pub fn should_retry(&self, error: &NetworkError, attempt: u32) -> RetryDecision {
        if !error.is_transient() {
            return RetryDecision::DoNotRetry {
                reason: "not a connection failure".to_string(),
            };
        }
        if attempt >= self.max_attempts {
            return RetryDecision::DoNotRetry {
                reason: format!("gave up after {} attempts", self.max_attempts),
            };
        }
        let delay = self.backoff(attempt) + jitter();
        debug!(attempt, delay_ms = delay.as_millis(), "scheduling reconnect");
        RetryDecision::Retry {
            delay,
            attempt: attempt + 1,
        }
    }

    /// `first_delay * 2^(attempt-1)`, capped at `max_delay`.
    fn backoff(&self, attempt: u32) -> Duration {
        let doublings = attempt.saturating_sub(1).min(16);
        self.first_delay
            .saturating_mul(1 << doublings)
            .min(self.max_delay)
    }
}

fn jitter() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(0..=MAX_JITTER_MS))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reset() -> NetworkError {
        NetworkError::transient("http://x/", "connection reset")
    }

    #[test]
    fn test_transport_failures_retry_until_attempts_run_out() {
        let policy = RetryPolicy::default();
        assert!(matches!(
            policy.should_retry(&reset(), 1),
            RetryDecision::Retry { attempt: 2, .. }
        ));
        assert!(matches!(
            policy.should_retry(&reset(), 2),
            RetryDecision::Retry { attempt: 3, .. }
        ));
        assert!(matches!(
            policy.should_retry(&reset(), 3),
            RetryDecision::DoNotRetry { .. }
        ));
    }

    #[test]
    fn test_answered_requests_are_not_retried() {
        let policy = RetryPolicy::default();
        for error in [
            NetworkError::remote_status(503, ""),
            NetworkError::remote_status(429, ""),
            NetworkError::redirect_loop("http://x/"),
            NetworkError::invalid_url("nope"),
        ] {
            assert!(matches!(
                policy.should_retry(&error, 1),
                RetryDecision::DoNotRetry { .. }
            ));
        }
    }

    #[test]
    fn test_backoff_doubles_then_caps() {
        let policy = RetryPolicy::new(10, Duration::from_secs(1), Duration::from_secs(4));
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(3), Duration::from_secs(4));
        assert_eq!(policy.backoff(40), Duration::from_secs(4));
    }

    #[test]
    fn test_jitter_is_bounded() {
        let policy = RetryPolicy::new(5, Duration::from_millis(200), Duration::from_secs(1));
        match policy.should_retry(&reset(), 1) {
            RetryDecision::Retry { delay, .. } => {
                assert!(delay >= Duration::from_millis(200));
                assert!(delay <= Duration::from_millis(300));
            }
            other => panic!("expected retry, got {other:?}"),
        }
    }

    #[test]
    fn test_no_retry_policy() {
        assert!(matches!(
            RetryPolicy::no_retry().should_retry(&reset(), 1),
            RetryDecision::DoNotRetry { .. }
        ));
    }
}
