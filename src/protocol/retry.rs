//! Retry policy for failed sends
//!
//! The manager retries a failed send once, after a fixed backoff and a fresh
//! transport selection. The policy is a value so tests can inject a zero backoff.

use super::envelope::{Envelope, DEFAULT_MAX_RETRIES};
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

/// Default wait between a failed send and its retry
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(1);

/// Configuration for retry behavior
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retry bound stamped onto envelopes built by the manager
    pub max_retries: u32,

    /// Wait before reselecting and retrying
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff: DEFAULT_BACKOFF,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with explicit values
    pub fn new(max_retries: u32, backoff: Duration) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    /// Zero backoff, for tests and in-process deployments
    pub fn immediate() -> Self {
        Self {
            backoff: Duration::ZERO,
            ..Default::default()
        }
    }

    /// Never retry
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            backoff: Duration::ZERO,
        }
    }

    /// True while the envelope still has retries left
    pub fn should_retry(&self, envelope: &Envelope) -> bool {
        envelope.retry_count < envelope.max_retries
    }

    /// Wait out the backoff
    pub async fn wait(&self) {
        if self.backoff.is_zero() {
            return;
        }
        debug!(backoff_ms = self.backoff.as_millis() as u64, "Backing off before retry");
        sleep(self.backoff).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Parameters;
    use std::time::Instant;

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.backoff, Duration::from_secs(1));
    }

    #[test]
    fn test_should_retry_respects_envelope_bound() {
        let policy = RetryPolicy::immediate();
        let mut env = Envelope::new("a", "b", "ping", Parameters::new()).with_max_retries(2);

        assert!(policy.should_retry(&env));
        env.retry_count = 1;
        assert!(policy.should_retry(&env));
        env.retry_count = 2;
        assert!(!policy.should_retry(&env));
    }

    #[test]
    fn test_zero_max_retries() {
        let policy = RetryPolicy::none();
        let env = Envelope::new("a", "b", "ping", Parameters::new()).with_max_retries(0);
        assert!(!policy.should_retry(&env));
    }

    #[tokio::test]
    async fn test_immediate_does_not_sleep() {
        let start = Instant::now();
        RetryPolicy::immediate().wait().await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_wait_uses_backoff() {
        let policy = RetryPolicy::new(3, Duration::from_millis(30));
        let start = Instant::now();
        policy.wait().await;
        assert!(start.elapsed() >= Duration::from_millis(30));
    }
}
