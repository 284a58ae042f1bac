//! Retry policy for farm unit attempts
//!
//! Farm work retries with a fixed delay between attempts, rotating the
//! proxy when the failure looks network-shaped. Business-rule rejections
//! from the task service never warrant a retry.

use std::time::Duration;

use tracing::debug;

use crate::config::RetryConfig;
use crate::error::{Error, FailureClass};

/// Decisions the attempt loop takes between failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Swap the proxy, wait the fixed delay, try again
    RotateAndRetry,
    /// Keep the proxy, wait the fixed delay, try again
    Retry,
    /// Stop attempting this unit for the current cycle
    GiveUp,
}

/// Fixed-delay retry policy derived from configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
    pub proxy_rotation: bool,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_farm_attempts,
            delay: Duration::from_secs(config.delay_seconds),
            proxy_rotation: config.proxy_rotation,
        }
    }

    /// Decide what to do after a failed attempt.
    ///
    /// `attempt` is 1-based; once it reaches `max_attempts` the unit is
    /// abandoned regardless of the error class.
    pub fn decide(&self, attempt: u32, error: &Error) -> RetryDecision {
        match error.class() {
            FailureClass::NonRotatable | FailureClass::Fatal => RetryDecision::GiveUp,
            FailureClass::Rotatable if attempt >= self.max_attempts => RetryDecision::GiveUp,
            FailureClass::Rotatable if self.proxy_rotation => RetryDecision::RotateAndRetry,
            FailureClass::Rotatable => RetryDecision::Retry,
        }
    }

    /// Sleep the fixed inter-attempt delay.
    pub async fn wait(&self, attempt: u32) {
        debug!(attempt, delay_ms = self.delay.as_millis() as u64, "Waiting before retry");
        tokio::time::sleep(self.delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ApiError;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            delay: Duration::from_millis(1),
            proxy_rotation: true,
        }
    }

    #[test]
    fn test_transport_error_rotates() {
        let err = Error::Transport("connection refused by upstream".into());
        assert_eq!(policy().decide(1, &err), RetryDecision::RotateAndRetry);
    }

    #[test]
    fn test_business_error_gives_up() {
        let err = Error::Api(ApiError::new("user is logged out"));
        assert_eq!(policy().decide(1, &err), RetryDecision::GiveUp);
    }

    #[test]
    fn test_exhaustion_gives_up() {
        let err = Error::Transport("connection refused by upstream".into());
        assert_eq!(policy().decide(3, &err), RetryDecision::GiveUp);
    }

    #[test]
    fn test_rotation_disabled_plain_retry() {
        let mut p = policy();
        p.proxy_rotation = false;
        let err = Error::Transport("proxy connection timed out".into());
        assert_eq!(p.decide(1, &err), RetryDecision::Retry);
    }
}
