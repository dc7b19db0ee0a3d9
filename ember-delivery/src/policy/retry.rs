//! Retry policy for failed sends.
//!
//! Backoff follows a fixed schedule indexed by the send's retry count rather
//! than a formula, and provider throttling uses its own short delay.

use std::time::Duration;

use ember_store::PauseReason;
use serde::{Deserialize, Serialize};

use crate::error::TransportError;

/// What the per-send worker does after a provider failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Mark the send failed and never retry it
    Fail,
    /// Pause the campaign and mark the send failed without a retry
    PauseCampaign(PauseReason),
    /// Mark the send failed and retry after `delay`
    Retry { delay: Duration },
}

/// Retry policy configuration for failed sends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Number of failed attempts after which a send is abandoned.
    ///
    /// Default: 5
    #[serde(default = "defaults::max_retries")]
    pub max_retries: u8,

    /// Backoff delays (in seconds) indexed by retry count; the last entry
    /// is used for every later attempt.
    ///
    /// Default: 5m, 15m, 30m, 1h, 2h
    #[serde(default = "defaults::schedule_secs")]
    pub schedule_secs: Vec<u64>,

    /// Fixed delay (in seconds) after the provider throttles a send.
    ///
    /// Default: 300 seconds (5 minutes)
    #[serde(default = "defaults::throttle_delay_secs")]
    pub throttle_delay_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: defaults::max_retries(),
            schedule_secs: defaults::schedule_secs(),
            throttle_delay_secs: defaults::throttle_delay_secs(),
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if another retry should be attempted based on the retry count.
    #[must_use]
    pub const fn should_retry(&self, retry_count: u8) -> bool {
        retry_count < self.max_retries
    }

    /// Delay before the next attempt of a send that has failed `retry_count`
    /// times so far.
    #[must_use]
    pub fn backoff_for(&self, retry_count: u8) -> Duration {
        let index = usize::from(retry_count);
        self.schedule_secs
            .get(index)
            .or_else(|| self.schedule_secs.last())
            .map_or(Duration::from_secs(defaults::LAST_RESORT_SECS), |secs| {
                Duration::from_secs(*secs)
            })
    }

    #[must_use]
    pub const fn throttle_delay(&self) -> Duration {
        Duration::from_secs(self.throttle_delay_secs)
    }

    /// Classify a provider failure.
    #[must_use]
    pub fn action_for(&self, error: &TransportError, retry_count: u8) -> FailureAction {
        match error {
            TransportError::MessageRejected(_) => FailureAction::Fail,
            TransportError::Configuration(_) => {
                FailureAction::PauseCampaign(PauseReason::ConfigurationError)
            }
            TransportError::AccountSendingPaused(_) => {
                FailureAction::PauseCampaign(PauseReason::AccountPaused)
            }
            TransportError::Throttled(_) => FailureAction::Retry {
                delay: self.throttle_delay(),
            },
            TransportError::Transient(_) => FailureAction::Retry {
                delay: self.backoff_for(retry_count),
            },
        }
    }

    /// Get the number of remaining retry attempts.
    #[must_use]
    pub const fn remaining_attempts(&self, retry_count: u8) -> u8 {
        self.max_retries.saturating_sub(retry_count)
    }
}

mod defaults {
    pub const LAST_RESORT_SECS: u64 = 2 * 60 * 60;

    pub const fn max_retries() -> u8 {
        5
    }

    pub fn schedule_secs() -> Vec<u64> {
        vec![5 * 60, 15 * 60, 30 * 60, 60 * 60, LAST_RESORT_SECS]
    }

    pub const fn throttle_delay_secs() -> u64 {
        300 // 5 minutes
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const MINUTE: u64 = 60;

    #[test]
    fn test_backoff_schedule() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.backoff_for(0), Duration::from_secs(5 * MINUTE));
        assert_eq!(policy.backoff_for(1), Duration::from_secs(15 * MINUTE));
        assert_eq!(policy.backoff_for(2), Duration::from_secs(30 * MINUTE));
        assert_eq!(policy.backoff_for(3), Duration::from_secs(60 * MINUTE));
        assert_eq!(policy.backoff_for(4), Duration::from_secs(120 * MINUTE));
        assert_eq!(policy.backoff_for(9), Duration::from_secs(120 * MINUTE));
    }

    #[test]
    fn test_should_retry() {
        let policy = RetryPolicy::default();

        assert!(policy.should_retry(0));
        assert!(policy.should_retry(4));
        assert!(!policy.should_retry(5));
        assert_eq!(policy.remaining_attempts(2), 3);
        assert_eq!(policy.remaining_attempts(7), 0);
    }

    #[test]
    fn test_failure_actions() {
        let policy = RetryPolicy::default();
        let reason = String::from("x");

        assert_eq!(
            policy.action_for(&TransportError::MessageRejected(reason.clone()), 0),
            FailureAction::Fail
        );
        assert_eq!(
            policy.action_for(&TransportError::Configuration(reason.clone()), 0),
            FailureAction::PauseCampaign(PauseReason::ConfigurationError)
        );
        assert_eq!(
            policy.action_for(&TransportError::AccountSendingPaused(reason.clone()), 0),
            FailureAction::PauseCampaign(PauseReason::AccountPaused)
        );
        // throttling ignores the general schedule
        assert_eq!(
            policy.action_for(&TransportError::Throttled(reason.clone()), 3),
            FailureAction::Retry {
                delay: Duration::from_secs(5 * MINUTE)
            }
        );
        assert_eq!(
            policy.action_for(&TransportError::Transient(reason), 2),
            FailureAction::Retry {
                delay: Duration::from_secs(30 * MINUTE)
            }
        );
    }

    #[test]
    fn test_empty_schedule_falls_back() {
        let policy = RetryPolicy {
            schedule_secs: Vec::new(),
            ..RetryPolicy::default()
        };
        assert_eq!(policy.backoff_for(0), Duration::from_secs(2 * 60 * MINUTE));
    }

    #[test]
    fn test_deserialize_partial_config() {
        let policy: RetryPolicy = ron::from_str("(max_retries: 3)").unwrap_or_default();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.schedule_secs.len(), 5);
    }
}
