//! Retry policy for protocol commands.
//!
//! Early timeouts on the instrument link are usually transient (the board is
//! busy finishing a long acquisition), so every retry quadruples the reply
//! budget: attempt *k* waits `base * 4^(k-1)`. Between attempts the link is
//! closed, left alone for `reconnect_delay`, and reopened.

use crate::config::{NoResponseAction, SerialSettings};
use std::time::Duration;

/// Growth factor applied to the reply budget on every retry.
pub const TIMEOUT_GROWTH: u32 = 4;

/// Defines a policy for retrying a command.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// The maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Pause between closing and reopening the link before a retry.
    pub reconnect_delay: Duration,
    /// What to do once every attempt has failed.
    pub on_exhausted: NoResponseAction,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&SerialSettings::default())
    }
}

/// What the engine should do after an attempt failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Reconnect and run `next_attempt`.
    Retry { next_attempt: u32 },
    /// Every attempt is spent; apply `on_exhausted`.
    GiveUp,
}

impl RetryPolicy {
    pub fn from_settings(settings: &SerialSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            reconnect_delay: settings.reconnect_delay(),
            on_exhausted: settings.on_no_response_action,
        }
    }

    /// Reply budget for a 1-based attempt number.
    pub fn timeout_for_attempt(&self, base: Duration, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = TIMEOUT_GROWTH.saturating_pow(exponent);
        base.saturating_mul(factor)
    }

    /// Decide whether a failed attempt gets another try.
    pub fn after_failure(&self, attempt: u32) -> RetryDecision {
        if attempt < self.max_attempts {
            RetryDecision::Retry {
                next_attempt: attempt + 1,
            }
        } else {
            RetryDecision::GiveUp
        }
    }

    /// Upper bound on time spent waiting for replies plus reconnect pauses
    /// across every attempt of one command.
    pub fn worst_case_wait(&self, base: Duration) -> Duration {
        let replies = (1..=self.max_attempts)
            .map(|attempt| self.timeout_for_attempt(base, attempt))
            .fold(Duration::ZERO, Duration::saturating_add);
        let pauses = self
            .reconnect_delay
            .saturating_mul(self.max_attempts.saturating_sub(1));
        replies.saturating_add(pauses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            reconnect_delay: Duration::from_millis(10),
            on_exhausted: NoResponseAction::Retry,
        }
    }

    #[test]
    fn test_timeout_quadruples() {
        let policy = policy(4);
        let base = Duration::from_millis(100);
        assert_eq!(policy.timeout_for_attempt(base, 1), base);
        assert_eq!(policy.timeout_for_attempt(base, 2), Duration::from_millis(400));
        assert_eq!(policy.timeout_for_attempt(base, 3), Duration::from_millis(1600));
        assert_eq!(policy.timeout_for_attempt(base, 4), Duration::from_millis(6400));
    }

    #[test]
    fn test_retry_until_budget_spent() {
        let policy = policy(3);
        assert_eq!(
            policy.after_failure(1),
            RetryDecision::Retry { next_attempt: 2 }
        );
        assert_eq!(
            policy.after_failure(2),
            RetryDecision::Retry { next_attempt: 3 }
        );
        assert_eq!(policy.after_failure(3), RetryDecision::GiveUp);
    }

    #[test]
    fn test_single_attempt_never_retries() {
        assert_eq!(policy(1).after_failure(1), RetryDecision::GiveUp);
    }

    #[test]
    fn test_worst_case_wait() {
        let policy = policy(3);
        // 100 + 400 + 1600 ms of replies, two 10 ms reconnect pauses
        assert_eq!(
            policy.worst_case_wait(Duration::from_millis(100)),
            Duration::from_millis(2120)
        );
    }

    #[test]
    fn test_from_settings_clamps_attempts() {
        let settings = SerialSettings {
            max_attempts: 0,
            ..SerialSettings::default()
        };
        assert_eq!(RetryPolicy::from_settings(&settings).max_attempts, 1);
    }
}
