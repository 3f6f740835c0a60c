//! Exponential backoff policy shared by both delivery pipelines.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain_types::{BackoffFactor, MaxAttempts};

/// Retry schedule: `initial * factor^(n-1)` after the n-th failure, capped,
/// with a bounded total number of attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the second attempt.
    pub initial: Duration,
    /// Multiplier applied per subsequent failure.
    pub factor: BackoffFactor,
    /// Upper bound on any single delay.
    pub cap: Duration,
    /// Total attempts before the task is handed to the permanent-failure
    /// handler.
    pub max_attempts: MaxAttempts,
}

impl RetryPolicy {
    /// Inbox dispatch schedule: 1 minute doubling up to 3 days, 10 attempts.
    #[must_use]
    pub fn inbound_default() -> Self {
        Self {
            initial: Duration::from_secs(60),
            factor: BackoffFactor::default(),
            cap: Duration::from_secs(3 * 24 * 60 * 60),
            max_attempts: MaxAttempts::default(),
        }
    }

    /// Outbound delivery uses the same schedule as inbox dispatch.
    #[must_use]
    pub fn outbound_default() -> Self {
        Self::inbound_default()
    }

    /// Delay before the next attempt once `attempts_made` have failed, or
    /// `None` when the attempt budget is exhausted.
    #[must_use]
    pub fn delay_after(&self, attempts_made: u32) -> Option<Duration> {
        if attempts_made >= self.max_attempts.as_u32() {
            return None;
        }
        let exponent = attempts_made.saturating_sub(1);
        let factor = self.factor.as_f64().powi(exponent.min(1_000) as i32);
        let delay = self.initial.as_secs_f64() * factor;
        if !delay.is_finite() || delay >= self.cap.as_secs_f64() {
            Some(self.cap)
        } else {
            Some(Duration::from_secs_f64(delay))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_from_the_initial_delay() {
        let policy = RetryPolicy::inbound_default();
        assert_eq!(policy.delay_after(1), Some(Duration::from_secs(60)));
        assert_eq!(policy.delay_after(2), Some(Duration::from_secs(120)));
        assert_eq!(policy.delay_after(3), Some(Duration::from_secs(240)));
    }

    #[test]
    fn caps_long_delays() {
        let policy = RetryPolicy {
            max_attempts: MaxAttempts::try_new(50).unwrap(),
            ..RetryPolicy::inbound_default()
        };
        assert_eq!(
            policy.delay_after(30),
            Some(Duration::from_secs(3 * 24 * 60 * 60))
        );
    }

    #[test]
    fn exhausts_after_max_attempts() {
        let policy = RetryPolicy::inbound_default();
        assert!(policy.delay_after(9).is_some());
        assert_eq!(policy.delay_after(10), None);
        assert_eq!(policy.delay_after(11), None);
    }
}
