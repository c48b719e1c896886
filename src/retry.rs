//! Reconnect backoff policy.
//!
//! The stream worker asks this policy how long to wait before each
//! reconnection attempt. The computation is pure so the ladder can be tested
//! without real network timing.

use std::time::Duration;

/// Policy controlling stream reconnection attempts and linear backoff.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReconnectPolicy {
    /// Delay unit; attempt `n` waits `base_delay * n`.
    pub base_delay: Duration,
    /// Maximum number of reconnection attempts after a connection error.
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    /// Default delay unit between reconnection attempts.
    pub const BASE_DELAY: Duration = Duration::from_secs(1);
    /// Default ceiling on consecutive reconnection attempts.
    pub const MAX_ATTEMPTS: u32 = 5;

    /// Computes the delay to wait before the given reconnection attempt.
    ///
    /// `attempt` is 1-based. Returns `None` once `attempt` exceeds
    /// `max_attempts`, meaning no further attempt may be scheduled.
    pub fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        Some(self.base_delay.saturating_mul(attempt))
    }

    /// Sum of every delay on the ladder, i.e. the longest a client can spend
    /// waiting before it gives up.
    pub fn total_delay(&self) -> Duration {
        (1..=self.max_attempts)
            .filter_map(|attempt| self.delay_for_attempt(attempt))
            .fold(Duration::ZERO, Duration::saturating_add)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Self::BASE_DELAY,
            max_attempts: Self::MAX_ATTEMPTS,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::ReconnectPolicy;

    #[test]
    fn delays_grow_linearly_with_attempt() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for_attempt(1), Some(Duration::from_secs(1)));
        assert_eq!(policy.delay_for_attempt(2), Some(Duration::from_secs(2)));
        assert_eq!(policy.delay_for_attempt(5), Some(Duration::from_secs(5)));
    }

    #[test]
    fn no_delay_past_the_attempt_ceiling() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for_attempt(6), None);
        assert_eq!(policy.delay_for_attempt(0), None);
    }

    #[test]
    fn total_delay_sums_the_ladder() {
        let policy = ReconnectPolicy {
            base_delay: Duration::from_millis(100),
            max_attempts: 3,
        };
        assert_eq!(policy.total_delay(), Duration::from_millis(600));
    }

    #[test]
    fn zero_attempts_never_schedules() {
        let policy = ReconnectPolicy {
            base_delay: Duration::from_millis(10),
            max_attempts: 0,
        };
        assert_eq!(policy.delay_for_attempt(1), None);
        assert_eq!(policy.total_delay(), Duration::ZERO);
    }
}
