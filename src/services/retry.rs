//! Retry budget and exponential backoff for queued work.

use std::time::Duration;

/// Backoff configuration for retryable work.
///
/// Transient failures are retried with exponentially growing delays until
/// `max_attempts` is spent; conditional failures are held for
/// `hold_delay` and do not spend the budget.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    pub max_attempts: u32,
    pub hold_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::uploads()
    }
}

impl RetryPolicy {
    /// Five attempts, 2s initial delay doubling up to 5 minutes.
    #[must_use]
    pub fn uploads() -> Self {
        Self {
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(300),
            factor: 2.0,
            max_attempts: 5,
            hold_delay: Duration::from_secs(30),
        }
    }

    /// Fast retry for tests (minimal delays)
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
            max_attempts: 5,
            hold_delay: Duration::from_millis(5),
        }
    }

    /// Delay before the retry that follows failed attempt number `attempt` (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let delay = self.initial_delay.mul_f64(self.factor.powi(exponent));
        delay.min(self.max_delay)
    }

    /// True once `attempts` failures have used up the budget.
    #[must_use]
    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}
