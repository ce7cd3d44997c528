use crate::error::SendError;
use std::time::Duration;

/// Exponential backoff for outbound delivery.
///
/// `max_attempts` counts every attempt including the first one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: max_delay.max(base_delay),
        }
    }

    /// Backoff after `failed_attempts` consecutive failures: base, 2·base, 4·base...
    pub fn backoff(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Wait before the next attempt. A channel-supplied hint wins over the
    /// computed backoff but is still capped.
    pub fn delay_after(&self, failed_attempts: u32, error: &SendError) -> Duration {
        match error {
            SendError::RateLimited {
                retry_after: Some(hint),
            } => (*hint).min(self.max_delay),
            _ => self.backoff(failed_attempts),
        }
    }

    pub fn should_retry(&self, attempts_made: u32, error: &SendError) -> bool {
        error.is_retryable() && attempts_made < self.max_attempts
    }
}
