//! Exponential backoff for transient job failures.

use std::time::Duration;

use crate::config::OrchestratorConfig;

/// Retry schedule: `base * 2^(attempt - 1)`, capped at `max_delay`, for at
/// most `max_retries` attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(240),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: config.retry_base_delay,
            max_delay: config.retry_max_delay,
        }
    }

    /// Delay before retry number `attempt` (1-based), or `None` once the
    /// retries are exhausted.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_retries {
            return None;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        let delay = self
            .base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay);
        Some(delay.min(self.max_delay))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_schedule_is_one_two_four_minutes() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Some(Duration::from_secs(60)));
        assert_eq!(policy.delay_for(2), Some(Duration::from_secs(120)));
        assert_eq!(policy.delay_for(3), Some(Duration::from_secs(240)));
        assert_eq!(policy.delay_for(4), None);
        assert_eq!(policy.delay_for(0), None);
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy {
            max_retries: 40,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        };
        assert_eq!(policy.delay_for(3), Some(Duration::from_secs(4)));
        assert_eq!(policy.delay_for(5), Some(Duration::from_secs(10)));
        assert_eq!(policy.delay_for(40), Some(Duration::from_secs(10)));
    }
}
