//! Reconnection Policy
//!
//! Bounded retry at a fixed delay. The attempt budget resets whenever the
//! connection reaches Streaming; running out of attempts is terminal.

use std::time::Duration;

/// Configuration for reconnection behavior.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectConfig {
    /// Delay before every reconnection attempt.
    pub delay: Duration,
    /// Attempts allowed before giving up.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(5),
            max_attempts: 10,
        }
    }
}

impl ReconnectConfig {
    /// Create a configuration with the given delay and budget.
    #[must_use]
    pub const fn fixed(delay: Duration, max_attempts: u32) -> Self {
        Self {
            delay,
            max_attempts,
        }
    }
}

/// Fixed-delay reconnection policy with an attempt budget.
#[derive(Debug)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    attempt_count: u32,
}

impl ReconnectPolicy {
    /// Create a new reconnection policy.
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempt_count: 0,
        }
    }

    /// Delay before the next attempt, or `None` once the budget is spent.
    #[must_use]
    pub const fn next_delay(&mut self) -> Option<Duration> {
        if !self.should_retry() {
            return None;
        }

        self.attempt_count += 1;
        Some(self.config.delay)
    }

    /// Reset the policy after reaching Streaming.
    pub const fn reset(&mut self) {
        self.attempt_count = 0;
    }

    /// Attempts used since the last reset.
    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Attempt budget.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Check if reconnection should continue.
    #[must_use]
    pub const fn should_retry(&self) -> bool {
        self.attempt_count < self.config.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = ReconnectConfig::default();
        assert_eq!(config.delay, Duration::from_secs(5));
        assert_eq!(config.max_attempts, 10);
    }

    #[test]
    fn delay_is_fixed() {
        let mut policy = ReconnectPolicy::new(ReconnectConfig::fixed(Duration::from_millis(250), 3));

        assert_eq!(policy.next_delay(), Some(Duration::from_millis(250)));
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(250)));
        assert_eq!(policy.attempt_count(), 2);
    }

    #[test]
    fn budget_is_bounded() {
        let mut policy = ReconnectPolicy::new(ReconnectConfig::fixed(Duration::from_millis(1), 2));

        assert!(policy.next_delay().is_some());
        assert!(policy.next_delay().is_some());
        assert!(policy.next_delay().is_none());
        assert!(!policy.should_retry());
    }

    #[test]
    fn zero_budget_never_retries() {
        let mut policy = ReconnectPolicy::new(ReconnectConfig::fixed(Duration::from_millis(1), 0));
        assert!(policy.next_delay().is_none());
    }

    #[test]
    fn reset_restores_budget() {
        let mut policy = ReconnectPolicy::new(ReconnectConfig::fixed(Duration::from_millis(1), 1));
        assert!(policy.next_delay().is_some());
        assert!(policy.next_delay().is_none());

        policy.reset();

        assert_eq!(policy.attempt_count(), 0);
        assert!(policy.next_delay().is_some());
    }
}
