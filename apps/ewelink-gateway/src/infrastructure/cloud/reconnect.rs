//! Reconnection Policy
//!
//! Capped exponential backoff for cloud session retries. Retry `k`
//! (zero-based) waits `min(initial * multiplier^k, max)`, without jitter.

use std::time::Duration;

use crate::infrastructure::config::ReconnectSettings;

/// Backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Ceiling for any single delay.
    pub max_delay: Duration,
    /// Growth factor between consecutive retries.
    pub multiplier: f64,
    /// Consecutive retries allowed (0 = unlimited).
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self::from_settings(&ReconnectSettings::default())
    }
}

impl ReconnectConfig {
    /// Take the backoff parameters from `ReconnectSettings`.
    #[must_use]
    pub const fn from_settings(settings: &ReconnectSettings) -> Self {
        Self {
            initial_delay: settings.delay_initial,
            max_delay: settings.delay_max,
            multiplier: settings.delay_multiplier,
            max_attempts: settings.max_attempts,
        }
    }

    /// Delay for zero-based retry `attempt`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let factor = self.multiplier.max(0.0).powi(exponent);
        let scaled = self.initial_delay.as_secs_f64() * factor;
        if !scaled.is_finite() || scaled >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(scaled).min(self.max_delay)
    }
}

/// Counts consecutive retries of one session cycle.
#[derive(Debug)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    attempt_count: u32,
}

impl ReconnectPolicy {
    /// Start a fresh retry count.
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempt_count: 0,
        }
    }

    /// Claim the next retry and return how long to wait before it.
    ///
    /// Returns `None` once the retry budget is spent.
    #[must_use]
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.should_retry() {
            return None;
        }
        let delay = self.config.delay_for(self.attempt_count);
        self.attempt_count += 1;
        Some(delay)
    }

    /// Forget past retries. Called when the cloud accepts a registration.
    pub const fn reset(&mut self) {
        self.attempt_count = 0;
    }

    /// Retries claimed since the last reset.
    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Whether another retry is allowed.
    #[must_use]
    pub const fn should_retry(&self) -> bool {
        self.config.max_attempts == 0 || self.attempt_count < self.config.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test]
    fn default_schedule_has_five_retries() {
        let mut policy = ReconnectPolicy::new(ReconnectConfig::default());
        let delays: Vec<u64> = std::iter::from_fn(|| policy.next_delay())
            .map(|d| d.as_secs())
            .collect();

        assert_eq!(delays, vec![5, 10, 20, 40, 60]);
        assert!(!policy.should_retry());
        assert!(policy.next_delay().is_none());
    }

    #[test_case(0, 5)]
    #[test_case(1, 10)]
    #[test_case(3, 40)]
    #[test_case(4, 60)]
    #[test_case(30, 60)]
    fn delay_for_attempt(attempt: u32, expected_secs: u64) {
        let config = ReconnectConfig::default();
        assert_eq!(config.delay_for(attempt), Duration::from_secs(expected_secs));
    }

    #[test]
    fn reset_restarts_schedule() {
        let mut policy = ReconnectPolicy::new(ReconnectConfig::default());
        let _ = policy.next_delay();
        let _ = policy.next_delay();
        assert_eq!(policy.attempt_count(), 2);

        policy.reset();
        assert_eq!(policy.attempt_count(), 0);
        assert_eq!(policy.next_delay(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn initial_delay_above_max_is_capped() {
        let config = ReconnectConfig {
            initial_delay: Duration::from_secs(120),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            max_attempts: 0,
        };
        assert_eq!(config.delay_for(0), Duration::from_secs(60));
    }

    #[test]
    fn sub_second_delays_keep_precision() {
        let config = ReconnectConfig {
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(200),
            multiplier: 2.0,
            max_attempts: 3,
        };
        assert_eq!(config.delay_for(1), Duration::from_millis(100));
        assert_eq!(config.delay_for(3), Duration::from_millis(200));
    }

    #[test]
    fn zero_max_attempts_never_gives_up() {
        let mut policy = ReconnectPolicy::new(ReconnectConfig {
            max_attempts: 0,
            ..Default::default()
        });
        for _ in 0..100 {
            assert!(policy.next_delay().is_some());
        }
    }
}
