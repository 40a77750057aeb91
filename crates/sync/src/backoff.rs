//! Exponential retry backoff with jitter.

use std::time::Duration;

use rand::Rng;

use crate::config::BackoffConfig;

/// Tracks consecutive failures and the delay before the next attempt.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    consecutive_failures: u32,
    last_delay: Option<Duration>,
}

impl Backoff {
    /// Create a backoff with no failures recorded.
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            consecutive_failures: 0,
            last_delay: None,
        }
    }

    /// Un-jittered delay after `failures` consecutive failures.
    ///
    /// `initial * multiplier^(failures - 1)`, capped at `max`. Zero failures
    /// means no delay.
    pub fn base_delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        if self.config.multiplier <= 1 || self.config.initial.is_zero() {
            return self.config.initial.min(self.config.max);
        }
        let mut delay = self.config.initial;
        for _ in 1..failures {
            delay = delay.saturating_mul(self.config.multiplier);
            if delay >= self.config.max {
                return self.config.max;
            }
        }
        delay.min(self.config.max)
    }

    /// Delay after `failures` consecutive failures, jittered within
    /// `[d/2, d]` when jitter is enabled.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let base = self.base_delay(failures);
        if !self.config.jitter || base.is_zero() {
            return base;
        }
        let millis = base.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(millis / 2..=millis))
    }

    /// Record a failure and return the delay before the next attempt.
    pub fn record_failure(&mut self) -> Duration {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let delay = self.delay_for(self.consecutive_failures);
        self.last_delay = Some(delay);
        delay
    }

    /// Record a success, resetting the failure count.
    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.last_delay = None;
    }

    /// Delay chosen at the last failure, `None` after a success.
    pub fn last_delay(&self) -> Option<Duration> {
        self.last_delay
    }

    /// Failures since the last success.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed() -> Backoff {
        Backoff::new(BackoffConfig::default().with_jitter(false))
    }

    #[test]
    fn doubles_from_two_seconds() {
        let backoff = fixed();
        assert_eq!(backoff.base_delay(0), Duration::ZERO);
        assert_eq!(backoff.base_delay(1), Duration::from_secs(2));
        assert_eq!(backoff.base_delay(2), Duration::from_secs(4));
        assert_eq!(backoff.base_delay(3), Duration::from_secs(8));
    }

    #[test]
    fn caps_at_five_minutes() {
        let backoff = fixed();
        assert_eq!(backoff.base_delay(9), Duration::from_secs(300));
        assert_eq!(backoff.base_delay(u32::MAX), Duration::from_secs(300));
    }

    #[test]
    fn jitter_stays_within_half_to_full_delay() {
        let backoff = Backoff::new(BackoffConfig::default());
        for failures in 1..12 {
            let base = backoff.base_delay(failures);
            let delay = backoff.delay_for(failures);
            assert!(delay >= base / 2 && delay <= base, "{delay:?} outside [{:?}, {base:?}]", base / 2);
        }
    }

    #[test]
    fn success_resets_failures() {
        let mut backoff = fixed();
        backoff.record_failure();
        assert_eq!(backoff.record_failure(), Duration::from_secs(4));
        assert_eq!(backoff.last_delay(), Some(Duration::from_secs(4)));
        backoff.record_success();
        assert_eq!(backoff.consecutive_failures(), 0);
        assert_eq!(backoff.last_delay(), None);
        assert_eq!(backoff.record_failure(), Duration::from_secs(2));
    }
}
