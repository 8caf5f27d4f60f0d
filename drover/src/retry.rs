use std::time::Duration;

use crate::config::Configuration;

/// Exponential backoff for transport retries (fetch and settle).
#[derive(Clone, Debug)]
pub struct Backoff {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            failures: 0,
        }
    }

    /// Transport retry backoff from `fetch_backoff_ms` / `max_fetch_backoff_ms`.
    pub fn from_config(config: &Configuration) -> Self {
        Self::new(
            Duration::from_millis(config.fetch_backoff_ms),
            Duration::from_millis(config.max_fetch_backoff_ms),
        )
    }

    /// Delay for the given consecutive failure count.
    ///
    /// Formula: min(base * 2^(failures - 1), max); zero failures wait zero.
    pub fn delay_for(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }

        let exp = failures.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Record a failure and return how long to wait before retrying.
    pub fn next_delay(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        self.delay_for(self.failures)
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }
}
