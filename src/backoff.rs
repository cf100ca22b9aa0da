//! Reconnect backoff owned by the watch loop.

use rand::Rng;
use std::time::Duration;

/// Parameters of the reconnect backoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Delay after the first failure.
    pub base: Duration,
    /// Upper bound on any delay.
    pub max: Duration,
    /// Growth factor applied per consecutive failure.
    pub factor: u32,
    /// Adds up to 10% random extra delay, still capped at `max`.
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            max: Duration::from_secs(300),
            factor: 2,
            jitter: false,
        }
    }
}

/// Exponential backoff state: retry count and the next delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    retries: u32,
    next: Duration,
}

impl Backoff {
    /// Creates a backoff with zero retries.
    #[must_use]
    pub fn new(config: BackoffConfig) -> Self {
        let next = config.base.min(config.max);
        Self {
            config,
            retries: 0,
            next,
        }
    }

    /// Records a failure and returns the delay to wait before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        self.retries = self.retries.saturating_add(1);
        let current = self.next;
        self.next = current
            .saturating_mul(self.config.factor)
            .min(self.config.max);

        if self.config.jitter {
            let spread = u64::try_from(current.as_millis() / 10).unwrap_or(u64::MAX);
            let extra = Duration::from_millis(rand::thread_rng().gen_range(0..=spread));
            current.saturating_add(extra).min(self.config.max)
        } else {
            current
        }
    }

    /// Clears the failure streak after a successful connection.
    pub fn reset(&mut self) {
        self.retries = 0;
        self.next = self.config.base.min(self.config.max);
    }

    /// Number of consecutive failures recorded since the last reset.
    #[must_use]
    pub fn retries(&self) -> u32 {
        self.retries
    }
}
