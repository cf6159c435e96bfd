//! Exponential backoff for transient request failures.

use std::time::Duration;

/// Delay schedule for retrying transient failures.
///
/// The default matches the exchange client's historical behaviour: `2^n`
/// seconds before retry `n`, with no cap on the number of attempts or on the
/// delay, so an exchange outage stalls the bot instead of stopping it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Give up after this many retries (None = retry forever)
    pub max_retries: Option<u32>,
    /// Upper bound on a single delay (None = uncapped)
    pub max_delay: Option<Duration>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_retries: None,
            max_delay: None,
        }
    }
}

impl BackoffPolicy {
    /// Delay to wait before retry number `retry_count` (zero-based).
    pub fn delay(&self, retry_count: u32) -> Duration {
        let factor = 2u32.checked_pow(retry_count).unwrap_or(u32::MAX);
        let delay = self
            .base_delay
            .checked_mul(factor)
            .unwrap_or(Duration::MAX);
        match self.max_delay {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }

    /// Whether another retry is allowed after `retry_count` retries already happened.
    pub fn should_retry(&self, retry_count: u32) -> bool {
        self.max_retries.map_or(true, |max| retry_count < max)
    }
}
