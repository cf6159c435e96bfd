//! Sliding-window request rate limiting.
//!
//! The exchange allows a fixed number of authenticated requests in any
//! trailing window. The limiter enforces that quota locally, before any
//! network I/O, instead of reacting to 429s.

use crate::utils::Clock;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Default quota: 60 requests per trailing 70 seconds.
pub const DEFAULT_MAX_REQUESTS: usize = 60;
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(70);

/// Admits at most `max_requests` in any trailing `interval`.
pub struct RateLimiter {
    max_requests: usize,
    interval: chrono::Duration,
    timestamps: Mutex<VecDeque<DateTime<Utc>>>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(max_requests: usize, interval: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            max_requests: max_requests.max(1),
            interval: chrono::Duration::from_std(interval)
                .unwrap_or_else(|_| chrono::Duration::days(36_500)),
            timestamps: Mutex::new(VecDeque::with_capacity(max_requests)),
            clock,
        }
    }

    /// Wait until the window admits one more request, then record it.
    ///
    /// The window lock is held across the wait so concurrent callers are
    /// admitted one at a time.
    pub async fn acquire(&self) {
        let mut timestamps = self.timestamps.lock().await;
        loop {
            let expire = self.clock.now() - self.interval;
            while timestamps.front().is_some_and(|oldest| *oldest < expire) {
                timestamps.pop_front();
            }

            if timestamps.len() < self.max_requests {
                break;
            }

            let Some(oldest) = timestamps.front().copied() else {
                break;
            };
            // Sleep until the oldest entry drops out; the loop re-checks in case of rounding.
            let delay = (oldest - expire)
                .to_std()
                .unwrap_or(Duration::ZERO)
                .max(Duration::from_millis(1));
            warn!(
                delay_ms = delay.as_millis() as u64,
                in_window = timestamps.len(),
                max_requests = self.max_requests,
                "Request rate limit hit, waiting"
            );
            self.clock.sleep(delay).await;
        }

        let now = self.clock.now();
        timestamps.push_back(now);
        debug!(in_window = timestamps.len(), "Rate limiter slot acquired");
    }

    /// Number of admissions currently tracked in the window.
    pub async fn in_window(&self) -> usize {
        let expire = self.clock.now() - self.interval;
        self.timestamps
            .lock()
            .await
            .iter()
            .filter(|t| **t >= expire)
            .count()
    }

    /// Snapshot of tracked admission times, oldest first.
    pub async fn timestamps(&self) -> Vec<DateTime<Utc>> {
        self.timestamps.lock().await.iter().copied().collect()
    }
}
