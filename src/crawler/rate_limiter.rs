//! Process-wide pacing of outbound requests
//!
//! Every request to the target site passes through one [`RateLimiter`]
//! clock, regardless of host, page or run. Waiters are served in arrival
//! order and there is no burst credit: the next release is measured from the
//! previous release, never from an idle period.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Enforces a minimum spacing between consecutive `acquire` returns
#[derive(Debug, Clone)]
pub struct RateLimiter {
    interval: Duration,
    last_release: Arc<Mutex<Option<Instant>>>,
}

impl RateLimiter {
    /// Creates a limiter with its own clock
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_release: Arc::new(Mutex::new(None)),
        }
    }

    /// Returns a limiter with a different spacing that shares this clock
    ///
    /// Used to apply each run's configured interval without resetting the
    /// process-wide release history.
    pub fn with_interval(&self, interval: Duration) -> Self {
        Self {
            interval,
            last_release: Arc::clone(&self.last_release),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Blocks until at least `interval` has elapsed since the previous release
    pub async fn acquire(&self) {
        // The lock is held across the sleep so waiters queue behind each other
        let mut last = self.last_release.lock().await;

        if let Some(prev) = *last {
            let ready_at = prev + self.interval;
            if ready_at > Instant::now() {
                tracing::trace!("Rate limiter waiting {:?}", ready_at - Instant::now());
                tokio::time::sleep_until(ready_at).await;
            }
        }

        *last = Some(Instant::now());
    }
}
