//! Per-endpoint token buckets.
//!
//! Buckets live behind one mutex; the lock is never held across an await.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use fenceref_types::{RateLimit, ResolveError};
use tokio::time::Instant;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(limit: &RateLimit, now: Instant) -> Self {
        let capacity = f64::from(limit.capacity());
        Self {
            tokens: capacity,
            capacity,
            refill_per_sec: f64::from(limit.requests_per_second.max(1)),
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Take a token, or report how long until one is available.
    fn try_take(&mut self, now: Instant) -> Result<(), Duration> {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            Err(Duration::from_secs_f64((1.0 - self.tokens) / self.refill_per_sec))
        }
    }
}

#[derive(Debug, Default)]
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for a token from `service`'s bucket.
    ///
    /// Under the queue policy this waits at most `limit.max_wait()` in total;
    /// under the fail policy an empty bucket fails immediately.
    pub async fn acquire(&self, service: &str, limit: &RateLimit) -> Result<(), ResolveError> {
        let started = Instant::now();
        let budget = limit.max_wait();

        loop {
            let now = Instant::now();
            let wait = {
                let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
                let bucket = buckets
                    .entry(service.to_string())
                    .or_insert_with(|| Bucket::new(limit, now));
                match bucket.try_take(now) {
                    Ok(()) => return Ok(()),
                    Err(wait) => wait,
                }
            };

            let waited = now.saturating_duration_since(started);
            if waited + wait > budget {
                tracing::debug!(
                    service,
                    wait_ms = wait.as_millis(),
                    "Rate limit bucket exhausted"
                );
                return Err(ResolveError::RateLimited {
                    service: service.to_string(),
                    retry_after: Some(wait),
                });
            }

            tracing::debug!(service, wait_ms = wait.as_millis(), "Queueing for rate limit token");
            tokio::time::sleep(wait).await;
        }
    }
}
