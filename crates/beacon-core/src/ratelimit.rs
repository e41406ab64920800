//! Per-sender admission control for Beacon.
//!
//! Token-bucket semantics: each sender owns a bucket of `capacity` tokens
//! refilling continuously at `capacity / window` tokens per second. A send
//! costs one token. Buckets are created lazily at full capacity and swept
//! once idle for longer than two refill windows.

use crate::registry::UserId;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Rate limiter configuration.
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Bucket capacity (burst size).
    pub capacity: u32,
    /// Refill window: a full bucket's worth of tokens accrues over this span.
    pub window: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            window: Duration::from_secs(60),
        }
    }
}

/// One sender's bucket.
#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
    last_touched: Instant,
}

impl Bucket {
    fn full(capacity: u32, now: Instant) -> Self {
        Self {
            tokens: f64::from(capacity),
            last_refill: now,
            last_touched: now,
        }
    }

    /// Accrue tokens for the elapsed time, capped at capacity.
    fn refill(&mut self, rate_per_second: f64, capacity: u32, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate_per_second).min(f64::from(capacity));
        self.last_refill = now;
    }
}

/// Per-user token-bucket rate limiter.
///
/// Refill and deduction happen as one step under the user's map entry, so
/// concurrent sends from multiple devices of the same user never overdraw
/// or overfill the bucket.
#[derive(Debug, Default)]
pub struct RateLimiter {
    buckets: DashMap<UserId, Bucket>,
    config: RateLimiterConfig,
}

impl RateLimiter {
    /// Create a limiter with default configuration (10 tokens / 60 s).
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RateLimiterConfig::default())
    }

    /// Create a limiter with custom configuration.
    #[must_use]
    pub fn with_config(config: RateLimiterConfig) -> Self {
        Self {
            buckets: DashMap::new(),
            config,
        }
    }

    /// The configured window.
    #[must_use]
    pub fn window(&self) -> Duration {
        self.config.window
    }

    /// Check whether a send by this user is admitted, deducting one token
    /// on success. Never blocks.
    pub fn allow(&self, user: &UserId) -> bool {
        self.allow_at(user, Instant::now())
    }

    fn allow_at(&self, user: &UserId, now: Instant) -> bool {
        let rate = f64::from(self.config.capacity) / self.config.window.as_secs_f64();

        let mut bucket = self
            .buckets
            .entry(user.clone())
            .or_insert_with(|| Bucket::full(self.config.capacity, now));

        bucket.refill(rate, self.config.capacity, now);
        bucket.last_touched = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            trace!(user = %user, remaining = bucket.tokens, "Send admitted");
            true
        } else {
            debug!(user = %user, "Rate limit exceeded");
            false
        }
    }

    /// Purge buckets untouched for longer than two refill windows.
    ///
    /// Returns the number of buckets removed.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    fn sweep_at(&self, now: Instant) -> usize {
        let ttl = self.config.window * 2;
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| now.duration_since(bucket.last_touched) <= ttl);
        before - self.buckets.len()
    }

    /// Number of live buckets.
    #[must_use]
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Periodic sweep loop; spawn as a background task.
    pub async fn run_sweeper(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let purged = self.sweep();
            if purged > 0 {
                debug!(purged, remaining = self.bucket_count(), "Swept idle rate buckets");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(capacity: u32, window_secs: u64) -> RateLimiter {
        RateLimiter::with_config(RateLimiterConfig {
            capacity,
            window: Duration::from_secs(window_secs),
        })
    }

    #[test]
    fn test_burst_then_exhausted() {
        let limiter = limiter(10, 60);
        let user = "alice".to_string();
        let now = Instant::now();

        for _ in 0..10 {
            assert!(limiter.allow_at(&user, now));
        }
        assert!(!limiter.allow_at(&user, now));
    }

    #[test]
    fn test_partial_refill_admits_exactly_one() {
        let limiter = limiter(10, 60);
        let user = "alice".to_string();
        let start = Instant::now();

        for _ in 0..10 {
            assert!(limiter.allow_at(&user, start));
        }
        assert!(!limiter.allow_at(&user, start));

        // A tenth of the window refills one token, no more
        let later = start + Duration::from_millis(6100);
        assert!(limiter.allow_at(&user, later));
        assert!(!limiter.allow_at(&user, later));
    }

    #[test]
    fn test_refill_capped_at_capacity() {
        let limiter = limiter(10, 60);
        let user = "alice".to_string();
        let start = Instant::now();

        assert!(limiter.allow_at(&user, start));

        // Idle far past the window: bucket refills to capacity, not beyond
        let later = start + Duration::from_secs(600);
        for _ in 0..10 {
            assert!(limiter.allow_at(&user, later));
        }
        assert!(!limiter.allow_at(&user, later));
    }

    #[test]
    fn test_users_are_isolated() {
        let limiter = limiter(1, 60);
        let now = Instant::now();

        assert!(limiter.allow_at(&"alice".to_string(), now));
        assert!(!limiter.allow_at(&"alice".to_string(), now));
        assert!(limiter.allow_at(&"bob".to_string(), now));
    }

    #[test]
    fn test_sweep_purges_idle_buckets() {
        let limiter = limiter(10, 60);
        let start = Instant::now();

        limiter.allow_at(&"idle".to_string(), start);
        limiter.allow_at(&"active".to_string(), start);
        assert_eq!(limiter.bucket_count(), 2);

        // Keep one bucket warm past the eviction horizon
        let later = start + Duration::from_secs(125);
        limiter.allow_at(&"active".to_string(), later);

        assert_eq!(limiter.sweep_at(later), 1);
        assert_eq!(limiter.bucket_count(), 1);

        // The evicted user starts over with a full bucket
        assert!(limiter.allow_at(&"idle".to_string(), later));
    }

    #[test]
    fn test_concurrent_devices_share_one_bucket() {
        let limiter = Arc::new(limiter(10, 60));
        let now = Instant::now();

        let admitted: usize = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..4)
                .map(|_| {
                    let limiter = Arc::clone(&limiter);
                    scope.spawn(move || {
                        (0..5)
                            .filter(|_| limiter.allow_at(&"alice".to_string(), now))
                            .count()
                    })
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).sum()
        });

        // 20 attempts against a 10-token bucket admit exactly 10
        assert_eq!(admitted, 10);
    }
}
