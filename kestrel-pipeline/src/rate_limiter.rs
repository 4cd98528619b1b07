//! Token-bucket admission control

use crate::config::RateLimiterConfig;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    max_tokens: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.max_tokens);
        self.last_refill = now;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimiterSnapshot {
    pub tokens: f64,
    pub max_tokens: f64,
    pub refill_rate: f64,
}

/// Bursts up to `max_tokens`, sustained rate capped at `refill_rate`
/// admissions per second.
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// The bucket starts full.
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            bucket: Mutex::new(Bucket {
                tokens: config.max_tokens,
                max_tokens: config.max_tokens,
                refill_rate: config.refill_rate,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token if a whole token is available.
    pub fn try_acquire(&self) -> bool {
        let mut bucket = self.bucket.lock();
        bucket.refill(Instant::now());
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            debug!("rate limited ({:.2} tokens)", bucket.tokens);
            false
        }
    }

    pub fn available_tokens(&self) -> f64 {
        let mut bucket = self.bucket.lock();
        bucket.refill(Instant::now());
        bucket.tokens
    }

    /// Change the limits. Tokens above the new cap are discarded.
    pub fn set_limits(&self, config: RateLimiterConfig) {
        let mut bucket = self.bucket.lock();
        bucket.refill(Instant::now());
        bucket.max_tokens = config.max_tokens;
        bucket.refill_rate = config.refill_rate;
        bucket.tokens = bucket.tokens.min(bucket.max_tokens);
        info!(
            "Rate limit settings: max_tokens={}, refill_rate={}/s",
            config.max_tokens, config.refill_rate
        );
    }

    /// Refill the bucket to capacity.
    pub fn reset(&self) {
        let mut bucket = self.bucket.lock();
        bucket.tokens = bucket.max_tokens;
        bucket.last_refill = Instant::now();
    }

    pub fn snapshot(&self) -> RateLimiterSnapshot {
        let mut bucket = self.bucket.lock();
        bucket.refill(Instant::now());
        RateLimiterSnapshot {
            tokens: bucket.tokens,
            max_tokens: bucket.max_tokens,
            refill_rate: bucket.refill_rate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn limiter(max_tokens: f64, refill_rate: f64) -> RateLimiter {
        RateLimiter::new(RateLimiterConfig { max_tokens, refill_rate })
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_refill() {
        let rl = limiter(10.0, 5.0);
        for _ in 0..10 {
            assert!(rl.try_acquire());
        }
        assert!(!rl.try_acquire());

        tokio::time::advance(Duration::from_secs(1)).await;
        for _ in 0..5 {
            assert!(rl.try_acquire());
        }
        assert!(!rl.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_is_capped() {
        let rl = limiter(3.0, 100.0);
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(rl.available_tokens(), 3.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fractional_tokens_do_not_admit() {
        let rl = limiter(1.0, 2.0);
        assert!(rl.try_acquire());
        tokio::time::advance(Duration::from_millis(250)).await;
        assert!(!rl.try_acquire());
        tokio::time::advance(Duration::from_millis(250)).await;
        assert!(rl.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_refill_never_recovers() {
        let rl = limiter(1.0, 0.0);
        assert!(rl.try_acquire());
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(!rl.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_limits_and_reset() {
        let rl = limiter(10.0, 1.0);
        rl.set_limits(RateLimiterConfig { max_tokens: 2.0, refill_rate: 1.0 });
        assert_eq!(rl.snapshot().tokens, 2.0);
        assert!(rl.try_acquire());
        assert!(rl.try_acquire());
        assert!(!rl.try_acquire());

        rl.reset();
        assert_eq!(rl.snapshot().tokens, 2.0);
        assert_eq!(rl.snapshot().max_tokens, 2.0);
    }
}
