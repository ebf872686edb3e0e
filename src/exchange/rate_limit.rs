// =============================================================================
// Token-Bucket Rate Limiter — every venue call passes through here
// =============================================================================

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::trace;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket refilled at `rate_per_second`, holding at most `capacity`
/// tokens. `acquire` waits until a token is available.
pub struct RateLimiter {
    rate_per_second: f64,
    capacity: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(rate_per_second: f64) -> Self {
        let rate = rate_per_second.max(0.1);
        Self {
            rate_per_second: rate,
            capacity: rate.max(1.0),
            bucket: Mutex::new(Bucket {
                tokens: rate.max(1.0),
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token, sleeping until the bucket refills when empty.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock();
                let elapsed = bucket.last_refill.elapsed().as_secs_f64();
                bucket.tokens = (bucket.tokens + elapsed * self.rate_per_second).min(self.capacity);
                bucket.last_refill = Instant::now();

                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    None
                } else {
                    let deficit = 1.0 - bucket.tokens;
                    Some(Duration::from_secs_f64(deficit / self.rate_per_second))
                }
            };
            match wait {
                None => return,
                Some(delay) => {
                    trace!(?delay, "rate limiter waiting");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Non-blocking variant for tests and opportunistic calls.
    pub fn try_acquire(&self) -> bool {
        let mut bucket = self.bucket.lock();
        let elapsed = bucket.last_refill.elapsed().as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate_per_second).min(self.capacity);
        bucket.last_refill = Instant::now();
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_up_to_capacity_then_blocks() {
        let limiter = RateLimiter::new(5.0);
        for _ in 0..5 {
            assert!(limiter.try_acquire());
        }
        assert!(!limiter.try_acquire());
    }

    #[tokio::test]
    async fn acquire_waits_for_refill() {
        let limiter = RateLimiter::new(50.0);
        for _ in 0..50 {
            assert!(limiter.try_acquire());
        }
        let start = std::time::Instant::now();
        limiter.acquire().await;
        // One token at 50/s refills in ~20ms.
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[tokio::test]
    async fn refill_restores_tokens() {
        let limiter = RateLimiter::new(100.0);
        while limiter.try_acquire() {}
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(limiter.try_acquire());
    }
}
