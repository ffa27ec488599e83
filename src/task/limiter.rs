//! Token-bucket rate limiter shared by the workers of a run.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::trace;

use crate::error::LimiterError;

/// Maximum number of stored tokens. Bursts are limited to one admission.
const CAPACITY: f64 = 1.0;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_update: Instant,
}

/// Admits at most `rate` callers per second.
///
/// A waiting caller reserves its token by driving the balance negative while
/// the lock is held, then sleeps with the lock released. Later callers see the
/// debt and queue behind it, so `N` consecutive admissions take at least
/// `(N - 1) / rate` seconds.
#[derive(Debug)]
pub struct RateLimiter {
    rate: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Creates a limiter admitting `rate` calls per second.
    ///
    /// A rate of `0.0` disables limiting.
    pub fn new(rate: f64) -> Result<Self, LimiterError> {
        if !rate.is_finite() || rate < 0.0 {
            return Err(LimiterError::InvalidRate(rate));
        }
        Ok(Self {
            rate,
            bucket: Mutex::new(Bucket {
                tokens: CAPACITY,
                last_update: Instant::now(),
            }),
        })
    }

    /// A limiter that admits every caller immediately.
    pub fn unlimited() -> Self {
        Self {
            rate: 0.0,
            bucket: Mutex::new(Bucket {
                tokens: CAPACITY,
                last_update: Instant::now(),
            }),
        }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn is_enabled(&self) -> bool {
        self.rate > 0.0
    }

    /// Waits until one admission token is available and consumes it.
    pub async fn wait(&self) {
        if let Some(delay) = self.reserve() {
            trace!(delay_ms = delay.as_millis() as u64, "Rate limiter delaying caller");
            tokio::time::sleep(delay).await;
        }
    }

    /// Takes a token, returning how long the caller must wait before using it.
    fn reserve(&self) -> Option<Duration> {
        if !self.is_enabled() {
            return None;
        }

        let mut bucket = self.bucket.lock().expect("rate limiter lock poisoned");
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_update).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate).min(CAPACITY);
        bucket.last_update = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            return None;
        }

        let deficit = 1.0 - bucket.tokens;
        bucket.tokens -= 1.0;
        Some(Duration::try_from_secs_f64(deficit / self.rate).unwrap_or(Duration::MAX))
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::unlimited()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_rejects_invalid_rates() {
        assert!(matches!(RateLimiter::new(-1.0), Err(LimiterError::InvalidRate(_))));
        assert!(RateLimiter::new(f64::NAN).is_err());
        assert!(RateLimiter::new(f64::INFINITY).is_err());
        assert!(RateLimiter::new(0.0).is_ok());
    }

    #[test]
    fn test_tiny_rate_saturates_delay() {
        let limiter = RateLimiter::new(1e-20).expect("valid rate");

        assert!(limiter.reserve().is_none());
        assert_eq!(limiter.reserve(), Some(Duration::MAX));
    }

    #[tokio::test]
    async fn test_zero_rate_never_waits() {
        let limiter = RateLimiter::new(0.0).expect("valid rate");
        assert!(!limiter.is_enabled());

        let start = Instant::now();
        for _ in 0..100 {
            limiter.wait().await;
        }
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn test_reserve_goes_into_debt() {
        let limiter = RateLimiter::new(10.0).expect("valid rate");

        assert!(limiter.reserve().is_none());
        let first = limiter.reserve().expect("second call must wait");
        let second = limiter.reserve().expect("third call must wait");

        // Each queued caller waits roughly one period longer than the last.
        assert!(first > Duration::from_millis(80));
        assert!(second > first + Duration::from_millis(80));
    }

    #[tokio::test]
    async fn test_consecutive_admissions_respect_rate() {
        let limiter = RateLimiter::new(20.0).expect("valid rate");
        let start = Instant::now();
        for _ in 0..5 {
            limiter.wait().await;
        }
        // (5 - 1) / 20 = 200ms, minus scheduling slack.
        assert!(start.elapsed() >= Duration::from_millis(190));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_share_one_budget() {
        let limiter = Arc::new(RateLimiter::new(20.0).expect("valid rate"));
        let start = Instant::now();

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                tokio::spawn(async move { limiter.wait().await })
            })
            .collect();
        for handle in handles {
            handle.await.expect("waiter panicked");
        }

        // (6 - 1) / 20 = 250ms.
        assert!(start.elapsed() >= Duration::from_millis(240));
    }
}
