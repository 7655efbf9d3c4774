//! Process-wide request rate limiting
//!
//! One token bucket (burst of one) is shared by every worker, so the total request
//! rate across all repositories stays at or below the configured requests per second.

use crate::error::{RegistryError, Result};
use governor::{DefaultDirectRateLimiter, Quota};
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};

pub struct RateLimiter {
    inner: DefaultDirectRateLimiter,
    per_second: NonZeroU32,
    admitted: AtomicU64,
}

impl RateLimiter {
    pub fn per_second(rate: u32) -> Result<Self> {
        let per_second = NonZeroU32::new(rate).ok_or_else(|| {
            RegistryError::Config("rate limit must be at least 1 request per second".to_string())
        })?;
        let quota = Quota::per_second(per_second).allow_burst(NonZeroU32::MIN);
        Ok(Self {
            inner: governor::RateLimiter::direct(quota),
            per_second,
            admitted: AtomicU64::new(0),
        })
    }

    /// Wait until a token is available and consume it
    pub async fn acquire(&self) {
        self.inner.until_ready().await;
        self.admitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Tokens handed out so far
    pub fn admitted(&self) -> u64 {
        self.admitted.load(Ordering::Relaxed)
    }

    pub fn rate(&self) -> u32 {
        self.per_second.get()
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("per_second", &self.per_second)
            .field("admitted", &self.admitted())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    #[test]
    fn test_zero_rate_rejected() {
        assert!(RateLimiter::per_second(0).is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_shared_limiter_bounds_total_rate() {
        let limiter = Arc::new(RateLimiter::per_second(10).unwrap());
        let window = Duration::from_millis(1000);
        let start = Instant::now();

        let mut workers = Vec::new();
        for _ in 0..8 {
            let limiter = Arc::clone(&limiter);
            workers.push(tokio::spawn(async move {
                let mut within_window = 0u64;
                loop {
                    limiter.acquire().await;
                    if start.elapsed() >= window {
                        return within_window;
                    }
                    within_window += 1;
                }
            }));
        }

        let mut total = 0;
        for worker in workers {
            total += worker.await.unwrap();
        }

        // rate * window, plus the initial burst token and one for timer slack
        assert!(total <= 12, "admitted {} requests in one second at 10/s", total);
        assert!(total >= 5, "limiter starved workers: {}", total);
    }
}
