//! Token bucket rate limiter
//!
//! Tokens refill continuously at `permits_per_second`, capped at `burst`.
//! The bucket starts full. Rejections are counted and reported through
//! return values, never raised.

use common::{RateLimiterSettings, RuntimeError};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RateLimitError {
    #[error("Rate limiter '{limiter}' could not grant {permits} permits within {max_wait:?}")]
    Timeout {
        limiter: String,
        permits: u32,
        max_wait: Duration,
    },

    #[error("Rate limiter '{limiter}' cannot ever grant {permits} permits (burst {burst})")]
    ExceedsBurst {
        limiter: String,
        permits: u32,
        burst: u32,
    },
}

impl From<RateLimitError> for RuntimeError {
    fn from(err: RateLimitError) -> Self {
        match err {
            RateLimitError::Timeout { limiter, .. } | RateLimitError::ExceedsBurst { limiter, .. } => {
                RuntimeError::RateLimited { limiter }
            }
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimiterStats {
    pub name: String,
    pub permits_per_second: f64,
    pub burst: u32,
    pub available: f64,
    pub acquired: u64,
    pub rejected: u64,
    /// Acquisitions that had to sleep before being granted
    pub waited: u64,
    pub total_wait: Duration,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self, rate: f64, burst: f64) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * rate).min(burst);
            self.last_refill = now;
        }
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    name: String,
    permits_per_second: f64,
    burst: u32,
    bucket: Mutex<Bucket>,
    acquired: AtomicU64,
    rejected: AtomicU64,
    waited: AtomicU64,
    total_wait_nanos: AtomicU64,
}

impl RateLimiter {
    pub fn new(name: impl Into<String>, permits_per_second: f64, burst: u32) -> Self {
        let permits_per_second = if permits_per_second.is_finite() && permits_per_second > 0.0 {
            permits_per_second
        } else {
            f64::MIN_POSITIVE
        };
        let burst = burst.max(1);

        Self {
            name: name.into(),
            permits_per_second,
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst as f64,
                last_refill: Instant::now(),
            }),
            acquired: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            waited: AtomicU64::new(0),
            total_wait_nanos: AtomicU64::new(0),
        }
    }

    pub fn from_settings(name: impl Into<String>, settings: &RateLimiterSettings) -> Self {
        Self::new(name, settings.permits_per_second, settings.burst)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Non-blocking acquisition of `permits`
    pub fn try_acquire(&self, permits: u32) -> bool {
        let mut bucket = self.bucket.lock();
        bucket.refill(self.permits_per_second, self.burst as f64);

        if bucket.tokens >= permits as f64 {
            bucket.tokens -= permits as f64;
            drop(bucket);
            self.acquired.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            drop(bucket);
            self.rejected.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Acquire `permits`, sleeping at most `max_wait`. Returns how long the
    /// caller waited.
    pub fn acquire(&self, permits: u32, max_wait: Duration) -> Result<Duration, RateLimitError> {
        let start = Instant::now();
        loop {
            let wait = match self.reserve_or_wait(permits, max_wait.saturating_sub(start.elapsed())) {
                Ok(()) => return Ok(self.granted_after(start)),
                Err(Some(wait)) => wait,
                Err(None) => return Err(self.reject(permits, max_wait)),
            };
            // Sleep outside the bucket lock
            std::thread::sleep(wait);
        }
    }

    /// Async variant of `acquire` built on `tokio::time::sleep`
    pub async fn acquire_async(
        &self,
        permits: u32,
        max_wait: Duration,
    ) -> Result<Duration, RateLimitError> {
        let start = Instant::now();
        loop {
            let wait = match self.reserve_or_wait(permits, max_wait.saturating_sub(start.elapsed())) {
                Ok(()) => return Ok(self.granted_after(start)),
                Err(Some(wait)) => wait,
                Err(None) => return Err(self.reject(permits, max_wait)),
            };
            tokio::time::sleep(wait).await;
        }
    }

    /// Ok when permits were taken; Err(Some(wait)) when they will be available
    /// within `remaining`; Err(None) when the caller should give up.
    fn reserve_or_wait(&self, permits: u32, remaining: Duration) -> Result<(), Option<Duration>> {
        if permits > self.burst {
            return Err(None);
        }

        let mut bucket = self.bucket.lock();
        bucket.refill(self.permits_per_second, self.burst as f64);

        if bucket.tokens >= permits as f64 {
            bucket.tokens -= permits as f64;
            return Ok(());
        }

        let deficit = permits as f64 - bucket.tokens;
        // A vanishing rate yields a wait no Duration can hold
        match Duration::try_from_secs_f64(deficit / self.permits_per_second) {
            // At least one millisecond so the loop never spins
            Ok(wait) if wait <= remaining => Err(Some(wait.max(Duration::from_millis(1)))),
            _ => Err(None),
        }
    }

    fn granted_after(&self, start: Instant) -> Duration {
        let waited = start.elapsed();
        self.acquired.fetch_add(1, Ordering::Relaxed);
        if waited >= Duration::from_millis(1) {
            self.waited.fetch_add(1, Ordering::Relaxed);
            self.total_wait_nanos
                .fetch_add(waited.as_nanos() as u64, Ordering::Relaxed);
        }
        waited
    }

    fn reject(&self, permits: u32, max_wait: Duration) -> RateLimitError {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        debug!(limiter = %self.name, permits, max_wait_ms = max_wait.as_millis() as u64, "Rate limiter rejected acquisition");

        if permits > self.burst {
            RateLimitError::ExceedsBurst {
                limiter: self.name.clone(),
                permits,
                burst: self.burst,
            }
        } else {
            RateLimitError::Timeout {
                limiter: self.name.clone(),
                permits,
                max_wait,
            }
        }
    }

    pub fn available(&self) -> f64 {
        let mut bucket = self.bucket.lock();
        bucket.refill(self.permits_per_second, self.burst as f64);
        bucket.tokens
    }

    pub fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            name: self.name.clone(),
            permits_per_second: self.permits_per_second,
            burst: self.burst,
            available: self.available(),
            acquired: self.acquired.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            waited: self.waited.load(Ordering::Relaxed),
            total_wait: Duration::from_nanos(self.total_wait_nanos.load(Ordering::Relaxed)),
        }
    }
}

/// Named limiters created on demand
#[derive(Debug, Default)]
pub struct RateLimiterRegistry {
    limiters: DashMap<String, Arc<RateLimiter>>,
    defaults: RateLimiterSettings,
}

impl RateLimiterRegistry {
    pub fn new(defaults: RateLimiterSettings) -> Self {
        Self {
            limiters: DashMap::new(),
            defaults,
        }
    }

    pub fn get_or_create(&self, name: &str) -> Arc<RateLimiter> {
        if let Some(limiter) = self.limiters.get(name) {
            return Arc::clone(limiter.value());
        }
        self.limiters
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(RateLimiter::from_settings(name, &self.defaults)))
            .value()
            .clone()
    }

    pub fn register(&self, name: &str, permits_per_second: f64, burst: u32) -> Arc<RateLimiter> {
        let limiter = Arc::new(RateLimiter::new(name, permits_per_second, burst));
        self.limiters.insert(name.to_string(), Arc::clone(&limiter));
        limiter
    }

    pub fn get(&self, name: &str) -> Option<Arc<RateLimiter>> {
        self.limiters.get(name).map(|l| Arc::clone(l.value()))
    }

    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }

    pub fn stats(&self) -> Vec<RateLimiterStats> {
        let mut stats: Vec<_> = self.limiters.iter().map(|l| l.value().stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_then_reject() {
        let limiter = RateLimiter::new("burst", 10.0, 5);
        for _ in 0..5 {
            assert!(limiter.try_acquire(1));
        }
        assert!(!limiter.try_acquire(1));

        let stats = limiter.stats();
        assert_eq!(stats.acquired, 5);
        assert_eq!(stats.rejected, 1);
    }

    #[test]
    fn test_zero_rate_rejects_instead_of_waiting() {
        let limiter = RateLimiter::new("frozen", 0.0, 1);
        assert!(limiter.try_acquire(1));

        let err = limiter.acquire(1, Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, RateLimitError::Timeout { .. }), "{err}");

        let nan = RateLimiter::new("nan", f64::NAN, 2);
        assert!(nan.acquire(2, Duration::from_millis(5)).is_ok());
        assert!(nan.acquire(1, Duration::from_millis(5)).is_err());
    }

    #[tokio::test]
    async fn test_zero_rate_async_rejects() {
        let limiter = RateLimiter::new("frozen-async", 0.0, 1);
        assert!(limiter.try_acquire(1));
        let err = limiter
            .acquire_async(1, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, RateLimitError::Timeout { .. }));
        assert_eq!(limiter.stats().rejected, 1);
    }

    #[test]
    fn test_refill_over_time() {
        let limiter = RateLimiter::new("refill", 100.0, 1);
        assert!(limiter.try_acquire(1));
        assert!(!limiter.try_acquire(1));

        std::thread::sleep(Duration::from_millis(30));
        assert!(limiter.try_acquire(1));
    }

    #[test]
    fn test_refill_capped_at_burst() {
        let limiter = RateLimiter::new("cap", 1000.0, 3);
        std::thread::sleep(Duration::from_millis(20));
        assert!(limiter.available() <= 3.0);
    }

    #[test]
    fn test_acquire_waits_for_tokens() {
        let limiter = RateLimiter::new("wait", 100.0, 1);
        assert!(limiter.try_acquire(1));

        let waited = limiter
            .acquire(1, Duration::from_millis(500))
            .expect("token refills within the wait budget");
        assert!(waited >= Duration::from_millis(1));
        assert_eq!(limiter.stats().waited, 1);
    }

    #[test]
    fn test_acquire_fails_fast_when_wait_too_long() {
        let limiter = RateLimiter::new("slow", 1.0, 1);
        assert!(limiter.try_acquire(1));

        let start = Instant::now();
        let result = limiter.acquire(1, Duration::from_millis(50));
        assert!(matches!(result, Err(RateLimitError::Timeout { .. })));
        assert!(start.elapsed() < Duration::from_millis(40));
    }

    #[test]
    fn test_permits_above_burst_are_never_granted() {
        let limiter = RateLimiter::new("big", 10.0, 2);
        assert!(matches!(
            limiter.acquire(3, Duration::from_secs(1)),
            Err(RateLimitError::ExceedsBurst { .. })
        ));
    }

    #[tokio::test]
    async fn test_acquire_async() {
        let limiter = RateLimiter::new("async", 200.0, 1);
        assert!(limiter.try_acquire(1));
        assert!(limiter
            .acquire_async(1, Duration::from_millis(200))
            .await
            .is_ok());
    }

    #[test]
    fn test_registry_creates_with_defaults() {
        let registry = RateLimiterRegistry::new(RateLimiterSettings {
            permits_per_second: 1.0,
            burst: 2,
        });
        let limiter = registry.get_or_create("executor");
        assert!(limiter.try_acquire(2));
        assert!(!registry.get_or_create("executor").try_acquire(1));
        assert_eq!(registry.len(), 1);
    }
}
