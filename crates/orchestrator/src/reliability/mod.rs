//! Fault isolation primitives
//!
//! Circuit breakers, token-bucket rate limiters, the watchdog and the health
//! monitor. Each primitive is usable on its own; `SafeExecutor` composes them.

pub mod circuit_breaker;
pub mod health;
pub mod rate_limiter;
pub mod watchdog;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerRegistry,
    CircuitBreakerState, CircuitBreakerStats,
};
pub use health::{ComponentHealth, HealthCheck, HealthMonitor, HealthReport, HealthStatus};
pub use rate_limiter::{RateLimitError, RateLimiter, RateLimiterRegistry, RateLimiterStats};
pub use watchdog::{
    ActiveOperation, Watchdog, WatchdogError, WatchdogStats, WatchdogToken, WORKER_THREAD_PREFIX,
};
