//! Safe execution facade
//!
//! Every operation passes, in order: a named rate limiter, the memory guard
//! (refused at CRITICAL pressure), a named circuit breaker and a watchdog
//! deadline. The outcome is recorded on the breaker. Callers of `execute`
//! always get a value back: either the operation's or the fallback's.

use common::{Counter, MetricsRegistry, RuntimeError, RuntimeResult};
use memory::{MemoryGuard, PressureLevel};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::reliability::{CircuitBreaker, CircuitBreakerRegistry, RateLimiterRegistry, Watchdog};

/// Why an operation was refused before it started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    RateLimited,
    MemoryPressure(PressureLevel),
    CircuitOpen,
}

impl Rejection {
    pub fn to_error(self, operation: &str) -> RuntimeError {
        match self {
            Rejection::RateLimited => RuntimeError::RateLimited {
                limiter: operation.to_string(),
            },
            Rejection::MemoryPressure(level) => RuntimeError::MemoryPressure {
                level: level.to_string(),
            },
            Rejection::CircuitOpen => RuntimeError::CircuitOpen {
                breaker: operation.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutorStats {
    pub executed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub fallbacks: u64,
    pub rate_limited: u64,
    pub pressure_rejected: u64,
    pub circuit_rejected: u64,
    pub timeouts: u64,
    pub panics: u64,
}

struct ExecutorCounters {
    executed: Arc<Counter>,
    succeeded: Arc<Counter>,
    failed: Arc<Counter>,
    fallbacks: Arc<Counter>,
    rate_limited: Arc<Counter>,
    pressure_rejected: Arc<Counter>,
    circuit_rejected: Arc<Counter>,
    timeouts: Arc<Counter>,
    panics: Arc<Counter>,
}

pub struct SafeExecutor {
    guard: Arc<MemoryGuard>,
    breakers: Arc<CircuitBreakerRegistry>,
    limiters: Arc<RateLimiterRegistry>,
    watchdog: Arc<Watchdog>,
    shutdown: CancellationToken,
    counters: ExecutorCounters,
}

impl std::fmt::Debug for SafeExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SafeExecutor")
            .field("stats", &self.stats())
            .finish()
    }
}

impl SafeExecutor {
    pub fn new(
        guard: Arc<MemoryGuard>,
        breakers: Arc<CircuitBreakerRegistry>,
        limiters: Arc<RateLimiterRegistry>,
        watchdog: Arc<Watchdog>,
        metrics: &MetricsRegistry,
    ) -> Self {
        Self {
            guard,
            breakers,
            limiters,
            watchdog,
            shutdown: CancellationToken::new(),
            counters: ExecutorCounters {
                executed: metrics.counter("executor.executed"),
                succeeded: metrics.counter("executor.succeeded"),
                failed: metrics.counter("executor.failed"),
                fallbacks: metrics.counter("executor.fallbacks"),
                rate_limited: metrics.counter("executor.rate_limited"),
                pressure_rejected: metrics.counter("executor.pressure_rejected"),
                circuit_rejected: metrics.counter("executor.circuit_rejected"),
                timeouts: metrics.counter("executor.timeouts"),
                panics: metrics.counter("executor.panics"),
            },
        }
    }

    /// Admission gates in order. On success the breaker has counted the request.
    pub fn admit(&self, operation: &str) -> Result<Arc<CircuitBreaker>, Rejection> {
        if !self.limiters.get_or_create(operation).try_acquire(1) {
            self.counters.rate_limited.inc();
            debug!(operation, "Rejected by rate limiter");
            return Err(Rejection::RateLimited);
        }

        let level = self.guard.check_pressure();
        if level >= PressureLevel::Critical {
            self.counters.pressure_rejected.inc();
            warn!(operation, level = %level, "Rejected under memory pressure");
            return Err(Rejection::MemoryPressure(level));
        }

        let breaker = self.breakers.get_or_create(operation);
        if !breaker.allow_request() {
            self.counters.circuit_rejected.inc();
            debug!(operation, "Rejected by open circuit");
            return Err(Rejection::CircuitOpen);
        }

        Ok(breaker)
    }

    pub fn try_execute<T, F>(&self, operation: &str, timeout: Duration, op: F) -> RuntimeResult<T>
    where
        F: FnOnce(&CancellationToken) -> RuntimeResult<T>,
    {
        self.try_execute_classified(operation, timeout, op, |_| false)
    }

    /// `is_failure` lets a successful return still count against the breaker
    pub fn try_execute_classified<T, F, C>(
        &self,
        operation: &str,
        timeout: Duration,
        op: F,
        is_failure: C,
    ) -> RuntimeResult<T>
    where
        F: FnOnce(&CancellationToken) -> RuntimeResult<T>,
        C: FnOnce(&T) -> bool,
    {
        let breaker = self.admit(operation).map_err(|r| r.to_error(operation))?;
        self.counters.executed.inc();

        let guarded = self.watchdog.guarded(operation, timeout, |cancel| {
            catch_unwind(AssertUnwindSafe(|| op(cancel)))
        });

        let outcome = match guarded {
            Ok(Ok(Ok(value))) => {
                if is_failure(&value) {
                    breaker.record_failure();
                    self.counters.failed.inc();
                } else {
                    breaker.record_success();
                    self.counters.succeeded.inc();
                }
                return Ok(value);
            }
            Ok(Ok(Err(e))) => e,
            Ok(Err(payload)) => {
                self.counters.panics.inc();
                let message = panic_message(payload.as_ref());
                error!(operation, panic = %message, "Operation panicked");
                RuntimeError::Internal(format!("operation '{operation}' panicked: {message}"))
            }
            Err(timeout_error) => {
                self.counters.timeouts.inc();
                timeout_error.into()
            }
        };

        breaker.record_failure();
        self.counters.failed.inc();
        Err(outcome)
    }

    /// Run `op` under every guard; any rejection or failure resolves through
    /// `fallback`
    pub fn execute<T, F, G>(&self, operation: &str, timeout: Duration, op: F, fallback: G) -> T
    where
        F: FnOnce(&CancellationToken) -> RuntimeResult<T>,
        G: FnOnce(RuntimeError) -> T,
    {
        self.try_execute(operation, timeout, op)
            .unwrap_or_else(|e| self.fall_back(operation, e, fallback))
    }

    pub fn execute_classified<T, F, C, G>(
        &self,
        operation: &str,
        timeout: Duration,
        op: F,
        is_failure: C,
        fallback: G,
    ) -> T
    where
        F: FnOnce(&CancellationToken) -> RuntimeResult<T>,
        C: FnOnce(&T) -> bool,
        G: FnOnce(RuntimeError) -> T,
    {
        self.try_execute_classified(operation, timeout, op, is_failure)
            .unwrap_or_else(|e| self.fall_back(operation, e, fallback))
    }

    /// Async variant. The future is raced against the deadline and executor
    /// shutdown; losing either cancels the token handed to `op`.
    pub async fn try_execute_async<T, F, Fut>(
        &self,
        operation: &str,
        timeout: Duration,
        op: F,
    ) -> RuntimeResult<T>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = RuntimeResult<T>>,
    {
        let breaker = self.admit(operation).map_err(|r| r.to_error(operation))?;
        self.counters.executed.inc();

        let token = self.watchdog.start(operation, timeout);
        let cancel = token.cancellation().clone();

        let outcome = tokio::select! {
            result = op(cancel.clone()) => {
                if self.watchdog.stop(&token) {
                    result
                } else {
                    self.counters.timeouts.inc();
                    Err(RuntimeError::WatchdogTimeout {
                        operation: operation.to_string(),
                        timeout_ms: timeout.as_millis() as u64,
                    })
                }
            }
            _ = tokio::time::sleep(timeout) => {
                cancel.cancel();
                self.watchdog.stop(&token);
                self.counters.timeouts.inc();
                Err(RuntimeError::WatchdogTimeout {
                    operation: operation.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
            _ = self.shutdown.cancelled() => {
                cancel.cancel();
                self.watchdog.stop(&token);
                Err(RuntimeError::Cancelled {
                    operation: operation.to_string(),
                })
            }
        };

        match &outcome {
            Ok(_) => {
                breaker.record_success();
                self.counters.succeeded.inc();
            }
            Err(_) => {
                breaker.record_failure();
                self.counters.failed.inc();
            }
        }
        outcome
    }

    pub async fn execute_async<T, F, Fut, G>(
        &self,
        operation: &str,
        timeout: Duration,
        op: F,
        fallback: G,
    ) -> T
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = RuntimeResult<T>>,
        G: FnOnce(RuntimeError) -> T,
    {
        match self.try_execute_async(operation, timeout, op).await {
            Ok(value) => value,
            Err(e) => self.fall_back(operation, e, fallback),
        }
    }

    fn fall_back<T, G>(&self, operation: &str, error: RuntimeError, fallback: G) -> T
    where
        G: FnOnce(RuntimeError) -> T,
    {
        self.counters.fallbacks.inc();
        debug!(operation, error = %error, code = error.error_code(), "Using fallback");
        fallback(error)
    }

    /// Cancel in-flight async operations
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn stats(&self) -> ExecutorStats {
        let c = &self.counters;
        ExecutorStats {
            executed: c.executed.get(),
            succeeded: c.succeeded.get(),
            failed: c.failed.get(),
            fallbacks: c.fallbacks.get(),
            rate_limited: c.rate_limited.get(),
            pressure_rejected: c.pressure_rejected.get(),
            circuit_rejected: c.circuit_rejected.get(),
            timeouts: c.timeouts.get(),
            panics: c.panics.get(),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
