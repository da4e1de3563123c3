//! Circuit breakers guarding named runtime operations
//!
//! Sliding-window circuit breaker guarding named operations. Trips on an
//! absolute failure count or on a failure rate within the window, cools down,
//! then admits a bounded number of trial requests.

use common::{BreakerSettings, RuntimeError};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Отказ в допуске операции
#[derive(Debug, Error)]
pub enum CircuitBreakerError<E> {
    #[error("Circuit breaker '{name}' is open - operation blocked")]
    Open { name: String },

    #[error("Operation failed: {0}")]
    Operation(E),
}

impl<E: std::fmt::Display> From<CircuitBreakerError<E>> for RuntimeError {
    fn from(err: CircuitBreakerError<E>) -> Self {
        match err {
            CircuitBreakerError::Open { name } => RuntimeError::CircuitOpen { breaker: name },
            CircuitBreakerError::Operation(e) => RuntimeError::Internal(e.to_string()),
        }
    }
}

/// Breaker state machine: Closed → Open → HalfOpen → Closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitBreakerState {
    /// Operations are admitted
    Closed,

    /// Operations are refused until the cooldown elapses
    Open,

    /// Circuit is half-open, testing if the operation has recovered
    HalfOpen,
}

impl Default for CircuitBreakerState {
    fn default() -> Self {
        Self::Closed
    }
}

impl std::fmt::Display for CircuitBreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitBreakerState::Closed => write!(f, "closed"),
            CircuitBreakerState::Open => write!(f, "open"),
            CircuitBreakerState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Breaker thresholds, built from `BreakerSettings`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Number of failures within the window before circuit opens
    pub failure_threshold: u32,

    /// Minimum number of requests in the window before evaluating failure rate
    pub minimum_request_threshold: u32,

    /// Sliding window for failure counting
    pub failure_rate_window: Duration,

    /// Cooldown before the first half-open trial
    pub recovery_timeout: Duration,

    /// Number of consecutive successes needed to close circuit in half-open state
    pub success_threshold_half_open: u32,

    /// Maximum number of trial requests allowed in half-open state
    pub max_half_open_requests: u32,

    /// Failure rate in the window (0.0..=1.0) that trips the breaker
    pub failure_rate_threshold: f64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self::from(&BreakerSettings::default())
    }
}

impl From<&BreakerSettings> for CircuitBreakerConfig {
    fn from(settings: &BreakerSettings) -> Self {
        Self {
            failure_threshold: settings.failure_threshold,
            minimum_request_threshold: settings.minimum_request_threshold,
            failure_rate_window: Duration::from_millis(settings.window_ms),
            recovery_timeout: Duration::from_millis(settings.cooldown_ms),
            success_threshold_half_open: settings.half_open_success_threshold,
            max_half_open_requests: settings.half_open_max_requests,
            failure_rate_threshold: settings.failure_rate_threshold,
        }
    }
}

/// Снимок счётчиков одного breaker
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub blocked_requests: u64,
    pub state_transitions: u64,
    pub time_in_current_state: Duration,
    pub recovery_attempts: u64,
    pub successful_recoveries: u64,
    pub current_state: CircuitBreakerState,
    pub failures_in_window: u32,
    pub failure_rate: f64,
}

impl CircuitBreakerStats {
    pub fn success_rate(&self) -> f64 {
        let completed = self.successful_requests + self.failed_requests;
        if completed == 0 {
            0.0
        } else {
            self.successful_requests as f64 / completed as f64
        }
    }

    pub fn block_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.blocked_requests as f64 / self.total_requests as f64
        }
    }
}

/// One outcome in the sliding window
#[derive(Debug, Clone, Copy)]
struct RequestOutcome {
    timestamp: Instant,
    success: bool,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitBreakerState,
    last_state_change: Instant,
    recent: VecDeque<RequestOutcome>,
    /// Failures currently in `recent`, kept in step with push and prune
    window_failures: u32,
    half_open_in_flight: u32,
    half_open_successes: u32,
}

impl BreakerInner {
    fn record(&mut self, success: bool, window: Duration) {
        self.recent.push_back(RequestOutcome {
            timestamp: Instant::now(),
            success,
        });
        if !success {
            self.window_failures += 1;
        }
        self.prune(window);
    }

    fn prune(&mut self, window: Duration) {
        let now = Instant::now();
        while let Some(front) = self.recent.front() {
            if now.duration_since(front.timestamp) <= window {
                break;
            }
            if !front.success {
                self.window_failures -= 1;
            }
            self.recent.pop_front();
        }
    }

    fn clear_window(&mut self) {
        self.recent.clear();
        self.window_failures = 0;
    }

    fn failures(&self) -> u32 {
        self.window_failures
    }

    fn failure_rate(&self) -> f64 {
        if self.recent.is_empty() {
            0.0
        } else {
            self.failures() as f64 / self.recent.len() as f64
        }
    }
}

/// Breaker for one named operation
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    blocked_requests: AtomicU64,
    state_transitions: AtomicU64,
    recovery_attempts: AtomicU64,
    successful_recoveries: AtomicU64,
}

impl CircuitBreaker {
    /// Breaker starts Closed
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitBreakerState::Closed,
                last_state_change: Instant::now(),
                recent: VecDeque::new(),
                window_failures: 0,
                half_open_in_flight: 0,
                half_open_successes: 0,
            }),
            total_requests: AtomicU64::new(0),
            successful_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            blocked_requests: AtomicU64::new(0),
            state_transitions: AtomicU64::new(0),
            recovery_attempts: AtomicU64::new(0),
            successful_recoveries: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check if circuit breaker admits a request. Moves OPEN to HALF_OPEN once
    /// the recovery timeout has elapsed.
    pub fn allow_request(&self) -> bool {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();

        if inner.state == CircuitBreakerState::Open
            && inner.last_state_change.elapsed() >= self.config.recovery_timeout
        {
            self.transition(&mut inner, CircuitBreakerState::HalfOpen);
        }

        let allowed = match inner.state {
            CircuitBreakerState::Closed => true,
            CircuitBreakerState::Open => false,
            CircuitBreakerState::HalfOpen => {
                if inner.half_open_in_flight < self.config.max_half_open_requests {
                    inner.half_open_in_flight += 1;
                    true
                } else {
                    false
                }
            }
        };

        if !allowed {
            self.blocked_requests.fetch_add(1, Ordering::Relaxed);
        }
        allowed
    }

    /// Успешный исход
    pub fn record_success(&self) {
        self.successful_requests.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();
        inner.record(true, self.config.failure_rate_window);

        match inner.state {
            CircuitBreakerState::Closed => {}
            CircuitBreakerState::HalfOpen => {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.success_threshold_half_open {
                    self.transition(&mut inner, CircuitBreakerState::Closed);
                }
            }
            CircuitBreakerState::Open => {
                // A request admitted before the trip finished late
                debug!(breaker = %self.name, "Recorded success while circuit is open");
            }
        }
    }

    /// Неудачный исход
    pub fn record_failure(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();
        inner.record(false, self.config.failure_rate_window);

        match inner.state {
            CircuitBreakerState::Closed => {
                if self.should_open(&inner) {
                    self.transition(&mut inner, CircuitBreakerState::Open);
                }
            }
            CircuitBreakerState::HalfOpen => {
                // Any failure in half-open state reopens the circuit
                self.transition(&mut inner, CircuitBreakerState::Open);
            }
            CircuitBreakerState::Open => {}
        }
    }

    /// Run `operation` if admitted and record its outcome
    pub fn execute<T, E, F>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Result<T, E>,
    {
        if !self.allow_request() {
            return Err(CircuitBreakerError::Open {
                name: self.name.clone(),
            });
        }

        match operation() {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(CircuitBreakerError::Operation(e))
            }
        }
    }

    /// Like `execute`, but rejection and failure both resolve through `fallback`
    pub fn execute_with_fallback<T, E, F, G>(&self, operation: F, fallback: G) -> T
    where
        F: FnOnce() -> Result<T, E>,
        G: FnOnce(CircuitBreakerError<E>) -> T,
    {
        self.execute(operation).unwrap_or_else(fallback)
    }

    /// Текущее состояние (cooldown применяется при следующем допуске)
    pub fn state(&self) -> CircuitBreakerState {
        self.inner.lock().state
    }

    /// Trip immediately, regardless of the window
    pub fn force_open(&self) {
        info!(breaker = %self.name, "Forcing circuit breaker to open state");
        let mut inner = self.inner.lock();
        self.transition(&mut inner, CircuitBreakerState::Open);
    }

    /// Force circuit breaker to closed state
    pub fn force_close(&self) {
        info!(breaker = %self.name, "Forcing circuit breaker to closed state");
        let mut inner = self.inner.lock();
        self.transition(&mut inner, CircuitBreakerState::Closed);
    }

    /// Reset circuit breaker statistics
    pub fn reset(&self) {
        debug!(breaker = %self.name, "Resetting circuit breaker statistics");

        let mut inner = self.inner.lock();
        inner.state = CircuitBreakerState::Closed;
        inner.last_state_change = Instant::now();
        inner.clear_window();
        inner.half_open_in_flight = 0;
        inner.half_open_successes = 0;

        for counter in [
            &self.total_requests,
            &self.successful_requests,
            &self.failed_requests,
            &self.blocked_requests,
            &self.state_transitions,
            &self.recovery_attempts,
            &self.successful_recoveries,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    /// Check if circuit should open based on failure conditions
    fn should_open(&self, inner: &BreakerInner) -> bool {
        if inner.failures() >= self.config.failure_threshold {
            return true;
        }

        inner.recent.len() >= self.config.minimum_request_threshold as usize
            && inner.failure_rate() >= self.config.failure_rate_threshold
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitBreakerState) {
        let from = inner.state;
        if from == to {
            return;
        }

        inner.state = to;
        inner.last_state_change = Instant::now();
        inner.half_open_in_flight = 0;
        inner.half_open_successes = 0;
        self.state_transitions.fetch_add(1, Ordering::Relaxed);

        match to {
            CircuitBreakerState::Open => {
                warn!(
                    breaker = %self.name,
                    from = %from,
                    failures_in_window = inner.failures(),
                    "Circuit breaker opening - blocking requests"
                );
            }
            CircuitBreakerState::HalfOpen => {
                self.recovery_attempts.fetch_add(1, Ordering::Relaxed);
                info!(breaker = %self.name, "Circuit breaker transitioning to half-open - testing recovery");
            }
            CircuitBreakerState::Closed => {
                if from == CircuitBreakerState::HalfOpen {
                    self.successful_recoveries.fetch_add(1, Ordering::Relaxed);
                }
                // Old failures must not re-trip a recovered circuit
                inner.clear_window();
                info!(breaker = %self.name, "Circuit breaker closing - operation recovered");
            }
        }
    }

    /// Get circuit breaker statistics
    pub fn stats(&self) -> CircuitBreakerStats {
        let mut inner = self.inner.lock();
        inner.prune(self.config.failure_rate_window);

        CircuitBreakerStats {
            name: self.name.clone(),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            successful_requests: self.successful_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            blocked_requests: self.blocked_requests.load(Ordering::Relaxed),
            state_transitions: self.state_transitions.load(Ordering::Relaxed),
            time_in_current_state: inner.last_state_change.elapsed(),
            recovery_attempts: self.recovery_attempts.load(Ordering::Relaxed),
            successful_recoveries: self.successful_recoveries.load(Ordering::Relaxed),
            current_state: inner.state,
            failures_in_window: inner.failures(),
            failure_rate: inner.failure_rate(),
        }
    }

    /// Get configuration
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }
}

/// Named breakers created on demand
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    defaults: CircuitBreakerConfig,
}

impl CircuitBreakerRegistry {
    pub fn new(defaults: CircuitBreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            defaults,
        }
    }

    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.get(name) {
            return Arc::clone(breaker.value());
        }
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.defaults.clone())))
            .value()
            .clone()
    }

    /// Register a breaker with its own configuration, replacing any existing one
    pub fn register(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        let breaker = Arc::new(CircuitBreaker::new(name, config));
        self.breakers.insert(name.to_string(), Arc::clone(&breaker));
        breaker
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|b| Arc::clone(b.value()))
    }

    pub fn open_count(&self) -> usize {
        self.breakers
            .iter()
            .filter(|b| b.value().state() == CircuitBreakerState::Open)
            .count()
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    pub fn reset_all(&self) {
        for breaker in self.breakers.iter() {
            breaker.value().reset();
        }
    }

    pub fn stats(&self) -> Vec<CircuitBreakerStats> {
        let mut stats: Vec<_> = self.breakers.iter().map(|b| b.value().stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn breaker(config: CircuitBreakerConfig) -> CircuitBreaker {
        CircuitBreaker::new("test", config)
    }

    #[test]
    fn test_circuit_breaker_initial_state() {
        let cb = breaker(CircuitBreakerConfig::default());
        assert_eq!(cb.state(), CircuitBreakerState::Closed);
        assert!(cb.allow_request());
    }

    #[test]
    fn test_circuit_opens_on_failures() {
        let cb = breaker(CircuitBreakerConfig {
            failure_threshold: 3,
            ..Default::default()
        });

        for _ in 0..3 {
            cb.record_failure();
        }

        assert_eq!(cb.state(), CircuitBreakerState::Open);
        assert!(!cb.allow_request());
    }

    #[test]
    fn test_failures_outside_window_do_not_count() {
        let cb = breaker(CircuitBreakerConfig {
            failure_threshold: 2,
            failure_rate_window: Duration::from_millis(20),
            ..Default::default()
        });

        cb.record_failure();
        thread::sleep(Duration::from_millis(40));
        cb.record_failure();

        assert_eq!(cb.state(), CircuitBreakerState::Closed);
    }

    #[test]
    fn test_window_failure_count_tracks_prune() {
        let window = Duration::from_millis(20);
        let mut inner = BreakerInner {
            state: CircuitBreakerState::Closed,
            last_state_change: Instant::now(),
            recent: VecDeque::new(),
            window_failures: 0,
            half_open_in_flight: 0,
            half_open_successes: 0,
        };

        inner.record(false, window);
        inner.record(true, window);
        inner.record(false, window);
        assert_eq!(inner.failures(), 2);
        assert!((inner.failure_rate() - 2.0 / 3.0).abs() < f64::EPSILON);

        thread::sleep(Duration::from_millis(40));
        inner.record(false, window);
        assert_eq!(inner.recent.len(), 1);
        assert_eq!(inner.failures(), 1);

        inner.clear_window();
        assert_eq!(inner.failures(), 0);
        assert_eq!(inner.failure_rate(), 0.0);
    }

    #[test]
    fn test_circuit_recovery_to_half_open() {
        let cb = breaker(CircuitBreakerConfig {
            failure_threshold: 2,
            recovery_timeout: Duration::from_millis(50),
            ..Default::default()
        });

        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitBreakerState::Open);

        thread::sleep(Duration::from_millis(60));

        assert!(cb.allow_request());
        assert_eq!(cb.state(), CircuitBreakerState::HalfOpen);
    }

    #[test]
    fn test_circuit_closes_after_successful_recovery() {
        let cb = breaker(CircuitBreakerConfig {
            failure_threshold: 2,
            success_threshold_half_open: 2,
            recovery_timeout: Duration::from_millis(10),
            ..Default::default()
        });

        cb.record_failure();
        cb.record_failure();

        thread::sleep(Duration::from_millis(20));
        assert!(cb.allow_request());
        cb.record_success();
        assert!(cb.allow_request());
        cb.record_success();

        assert_eq!(cb.state(), CircuitBreakerState::Closed);
        assert_eq!(cb.stats().successful_recoveries, 1);
    }

    #[test]
    fn test_half_open_limits_trial_requests() {
        let cb = breaker(CircuitBreakerConfig {
            failure_threshold: 1,
            max_half_open_requests: 2,
            recovery_timeout: Duration::from_millis(5),
            ..Default::default()
        });
        cb.record_failure();
        thread::sleep(Duration::from_millis(10));

        assert!(cb.allow_request());
        assert!(cb.allow_request());
        assert!(!cb.allow_request());
    }

    #[test]
    fn test_failure_rate_trips_with_minimum_samples() {
        let cb = breaker(CircuitBreakerConfig {
            failure_threshold: 100,
            failure_rate_threshold: 0.5,
            minimum_request_threshold: 4,
            ..Default::default()
        });

        cb.record_success();
        cb.record_success();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitBreakerState::Closed);

        cb.record_failure();
        assert_eq!(cb.state(), CircuitBreakerState::Open);
    }

    #[test]
    fn test_execute_with_fallback() {
        let cb = breaker(CircuitBreakerConfig {
            failure_threshold: 1,
            ..Default::default()
        });

        let value = cb.execute_with_fallback(|| Err::<u32, _>("boom"), |_| 7);
        assert_eq!(value, 7);

        let rejected = cb.execute(|| Ok::<u32, &str>(1));
        assert!(matches!(rejected, Err(CircuitBreakerError::Open { .. })));
    }

    #[test]
    fn test_force_and_reset() {
        let cb = breaker(CircuitBreakerConfig::default());
        cb.force_open();
        assert!(!cb.allow_request());
        cb.force_close();
        assert!(cb.allow_request());

        cb.record_failure();
        cb.reset();
        let stats = cb.stats();
        assert_eq!(stats.failed_requests, 0);
        assert_eq!(stats.current_state, CircuitBreakerState::Closed);
    }

    #[test]
    fn test_registry_shares_breakers_by_name() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 1,
            ..Default::default()
        });
        registry.get_or_create("pipeline").record_failure();

        assert_eq!(
            registry.get_or_create("pipeline").state(),
            CircuitBreakerState::Open
        );
        assert_eq!(registry.open_count(), 1);
        registry.reset_all();
        assert_eq!(registry.open_count(), 0);
    }
}
