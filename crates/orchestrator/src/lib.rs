//! Self-protecting transformation runtime
//!
//! Wraps an arbitrary byte transformation pipeline in protective layers:
//! memory-pressure shedding, lazy module lifecycle, a content-addressed
//! result cache, circuit breakers, rate limiting and a watchdog.
//!
//! # Architecture
//!
//! - **RuntimeContext**: explicit owner of every shared component
//! - **TransformationPipeline**: budgeted, cached, optionally parallel transforms
//! - **SafeExecutor**: admission (limiter → pressure → breaker) plus watchdog
//! - **reliability**: breakers, limiters, watchdog, health monitor
//!
//! # Usage
//!
//! ```no_run
//! use common::RuntimeConfig;
//! use orchestrator::{transform_fn, RuntimeContext};
//!
//! fn main() -> anyhow::Result<()> {
//!     let runtime = RuntimeContext::new(RuntimeConfig::default())?;
//!     runtime.bootstrap()?;
//!
//!     let upper = transform_fn("upper", |unit| {
//!         unit.data_mut().make_ascii_uppercase();
//!         Ok(true)
//!     })
//!     .into_arc();
//!     let result = runtime.transform("scripts/main", b"hello", &[upper]);
//!     assert_eq!(result.output.as_deref(), Some(&b"HELLO"[..]));
//!
//!     runtime.shutdown();
//!     Ok(())
//! }
//! ```

#![allow(clippy::uninlined_format_args)]

pub mod executor;
pub mod pipeline;
pub mod reliability;
pub mod runtime;

// Исполнение с защитой
pub use executor::{ExecutorStats, Rejection, SafeExecutor};

// Конвейер трансформаций
pub use pipeline::{
    transform_fn, FnTransform, PassSet, PipelineStats, ResultStatus, SkipReason,
    SkippedTransform, Transform, TransformError, TransformResult, TransformSkip,
    TransformationPipeline, WorkingUnit,
};

// Надёжность
pub use reliability::{
    ActiveOperation, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError,
    CircuitBreakerRegistry, CircuitBreakerState, CircuitBreakerStats, ComponentHealth,
    HealthCheck, HealthMonitor, HealthReport, HealthStatus, RateLimitError, RateLimiter,
    RateLimiterRegistry, RateLimiterStats, Watchdog, WatchdogError, WatchdogStats, WatchdogToken,
    WORKER_THREAD_PREFIX,
};

pub use runtime::{RuntimeBuilder, RuntimeContext, PIPELINE_OPERATION};
