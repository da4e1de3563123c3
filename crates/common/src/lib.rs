pub mod config;
pub mod errors;
pub mod metrics;
pub mod structured_logging;
pub mod test_utils;

pub use config::{
    BreakerSettings, CacheSettings, ConfigError, LoggingSettings, MaintenanceSettings,
    MemorySettings, ModuleSettings, PipelineSettings, PoolSettings, RateLimiterSettings,
    RuntimeConfig, WatchdogSettings,
};

pub use errors::{
    ErrorContext, ErrorSeverity, IsRecoverable, IsRetriable, RuntimeError, RuntimeResult,
};

pub use metrics::{
    Counter, Gauge, Histogram, HistogramSnapshot, MetricsRegistry, MetricsSnapshot, Timer,
};

pub use structured_logging::{
    init_structured_logging, ExecutionContext, LoggingConfig, OperationTimer,
    PerformanceMetrics, StructuredLogEntry,
};
