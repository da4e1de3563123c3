use thiserror::Error;

use crate::config::ConfigError;

/// Единая иерархия ошибок защитного runtime-слоя.
///
/// Expected, recoverable conditions (budget overrun, rejection, quarantine) are
/// ordinary variants here and travel through `Result`. Programming errors are
/// reported as `Internal` and never used for branching.
#[derive(Error, Debug)]
pub enum RuntimeError {
    // === Module lifecycle ===
    #[error("Module '{module_id}' failed to thaw: {reason}")]
    ModuleThawFailure { module_id: String, reason: String },

    #[error("Module '{module_id}' is quarantined for another {remaining_ms}ms")]
    ModuleQuarantined { module_id: String, remaining_ms: u64 },

    // === Pipeline ===
    #[error("Transform '{transform_id}' failed on unit '{unit_id}': {reason}")]
    TransformFailure {
        unit_id: String,
        transform_id: String,
        reason: String,
    },

    #[error("Budget exceeded for {scope}: {elapsed_ms}ms > {budget_ms}ms")]
    BudgetExceeded {
        scope: String,
        elapsed_ms: u64,
        budget_ms: u64,
    },

    // === Fault isolation ===
    #[error("Circuit breaker '{breaker}' is open - operation rejected")]
    CircuitOpen { breaker: String },

    #[error("Rate limiter '{limiter}' rejected the request")]
    RateLimited { limiter: String },

    #[error("Operation '{operation}' exceeded watchdog deadline of {timeout_ms}ms")]
    WatchdogTimeout { operation: String, timeout_ms: u64 },

    #[error("New work refused under {level} memory pressure")]
    MemoryPressure { level: String },

    #[error("Operation '{operation}' was cancelled")]
    Cancelled { operation: String },

    // === Общие ===
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Трейт для определения retriable ошибок
pub trait IsRetriable {
    fn is_retriable(&self) -> bool;
}

impl IsRetriable for RuntimeError {
    fn is_retriable(&self) -> bool {
        match self {
            // Fast-fail rejections clear once the limiter refills or the breaker cools down
            RuntimeError::RateLimited { .. } => true,
            RuntimeError::CircuitOpen { .. } => true,
            RuntimeError::ModuleThawFailure { .. } => true,
            RuntimeError::WatchdogTimeout { .. } => true,
            RuntimeError::MemoryPressure { .. } => true,
            _ => false,
        }
    }
}

/// Трейт для определения recoverable ошибок
pub trait IsRecoverable {
    fn is_recoverable(&self) -> bool;
}

impl IsRecoverable for RuntimeError {
    fn is_recoverable(&self) -> bool {
        match self {
            RuntimeError::TransformFailure { .. } => true,
            RuntimeError::BudgetExceeded { .. } => true,
            RuntimeError::ModuleThawFailure { .. } => true,
            RuntimeError::ModuleQuarantined { .. } => true,
            RuntimeError::Cancelled { .. } => true,
            RuntimeError::Configuration(_) | RuntimeError::Internal(_) => false,
            _ => true,
        }
    }
}

/// Error severity для alerting
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl RuntimeError {
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            RuntimeError::Internal(_) => ErrorSeverity::Critical,
            RuntimeError::MemoryPressure { .. } => ErrorSeverity::High,
            RuntimeError::ModuleQuarantined { .. } => ErrorSeverity::High,
            RuntimeError::Configuration(_) => ErrorSeverity::High,

            RuntimeError::WatchdogTimeout { .. } => ErrorSeverity::Medium,
            RuntimeError::ModuleThawFailure { .. } => ErrorSeverity::Medium,
            RuntimeError::CircuitOpen { .. } => ErrorSeverity::Medium,
            RuntimeError::TransformFailure { .. } => ErrorSeverity::Medium,

            // Expected under load
            RuntimeError::BudgetExceeded { .. } => ErrorSeverity::Low,
            RuntimeError::RateLimited { .. } => ErrorSeverity::Low,
            RuntimeError::Cancelled { .. } => ErrorSeverity::Low,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            RuntimeError::ModuleThawFailure { .. } => "MODULE_THAW_FAILURE",
            RuntimeError::ModuleQuarantined { .. } => "MODULE_QUARANTINED",
            RuntimeError::TransformFailure { .. } => "TRANSFORM_FAILURE",
            RuntimeError::BudgetExceeded { .. } => "BUDGET_EXCEEDED",
            RuntimeError::CircuitOpen { .. } => "CIRCUIT_OPEN",
            RuntimeError::RateLimited { .. } => "RATE_LIMITED",
            RuntimeError::WatchdogTimeout { .. } => "WATCHDOG_TIMEOUT",
            RuntimeError::MemoryPressure { .. } => "MEMORY_PRESSURE",
            RuntimeError::Cancelled { .. } => "CANCELLED",
            RuntimeError::Configuration(_) => "CONFIG_ERROR",
            RuntimeError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

/// Result type alias для удобства
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Extension trait для добавления контекста
pub trait ErrorContext<T> {
    fn context_lazy<F>(self, f: F) -> RuntimeResult<T>
    where
        F: FnOnce() -> String;
}

impl<T, E> ErrorContext<T> for Result<T, E>
where
    E: Into<RuntimeError>,
{
    fn context_lazy<F>(self, f: F) -> RuntimeResult<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| {
            let base_error = e.into();
            RuntimeError::Internal(format!("{}: {}", f(), base_error))
        })
    }
}

/// Макрос для быстрого создания внутренних ошибок
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::errors::RuntimeError::Internal(format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_severity() {
        let internal = RuntimeError::Internal("broken invariant".into());
        assert_eq!(internal.severity(), ErrorSeverity::Critical);

        let limited = RuntimeError::RateLimited {
            limiter: "transform".into(),
        };
        assert_eq!(limited.severity(), ErrorSeverity::Low);
    }

    #[test]
    fn test_retriable_errors() {
        let open = RuntimeError::CircuitOpen {
            breaker: "pipeline".into(),
        };
        assert!(open.is_retriable());

        let internal = RuntimeError::Internal("bug".into());
        assert!(!internal.is_retriable());
        assert!(!internal.is_recoverable());
    }

    #[test]
    fn test_error_codes() {
        let err = RuntimeError::WatchdogTimeout {
            operation: "transform".into(),
            timeout_ms: 10,
        };
        assert_eq!(err.error_code(), "WATCHDOG_TIMEOUT");
        assert!(err.to_string().contains("10ms"));
    }

    #[test]
    fn test_context_lazy_wraps_message() {
        let result: Result<(), RuntimeError> = Err(RuntimeError::Cancelled {
            operation: "batch".into(),
        });
        let wrapped = result.context_lazy(|| "while draining".to_string());
        let message = wrapped.unwrap_err().to_string();
        assert!(message.contains("while draining"));
        assert!(message.contains("batch"));
    }
}
