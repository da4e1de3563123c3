//! Ленивые модули и их реестр

pub mod descriptor;
pub mod lazy;
pub mod registry;

use common::RuntimeError;
use std::time::Duration;
use thiserror::Error;

use crate::guard::PressureLevel;

pub use descriptor::{ModuleClass, ModuleDescriptor, ModulePriority, ModuleState};
pub use lazy::{
    LazyModule, LifecyclePolicy, ModuleCleanup, ModuleFactory, ModuleStats, Thawed,
    LIFECYCLE_LOCK_TIMEOUT,
};
pub use registry::{ModuleHandle, ModuleRegistry};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModuleError {
    #[error("Module '{id}' is not registered")]
    NotFound { id: String },

    #[error("Module '{id}' is already registered")]
    AlreadyRegistered { id: String },

    #[error("Module '{id}' does not hold a {expected}")]
    TypeMismatch { id: String, expected: &'static str },

    #[error("Module '{id}' failed to thaw: {reason}")]
    ThawFailed { id: String, reason: String },

    #[error("Module '{id}' is quarantined for another {remaining:?}")]
    Quarantined { id: String, remaining: Duration },

    #[error("Dependency cycle or depth limit reached at '{id}' (depth {depth})")]
    DependencyCycle { id: String, depth: usize },

    #[error("Thaw of '{id}' denied under {level} memory pressure")]
    ThawDenied { id: String, level: PressureLevel },

    #[error("Module '{id}' declares {budget} bytes but only {headroom} remain in the retained budget")]
    OverBudget { id: String, budget: u64, headroom: u64 },

    #[error("Timed out waiting for lifecycle lock of '{id}'")]
    LockTimeout { id: String },
}

impl From<ModuleError> for RuntimeError {
    fn from(err: ModuleError) -> Self {
        match err {
            ModuleError::ThawFailed { id, reason } => RuntimeError::ModuleThawFailure {
                module_id: id,
                reason,
            },
            ModuleError::Quarantined { id, remaining } => RuntimeError::ModuleQuarantined {
                module_id: id,
                remaining_ms: remaining.as_millis() as u64,
            },
            ModuleError::ThawDenied { level, .. } => RuntimeError::MemoryPressure {
                level: level.to_string(),
            },
            ModuleError::OverBudget { .. } => RuntimeError::MemoryPressure {
                level: "retained budget".to_string(),
            },
            ModuleError::DependencyCycle { ref id, .. } | ModuleError::LockTimeout { ref id } => {
                RuntimeError::ModuleThawFailure {
                    module_id: id.clone(),
                    reason: err.to_string(),
                }
            }
            other => RuntimeError::Internal(other.to_string()),
        }
    }
}
