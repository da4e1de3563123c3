//! Transform contract and result records

use common::RuntimeError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Ошибка отдельного transform, изолирована в пределах одного unit
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransformError {
    #[error("{0}")]
    Failed(String),

    #[error("transform observed cancellation")]
    Cancelled,

    #[error("transform panicked: {0}")]
    Panicked(String),
}

impl TransformError {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed(reason.into())
    }

    pub fn into_runtime(self, unit_id: &str, transform_id: &str) -> RuntimeError {
        match self {
            TransformError::Cancelled => RuntimeError::Cancelled {
                operation: format!("{transform_id} on {unit_id}"),
            },
            TransformError::Failed(reason) | TransformError::Panicked(reason) => {
                RuntimeError::TransformFailure {
                    unit_id: unit_id.to_string(),
                    transform_id: transform_id.to_string(),
                    reason,
                }
            }
        }
    }
}

/// Mutable view of one unit while transforms run over it.
/// The buffer is borrowed from the pipeline's byte pool.
pub struct WorkingUnit<'a> {
    unit_id: &'a str,
    data: &'a mut Vec<u8>,
    cancel: &'a CancellationToken,
}

impl<'a> WorkingUnit<'a> {
    pub fn new(unit_id: &'a str, data: &'a mut Vec<u8>, cancel: &'a CancellationToken) -> Self {
        Self {
            unit_id,
            data,
            cancel,
        }
    }

    pub fn unit_id(&self) -> &str {
        self.unit_id
    }

    pub fn data(&self) -> &[u8] {
        self.data.as_slice()
    }

    pub fn data_mut(&mut self) -> &mut Vec<u8> {
        &mut *self.data
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Yield point for long transforms
    pub fn check_cancelled(&self) -> Result<(), TransformError> {
        if self.cancel.is_cancelled() {
            Err(TransformError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// A named, orderable operation over a unit.
///
/// `apply` returns `Ok(true)` when it modified the unit.
pub trait Transform: Send + Sync {
    fn id(&self) -> &str;

    /// Lower runs first
    fn priority(&self) -> i32 {
        0
    }

    /// A failing critical transform stops processing of the unit
    fn is_critical(&self) -> bool {
        false
    }

    fn applies_to(&self, _unit_id: &str) -> bool {
        true
    }

    fn apply(&self, unit: &mut WorkingUnit<'_>) -> Result<bool, TransformError>;
}

type ApplyFn = Box<dyn Fn(&mut WorkingUnit<'_>) -> Result<bool, TransformError> + Send + Sync>;
type PredicateFn = Box<dyn Fn(&str) -> bool + Send + Sync>;

/// Closure-backed transform
pub struct FnTransform {
    id: String,
    priority: i32,
    critical: bool,
    predicate: Option<PredicateFn>,
    apply: ApplyFn,
}

impl FnTransform {
    pub fn new<F>(id: impl Into<String>, apply: F) -> Self
    where
        F: Fn(&mut WorkingUnit<'_>) -> Result<bool, TransformError> + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            priority: 0,
            critical: false,
            predicate: None,
            apply: Box::new(apply),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    /// Restrict the transform to units matching `predicate`
    pub fn only_for<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Box::new(predicate));
        self
    }

    pub fn into_arc(self) -> Arc<dyn Transform> {
        Arc::new(self)
    }
}

impl std::fmt::Debug for FnTransform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnTransform")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("critical", &self.critical)
            .finish()
    }
}

impl Transform for FnTransform {
    fn id(&self) -> &str {
        &self.id
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn is_critical(&self) -> bool {
        self.critical
    }

    fn applies_to(&self, unit_id: &str) -> bool {
        self.predicate.as_ref().map_or(true, |p| p(unit_id))
    }

    fn apply(&self, unit: &mut WorkingUnit<'_>) -> Result<bool, TransformError> {
        (self.apply)(unit)
    }
}

/// Shorthand for `FnTransform::new`
pub fn transform_fn<F>(id: impl Into<String>, apply: F) -> FnTransform
where
    F: Fn(&mut WorkingUnit<'_>) -> Result<bool, TransformError> + Send + Sync + 'static,
{
    FnTransform::new(id, apply)
}

/// Why a whole unit was skipped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipReason {
    /// Unit id matched an exclusion prefix
    Excluded,
    /// Nothing to apply
    NoTransforms,
    /// Per-unit batch timeout
    Timeout,
    Cancelled,
    /// Refused by the safe executor (rate limit, breaker, pressure)
    Rejected,
}

/// Why an individual transform did not run (or did not count)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransformSkip {
    NotApplicable,
    BudgetExhausted,
    Failed(String),
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedTransform {
    pub id: String,
    pub reason: TransformSkip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultStatus {
    Completed,
    Skipped,
    Failed,
}

/// Terminal record for one unit
#[derive(Debug)]
pub struct TransformResult {
    pub unit_id: String,
    /// Transformed bytes; skipped results echo the original input
    pub output: Option<Vec<u8>>,
    pub transforms_applied: u32,
    pub duration: Duration,
    pub from_cache: bool,
    pub skipped: bool,
    pub skip_reason: Option<SkipReason>,
    pub applied: Vec<String>,
    pub skipped_transforms: Vec<SkippedTransform>,
    /// Cumulative unit budget ran out; remaining transforms were dropped
    pub budget_exceeded: bool,
    pub modified: bool,
    pub error: Option<RuntimeError>,
}

impl TransformResult {
    pub(crate) fn completed(unit_id: &str, output: Vec<u8>) -> Self {
        Self {
            unit_id: unit_id.to_string(),
            output: Some(output),
            transforms_applied: 0,
            duration: Duration::ZERO,
            from_cache: false,
            skipped: false,
            skip_reason: None,
            applied: Vec::new(),
            skipped_transforms: Vec::new(),
            budget_exceeded: false,
            modified: false,
            error: None,
        }
    }

    pub fn skipped(unit_id: &str, original: &[u8], reason: SkipReason) -> Self {
        Self {
            skipped: true,
            skip_reason: Some(reason),
            ..Self::completed(unit_id, original.to_vec())
        }
    }

    pub fn rejected(unit_id: &str, original: &[u8], error: RuntimeError) -> Self {
        Self {
            error: Some(error),
            ..Self::skipped(unit_id, original, SkipReason::Rejected)
        }
    }

    pub fn failed(unit_id: &str, error: RuntimeError) -> Self {
        Self {
            output: None,
            error: Some(error),
            ..Self::completed(unit_id, Vec::new())
        }
    }

    pub fn status(&self) -> ResultStatus {
        if self.skipped {
            ResultStatus::Skipped
        } else if self.output.is_none() {
            ResultStatus::Failed
        } else {
            ResultStatus::Completed
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status() == ResultStatus::Completed
    }

    /// Bytes to hand back to the host: output when present
    pub fn output_or<'a>(&'a self, original: &'a [u8]) -> &'a [u8] {
        self.output.as_deref().unwrap_or(original)
    }

    pub fn failed_transforms(&self) -> impl Iterator<Item = &SkippedTransform> {
        self.skipped_transforms
            .iter()
            .filter(|s| matches!(s.reason, TransformSkip::Failed(_)))
    }
}
