//! Transformation pipeline
//!
//! Applies an ordered set of transforms to one unit under a cumulative time
//! budget, consulting the transform cache first and working in a pooled
//! buffer. Batches fan out to a bounded worker pool.

pub mod passes;
pub mod transform;
mod workers;

pub use passes::PassSet;
pub use transform::{
    transform_fn, FnTransform, ResultStatus, SkipReason, SkippedTransform, Transform,
    TransformError, TransformResult, TransformSkip, WorkingUnit,
};

use ahash::RandomState;
use common::{Counter, Histogram, MetricsRegistry, PipelineSettings};
use memory::{BoundedPool, TransformCache};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::hash::{BuildHasher, Hash, Hasher};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::reliability::Watchdog;
use workers::WorkerPool;

// Fixed so that fingerprints are stable across pipeline instances
const FINGERPRINT_SEEDS: [u64; 4] = [
    0x243f_6a88_85a3_08d3,
    0x1319_8a2e_0370_7344,
    0xa409_3822_299f_31d0,
    0x082e_fa98_ec4e_6c89,
];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineStats {
    pub units: u64,
    pub completed: u64,
    pub cache_hits: u64,
    pub skipped: u64,
    pub excluded: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub timeouts: u64,
    /// Units whose cumulative budget ran out
    pub budget_exceeded: u64,
    /// Single transforms over their soft budget
    pub soft_violations: u64,
    pub transform_failures: u64,
    pub batches: u64,
    pub caller_runs: u64,
    pub workers: usize,
    pub mean_unit_ms: f64,
}

struct PipelineCounters {
    units: Arc<Counter>,
    completed: Arc<Counter>,
    cache_hits: Arc<Counter>,
    skipped: Arc<Counter>,
    excluded: Arc<Counter>,
    failed: Arc<Counter>,
    cancelled: Arc<Counter>,
    timeouts: Arc<Counter>,
    budget_exceeded: Arc<Counter>,
    soft_violations: Arc<Counter>,
    transform_failures: Arc<Counter>,
    batches: Arc<Counter>,
    caller_runs: Arc<Counter>,
    unit_time: Arc<Histogram>,
    transform_time: Arc<Histogram>,
}

impl PipelineCounters {
    fn new(metrics: &MetricsRegistry) -> Self {
        Self {
            units: metrics.counter("pipeline.units"),
            completed: metrics.counter("pipeline.completed"),
            cache_hits: metrics.counter("pipeline.cache_hits"),
            skipped: metrics.counter("pipeline.skipped"),
            excluded: metrics.counter("pipeline.excluded"),
            failed: metrics.counter("pipeline.failed"),
            cancelled: metrics.counter("pipeline.cancelled"),
            timeouts: metrics.counter("pipeline.timeouts"),
            budget_exceeded: metrics.counter("pipeline.budget_exceeded"),
            soft_violations: metrics.counter("pipeline.soft_violations"),
            transform_failures: metrics.counter("pipeline.transform_failures"),
            batches: metrics.counter("pipeline.batches"),
            caller_runs: metrics.counter("pipeline.caller_runs"),
            unit_time: metrics.histogram("pipeline.unit_ms"),
            transform_time: metrics.histogram("pipeline.transform_ms"),
        }
    }
}

pub(crate) struct PipelineCore {
    settings: RwLock<PipelineSettings>,
    cache: Arc<TransformCache>,
    buffers: BoundedPool<Vec<u8>>,
    watchdog: Option<Arc<Watchdog>>,
    generation: RwLock<CancellationToken>,
    counters: PipelineCounters,
    fingerprints: RandomState,
}

impl PipelineCore {
    fn is_excluded(&self, unit_id: &str) -> bool {
        self.settings
            .read()
            .excluded_prefixes
            .iter()
            .any(|prefix| unit_id.starts_with(prefix.as_str()))
    }

    /// Cache salt for an ordered list of effective transforms
    fn fingerprint(&self, transforms: &[&Arc<dyn Transform>]) -> u64 {
        let mut hasher = self.fingerprints.build_hasher();
        for transform in transforms {
            transform.id().hash(&mut hasher);
            transform.priority().hash(&mut hasher);
        }
        hasher.finish()
    }

    pub(crate) fn record_cancelled(&self) {
        self.counters.units.inc();
        self.counters.cancelled.inc();
        self.counters.skipped.inc();
    }

    pub(crate) fn record_failed(&self) {
        self.counters.units.inc();
        self.counters.failed.inc();
    }

    pub(crate) fn record_timeout(&self) {
        self.counters.timeouts.inc();
    }

    pub(crate) fn record_caller_run(&self) {
        self.counters.caller_runs.inc();
    }

    pub(crate) fn watchdog(&self) -> Option<&Arc<Watchdog>> {
        self.watchdog.as_ref()
    }

    /// Run every applicable transform over one unit
    pub(crate) fn run_unit(
        &self,
        unit_id: &str,
        input: &[u8],
        transforms: &[Arc<dyn Transform>],
        cancel: &CancellationToken,
    ) -> TransformResult {
        let start = Instant::now();
        self.counters.units.inc();

        if self.is_excluded(unit_id) {
            self.counters.excluded.inc();
            return self.finish(
                TransformResult::skipped(unit_id, input, SkipReason::Excluded),
                start,
            );
        }

        if transforms.is_empty() {
            return self.finish(
                TransformResult::skipped(unit_id, input, SkipReason::NoTransforms),
                start,
            );
        }

        let (unit_budget, transform_budget) = {
            let settings = self.settings.read();
            (settings.unit_budget(), settings.transform_budget())
        };

        let mut skipped_transforms = Vec::new();
        let mut effective: Vec<&Arc<dyn Transform>> = Vec::with_capacity(transforms.len());
        for transform in transforms {
            if transform.applies_to(unit_id) {
                effective.push(transform);
            } else {
                skipped_transforms.push(SkippedTransform {
                    id: transform.id().to_string(),
                    reason: TransformSkip::NotApplicable,
                });
            }
        }

        if effective.is_empty() {
            let mut result = TransformResult::skipped(unit_id, input, SkipReason::NoTransforms);
            result.skipped_transforms = skipped_transforms;
            return self.finish(result, start);
        }

        // Stable: equal priorities keep their submitted order
        effective.sort_by_key(|t| t.priority());
        let salt = self.fingerprint(&effective);

        if let Some(hit) = self.cache.lookup(input, salt) {
            self.counters.cache_hits.inc();
            let mut result = TransformResult::completed(unit_id, hit.output);
            result.from_cache = true;
            result.transforms_applied = hit.transform_count;
            result.skipped_transforms = skipped_transforms;
            return self.finish(result, start);
        }

        let mut buffer = self.buffers.borrow();
        buffer.extend_from_slice(input);

        let mut applied: Vec<String> = Vec::with_capacity(effective.len());
        let mut modified = false;
        let mut budget_exceeded = false;

        for (index, transform) in effective.iter().enumerate() {
            if cancel.is_cancelled() {
                skip_rest(&mut skipped_transforms, &effective[index..], TransformSkip::Cancelled);
                return self.cancelled(unit_id, input, applied, skipped_transforms, start);
            }

            let transform_start = Instant::now();
            let outcome = {
                let mut unit = WorkingUnit::new(unit_id, &mut buffer, cancel);
                catch_unwind(AssertUnwindSafe(|| transform.apply(&mut unit)))
                    .unwrap_or_else(|payload| Err(TransformError::Panicked(panic_message(&payload))))
            };
            let took = transform_start.elapsed();
            self.counters.transform_time.record(took);

            if took > transform_budget {
                self.counters.soft_violations.inc();
                warn!(
                    unit_id = %unit_id,
                    transform = transform.id(),
                    duration_ms = took.as_millis() as u64,
                    budget_ms = transform_budget.as_millis() as u64,
                    "Transform exceeded its soft budget"
                );
            }

            match outcome {
                Ok(changed) => {
                    applied.push(transform.id().to_string());
                    modified |= changed;
                }
                Err(TransformError::Cancelled) => {
                    skip_rest(&mut skipped_transforms, &effective[index..], TransformSkip::Cancelled);
                    return self.cancelled(unit_id, input, applied, skipped_transforms, start);
                }
                Err(err) => {
                    self.counters.transform_failures.inc();
                    if transform.is_critical() {
                        error!(
                            unit_id = %unit_id,
                            transform = transform.id(),
                            error = %err,
                            "Critical transform failed, unit abandoned"
                        );
                        skip_rest(
                            &mut skipped_transforms,
                            &effective[index..index + 1],
                            TransformSkip::Failed(err.to_string()),
                        );
                        let mut result = TransformResult::failed(
                            unit_id,
                            err.into_runtime(unit_id, transform.id()),
                        );
                        result.transforms_applied = applied.len() as u32;
                        result.applied = applied;
                        result.skipped_transforms = skipped_transforms;
                        return self.finish(result, start);
                    }

                    warn!(
                        unit_id = %unit_id,
                        transform = transform.id(),
                        error = %err,
                        "Transform failed, continuing with the next one"
                    );
                    skipped_transforms.push(SkippedTransform {
                        id: transform.id().to_string(),
                        reason: TransformSkip::Failed(err.to_string()),
                    });
                }
            }

            let elapsed = start.elapsed();
            if elapsed > unit_budget {
                budget_exceeded = true;
                let remaining = &effective[index + 1..];
                skip_rest(&mut skipped_transforms, remaining, TransformSkip::BudgetExhausted);
                warn!(
                    unit_id = %unit_id,
                    elapsed_ms = elapsed.as_millis() as u64,
                    budget_ms = unit_budget.as_millis() as u64,
                    dropped = remaining.len(),
                    "Unit budget exhausted, remaining transforms skipped"
                );
                break;
            }
        }

        let output = if modified {
            buffer.to_vec()
        } else {
            input.to_vec()
        };
        drop(buffer);

        if budget_exceeded {
            self.counters.budget_exceeded.inc();
        } else if let Err(e) =
            self.cache
                .put_salted(input, salt, &output, unit_id, applied.len() as u32)
        {
            debug!(unit_id = %unit_id, error = %e, "Transform output not cached");
        }

        let mut result = TransformResult::completed(unit_id, output);
        result.transforms_applied = applied.len() as u32;
        result.applied = applied;
        result.skipped_transforms = skipped_transforms;
        result.budget_exceeded = budget_exceeded;
        result.modified = modified;
        self.finish(result, start)
    }

    fn cancelled(
        &self,
        unit_id: &str,
        input: &[u8],
        applied: Vec<String>,
        skipped_transforms: Vec<SkippedTransform>,
        start: Instant,
    ) -> TransformResult {
        debug!(unit_id = %unit_id, applied = applied.len(), "Unit cancelled mid-run");
        let mut result = TransformResult::skipped(unit_id, input, SkipReason::Cancelled);
        result.applied = applied;
        result.skipped_transforms = skipped_transforms;
        self.finish(result, start)
    }

    fn finish(&self, mut result: TransformResult, start: Instant) -> TransformResult {
        result.duration = start.elapsed();
        self.counters.unit_time.record(result.duration);

        match result.status() {
            ResultStatus::Completed => self.counters.completed.inc(),
            ResultStatus::Failed => self.counters.failed.inc(),
            ResultStatus::Skipped => {
                self.counters.skipped.inc();
                if result.skip_reason == Some(SkipReason::Cancelled) {
                    self.counters.cancelled.inc();
                }
            }
        }
        result
    }
}

fn skip_rest(
    skipped: &mut Vec<SkippedTransform>,
    rest: &[&Arc<dyn Transform>],
    reason: TransformSkip,
) {
    skipped.extend(rest.iter().map(|t| SkippedTransform {
        id: t.id().to_string(),
        reason: reason.clone(),
    }));
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Budgeted transformation pipeline
pub struct TransformationPipeline {
    core: Arc<PipelineCore>,
    workers: Mutex<Option<Arc<WorkerPool>>>,
}

impl std::fmt::Debug for TransformationPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformationPipeline")
            .field("settings", &*self.core.settings.read())
            .field("workers", &self.worker_count())
            .finish()
    }
}

impl TransformationPipeline {
    pub fn new(
        settings: &PipelineSettings,
        cache: Arc<TransformCache>,
        buffers: BoundedPool<Vec<u8>>,
        metrics: &MetricsRegistry,
        watchdog: Option<Arc<Watchdog>>,
    ) -> Self {
        Self {
            core: Arc::new(PipelineCore {
                settings: RwLock::new(settings.clone()),
                cache,
                buffers,
                watchdog,
                generation: RwLock::new(CancellationToken::new()),
                counters: PipelineCounters::new(metrics),
                fingerprints: RandomState::with_seeds(
                    FINGERPRINT_SEEDS[0],
                    FINGERPRINT_SEEDS[1],
                    FINGERPRINT_SEEDS[2],
                    FINGERPRINT_SEEDS[3],
                ),
            }),
            workers: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> PipelineSettings {
        self.core.settings.read().clone()
    }

    pub fn cache(&self) -> &Arc<TransformCache> {
        &self.core.cache
    }

    pub fn buffers(&self) -> &BoundedPool<Vec<u8>> {
        &self.core.buffers
    }

    /// Change budgets and parallelism. A new worker count takes effect on
    /// the next batch; `max_parallelism == 0` means one worker per CPU.
    pub fn configure(
        &self,
        unit_budget: Duration,
        transform_budget: Duration,
        parallel: bool,
        max_parallelism: usize,
    ) {
        let max_parallelism = match max_parallelism {
            0 => num_cpus::get().max(1),
            n => n,
        };
        let resized = {
            let mut settings = self.core.settings.write();
            settings.unit_budget_ms = unit_budget.as_millis() as u64;
            settings.transform_budget_ms = transform_budget.as_millis() as u64;
            settings.parallel = parallel;
            let resized = settings.max_parallelism != max_parallelism;
            settings.max_parallelism = max_parallelism;
            resized
        };

        if resized || !parallel {
            self.stop_workers();
        }

        info!(
            unit_budget_ms = unit_budget.as_millis() as u64,
            transform_budget_ms = transform_budget.as_millis() as u64,
            parallel,
            max_parallelism,
            "Pipeline reconfigured"
        );
    }

    pub fn set_excluded_prefixes(&self, prefixes: Vec<String>) {
        self.core.settings.write().excluded_prefixes = prefixes;
    }

    pub fn is_excluded(&self, unit_id: &str) -> bool {
        self.core.is_excluded(unit_id)
    }

    pub fn transform(
        &self,
        unit_id: &str,
        input: &[u8],
        transforms: &[Arc<dyn Transform>],
    ) -> TransformResult {
        self.core
            .run_unit(unit_id, input, transforms, &CancellationToken::new())
    }

    /// Like `transform`, observing an external cancellation token between
    /// transforms
    pub fn transform_with_cancel(
        &self,
        unit_id: &str,
        input: &[u8],
        transforms: &[Arc<dyn Transform>],
        cancel: &CancellationToken,
    ) -> TransformResult {
        self.core.run_unit(unit_id, input, transforms, cancel)
    }

    /// Transform many units. Results keep input order.
    pub fn transform_batch(
        &self,
        units: Vec<(String, Vec<u8>)>,
        transforms: &[Arc<dyn Transform>],
    ) -> Vec<TransformResult> {
        self.core.counters.batches.inc();
        let generation = self.core.generation.read().clone();
        let settings = self.settings();

        if settings.parallel && units.len() > 1 {
            if let Some(pool) = self.worker_pool(&settings) {
                let unit_timeout = (settings.unit_budget() * 2).max(Duration::from_millis(1));
                return workers::run_batch(
                    &self.core,
                    &pool,
                    units,
                    transforms.to_vec(),
                    generation,
                    unit_timeout,
                );
            }
        }

        units
            .into_iter()
            .map(|(unit_id, bytes)| {
                if generation.is_cancelled() {
                    self.core.record_cancelled();
                    TransformResult::skipped(&unit_id, &bytes, SkipReason::Cancelled)
                } else {
                    self.transform(&unit_id, &bytes, transforms)
                }
            })
            .collect()
    }

    /// Cancel batch work that has not started yet. Units already running
    /// finish normally.
    pub fn cancel_queued(&self) {
        let previous = {
            let mut generation = self.core.generation.write();
            std::mem::replace(&mut *generation, CancellationToken::new())
        };
        previous.cancel();
        info!("Queued pipeline work cancelled");
    }

    pub fn worker_count(&self) -> usize {
        self.workers.lock().as_ref().map_or(0, |pool| pool.size())
    }

    pub fn stats(&self) -> PipelineStats {
        let c = &self.core.counters;
        PipelineStats {
            units: c.units.get(),
            completed: c.completed.get(),
            cache_hits: c.cache_hits.get(),
            skipped: c.skipped.get(),
            excluded: c.excluded.get(),
            failed: c.failed.get(),
            cancelled: c.cancelled.get(),
            timeouts: c.timeouts.get(),
            budget_exceeded: c.budget_exceeded.get(),
            soft_violations: c.soft_violations.get(),
            transform_failures: c.transform_failures.get(),
            batches: c.batches.get(),
            caller_runs: c.caller_runs.get(),
            workers: self.worker_count(),
            mean_unit_ms: c.unit_time.mean_ms(),
        }
    }

    /// Stop worker threads; later batches start a fresh pool
    pub fn shutdown(&self) {
        self.stop_workers();
    }

    fn worker_pool(&self, settings: &PipelineSettings) -> Option<Arc<WorkerPool>> {
        let mut workers = self.workers.lock();
        if let Some(pool) = workers.as_ref() {
            return Some(Arc::clone(pool));
        }

        match WorkerPool::new(settings.max_parallelism, settings.queue_factor) {
            Ok(pool) => {
                let pool = Arc::new(pool);
                *workers = Some(Arc::clone(&pool));
                Some(pool)
            }
            Err(e) => {
                error!(error = %e, "Failed to start pipeline workers, running batch on caller");
                None
            }
        }
    }

    fn stop_workers(&self) {
        let pool = self.workers.lock().take();
        if let Some(pool) = pool {
            pool.shutdown();
        }
    }
}

impl Drop for TransformationPipeline {
    fn drop(&mut self) {
        self.stop_workers();
    }
}
