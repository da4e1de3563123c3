//! Runtime context
//!
//! Owns every process-wide component (metrics, memory guard, cache, pools,
//! module registry, breakers, limiters, watchdog, pipeline, executor, health)
//! as plain fields. Several contexts can coexist, which keeps tests isolated.

use common::{
    MetricsRegistry, MetricsSnapshot, OperationTimer, RuntimeConfig, RuntimeError, RuntimeResult,
};
use memory::{
    BoundedPool, MemoryGuard, MemoryProbe, ModuleDescriptor, ModuleHandle, ModulePriority,
    ModuleRegistry, PoolRegistry, PressureLevel, SystemMemoryProbe, Thawed, TransformCache,
};
use parking_lot::{Condvar, Mutex, RwLock};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::executor::SafeExecutor;
use crate::pipeline::{
    PassSet, ResultStatus, SkipReason, Transform, TransformResult, TransformationPipeline,
};
use crate::reliability::{
    CircuitBreakerConfig, CircuitBreakerRegistry, ComponentHealth, HealthCheck, HealthMonitor,
    HealthReport, HealthStatus, RateLimiterRegistry, Watchdog,
};

/// Breaker, limiter and watchdog name used for pipeline calls
pub const PIPELINE_OPERATION: &str = "pipeline";
const PIPELINE_BATCH_OPERATION: &str = "pipeline.batch";

type EmergencyCallback = Arc<dyn Fn() + Send + Sync>;

struct Maintenance {
    stop: Arc<(Mutex<bool>, Condvar)>,
    handle: JoinHandle<()>,
}

pub struct RuntimeBuilder {
    config: RuntimeConfig,
    probe: Option<Arc<dyn MemoryProbe>>,
    watchdog_monitor: bool,
}

impl RuntimeBuilder {
    /// Replace the system memory probe, e.g. with a `StaticMemoryProbe`
    pub fn probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Run without the watchdog monitor thread; overdue checks then only
    /// happen through `Watchdog::poll`
    pub fn without_watchdog_monitor(mut self) -> Self {
        self.watchdog_monitor = false;
        self
    }

    pub fn build(self) -> RuntimeResult<Arc<RuntimeContext>> {
        let config = self.config;
        config.validate()?;

        let metrics = Arc::new(MetricsRegistry::new());
        let probe = self.probe.unwrap_or_else(|| {
            Arc::new(SystemMemoryProbe::new(config.memory.process_ceiling_bytes))
        });
        let guard = Arc::new(MemoryGuard::new(probe, &config.memory));
        let cache = Arc::new(TransformCache::new(&config.cache).with_guard(Arc::clone(&guard)));

        let pools = Arc::new(PoolRegistry::new());
        let buffers = BoundedPool::byte_buffers("pipeline.buffers", &config.pools);
        pools.register(Arc::new(buffers.clone()));

        let modules = Arc::new(ModuleRegistry::new(&config.modules, Some(Arc::clone(&guard))));
        let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::from(
            &config.breaker,
        )));
        let limiters = Arc::new(RateLimiterRegistry::new(config.rate_limiter.clone()));
        let watchdog = Arc::new(if self.watchdog_monitor {
            Watchdog::new(&config.watchdog)
        } else {
            Watchdog::without_monitor(&config.watchdog)
        });

        let pipeline = Arc::new(TransformationPipeline::new(
            &config.pipeline,
            Arc::clone(&cache),
            buffers,
            &metrics,
            Some(Arc::clone(&watchdog)),
        ));
        let executor = SafeExecutor::new(
            Arc::clone(&guard),
            Arc::clone(&breakers),
            Arc::clone(&limiters),
            Arc::clone(&watchdog),
            &metrics,
        );

        debug!("Runtime context built");
        Ok(Arc::new(RuntimeContext {
            config,
            metrics,
            guard,
            cache,
            pools,
            modules,
            breakers,
            limiters,
            watchdog,
            pipeline,
            executor,
            health: HealthMonitor::new(),
            emergency: RwLock::new(Vec::new()),
            maintenance: Mutex::new(None),
            bootstrapped: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        }))
    }
}

/// Explicitly constructed runtime: the single owner of every shared component
pub struct RuntimeContext {
    config: RuntimeConfig,
    metrics: Arc<MetricsRegistry>,
    guard: Arc<MemoryGuard>,
    cache: Arc<TransformCache>,
    pools: Arc<PoolRegistry>,
    modules: Arc<ModuleRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
    limiters: Arc<RateLimiterRegistry>,
    watchdog: Arc<Watchdog>,
    pipeline: Arc<TransformationPipeline>,
    executor: SafeExecutor,
    health: HealthMonitor,
    emergency: RwLock<Vec<EmergencyCallback>>,
    maintenance: Mutex<Option<Maintenance>>,
    bootstrapped: AtomicBool,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for RuntimeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeContext")
            .field("bootstrapped", &self.bootstrapped.load(Ordering::Relaxed))
            .field("shut_down", &self.shut_down.load(Ordering::Relaxed))
            .field("modules", &self.modules.len())
            .field("pressure", &self.guard.current_level())
            .finish()
    }
}

impl RuntimeContext {
    pub fn builder(config: RuntimeConfig) -> RuntimeBuilder {
        RuntimeBuilder {
            config,
            probe: None,
            watchdog_monitor: true,
        }
    }

    pub fn new(config: RuntimeConfig) -> RuntimeResult<Arc<Self>> {
        Self::builder(config).build()
    }

    /// Thaw core modules, warm pools, install health checks, the pressure
    /// responder and the maintenance thread. Calling it twice is a no-op.
    pub fn bootstrap(self: &Arc<Self>) -> RuntimeResult<()> {
        if self.bootstrapped.swap(true, Ordering::AcqRel) {
            debug!("Runtime already bootstrapped");
            return Ok(());
        }

        let timer = OperationTimer::new("runtime.bootstrap");
        let outcome = self.start_components();
        timer.finish_with_result(&outcome);
        outcome
    }

    fn start_components(self: &Arc<Self>) -> RuntimeResult<()> {
        self.modules.validate_dependencies()?;
        let core = self.modules.initialize()?;

        let warmed = self.pipeline.buffers().warm_up(self.config.pools.warm_up);

        self.register_default_health_checks();
        self.install_pressure_responder();

        if self.config.maintenance.enabled {
            self.start_maintenance();
        }

        info!(
            core_modules = core,
            warmed_buffers = warmed,
            modules = self.modules.len(),
            "Runtime bootstrapped"
        );
        Ok(())
    }

    fn install_pressure_responder(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.guard.on_pressure_change(move |previous, level| {
            if let Some(runtime) = weak.upgrade() {
                runtime.respond_to_pressure(previous, level);
            }
        });

        if let Some(budget) = self.config.memory.retained_budget_bytes {
            // Weak: the cache and registry both hold the guard
            let modules = Arc::downgrade(&self.modules);
            let cache = Arc::downgrade(&self.cache);
            self.guard.set_retained_source(budget, move || {
                let module_bytes = modules.upgrade().map_or(0, |m| m.accounted_bytes());
                let cache_bytes = cache.upgrade().map_or(0, |c| c.total_bytes());
                module_bytes + cache_bytes
            });
        }
    }

    /// Escalating, idempotent reaction to an upward pressure transition.
    /// Downward transitions only log.
    pub fn respond_to_pressure(&self, previous: PressureLevel, level: PressureLevel) {
        self.metrics.counter("runtime.pressure_transitions").inc();

        if level <= previous {
            info!(from = %previous, to = %level, "Memory pressure eased");
            return;
        }

        match level {
            PressureLevel::Green => {}
            PressureLevel::Yellow => {
                let frozen = self.modules.freeze_idle();
                warn!(level = %level, frozen, "Memory pressure response");
            }
            PressureLevel::Orange => {
                let frozen = self.modules.freeze_idle();
                let shed = self.modules.shed_priorities(ModulePriority::Disposable);
                let evicted = self.cache.shrink(0.5);
                warn!(level = %level, frozen, shed, evicted, "Memory pressure response");
            }
            PressureLevel::Red => {
                let frozen = self.modules.freeze_idle();
                let shed = self.modules.shed_priorities(ModulePriority::Normal);
                let evicted = self.cache.shrink(0.25);
                let drained = self.pools.drain_all();
                warn!(level = %level, frozen, shed, evicted, drained, "Memory pressure response");
            }
            PressureLevel::Critical => {
                let shed = self.modules.shed_all_non_core();
                self.cache.clear();
                let drained = self.pools.drain_all();
                self.pipeline.cancel_queued();
                error!(level = %level, shed, drained, "Critical memory pressure: emergency shedding");
                self.run_emergency_callbacks();
            }
        }
    }

    fn run_emergency_callbacks(&self) {
        let callbacks = self.emergency.read().clone();
        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback())).is_err() {
                error!("Emergency callback panicked");
            }
        }
    }

    /// Called once per CRITICAL transition, after built-in shedding
    pub fn on_emergency<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.emergency.write().push(Arc::new(callback));
    }

    fn start_maintenance(self: &Arc<Self>) {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let thread_stop = Arc::clone(&stop);
        let weak: Weak<Self> = Arc::downgrade(self);
        let interval = Duration::from_millis(self.config.maintenance.tick_interval_ms.max(1));
        let report_every = u64::from(self.config.maintenance.health_report_every_ticks.max(1));

        let spawned = thread::Builder::new()
            .name("aegis-maintenance".to_string())
            .spawn(move || {
                let mut tick: u64 = 0;
                loop {
                    {
                        let (lock, wake) = &*thread_stop;
                        let mut stopped = lock.lock();
                        if !*stopped {
                            wake.wait_for(&mut stopped, interval);
                        }
                        if *stopped {
                            break;
                        }
                    }

                    let Some(runtime) = weak.upgrade() else {
                        break;
                    };
                    tick += 1;
                    runtime.maintenance_tick(tick % report_every == 0);
                }
                debug!("Maintenance thread stopped");
            });

        match spawned {
            Ok(handle) => *self.maintenance.lock() = Some(Maintenance { stop, handle }),
            Err(e) => error!(error = %e, "Failed to spawn maintenance thread"),
        }
    }

    /// One maintenance pass: pressure poll, idle freezing, cache purge and
    /// optionally a health report
    pub fn maintenance_tick(&self, report_health: bool) {
        let level = self.guard.check_pressure();
        let frozen = self.modules.freeze_idle();
        let expired = self.cache.purge_expired();
        if frozen > 0 || expired > 0 {
            debug!(level = %level, frozen, expired, "Maintenance tick");
        }

        if report_health {
            let report = self.full_health_report();
            if report.status == HealthStatus::Healthy {
                info!(status = %report.status, uptime_seconds = report.uptime_seconds, "Health report");
            } else {
                warn!(
                    status = %report.status,
                    problems = ?report.problems(),
                    "Health report"
                );
            }
        }
    }

    fn stop_maintenance(&self) {
        let Some(maintenance) = self.maintenance.lock().take() else {
            return;
        };

        {
            let (lock, wake) = &*maintenance.stop;
            *lock.lock() = true;
            wake.notify_all();
        }

        // The last Arc may be released on the maintenance thread itself
        if maintenance.handle.thread().id() == thread::current().id() {
            return;
        }
        if maintenance.handle.join().is_err() {
            error!("Maintenance thread panicked");
        }
    }

    /// Graceful teardown: stop background threads, freeze every module,
    /// drain pools, clear the cache and flush final metrics.
    pub fn shutdown(&self) -> MetricsSnapshot {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return self.metrics.snapshot();
        }

        self.stop_maintenance();
        self.executor.shutdown();
        self.pipeline.shutdown();
        let released = self.modules.release_all();
        let drained = self.pools.drain_all();
        self.cache.clear();
        self.watchdog.shutdown();

        let snapshot = self.metrics.snapshot();
        match serde_json::to_string(&snapshot) {
            Ok(json) => info!(released_bytes = released, drained, metrics = %json, "Runtime shut down"),
            Err(e) => warn!(error = %e, "Runtime shut down; metrics snapshot not serializable"),
        }
        snapshot
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    // === Modules ===

    pub fn register_module<T, F, C>(
        &self,
        descriptor: ModuleDescriptor,
        factory: F,
        cleanup: C,
    ) -> RuntimeResult<ModuleHandle<T>>
    where
        T: Send + Sync + 'static,
        F: Fn() -> anyhow::Result<Thawed<T>> + Send + Sync + 'static,
        C: Fn(Arc<T>) -> anyhow::Result<u64> + Send + Sync + 'static,
    {
        Ok(self.modules.register(descriptor, factory, cleanup)?)
    }

    /// Thaw (if needed) and return the module instance
    pub fn get_module<T: Send + Sync + 'static>(&self, id: &str) -> RuntimeResult<Arc<T>> {
        Ok(self.modules.get::<T>(id)?.get()?)
    }

    pub fn module<T: Send + Sync + 'static>(&self, handle: &ModuleHandle<T>) -> RuntimeResult<Arc<T>> {
        Ok(self.modules.instance(handle)?)
    }

    /// Register an optimization pass set as an on-demand module
    pub fn register_pass_set<F>(&self, id: &str, build: F) -> RuntimeResult<ModuleHandle<PassSet>>
    where
        F: Fn() -> anyhow::Result<PassSet> + Send + Sync + 'static,
    {
        self.register_module(
            PassSet::descriptor(id),
            move || Ok(build()?.into_thawed()),
            |set: Arc<PassSet>| Ok(set.estimated_bytes()),
        )
    }

    // === Pipeline ===

    /// Transform one unit through the safe executor. Always returns a
    /// terminal result.
    pub fn transform(
        &self,
        unit_id: &str,
        bytes: &[u8],
        transforms: &[Arc<dyn Transform>],
    ) -> TransformResult {
        let timeout = self.watchdog.default_timeout();
        self.executor.execute_classified(
            PIPELINE_OPERATION,
            timeout,
            |cancel| {
                Ok(self
                    .pipeline
                    .transform_with_cancel(unit_id, bytes, transforms, cancel))
            },
            |result: &TransformResult| result.status() == ResultStatus::Failed,
            |error| rejected_result(unit_id, bytes, error),
        )
    }

    /// Transform a batch. Admission is decided once for the whole batch;
    /// results keep input order.
    pub fn transform_batch(
        &self,
        units: Vec<(String, Vec<u8>)>,
        transforms: &[Arc<dyn Transform>],
    ) -> Vec<TransformResult> {
        let breaker = match self.executor.admit(PIPELINE_BATCH_OPERATION) {
            Ok(breaker) => breaker,
            Err(rejection) => {
                return units
                    .iter()
                    .map(|(unit_id, bytes)| {
                        TransformResult::rejected(
                            unit_id,
                            bytes,
                            rejection.to_error(PIPELINE_BATCH_OPERATION),
                        )
                    })
                    .collect();
            }
        };

        let results = self.pipeline.transform_batch(units, transforms);
        if results.iter().any(|r| r.status() == ResultStatus::Failed) {
            breaker.record_failure();
        } else {
            breaker.record_success();
        }
        results
    }

    /// Transform with the passes of a lazily thawed `PassSet` module
    pub fn transform_with_passes(
        &self,
        unit_id: &str,
        bytes: &[u8],
        pass_module_id: &str,
    ) -> TransformResult {
        match self.get_module::<PassSet>(pass_module_id) {
            Ok(passes) => self.transform(unit_id, bytes, passes.passes()),
            Err(e) => {
                warn!(unit_id = %unit_id, module = pass_module_id, error = %e, "Pass set unavailable");
                TransformResult::rejected(unit_id, bytes, e)
            }
        }
    }

    pub fn configure_pipeline(
        &self,
        unit_budget_ms: u64,
        transform_budget_ms: u64,
        parallel: bool,
        max_parallelism: usize,
    ) {
        self.pipeline.configure(
            Duration::from_millis(unit_budget_ms),
            Duration::from_millis(transform_budget_ms),
            parallel,
            max_parallelism,
        );
    }

    pub fn configure_cache(&self, max_entries_per_stripe: usize, max_total_bytes: u64, ttl_ms: u64) {
        self.cache.configure(
            max_entries_per_stripe,
            max_total_bytes,
            Duration::from_millis(ttl_ms),
        );
    }

    // === Health ===

    pub fn register_health_check(&self, name: &str, check: impl HealthCheck + 'static) {
        self.health.register_check(name, check);
    }

    pub fn full_health_report(&self) -> HealthReport {
        self.health.full_report()
    }

    fn register_default_health_checks(self: &Arc<Self>) {
        let guard = Arc::clone(&self.guard);
        self.health.register_check("memory", move || {
            let stats = guard.stats();
            let status = match stats.level {
                PressureLevel::Green => HealthStatus::Healthy,
                PressureLevel::Yellow | PressureLevel::Orange => HealthStatus::Degraded,
                PressureLevel::Red => HealthStatus::Unhealthy,
                PressureLevel::Critical => HealthStatus::Critical,
            };
            ComponentHealth::new(status)
                .with_detail("level", stats.level.as_str())
                .with_detail("ratio", stats.ratio)
                .with_detail("used_bytes", stats.used_bytes)
                .with_detail("max_bytes", stats.max_bytes)
                .with_detail("probe", stats.probe)
        });

        let modules = Arc::clone(&self.modules);
        self.health.register_check("modules", move || {
            let stats = modules.stats();
            let quarantined: Vec<&str> = stats
                .iter()
                .filter(|s| s.state == memory::ModuleState::Quarantined)
                .map(|s| s.id.as_str())
                .collect();
            let health = if quarantined.is_empty() {
                ComponentHealth::healthy()
            } else {
                ComponentHealth::degraded(format!("{} module(s) quarantined", quarantined.len()))
            };
            health
                .with_detail("registered", stats.len())
                .with_detail("active", modules.active_module_count())
                .with_detail("core", modules.core_module_count())
                .with_detail("accounted_bytes", modules.accounted_bytes())
                .with_detail("quarantined", quarantined)
        });

        let cache = Arc::clone(&self.cache);
        let cache_ceiling = self.config.cache.max_total_bytes as u64;
        self.health.register_check("cache", move || {
            let stats = cache.stats();
            let health = if cache_ceiling > 0 && stats.total_bytes * 10 >= cache_ceiling * 9 {
                ComponentHealth::degraded("cache near its byte ceiling")
            } else {
                ComponentHealth::healthy()
            };
            health
                .with_detail("entries", stats.entries)
                .with_detail("total_bytes", stats.total_bytes)
                .with_detail("hit_rate", stats.hit_rate())
                .with_detail("refused", stats.refused)
                .with_detail("evictions", stats.evictions)
        });

        let pipeline = Arc::clone(&self.pipeline);
        self.health.register_check("pipeline", move || {
            let stats = pipeline.stats();
            let failure_rate = if stats.units == 0 {
                0.0
            } else {
                stats.failed as f64 / stats.units as f64
            };
            let health = if failure_rate > 0.5 {
                ComponentHealth::unhealthy("most units fail")
            } else if failure_rate > 0.1 {
                ComponentHealth::degraded("elevated unit failure rate")
            } else {
                ComponentHealth::healthy()
            };
            health
                .with_detail("units", stats.units)
                .with_detail("failure_rate", failure_rate)
                .with_detail("cache_hits", stats.cache_hits)
                .with_detail("budget_exceeded", stats.budget_exceeded)
                .with_detail("timeouts", stats.timeouts)
                .with_detail("mean_unit_ms", stats.mean_unit_ms)
        });

        let breakers = Arc::clone(&self.breakers);
        self.health.register_check("circuit_breakers", move || {
            let open = breakers.open_count();
            let total = breakers.len();
            let health = if open == 0 {
                ComponentHealth::healthy()
            } else if open == total {
                ComponentHealth::unhealthy(format!("all {total} breaker(s) open"))
            } else {
                ComponentHealth::degraded(format!("{open} of {total} breaker(s) open"))
            };
            health.with_detail("open", open).with_detail("total", total)
        });

        let watchdog = Arc::clone(&self.watchdog);
        self.health.register_check("watchdog", move || {
            let stats = watchdog.stats();
            let health = if stats.deadlocks_detected > 0 {
                ComponentHealth::critical("deadlock detected")
            } else if !watchdog.is_monitoring() {
                ComponentHealth::degraded("watchdog monitor not running")
            } else {
                ComponentHealth::healthy()
            };
            health
                .with_detail("active", stats.active)
                .with_detail("overdue", stats.overdue)
                .with_detail("recoveries", stats.recoveries)
                .with_detail("longest_running", watchdog.active_operations().into_iter().next())
        });

        let weak = Arc::downgrade(self);
        self.health.register_check("threads", move || {
            let Some(runtime) = weak.upgrade() else {
                return ComponentHealth::unhealthy("runtime released");
            };
            let maintenance_running = runtime.maintenance.lock().is_some();
            let health = if runtime.config.maintenance.enabled
                && !maintenance_running
                && !runtime.is_shut_down()
            {
                ComponentHealth::degraded("maintenance thread not running")
            } else {
                ComponentHealth::healthy()
            };
            health
                .with_detail("pipeline_workers", runtime.pipeline.worker_count())
                .with_detail("maintenance", maintenance_running)
                .with_detail("watchdog", runtime.watchdog.is_monitoring())
        });

        let pools = Arc::clone(&self.pools);
        self.health.register_check("pools", move || {
            ComponentHealth::healthy().with_detail("pools", pools.stats())
        });
    }

    // === Accessors ===

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub fn memory_guard(&self) -> &Arc<MemoryGuard> {
        &self.guard
    }

    pub fn cache(&self) -> &Arc<TransformCache> {
        &self.cache
    }

    pub fn pools(&self) -> &Arc<PoolRegistry> {
        &self.pools
    }

    pub fn modules(&self) -> &Arc<ModuleRegistry> {
        &self.modules
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn limiters(&self) -> &Arc<RateLimiterRegistry> {
        &self.limiters
    }

    pub fn watchdog(&self) -> &Arc<Watchdog> {
        &self.watchdog
    }

    pub fn pipeline(&self) -> &Arc<TransformationPipeline> {
        &self.pipeline
    }

    pub fn executor(&self) -> &SafeExecutor {
        &self.executor
    }

    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }
}

impl Drop for RuntimeContext {
    fn drop(&mut self) {
        self.stop_maintenance();
    }
}

/// Result for a unit the executor refused or abandoned
fn rejected_result(unit_id: &str, bytes: &[u8], error: RuntimeError) -> TransformResult {
    let reason = match error {
        RuntimeError::WatchdogTimeout { .. } => SkipReason::Timeout,
        RuntimeError::Cancelled { .. } => SkipReason::Cancelled,
        _ => SkipReason::Rejected,
    };
    let mut result = TransformResult::rejected(unit_id, bytes, error);
    result.skip_reason = Some(reason);
    result
}
