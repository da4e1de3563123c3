use common::ModuleSettings;
use dashmap::DashMap;
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::descriptor::{ModuleClass, ModuleDescriptor, ModulePriority, ModuleState};
use super::ModuleError;
use crate::guard::MemoryGuard;

/// Lifecycle lock wait before a thaw or freeze gives up
pub const LIFECYCLE_LOCK_TIMEOUT: Duration = Duration::from_secs(2);

/// Экземпляр модуля вместе с заявленным размером в памяти
pub struct Thawed<T> {
    pub instance: T,
    pub estimated_bytes: u64,
}

impl<T> Thawed<T> {
    pub fn new(instance: T, estimated_bytes: u64) -> Self {
        Self {
            instance,
            estimated_bytes,
        }
    }
}

pub type ModuleFactory<T> = Box<dyn Fn() -> anyhow::Result<Thawed<T>> + Send + Sync>;

/// Receives the released instance and confirms how many bytes were freed
pub type ModuleCleanup<T> = Box<dyn Fn(Arc<T>) -> anyhow::Result<u64> + Send + Sync>;

pub(crate) type ModuleTable = DashMap<String, Arc<dyn ModuleSlot>>;

/// Ограничения жизненного цикла
#[derive(Debug, Clone)]
pub struct LifecyclePolicy {
    pub max_consecutive_failures: u32,
    pub quarantine_cooldown: Duration,
    pub max_dependency_depth: usize,
    pub lock_timeout: Duration,
}

impl Default for LifecyclePolicy {
    fn default() -> Self {
        Self::from(&ModuleSettings::default())
    }
}

impl From<&ModuleSettings> for LifecyclePolicy {
    fn from(settings: &ModuleSettings) -> Self {
        Self {
            max_consecutive_failures: settings.max_consecutive_failures.max(1),
            quarantine_cooldown: settings.quarantine_cooldown(),
            max_dependency_depth: settings.max_dependency_depth,
            lock_timeout: LIFECYCLE_LOCK_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleStats {
    pub id: String,
    pub class: ModuleClass,
    pub priority: ModulePriority,
    pub state: ModuleState,
    pub thaw_count: u64,
    pub freeze_count: u64,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub active_time_ms: u64,
    pub estimated_bytes: u64,
    pub idle_ms: u64,
    pub quarantine_remaining_ms: Option<u64>,
    pub last_error: Option<String>,
}

/// Object-safe view of a module used by the registry
pub(crate) trait ModuleSlot: Send + Sync {
    fn descriptor(&self) -> &ModuleDescriptor;
    fn state(&self) -> ModuleState;
    fn ensure_thawed(&self, depth: usize) -> Result<(), ModuleError>;
    fn freeze(&self) -> u64;
    fn try_freeze(&self) -> Option<u64>;
    fn release(&self) -> u64;
    fn quarantine(&self, reason: &str) -> bool;
    fn should_freeze_idle(&self) -> bool;
    fn idle_for(&self) -> Duration;
    fn estimated_bytes(&self) -> u64;
    fn stats(&self) -> ModuleStats;
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

struct Lifecycle {
    consecutive_failures: u32,
    total_failures: u64,
    quarantined_until: Option<Instant>,
    thawed_at: Option<Instant>,
    estimated_bytes: u64,
    last_error: Option<String>,
}

/// Контейнер ленивого модуля.
///
/// Holds at most one live instance. The hot path is a read of an atomic state
/// plus a shared read lock; thawing and freezing are serialized by a per-module
/// reentrant lock so a dependency cycle on one thread is detected instead of
/// deadlocking.
pub struct LazyModule<T: Send + Sync + 'static> {
    descriptor: ModuleDescriptor,
    policy: LifecyclePolicy,
    state: AtomicU8,
    instance: RwLock<Option<Arc<T>>>,
    transition: ReentrantMutex<()>,
    lifecycle: Mutex<Lifecycle>,
    factory: ModuleFactory<T>,
    cleanup: ModuleCleanup<T>,
    guard: Option<Arc<MemoryGuard>>,
    table: Weak<ModuleTable>,
    created: Instant,
    last_access_ms: AtomicU64,
    thaw_count: AtomicU64,
    freeze_count: AtomicU64,
    active_nanos: AtomicU64,
}

impl<T: Send + Sync + 'static> std::fmt::Debug for LazyModule<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazyModule")
            .field("descriptor", &self.descriptor)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl<T: Send + Sync + 'static> LazyModule<T> {
    pub(crate) fn new(
        descriptor: ModuleDescriptor,
        policy: LifecyclePolicy,
        factory: ModuleFactory<T>,
        cleanup: ModuleCleanup<T>,
        guard: Option<Arc<MemoryGuard>>,
        table: Weak<ModuleTable>,
    ) -> Self {
        Self {
            descriptor,
            policy,
            state: AtomicU8::new(ModuleState::Frozen as u8),
            instance: RwLock::new(None),
            transition: ReentrantMutex::new(()),
            lifecycle: Mutex::new(Lifecycle {
                consecutive_failures: 0,
                total_failures: 0,
                quarantined_until: None,
                thawed_at: None,
                estimated_bytes: 0,
                last_error: None,
            }),
            factory,
            cleanup,
            guard,
            table,
            created: Instant::now(),
            last_access_ms: AtomicU64::new(0),
            thaw_count: AtomicU64::new(0),
            freeze_count: AtomicU64::new(0),
            active_nanos: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }

    pub fn state(&self) -> ModuleState {
        ModuleState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ModuleState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn touch(&self) {
        let now = self.created.elapsed().as_millis() as u64;
        self.last_access_ms.store(now, Ordering::Relaxed);
    }

    /// Live instance, thawing it (and its dependencies) first if needed
    pub fn get(&self) -> Result<Arc<T>, ModuleError> {
        self.acquire(0)
    }

    /// Live instance without thawing
    pub fn peek(&self) -> Option<Arc<T>> {
        if self.state().is_live() {
            self.instance.read().clone()
        } else {
            None
        }
    }

    fn acquire(&self, depth: usize) -> Result<Arc<T>, ModuleError> {
        self.touch();
        if let Some(instance) = self.peek() {
            return Ok(instance);
        }
        self.thaw_slow(depth)
    }

    /// Lifts an expired quarantine, leaving one retry before the next one
    fn check_quarantine(&self) -> Result<(), ModuleError> {
        if self.state() != ModuleState::Quarantined {
            return Ok(());
        }

        let mut lifecycle = self.lifecycle.lock();
        let now = Instant::now();
        match lifecycle.quarantined_until {
            Some(until) if now < until => Err(ModuleError::Quarantined {
                id: self.descriptor.id.clone(),
                remaining: until - now,
            }),
            _ => {
                lifecycle.quarantined_until = None;
                lifecycle.consecutive_failures = self.policy.max_consecutive_failures - 1;
                let _ = self.state.compare_exchange(
                    ModuleState::Quarantined as u8,
                    ModuleState::Frozen as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                info!(module = %self.descriptor.id, "Quarantine lifted, one retry admitted");
                Ok(())
            }
        }
    }

    fn thaw_slow(&self, depth: usize) -> Result<Arc<T>, ModuleError> {
        let id = &self.descriptor.id;
        if depth > self.policy.max_dependency_depth {
            return Err(ModuleError::DependencyCycle {
                id: id.clone(),
                depth,
            });
        }

        self.check_quarantine()?;

        // Pressure listeners may run here, so no lifecycle lock is held yet
        if let Err(denied) = self.admit(depth) {
            return self.peek().ok_or(denied);
        }

        let _transition = self
            .transition
            .try_lock_for(self.policy.lock_timeout)
            .ok_or_else(|| ModuleError::LockTimeout { id: id.clone() })?;

        match self.state() {
            ModuleState::Active | ModuleState::Permanent => {
                if let Some(instance) = self.instance.read().clone() {
                    return Ok(instance);
                }
            }
            // Re-entered on the thawing thread through a dependency
            ModuleState::Thawing => {
                return Err(ModuleError::DependencyCycle {
                    id: id.clone(),
                    depth,
                });
            }
            ModuleState::Quarantined => self.check_quarantine()?,
            ModuleState::Frozen | ModuleState::Cooling => {}
        }

        self.set_state(ModuleState::Thawing);
        let started = Instant::now();

        match self.thaw_dependencies(depth) {
            Ok(()) => {}
            // Admission and lock contention are not failures of this module
            Err(
                e @ (ModuleError::ThawDenied { .. }
                | ModuleError::OverBudget { .. }
                | ModuleError::LockTimeout { .. }),
            ) => {
                self.set_state(ModuleState::Frozen);
                return Err(e);
            }
            Err(e) => return Err(self.record_failure(e)),
        }

        let outcome = catch_unwind(AssertUnwindSafe(|| (self.factory)()));
        let thawed = match outcome {
            Ok(Ok(thawed)) => thawed,
            Ok(Err(e)) => {
                return Err(self.record_failure(ModuleError::ThawFailed {
                    id: id.clone(),
                    reason: format!("{e:#}"),
                }));
            }
            Err(_) => {
                return Err(self.record_failure(ModuleError::ThawFailed {
                    id: id.clone(),
                    reason: "factory panicked".to_string(),
                }));
            }
        };

        let instance = Arc::new(thawed.instance);
        *self.instance.write() = Some(Arc::clone(&instance));
        {
            let mut lifecycle = self.lifecycle.lock();
            lifecycle.consecutive_failures = 0;
            lifecycle.thawed_at = Some(Instant::now());
            lifecycle.estimated_bytes = thawed.estimated_bytes;
        }
        self.thaw_count.fetch_add(1, Ordering::Relaxed);
        self.set_state(if self.descriptor.is_core() {
            ModuleState::Permanent
        } else {
            ModuleState::Active
        });

        let budget = self.descriptor.memory_budget_bytes;
        if budget > 0 && thawed.estimated_bytes > budget {
            warn!(
                module = %id,
                budget,
                estimated_bytes = thawed.estimated_bytes,
                "Module exceeds its declared memory budget"
            );
        }

        info!(
            module = %id,
            estimated_bytes = thawed.estimated_bytes,
            duration_ms = started.elapsed().as_millis() as u64,
            "Module thawed"
        );
        Ok(instance)
    }

    /// Memory admission for a thaw. Only the head of a dependency chain
    /// samples the guard; dependencies reuse the cached level.
    fn admit(&self, depth: usize) -> Result<(), ModuleError> {
        if self.descriptor.is_core() {
            return Ok(());
        }
        let Some(guard) = &self.guard else {
            return Ok(());
        };
        let id = &self.descriptor.id;

        let level = if depth == 0 {
            guard.check_pressure()
        } else {
            guard.current_level()
        };
        if !MemoryGuard::admits(level, self.descriptor.priority) {
            debug!(module = %id, %level, "Thaw denied by memory guard");
            return Err(ModuleError::ThawDenied {
                id: id.clone(),
                level,
            });
        }

        let budget = self.descriptor.memory_budget_bytes;
        if budget > 0 {
            if let Some(headroom) = guard.retained_headroom() {
                if budget > headroom {
                    debug!(module = %id, budget, headroom, "Thaw denied, retained budget exhausted");
                    return Err(ModuleError::OverBudget {
                        id: id.clone(),
                        budget,
                        headroom,
                    });
                }
            }
        }
        Ok(())
    }

    fn thaw_dependencies(&self, depth: usize) -> Result<(), ModuleError> {
        if self.descriptor.dependencies.is_empty() {
            return Ok(());
        }
        let table = self.table.upgrade().ok_or_else(|| ModuleError::ThawFailed {
            id: self.descriptor.id.clone(),
            reason: "module registry dropped".to_string(),
        })?;

        for dependency in &self.descriptor.dependencies {
            // Clone out so no map shard lock is held while thawing
            let slot = table
                .get(dependency)
                .map(|entry| Arc::clone(entry.value()))
                .ok_or_else(|| ModuleError::NotFound {
                    id: dependency.clone(),
                })?;
            slot.ensure_thawed(depth + 1)?;
        }
        Ok(())
    }

    fn record_failure(&self, err: ModuleError) -> ModuleError {
        let id = &self.descriptor.id;
        let mut lifecycle = self.lifecycle.lock();
        lifecycle.consecutive_failures += 1;
        lifecycle.total_failures += 1;
        lifecycle.last_error = Some(err.to_string());

        if !self.descriptor.is_core()
            && lifecycle.consecutive_failures >= self.policy.max_consecutive_failures
        {
            lifecycle.quarantined_until = Some(Instant::now() + self.policy.quarantine_cooldown);
            self.set_state(ModuleState::Quarantined);
            warn!(
                module = %id,
                failures = lifecycle.consecutive_failures,
                cooldown_ms = self.policy.quarantine_cooldown.as_millis() as u64,
                error = %err,
                "Module quarantined after repeated thaw failures"
            );
        } else {
            self.set_state(ModuleState::Frozen);
            warn!(
                module = %id,
                failures = lifecycle.consecutive_failures,
                error = %err,
                "Module thaw failed"
            );
        }
        err
    }

    /// Release the instance. Cleanup errors are logged, never returned.
    pub fn freeze(&self) -> u64 {
        self.try_freeze().unwrap_or(0)
    }

    /// Like `freeze`, but None when no Active → Frozen transition happened
    pub fn try_freeze(&self) -> Option<u64> {
        if self.descriptor.is_core() {
            return None;
        }
        self.release_instance(ModuleState::Active)
    }

    /// Teardown: release the instance whatever its class, core included
    pub fn release(&self) -> u64 {
        let from = if self.descriptor.is_core() {
            ModuleState::Permanent
        } else {
            ModuleState::Active
        };
        self.release_instance(from).unwrap_or(0)
    }

    fn release_instance(&self, from: ModuleState) -> Option<u64> {
        let id = &self.descriptor.id;
        let Some(_transition) = self.transition.try_lock_for(self.policy.lock_timeout) else {
            warn!(module = %id, "Freeze skipped, lifecycle lock busy");
            return None;
        };
        if self.state() != from {
            return None;
        }

        self.set_state(ModuleState::Cooling);
        let instance = self.instance.write().take();
        let (estimated, thawed_at) = {
            let mut lifecycle = self.lifecycle.lock();
            (
                std::mem::take(&mut lifecycle.estimated_bytes),
                lifecycle.thawed_at.take(),
            )
        };

        let freed = match instance {
            Some(instance) => {
                match catch_unwind(AssertUnwindSafe(|| (self.cleanup)(instance))) {
                    Ok(Ok(confirmed)) => confirmed,
                    Ok(Err(e)) => {
                        warn!(module = %id, error = %e, "Module cleanup failed");
                        estimated
                    }
                    Err(_) => {
                        error!(module = %id, "Module cleanup panicked");
                        estimated
                    }
                }
            }
            None => 0,
        };

        if let Some(thawed_at) = thawed_at {
            self.active_nanos
                .fetch_add(thawed_at.elapsed().as_nanos() as u64, Ordering::Relaxed);
        }
        self.freeze_count.fetch_add(1, Ordering::Relaxed);
        self.set_state(ModuleState::Frozen);

        info!(module = %id, freed_bytes = freed, "Module frozen");
        Some(freed)
    }

    /// Force quarantine regardless of the failure count
    pub fn quarantine(&self, reason: &str) -> bool {
        if self.descriptor.is_core() {
            warn!(module = %self.descriptor.id, "Refusing to quarantine core module");
            return false;
        }
        self.freeze();

        let Some(_transition) = self.transition.try_lock_for(self.policy.lock_timeout) else {
            return false;
        };
        let mut lifecycle = self.lifecycle.lock();
        lifecycle.consecutive_failures = self.policy.max_consecutive_failures;
        lifecycle.quarantined_until = Some(Instant::now() + self.policy.quarantine_cooldown);
        lifecycle.last_error = Some(reason.to_string());
        self.set_state(ModuleState::Quarantined);

        warn!(module = %self.descriptor.id, reason, "Module quarantined");
        true
    }

    pub fn idle_for(&self) -> Duration {
        let now = self.created.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(self.last_access_ms.load(Ordering::Relaxed)))
    }

    pub fn estimated_bytes(&self) -> u64 {
        if self.state().is_live() {
            self.lifecycle.lock().estimated_bytes
        } else {
            0
        }
    }

    pub fn stats(&self) -> ModuleStats {
        let lifecycle = self.lifecycle.lock();
        let current = lifecycle
            .thawed_at
            .map(|at| at.elapsed().as_nanos() as u64)
            .unwrap_or(0);
        let now = Instant::now();

        ModuleStats {
            id: self.descriptor.id.clone(),
            class: self.descriptor.class,
            priority: self.descriptor.priority,
            state: self.state(),
            thaw_count: self.thaw_count.load(Ordering::Relaxed),
            freeze_count: self.freeze_count.load(Ordering::Relaxed),
            consecutive_failures: lifecycle.consecutive_failures,
            total_failures: lifecycle.total_failures,
            active_time_ms: (self.active_nanos.load(Ordering::Relaxed) + current) / 1_000_000,
            estimated_bytes: lifecycle.estimated_bytes,
            idle_ms: self.idle_for().as_millis() as u64,
            quarantine_remaining_ms: lifecycle
                .quarantined_until
                .map(|until| until.saturating_duration_since(now).as_millis() as u64),
            last_error: lifecycle.last_error.clone(),
        }
    }
}

impl<T: Send + Sync + 'static> ModuleSlot for LazyModule<T> {
    fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }

    fn state(&self) -> ModuleState {
        LazyModule::state(self)
    }

    fn ensure_thawed(&self, depth: usize) -> Result<(), ModuleError> {
        self.acquire(depth).map(|_| ())
    }

    fn freeze(&self) -> u64 {
        LazyModule::freeze(self)
    }

    fn try_freeze(&self) -> Option<u64> {
        LazyModule::try_freeze(self)
    }

    fn release(&self) -> u64 {
        LazyModule::release(self)
    }

    fn quarantine(&self, reason: &str) -> bool {
        LazyModule::quarantine(self, reason)
    }

    fn should_freeze_idle(&self) -> bool {
        if self.state() != ModuleState::Active {
            return false;
        }
        match self.descriptor.class {
            ModuleClass::Core => false,
            ModuleClass::SingleUse => true,
            ModuleClass::OnDemand => self.idle_for() >= self.descriptor.effective_idle_timeout(),
        }
    }

    fn idle_for(&self) -> Duration {
        LazyModule::idle_for(self)
    }

    fn estimated_bytes(&self) -> u64 {
        LazyModule::estimated_bytes(self)
    }

    fn stats(&self) -> ModuleStats {
        LazyModule::stats(self)
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
