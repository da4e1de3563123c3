use common::ModuleSettings;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::descriptor::{ModuleDescriptor, ModulePriority, ModuleState};
use super::lazy::{LazyModule, LifecyclePolicy, ModuleSlot, ModuleStats, ModuleTable, Thawed};
use super::ModuleError;
use crate::guard::MemoryGuard;

/// Typed handle to a registered module
pub struct ModuleHandle<T> {
    id: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ModuleHandle<T> {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl<T> Clone for ModuleHandle<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for ModuleHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleHandle").field("id", &self.id).finish()
    }
}

/// Реестр ленивых модулей. Единственный владелец контейнеров.
pub struct ModuleRegistry {
    modules: Arc<ModuleTable>,
    policy: LifecyclePolicy,
    default_idle_timeout: Duration,
    guard: Option<Arc<MemoryGuard>>,
    initialized: AtomicBool,
}

impl ModuleRegistry {
    pub fn new(settings: &ModuleSettings, guard: Option<Arc<MemoryGuard>>) -> Self {
        Self {
            modules: Arc::new(DashMap::new()),
            policy: LifecyclePolicy::from(settings),
            default_idle_timeout: Duration::from_millis(settings.default_idle_timeout_ms),
            guard,
            initialized: AtomicBool::new(false),
        }
    }

    pub fn policy(&self) -> &LifecyclePolicy {
        &self.policy
    }

    pub fn default_idle_timeout(&self) -> Duration {
        self.default_idle_timeout
    }

    pub fn register<T, F, C>(
        &self,
        descriptor: ModuleDescriptor,
        factory: F,
        cleanup: C,
    ) -> Result<ModuleHandle<T>, ModuleError>
    where
        T: Send + Sync + 'static,
        F: Fn() -> anyhow::Result<Thawed<T>> + Send + Sync + 'static,
        C: Fn(Arc<T>) -> anyhow::Result<u64> + Send + Sync + 'static,
    {
        let mut descriptor = descriptor;
        if descriptor.idle_timeout.is_none() {
            descriptor.idle_timeout = Some(self.default_idle_timeout);
        }
        let id = descriptor.id.clone();
        let is_core = descriptor.is_core();
        let module = Arc::new(LazyModule::new(
            descriptor,
            self.policy.clone(),
            Box::new(factory),
            Box::new(cleanup),
            self.guard.clone(),
            Arc::downgrade(&self.modules),
        ));

        match self.modules.entry(id.clone()) {
            Entry::Occupied(_) => return Err(ModuleError::AlreadyRegistered { id }),
            Entry::Vacant(slot) => {
                slot.insert(module.clone() as Arc<dyn ModuleSlot>);
            }
        }
        debug!(module = %id, core = is_core, "Module registered");

        // Late core modules are thawed right away
        if is_core && self.initialized.load(Ordering::Acquire) {
            if let Err(e) = module.get() {
                error!(module = %id, error = %e, "Core module failed to thaw at registration");
            }
        }

        Ok(ModuleHandle {
            id,
            _marker: PhantomData,
        })
    }

    fn slot(&self, id: &str) -> Result<Arc<dyn ModuleSlot>, ModuleError> {
        self.modules
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ModuleError::NotFound { id: id.to_string() })
    }

    fn slots(&self) -> Vec<Arc<dyn ModuleSlot>> {
        self.modules
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn get<T: Send + Sync + 'static>(&self, id: &str) -> Result<Arc<LazyModule<T>>, ModuleError> {
        self.slot(id)?
            .into_any()
            .downcast::<LazyModule<T>>()
            .map_err(|_| ModuleError::TypeMismatch {
                id: id.to_string(),
                expected: std::any::type_name::<T>(),
            })
    }

    pub fn resolve<T: Send + Sync + 'static>(
        &self,
        handle: &ModuleHandle<T>,
    ) -> Result<Arc<LazyModule<T>>, ModuleError> {
        self.get(&handle.id)
    }

    /// Shortcut for `resolve(handle)?.get()`
    pub fn instance<T: Send + Sync + 'static>(
        &self,
        handle: &ModuleHandle<T>,
    ) -> Result<Arc<T>, ModuleError> {
        self.resolve(handle)?.get()
    }

    /// Thaw every core module. Returns how many are permanent afterwards.
    pub fn initialize(&self) -> Result<usize, ModuleError> {
        self.initialized.store(true, Ordering::Release);
        let mut first_error = None;
        let mut thawed = 0;

        for slot in self.slots() {
            if !slot.descriptor().is_core() {
                continue;
            }
            match slot.ensure_thawed(0) {
                Ok(()) => thawed += 1,
                Err(e) => {
                    error!(module = %slot.descriptor().id, error = %e, "Core module failed to thaw");
                    first_error.get_or_insert(e);
                }
            }
        }

        info!(core_modules = thawed, "Module registry initialized");
        match first_error {
            Some(e) => Err(e),
            None => Ok(thawed),
        }
    }

    pub fn thaw(&self, id: &str) -> Result<(), ModuleError> {
        self.slot(id)?.ensure_thawed(0)
    }

    pub fn freeze(&self, id: &str) -> Result<u64, ModuleError> {
        Ok(self.slot(id)?.freeze())
    }

    /// Freeze every non-core module, returning the bytes released
    pub fn freeze_all(&self) -> u64 {
        let freed: u64 = self
            .slots()
            .into_iter()
            .filter(|slot| !slot.descriptor().is_core())
            .map(|slot| slot.freeze())
            .sum();
        info!(freed_bytes = freed, "All non-core modules frozen");
        freed
    }

    /// Teardown: release every module, core modules included. Core modules
    /// thaw again on the next `get`.
    pub fn release_all(&self) -> u64 {
        let freed: u64 = self.slots().into_iter().map(|slot| slot.release()).sum();
        info!(freed_bytes = freed, "All modules released");
        freed
    }

    pub fn quarantine(&self, id: &str, reason: &str) -> Result<bool, ModuleError> {
        Ok(self.slot(id)?.quarantine(reason))
    }

    /// Freeze modules past their idle timeout, and used single-use modules
    pub fn freeze_idle(&self) -> usize {
        let mut frozen = 0;
        for slot in self.slots() {
            if slot.should_freeze_idle() && slot.try_freeze().is_some() {
                frozen += 1;
            }
        }
        if frozen > 0 {
            debug!(frozen, "Idle modules frozen");
        }
        frozen
    }

    /// Active non-core modules, least important and longest idle first
    fn shedding_candidates(&self) -> Vec<Arc<dyn ModuleSlot>> {
        let mut candidates: Vec<_> = self
            .slots()
            .into_iter()
            .filter(|slot| !slot.descriptor().is_core() && slot.state() == ModuleState::Active)
            .collect();
        candidates.sort_by(|a, b| {
            a.descriptor()
                .priority
                .cmp(&b.descriptor().priority)
                .then_with(|| b.idle_for().cmp(&a.idle_for()))
        });
        candidates
    }

    /// Freeze modules in ascending priority until `target_bytes` are released
    pub fn shed_to_memory_target(&self, target_bytes: u64) -> u64 {
        let mut freed = 0u64;
        for slot in self.shedding_candidates() {
            if freed >= target_bytes {
                break;
            }
            freed += slot.freeze();
        }
        info!(target_bytes, freed_bytes = freed, "Modules shed to memory target");
        freed
    }

    /// Freeze every active non-core module with priority at most `max_priority`
    pub fn shed_priorities(&self, max_priority: ModulePriority) -> usize {
        let mut shed = 0;
        for slot in self.shedding_candidates() {
            if slot.descriptor().priority <= max_priority && slot.try_freeze().is_some() {
                shed += 1;
            }
        }
        if shed > 0 {
            info!(?max_priority, shed, "Modules shed by priority");
        }
        shed
    }

    pub fn shed_all_non_core(&self) -> usize {
        let count = self
            .shedding_candidates()
            .into_iter()
            .filter(|slot| slot.try_freeze().is_some())
            .count();
        if count > 0 {
            warn!(shed = count, "All non-core modules shed");
        }
        count
    }

    pub fn active_module_count(&self) -> usize {
        self.modules
            .iter()
            .filter(|entry| entry.value().state().is_live())
            .count()
    }

    pub fn core_module_count(&self) -> usize {
        self.modules
            .iter()
            .filter(|entry| entry.value().descriptor().is_core())
            .count()
    }

    /// Sum of the footprints declared by live modules
    pub fn accounted_bytes(&self) -> u64 {
        self.modules
            .iter()
            .map(|entry| entry.value().estimated_bytes())
            .sum()
    }

    pub fn state(&self, id: &str) -> Result<ModuleState, ModuleError> {
        Ok(self.slot(id)?.state())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.modules.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn stats(&self) -> Vec<ModuleStats> {
        let mut stats: Vec<_> = self.slots().iter().map(|slot| slot.stats()).collect();
        stats.sort_by(|a, b| a.id.cmp(&b.id));
        stats
    }

    /// Check that every dependency exists and the graph is acyclic
    pub fn validate_dependencies(&self) -> Result<(), ModuleError> {
        let graph: HashMap<String, Vec<String>> = self
            .modules
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().descriptor().dependencies.clone()))
            .collect();

        for deps in graph.values() {
            if let Some(missing) = deps.iter().find(|dep| !graph.contains_key(*dep)) {
                return Err(ModuleError::NotFound {
                    id: missing.clone(),
                });
            }
        }

        let mut done = HashSet::new();
        let mut ids: Vec<&String> = graph.keys().collect();
        ids.sort();
        for id in ids {
            let mut path = Vec::new();
            visit(id, &graph, &mut path, &mut done)?;
        }
        Ok(())
    }
}

fn visit(
    id: &str,
    graph: &HashMap<String, Vec<String>>,
    path: &mut Vec<String>,
    done: &mut HashSet<String>,
) -> Result<(), ModuleError> {
    if done.contains(id) {
        return Ok(());
    }
    if path.iter().any(|p| p == id) {
        return Err(ModuleError::DependencyCycle {
            id: id.to_string(),
            depth: path.len(),
        });
    }
    path.push(id.to_string());
    for dep in graph.get(id).into_iter().flatten() {
        visit(dep, graph, path, done)?;
    }
    path.pop();
    done.insert(id.to_string());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::StaticMemoryProbe;
    use crate::modules::ModuleClass;
    use common::MemorySettings;
    use std::sync::atomic::AtomicUsize;

    fn settings() -> ModuleSettings {
        ModuleSettings {
            max_consecutive_failures: 3,
            quarantine_cooldown_ms: 50,
            max_dependency_depth: 16,
            default_idle_timeout_ms: 60_000,
        }
    }

    fn registry() -> ModuleRegistry {
        ModuleRegistry::new(&settings(), None)
    }

    fn register_sized(registry: &ModuleRegistry, descriptor: ModuleDescriptor, bytes: u64) {
        registry
            .register(
                descriptor,
                move || Ok(Thawed::new(bytes, bytes)),
                |instance: Arc<u64>| Ok(*instance),
            )
            .unwrap();
    }

    #[test]
    fn test_lazy_thaw_on_first_get() {
        let registry = registry();
        let created = Arc::new(AtomicUsize::new(0));
        let counter = created.clone();
        let handle = registry
            .register(
                ModuleDescriptor::new("analysis"),
                move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(Thawed::new(String::from("ready"), 128))
                },
                |_| Ok(128),
            )
            .unwrap();

        assert_eq!(registry.state("analysis").unwrap(), ModuleState::Frozen);
        assert_eq!(created.load(Ordering::SeqCst), 0);

        let first = registry.instance(&handle).unwrap();
        let second = registry.instance(&handle).unwrap();
        assert_eq!(*first, "ready");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(registry.accounted_bytes(), 128);
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let registry = registry();
        register_sized(&registry, ModuleDescriptor::new("a"), 1);
        let err = registry
            .register(ModuleDescriptor::new("a"), || Ok(Thawed::new(0u8, 0)), |_| Ok(0))
            .unwrap_err();
        assert_eq!(err, ModuleError::AlreadyRegistered { id: "a".into() });
    }

    #[test]
    fn test_type_mismatch_is_typed_error() {
        let registry = registry();
        register_sized(&registry, ModuleDescriptor::new("numbers"), 8);
        let err = registry.get::<String>("numbers").unwrap_err();
        assert!(matches!(err, ModuleError::TypeMismatch { .. }));
    }

    #[test]
    fn test_freeze_runs_cleanup_and_tracks_active_time() {
        let registry = registry();
        register_sized(&registry, ModuleDescriptor::new("m"), 64);
        registry.thaw("m").unwrap();

        assert_eq!(registry.freeze("m").unwrap(), 64);
        assert_eq!(registry.state("m").unwrap(), ModuleState::Frozen);
        assert_eq!(registry.accounted_bytes(), 0);

        let stats = registry.get::<u64>("m").unwrap().stats();
        assert_eq!(stats.thaw_count, 1);
        assert_eq!(stats.freeze_count, 1);
    }

    #[test]
    fn test_cleanup_error_is_swallowed() {
        let registry = registry();
        registry
            .register(
                ModuleDescriptor::new("leaky"),
                || Ok(Thawed::new(1u32, 32)),
                |_| anyhow::bail!("cleanup exploded"),
            )
            .unwrap();
        registry.thaw("leaky").unwrap();
        assert_eq!(registry.freeze("leaky").unwrap(), 32);
        assert_eq!(registry.state("leaky").unwrap(), ModuleState::Frozen);
    }

    #[test]
    fn test_core_modules_are_permanent() {
        let registry = registry();
        register_sized(&registry, ModuleDescriptor::core("kernel"), 10);
        assert_eq!(registry.initialize().unwrap(), 1);

        assert_eq!(registry.state("kernel").unwrap(), ModuleState::Permanent);
        assert_eq!(registry.freeze("kernel").unwrap(), 0);
        assert!(!registry.quarantine("kernel", "test").unwrap());
        assert_eq!(registry.state("kernel").unwrap(), ModuleState::Permanent);

        register_sized(&registry, ModuleDescriptor::core("late"), 10);
        assert_eq!(registry.state("late").unwrap(), ModuleState::Permanent);
    }

    #[test]
    fn test_release_all_includes_core() {
        let registry = registry();
        register_sized(&registry, ModuleDescriptor::core("kernel"), 10);
        register_sized(&registry, ModuleDescriptor::new("extra"), 5);
        registry.initialize().unwrap();
        registry.get::<u64>("extra").unwrap().get().unwrap();

        assert_eq!(registry.release_all(), 15);
        assert_eq!(registry.active_module_count(), 0);
        assert_eq!(registry.state("kernel").unwrap(), ModuleState::Frozen);

        // Core modules come back on demand
        assert_eq!(*registry.get::<u64>("kernel").unwrap().get().unwrap(), 10);
        assert_eq!(registry.state("kernel").unwrap(), ModuleState::Permanent);
    }

    #[test]
    fn test_dependencies_thaw_first() {
        let registry = registry();
        register_sized(&registry, ModuleDescriptor::new("base"), 1);
        register_sized(&registry, ModuleDescriptor::new("top").depends_on("base"), 1);

        registry.thaw("top").unwrap();
        assert_eq!(registry.state("base").unwrap(), ModuleState::Active);
    }

    #[test]
    fn test_dependency_cycle_fails_fast() {
        let registry = registry();
        register_sized(&registry, ModuleDescriptor::new("a").depends_on("b"), 1);
        register_sized(&registry, ModuleDescriptor::new("b").depends_on("a"), 1);

        let err = registry.thaw("a").unwrap_err();
        assert!(matches!(err, ModuleError::DependencyCycle { .. }));
        assert!(registry.validate_dependencies().is_err());
        assert_ne!(registry.state("a").unwrap(), ModuleState::Active);
    }

    #[test]
    fn test_missing_dependency_reported() {
        let registry = registry();
        register_sized(&registry, ModuleDescriptor::new("a").depends_on("ghost"), 1);
        assert_eq!(
            registry.validate_dependencies().unwrap_err(),
            ModuleError::NotFound { id: "ghost".into() }
        );
    }

    #[test]
    fn test_single_use_frozen_by_idle_sweep() {
        let registry = registry();
        register_sized(
            &registry,
            ModuleDescriptor::new("once").class(ModuleClass::SingleUse),
            1,
        );
        register_sized(&registry, ModuleDescriptor::new("long"), 1);
        registry.thaw("once").unwrap();
        registry.thaw("long").unwrap();

        assert_eq!(registry.freeze_idle(), 1);
        assert_eq!(registry.state("once").unwrap(), ModuleState::Frozen);
        assert_eq!(registry.state("long").unwrap(), ModuleState::Active);
    }

    #[test]
    fn test_idle_timeout_freezes_on_demand_module() {
        let registry = registry();
        register_sized(
            &registry,
            ModuleDescriptor::new("brief").idle_timeout(Duration::from_millis(10)),
            1,
        );
        registry.thaw("brief").unwrap();
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(registry.freeze_idle(), 1);
    }

    #[test]
    fn test_registry_default_idle_timeout_applies() {
        let registry = ModuleRegistry::new(
            &ModuleSettings {
                default_idle_timeout_ms: 10,
                ..settings()
            },
            None,
        );
        register_sized(&registry, ModuleDescriptor::new("plain"), 1);
        register_sized(
            &registry,
            ModuleDescriptor::new("pinned").idle_timeout(Duration::from_secs(60)),
            1,
        );
        registry.thaw("plain").unwrap();
        registry.thaw("pinned").unwrap();

        let plain = registry.get::<u64>("plain").unwrap();
        assert_eq!(plain.descriptor().idle_timeout, Some(Duration::from_millis(10)));

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(registry.freeze_idle(), 1);
        assert_eq!(registry.state("plain").unwrap(), ModuleState::Frozen);
        assert_eq!(registry.state("pinned").unwrap(), ModuleState::Active);
    }

    #[test]
    fn test_freeze_counts_transitions_not_bytes() {
        let registry = registry();
        register_sized(
            &registry,
            ModuleDescriptor::new("weightless").class(ModuleClass::SingleUse),
            0,
        );
        registry.thaw("weightless").unwrap();

        let module = registry.get::<u64>("weightless").unwrap();
        assert_eq!(registry.freeze_idle(), 1);
        assert_eq!(module.try_freeze(), None);
        assert_eq!(registry.freeze_idle(), 0);
        assert_eq!(registry.shed_all_non_core(), 0);
    }

    #[test]
    fn test_declared_budget_checked_against_retained_headroom() {
        let guard = Arc::new(MemoryGuard::new(
            Arc::new(StaticMemoryProbe::new(0.1)),
            &MemorySettings {
                check_interval_ms: 0,
                ..MemorySettings::default()
            },
        ));
        guard.set_retained_source(100, || 80);
        let registry = ModuleRegistry::new(&settings(), Some(guard));
        register_sized(&registry, ModuleDescriptor::new("big").memory_budget(50), 50);
        register_sized(&registry, ModuleDescriptor::new("small").memory_budget(10), 10);
        register_sized(&registry, ModuleDescriptor::new("undeclared"), 50);

        assert!(matches!(
            registry.thaw("big").unwrap_err(),
            ModuleError::OverBudget {
                budget: 50,
                headroom: 20,
                ..
            }
        ));
        assert_eq!(registry.state("big").unwrap(), ModuleState::Frozen);
        assert_eq!(registry.get::<u64>("big").unwrap().stats().consecutive_failures, 0);
        assert!(registry.thaw("small").is_ok());
        assert!(registry.thaw("undeclared").is_ok());
    }

    #[test]
    fn test_shed_to_target_prefers_low_priority() {
        let registry = registry();
        register_sized(
            &registry,
            ModuleDescriptor::new("cheap").priority(ModulePriority::Disposable),
            100,
        );
        register_sized(
            &registry,
            ModuleDescriptor::new("important").priority(ModulePriority::High),
            100,
        );
        registry.thaw("cheap").unwrap();
        registry.thaw("important").unwrap();

        assert_eq!(registry.shed_to_memory_target(50), 100);
        assert_eq!(registry.state("cheap").unwrap(), ModuleState::Frozen);
        assert_eq!(registry.state("important").unwrap(), ModuleState::Active);
    }

    #[test]
    fn test_shed_priorities_and_all() {
        let registry = registry();
        for (id, priority) in [
            ("d", ModulePriority::Disposable),
            ("l", ModulePriority::Low),
            ("n", ModulePriority::Normal),
            ("h", ModulePriority::High),
        ] {
            register_sized(&registry, ModuleDescriptor::new(id).priority(priority), 1);
            registry.thaw(id).unwrap();
        }
        register_sized(&registry, ModuleDescriptor::core("core"), 1);
        registry.initialize().unwrap();

        assert_eq!(registry.shed_priorities(ModulePriority::Normal), 3);
        assert_eq!(registry.active_module_count(), 2);
        assert_eq!(registry.shed_all_non_core(), 1);
        assert_eq!(registry.active_module_count(), registry.core_module_count());
    }

    #[test]
    fn test_thaw_denied_under_pressure() {
        let probe = Arc::new(StaticMemoryProbe::new(0.9));
        let guard = Arc::new(MemoryGuard::new(
            probe,
            &MemorySettings {
                check_interval_ms: 0,
                ..MemorySettings::default()
            },
        ));
        let registry = ModuleRegistry::new(&settings(), Some(guard));
        register_sized(&registry, ModuleDescriptor::new("normal"), 1);
        register_sized(
            &registry,
            ModuleDescriptor::new("vital").priority(ModulePriority::Critical),
            1,
        );

        assert!(matches!(
            registry.thaw("normal").unwrap_err(),
            ModuleError::ThawDenied { .. }
        ));
        assert!(registry.thaw("vital").is_ok());
        // Denials do not count towards quarantine
        assert_eq!(registry.get::<u64>("normal").unwrap().stats().consecutive_failures, 0);
    }

    #[test]
    fn test_forced_quarantine() {
        let registry = registry();
        register_sized(&registry, ModuleDescriptor::new("suspect"), 1);
        registry.thaw("suspect").unwrap();

        assert!(registry.quarantine("suspect", "operator request").unwrap());
        assert_eq!(registry.state("suspect").unwrap(), ModuleState::Quarantined);
        assert!(matches!(
            registry.thaw("suspect").unwrap_err(),
            ModuleError::Quarantined { .. }
        ));
    }
}
