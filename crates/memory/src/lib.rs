pub mod cache;
pub mod guard;
pub mod modules;
pub mod pool;

// Давление на память
pub use guard::{
    MemoryGuard, MemoryGuardStats, MemoryProbe, MemorySample, PressureLevel, PressureListener,
    PressureThresholds, StaticMemoryProbe, SystemMemoryProbe,
};

// Кеш результатов трансформации
pub use cache::{CacheEntry, CacheError, CacheKey, CacheStats, CachedOutput, TransformCache};

// Пулы объектов
pub use pool::{BoundedPool, BoundedPoolBuilder, DrainablePool, PoolError, PoolRegistry, PoolStats, Pooled};

// Жизненный цикл модулей
pub use modules::{
    LazyModule, LifecyclePolicy, ModuleClass, ModuleDescriptor, ModuleError, ModuleHandle,
    ModulePriority, ModuleRegistry, ModuleState, ModuleStats, Thawed,
};
