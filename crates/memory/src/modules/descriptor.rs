use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Классификация модуля по жизненному циклу
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModuleClass {
    /// Thawed once at registry initialization, never frozen or quarantined
    Core,
    /// Thawed on first use, frozen after its idle timeout
    OnDemand,
    /// Frozen at the first maintenance sweep after use
    SingleUse,
}

/// Importance of a module when memory has to be reclaimed.
/// Ordered from least to most important.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ModulePriority {
    Disposable = 0,
    Low = 1,
    Normal = 2,
    High = 3,
    Critical = 4,
}

impl Default for ModulePriority {
    fn default() -> Self {
        ModulePriority::Normal
    }
}

/// Состояние жизненного цикла модуля
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ModuleState {
    Frozen = 0,
    Thawing = 1,
    Active = 2,
    Cooling = 3,
    Quarantined = 4,
    Permanent = 5,
}

impl ModuleState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => ModuleState::Thawing,
            2 => ModuleState::Active,
            3 => ModuleState::Cooling,
            4 => ModuleState::Quarantined,
            5 => ModuleState::Permanent,
            _ => ModuleState::Frozen,
        }
    }

    /// A live instance is available without taking the lifecycle lock
    pub fn is_live(self) -> bool {
        matches!(self, ModuleState::Active | ModuleState::Permanent)
    }
}

impl std::fmt::Display for ModuleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ModuleState::Frozen => "frozen",
            ModuleState::Thawing => "thawing",
            ModuleState::Active => "active",
            ModuleState::Cooling => "cooling",
            ModuleState::Quarantined => "quarantined",
            ModuleState::Permanent => "permanent",
        };
        write!(f, "{name}")
    }
}

/// Idle timeout of a module registered outside a registry
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Immutable identity of an optional subsystem
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    pub id: String,
    pub class: ModuleClass,
    pub dependencies: Vec<String>,
    /// Declared upper bound of the module footprint; 0 means undeclared.
    /// Thaw is refused when it does not fit the retained headroom.
    pub memory_budget_bytes: u64,
    /// None: the registry default applies
    pub idle_timeout: Option<Duration>,
    pub priority: ModulePriority,
}

impl ModuleDescriptor {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            class: ModuleClass::OnDemand,
            dependencies: Vec::new(),
            memory_budget_bytes: 0,
            idle_timeout: None,
            priority: ModulePriority::Normal,
        }
    }

    /// Core modules are always critical
    pub fn core(id: impl Into<String>) -> Self {
        Self::new(id)
            .class(ModuleClass::Core)
            .priority(ModulePriority::Critical)
    }

    pub fn class(mut self, class: ModuleClass) -> Self {
        self.class = class;
        self
    }

    pub fn depends_on(mut self, dependency: impl Into<String>) -> Self {
        self.dependencies.push(dependency.into());
        self
    }

    pub fn memory_budget(mut self, bytes: u64) -> Self {
        self.memory_budget_bytes = bytes;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    pub fn effective_idle_timeout(&self) -> Duration {
        self.idle_timeout.unwrap_or(DEFAULT_IDLE_TIMEOUT)
    }

    pub fn priority(mut self, priority: ModulePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn is_core(&self) -> bool {
        self.class == ModuleClass::Core
    }
}
