use common::MemorySettings;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::{debug, error, info, warn};

use crate::modules::ModulePriority;

/// Уровень давления на память, упорядочен от GREEN к CRITICAL
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PressureLevel {
    Green = 0,
    Yellow = 1,
    Orange = 2,
    Red = 3,
    Critical = 4,
}

impl PressureLevel {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => PressureLevel::Yellow,
            2 => PressureLevel::Orange,
            3 => PressureLevel::Red,
            4 => PressureLevel::Critical,
            _ => PressureLevel::Green,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PressureLevel::Green => "GREEN",
            PressureLevel::Yellow => "YELLOW",
            PressureLevel::Orange => "ORANGE",
            PressureLevel::Red => "RED",
            PressureLevel::Critical => "CRITICAL",
        }
    }
}

impl std::fmt::Display for PressureLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lower bounds of each band above GREEN. Must be strictly ascending.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PressureThresholds {
    pub yellow: f64,
    pub orange: f64,
    pub red: f64,
    pub critical: f64,
}

impl Default for PressureThresholds {
    fn default() -> Self {
        Self::from(&MemorySettings::default())
    }
}

impl From<&MemorySettings> for PressureThresholds {
    fn from(settings: &MemorySettings) -> Self {
        Self {
            yellow: settings.yellow_threshold,
            orange: settings.orange_threshold,
            red: settings.red_threshold,
            critical: settings.critical_threshold,
        }
    }
}

impl PressureThresholds {
    pub fn classify(&self, ratio: f64) -> PressureLevel {
        if ratio >= self.critical {
            PressureLevel::Critical
        } else if ratio >= self.red {
            PressureLevel::Red
        } else if ratio >= self.orange {
            PressureLevel::Orange
        } else if ratio >= self.yellow {
            PressureLevel::Yellow
        } else {
            PressureLevel::Green
        }
    }
}

/// Один замер использования памяти
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MemorySample {
    pub used_bytes: u64,
    pub max_bytes: u64,
}

impl MemorySample {
    pub fn ratio(&self) -> f64 {
        if self.max_bytes == 0 {
            return 0.0;
        }
        (self.used_bytes as f64 / self.max_bytes as f64).clamp(0.0, 1.0)
    }
}

/// Source of heap-equivalent memory usage
pub trait MemoryProbe: Send + Sync {
    fn sample(&self) -> MemorySample;

    fn name(&self) -> &'static str {
        "custom"
    }
}

/// Системный probe на базе sysinfo.
///
/// Without a ceiling it reports system used/total memory. With a ceiling it
/// reports this process's resident memory against that ceiling.
pub struct SystemMemoryProbe {
    system: Mutex<System>,
    pid: Option<Pid>,
    process_ceiling_bytes: Option<u64>,
}

impl SystemMemoryProbe {
    pub fn new(process_ceiling_bytes: Option<u64>) -> Self {
        let mut system = System::new();
        system.refresh_memory();
        let pid = sysinfo::get_current_pid().ok();

        debug!(
            total_memory_mb = system.total_memory() / (1024 * 1024),
            ceiling_bytes = ?process_ceiling_bytes,
            "System memory probe initialized"
        );

        Self {
            system: Mutex::new(system),
            pid,
            process_ceiling_bytes,
        }
    }
}

impl MemoryProbe for SystemMemoryProbe {
    fn sample(&self) -> MemorySample {
        let mut system = self.system.lock();

        if let (Some(ceiling), Some(pid)) = (self.process_ceiling_bytes, self.pid) {
            system.refresh_processes(ProcessesToUpdate::Some(&[pid]));
            if let Some(process) = system.process(pid) {
                return MemorySample {
                    used_bytes: process.memory(),
                    max_bytes: ceiling,
                };
            }
        }

        system.refresh_memory();
        MemorySample {
            used_bytes: system.used_memory(),
            max_bytes: system.total_memory(),
        }
    }

    fn name(&self) -> &'static str {
        "system"
    }
}

/// Probe с фиксированным значением для симуляции давления
#[derive(Debug)]
pub struct StaticMemoryProbe {
    ratio_bits: AtomicU64,
}

const STATIC_PROBE_MAX_BYTES: u64 = 1 << 30;

impl StaticMemoryProbe {
    pub fn new(ratio: f64) -> Self {
        Self {
            ratio_bits: AtomicU64::new(ratio.clamp(0.0, 1.0).to_bits()),
        }
    }

    pub fn set_ratio(&self, ratio: f64) {
        self.ratio_bits
            .store(ratio.clamp(0.0, 1.0).to_bits(), Ordering::Release);
    }

    pub fn ratio(&self) -> f64 {
        f64::from_bits(self.ratio_bits.load(Ordering::Acquire))
    }
}

impl MemoryProbe for StaticMemoryProbe {
    fn sample(&self) -> MemorySample {
        MemorySample {
            used_bytes: (self.ratio() * STATIC_PROBE_MAX_BYTES as f64) as u64,
            max_bytes: STATIC_PROBE_MAX_BYTES,
        }
    }

    fn name(&self) -> &'static str {
        "static"
    }
}

pub type PressureListener = Arc<dyn Fn(PressureLevel, PressureLevel) + Send + Sync>;

type RetainedBytesFn = Arc<dyn Fn() -> u64 + Send + Sync>;

struct RetainedSource {
    budget_bytes: u64,
    measure: RetainedBytesFn,
}

struct GuardState {
    last_check: Option<Instant>,
    last_ratio: f64,
    last_sample: MemorySample,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryGuardStats {
    pub level: PressureLevel,
    pub ratio: f64,
    pub used_bytes: u64,
    pub max_bytes: u64,
    pub checks: u64,
    pub transitions: u64,
    pub probe: String,
}

/// Классификатор давления на память с кешированием замеров.
///
/// The ratio is the maximum of the probe ratio and the retained ratio
/// (explicitly accounted bytes over the retained budget) when a retained
/// source is installed.
pub struct MemoryGuard {
    probe: Arc<dyn MemoryProbe>,
    thresholds: PressureThresholds,
    check_interval: Duration,
    level: AtomicU8,
    state: Mutex<GuardState>,
    retained: RwLock<Option<RetainedSource>>,
    listeners: RwLock<Vec<PressureListener>>,
    checks: AtomicU64,
    transitions: AtomicU64,
}

impl MemoryGuard {
    pub fn new(probe: Arc<dyn MemoryProbe>, settings: &MemorySettings) -> Self {
        Self {
            probe,
            thresholds: PressureThresholds::from(settings),
            check_interval: settings.check_interval(),
            level: AtomicU8::new(PressureLevel::Green as u8),
            state: Mutex::new(GuardState {
                last_check: None,
                last_ratio: 0.0,
                last_sample: MemorySample::default(),
            }),
            retained: RwLock::new(None),
            listeners: RwLock::new(Vec::new()),
            checks: AtomicU64::new(0),
            transitions: AtomicU64::new(0),
        }
    }

    /// Guard over the host system memory
    pub fn with_system_probe(settings: &MemorySettings) -> Self {
        Self::new(
            Arc::new(SystemMemoryProbe::new(settings.process_ceiling_bytes)),
            settings,
        )
    }

    pub fn thresholds(&self) -> PressureThresholds {
        self.thresholds
    }

    /// Install the long-lived memory source measured against `budget_bytes`
    pub fn set_retained_source<F>(&self, budget_bytes: u64, measure: F)
    where
        F: Fn() -> u64 + Send + Sync + 'static,
    {
        if budget_bytes == 0 {
            warn!("Ignoring retained memory source with zero budget");
            return;
        }
        *self.retained.write() = Some(RetainedSource {
            budget_bytes,
            measure: Arc::new(measure),
        });
    }

    pub fn on_pressure_change<F>(&self, listener: F)
    where
        F: Fn(PressureLevel, PressureLevel) + Send + Sync + 'static,
    {
        self.listeners.write().push(Arc::new(listener));
    }

    /// Last classified level without sampling
    pub fn current_level(&self) -> PressureLevel {
        PressureLevel::from_u8(self.level.load(Ordering::Acquire))
    }

    /// Cached classification, resampled at most once per check interval
    pub fn check_pressure(&self) -> PressureLevel {
        {
            let state = self.state.lock();
            if let Some(last) = state.last_check {
                if last.elapsed() < self.check_interval {
                    return self.current_level();
                }
            }
        }
        self.check_pressure_now()
    }

    /// Sample immediately, bypassing the interval cache
    pub fn check_pressure_now(&self) -> PressureLevel {
        let sample = self.probe.sample();
        let mut ratio = sample.ratio();

        if let Some(retained) = self.retained.read().as_ref() {
            let retained_bytes = (retained.measure)();
            let retained_ratio =
                (retained_bytes as f64 / retained.budget_bytes as f64).clamp(0.0, 1.0);
            ratio = ratio.max(retained_ratio);
        }

        let level = self.thresholds.classify(ratio);
        self.checks.fetch_add(1, Ordering::Relaxed);

        let previous = {
            let mut state = self.state.lock();
            state.last_check = Some(Instant::now());
            state.last_ratio = ratio;
            state.last_sample = sample;
            PressureLevel::from_u8(self.level.swap(level as u8, Ordering::AcqRel))
        };

        if previous != level {
            self.transitions.fetch_add(1, Ordering::Relaxed);
            if level > previous {
                warn!(
                    from = %previous,
                    to = %level,
                    ratio = format!("{:.3}", ratio),
                    "Memory pressure increased"
                );
            } else {
                info!(
                    from = %previous,
                    to = %level,
                    ratio = format!("{:.3}", ratio),
                    "Memory pressure recovered"
                );
            }
            self.notify(previous, level);
        }

        level
    }

    fn notify(&self, previous: PressureLevel, current: PressureLevel) {
        let listeners: Vec<PressureListener> = self.listeners.read().clone();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(previous, current))).is_err() {
                error!(from = %previous, to = %current, "Pressure listener panicked");
            }
        }
    }

    /// Admission gate for thawing a module of the given priority
    pub fn allow_thaw(&self, priority: ModulePriority) -> bool {
        Self::admits(self.check_pressure(), priority)
    }

    /// Pure admission rule: which priorities may thaw at `level`
    pub fn admits(level: PressureLevel, priority: ModulePriority) -> bool {
        match level {
            PressureLevel::Green => true,
            PressureLevel::Yellow | PressureLevel::Orange => priority >= ModulePriority::High,
            PressureLevel::Red | PressureLevel::Critical => priority >= ModulePriority::Critical,
        }
    }

    /// Bytes still free under the retained budget, if a retained source is set
    pub fn retained_headroom(&self) -> Option<u64> {
        let (budget, measure) = {
            let retained = self.retained.read();
            let source = retained.as_ref()?;
            (source.budget_bytes, Arc::clone(&source.measure))
        };
        Some(budget.saturating_sub(measure()))
    }

    pub fn stats(&self) -> MemoryGuardStats {
        let state = self.state.lock();
        MemoryGuardStats {
            level: self.current_level(),
            ratio: state.last_ratio,
            used_bytes: state.last_sample.used_bytes,
            max_bytes: state.last_sample.max_bytes,
            checks: self.checks.load(Ordering::Relaxed),
            transitions: self.transitions.load(Ordering::Relaxed),
            probe: self.probe.name().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;
    use std::sync::atomic::AtomicUsize;

    fn settings() -> MemorySettings {
        MemorySettings {
            check_interval_ms: 0,
            ..MemorySettings::default()
        }
    }

    #[rstest]
    #[case(0.0, PressureLevel::Green)]
    #[case(0.59, PressureLevel::Green)]
    #[case(0.60, PressureLevel::Yellow)]
    #[case(0.80, PressureLevel::Orange)]
    #[case(0.90, PressureLevel::Red)]
    #[case(0.95, PressureLevel::Critical)]
    #[case(1.0, PressureLevel::Critical)]
    fn test_classify_bands(#[case] ratio: f64, #[case] expected: PressureLevel) {
        assert_eq!(PressureThresholds::default().classify(ratio), expected);
    }

    proptest! {
        #[test]
        fn prop_classification_is_monotonic(a in 0.0f64..=1.0, b in 0.0f64..=1.0) {
            let thresholds = PressureThresholds::default();
            let (low, high) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(thresholds.classify(low) <= thresholds.classify(high));
        }
    }

    #[test]
    fn test_listener_sees_transitions() {
        let probe = Arc::new(StaticMemoryProbe::new(0.1));
        let guard = MemoryGuard::new(probe.clone(), &settings());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        guard.on_pressure_change(move |from, to| sink.lock().push((from, to)));

        assert_eq!(guard.check_pressure(), PressureLevel::Green);
        probe.set_ratio(0.97);
        assert_eq!(guard.check_pressure(), PressureLevel::Critical);
        probe.set_ratio(0.65);
        assert_eq!(guard.check_pressure(), PressureLevel::Yellow);

        let seen = seen.lock();
        assert_eq!(
            *seen,
            vec![
                (PressureLevel::Green, PressureLevel::Critical),
                (PressureLevel::Critical, PressureLevel::Yellow),
            ]
        );
        assert_eq!(guard.stats().transitions, 2);
    }

    #[test]
    fn test_check_is_cached_within_interval() {
        let probe = Arc::new(StaticMemoryProbe::new(0.1));
        let guard = MemoryGuard::new(
            probe.clone(),
            &MemorySettings {
                check_interval_ms: 60_000,
                ..MemorySettings::default()
            },
        );

        assert_eq!(guard.check_pressure(), PressureLevel::Green);
        probe.set_ratio(0.99);
        assert_eq!(guard.check_pressure(), PressureLevel::Green);
        assert_eq!(guard.check_pressure_now(), PressureLevel::Critical);
    }

    #[test]
    fn test_allow_thaw_gates_by_priority() {
        let probe = Arc::new(StaticMemoryProbe::new(0.1));
        let guard = MemoryGuard::new(probe.clone(), &settings());
        assert!(guard.allow_thaw(ModulePriority::Disposable));

        probe.set_ratio(0.70);
        assert!(!guard.allow_thaw(ModulePriority::Normal));
        assert!(guard.allow_thaw(ModulePriority::High));

        probe.set_ratio(0.90);
        assert!(!guard.allow_thaw(ModulePriority::High));
        assert!(guard.allow_thaw(ModulePriority::Critical));
    }

    #[test]
    fn test_retained_headroom() {
        let guard = MemoryGuard::new(Arc::new(StaticMemoryProbe::new(0.1)), &settings());
        assert_eq!(guard.retained_headroom(), None);

        guard.set_retained_source(1000, || 600);
        assert_eq!(guard.retained_headroom(), Some(400));

        guard.set_retained_source(500, || 600);
        assert_eq!(guard.retained_headroom(), Some(0));
    }

    #[test]
    fn test_retained_ratio_dominates() {
        let probe = Arc::new(StaticMemoryProbe::new(0.1));
        let guard = MemoryGuard::new(probe, &settings());
        guard.set_retained_source(1000, || 900);
        assert_eq!(guard.check_pressure(), PressureLevel::Red);
    }

    #[test]
    fn test_panicking_listener_is_contained() {
        let probe = Arc::new(StaticMemoryProbe::new(0.1));
        let guard = MemoryGuard::new(probe.clone(), &settings());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        guard.on_pressure_change(|_, _| panic!("listener failure"));
        guard.on_pressure_change(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        probe.set_ratio(0.99);
        guard.check_pressure();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_system_probe_reports_sane_values() {
        let sample = SystemMemoryProbe::new(None).sample();
        assert!(sample.ratio() >= 0.0 && sample.ratio() <= 1.0);
    }
}
