//! Runtime configuration
//!
//! All durations are plain millisecond integers so that TOML files and
//! environment overrides stay trivial to write. Every section has a `Default`
//! and `#[serde(default)]`, so a partial file only overrides what it names.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

impl ConfigError {
    fn invalid(field: &str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

/// Transformation pipeline settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Cumulative budget for all transforms of one unit
    pub unit_budget_ms: u64,
    /// Soft budget for a single transform
    pub transform_budget_ms: u64,
    /// Fan batches out to the worker pool
    pub parallel: bool,
    pub max_parallelism: usize,
    /// Bounded queue size expressed as a multiple of the worker count
    pub queue_factor: usize,
    /// Unit ids starting with any of these are never transformed
    pub excluded_prefixes: Vec<String>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            unit_budget_ms: 50,
            transform_budget_ms: 10,
            parallel: true,
            max_parallelism: num_cpus::get().max(1),
            queue_factor: 2,
            excluded_prefixes: vec![
                "java/".to_string(),
                "javax/".to_string(),
                "sun/".to_string(),
                "jdk/".to_string(),
                "aegis/".to_string(),
            ],
        }
    }
}

impl PipelineSettings {
    pub fn unit_budget(&self) -> Duration {
        Duration::from_millis(self.unit_budget_ms)
    }

    pub fn transform_budget(&self) -> Duration {
        Duration::from_millis(self.transform_budget_ms)
    }
}

/// Transform cache settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub stripes: usize,
    pub max_entries_per_stripe: usize,
    pub max_total_bytes: usize,
    pub ttl_ms: u64,
    /// Keep a copy of each input and compare bytes on hit
    pub verify_content: bool,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            stripes: 16,
            max_entries_per_stripe: 512,
            max_total_bytes: 64 * 1024 * 1024, // 64MB
            ttl_ms: 10 * 60 * 1000,
            verify_content: false,
        }
    }
}

impl CacheSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

/// Object pool settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub max_idle: usize,
    /// Objects whose retained capacity exceeds this are discarded on return
    pub max_object_bytes: usize,
    pub warm_up: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_idle: 64,
            max_object_bytes: 1024 * 1024, // 1MB
            warm_up: 8,
        }
    }
}

/// Memory guard settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemorySettings {
    pub check_interval_ms: u64,
    pub yellow_threshold: f64,
    pub orange_threshold: f64,
    pub red_threshold: f64,
    pub critical_threshold: f64,
    /// Budget for explicitly accounted bytes (modules + cache)
    pub retained_budget_bytes: Option<u64>,
    /// Measure process RSS against this ceiling instead of system memory
    pub process_ceiling_bytes: Option<u64>,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            check_interval_ms: 500,
            yellow_threshold: 0.60,
            orange_threshold: 0.75,
            red_threshold: 0.85,
            critical_threshold: 0.95,
            retained_budget_bytes: None,
            process_ceiling_bytes: None,
        }
    }
}

impl MemorySettings {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }
}

/// Module lifecycle settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleSettings {
    pub max_consecutive_failures: u32,
    pub quarantine_cooldown_ms: u64,
    pub max_dependency_depth: usize,
    pub default_idle_timeout_ms: u64,
}

impl Default for ModuleSettings {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 3,
            quarantine_cooldown_ms: 60_000,
            max_dependency_depth: 16,
            default_idle_timeout_ms: 5 * 60 * 1000,
        }
    }
}

impl ModuleSettings {
    pub fn quarantine_cooldown(&self) -> Duration {
        Duration::from_millis(self.quarantine_cooldown_ms)
    }
}

/// Circuit breaker defaults for breakers created on demand
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub minimum_request_threshold: u32,
    pub failure_rate_threshold: f64,
    pub window_ms: u64,
    pub cooldown_ms: u64,
    pub half_open_success_threshold: u32,
    pub half_open_max_requests: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            minimum_request_threshold: 10,
            failure_rate_threshold: 0.5,
            window_ms: 60_000,
            cooldown_ms: 30_000,
            half_open_success_threshold: 3,
            half_open_max_requests: 5,
        }
    }
}

/// Token bucket defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterSettings {
    pub permits_per_second: f64,
    pub burst: u32,
}

impl Default for RateLimiterSettings {
    fn default() -> Self {
        Self {
            permits_per_second: 1000.0,
            burst: 200,
        }
    }
}

/// Watchdog settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogSettings {
    pub poll_interval_ms: u64,
    pub deadlock_scan_interval_ms: u64,
    /// Cancel the token of an overdue operation
    pub interrupt_overdue: bool,
    pub capture_backtraces: bool,
    pub default_timeout_ms: u64,
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            deadlock_scan_interval_ms: 10_000,
            interrupt_overdue: true,
            capture_backtraces: false,
            default_timeout_ms: 5_000,
        }
    }
}

/// Background maintenance thread settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceSettings {
    pub enabled: bool,
    pub tick_interval_ms: u64,
    pub health_report_every_ticks: u32,
}

impl Default for MaintenanceSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_interval_ms: 1_000,
            health_report_every_ticks: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Полная конфигурация runtime
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub pipeline: PipelineSettings,
    pub cache: CacheSettings,
    pub pools: PoolSettings,
    pub memory: MemorySettings,
    pub modules: ModuleSettings,
    pub breaker: BreakerSettings,
    pub rate_limiter: RateLimiterSettings,
    pub watchdog: WatchdogSettings,
    pub maintenance: MaintenanceSettings,
    pub logging: LoggingSettings,
}

impl RuntimeConfig {
    pub fn development() -> Self {
        let mut config = Self::default();
        config.logging.level = "debug".to_string();
        config.maintenance.health_report_every_ticks = 10;
        config
    }

    pub fn production() -> Self {
        let mut config = Self::default();
        config.logging.json = true;
        config.cache.max_entries_per_stripe = 2048;
        config.cache.max_total_bytes = 256 * 1024 * 1024;
        config
    }

    /// Short intervals and small caches, no background maintenance
    pub fn testing() -> Self {
        let mut config = Self::default();
        config.cache.stripes = 4;
        config.cache.max_entries_per_stripe = 64;
        config.cache.max_total_bytes = 4 * 1024 * 1024;
        config.memory.check_interval_ms = 0;
        config.modules.quarantine_cooldown_ms = 100;
        config.watchdog.poll_interval_ms = 10;
        config.watchdog.deadlock_scan_interval_ms = 1_000;
        config.maintenance.enabled = false;
        config.pipeline.max_parallelism = 4;
        config
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml_str(&content)
    }

    /// Apply `AEGIS_*` environment overrides on top of the current values
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(level) = std::env::var("AEGIS_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(json) = std::env::var("AEGIS_LOG_JSON") {
            self.logging.json = parse_env("AEGIS_LOG_JSON", &json)?;
        }
        if let Ok(parallel) = std::env::var("AEGIS_PIPELINE_PARALLEL") {
            self.pipeline.parallel = parse_env("AEGIS_PIPELINE_PARALLEL", &parallel)?;
        }
        if let Ok(workers) = std::env::var("AEGIS_MAX_PARALLELISM") {
            self.pipeline.max_parallelism = parse_env("AEGIS_MAX_PARALLELISM", &workers)?;
        }
        if let Ok(budget) = std::env::var("AEGIS_UNIT_BUDGET_MS") {
            self.pipeline.unit_budget_ms = parse_env("AEGIS_UNIT_BUDGET_MS", &budget)?;
        }
        if let Ok(ttl) = std::env::var("AEGIS_CACHE_TTL_MS") {
            self.cache.ttl_ms = parse_env("AEGIS_CACHE_TTL_MS", &ttl)?;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache.stripes == 0 {
            return Err(ConfigError::invalid("cache.stripes", "must be at least 1"));
        }
        if self.cache.max_entries_per_stripe == 0 {
            return Err(ConfigError::invalid(
                "cache.max_entries_per_stripe",
                "must be at least 1",
            ));
        }
        if self.pipeline.max_parallelism == 0 {
            return Err(ConfigError::invalid(
                "pipeline.max_parallelism",
                "must be at least 1",
            ));
        }
        if self.pipeline.unit_budget_ms == 0 {
            return Err(ConfigError::invalid(
                "pipeline.unit_budget_ms",
                "must be greater than zero",
            ));
        }

        let thresholds = [
            self.memory.yellow_threshold,
            self.memory.orange_threshold,
            self.memory.red_threshold,
            self.memory.critical_threshold,
        ];
        if thresholds.iter().any(|t| !(*t > 0.0 && *t <= 1.0)) {
            return Err(ConfigError::invalid(
                "memory thresholds",
                "each threshold must lie in (0, 1]",
            ));
        }
        if thresholds.windows(2).any(|w| w[0] >= w[1]) {
            return Err(ConfigError::invalid(
                "memory thresholds",
                "must be strictly ascending yellow < orange < red < critical",
            ));
        }

        if !(0.0..=1.0).contains(&self.breaker.failure_rate_threshold) {
            return Err(ConfigError::invalid(
                "breaker.failure_rate_threshold",
                "must lie in [0, 1]",
            ));
        }
        if self.breaker.failure_threshold == 0 || self.breaker.half_open_success_threshold == 0 {
            return Err(ConfigError::invalid(
                "breaker",
                "failure and half-open success thresholds must be at least 1",
            ));
        }
        let rate = self.rate_limiter.permits_per_second;
        if self.rate_limiter.burst == 0 || !rate.is_finite() || rate <= 0.0 {
            return Err(ConfigError::invalid(
                "rate_limiter",
                "burst and permits_per_second must be positive",
            ));
        }
        if self.modules.max_consecutive_failures == 0 {
            return Err(ConfigError::invalid(
                "modules.max_consecutive_failures",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| ConfigError::invalid(name, format!("cannot parse '{raw}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        assert!(RuntimeConfig::default().validate().is_ok());
        assert!(RuntimeConfig::testing().validate().is_ok());
        assert!(RuntimeConfig::production().validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = RuntimeConfig::from_toml_str(
            r#"
            [pipeline]
            unit_budget_ms = 5
            parallel = false

            [cache]
            ttl_ms = 1000
            "#,
        )
        .expect("valid toml");

        assert_eq!(config.pipeline.unit_budget_ms, 5);
        assert!(!config.pipeline.parallel);
        assert_eq!(config.cache.ttl_ms, 1000);
        assert_eq!(config.cache.stripes, CacheSettings::default().stripes);
        assert_eq!(config.breaker, BreakerSettings::default());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "[rate_limiter]\npermits_per_second = 10.0\nburst = 5").expect("write");

        let config = RuntimeConfig::load(file.path()).expect("load");
        assert_eq!(config.rate_limiter.burst, 5);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = RuntimeConfig::load("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[rstest]
    #[case("[cache]\nstripes = 0")]
    #[case("[memory]\nyellow_threshold = 0.9\norange_threshold = 0.8")]
    #[case("[memory]\ncritical_threshold = 1.5")]
    #[case("[rate_limiter]\nburst = 0")]
    #[case("[rate_limiter]\npermits_per_second = 0.0")]
    #[case("[rate_limiter]\npermits_per_second = -5.0")]
    #[case("[breaker]\nfailure_rate_threshold = 2.0")]
    fn test_invalid_values_rejected(#[case] content: &str) {
        let err = RuntimeConfig::from_toml_str(content).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }), "{err}");
    }

    #[test]
    fn test_garbage_is_parse_error() {
        let err = RuntimeConfig::from_toml_str("[[[not toml").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        std::env::set_var("AEGIS_UNIT_BUDGET_MS", "7");
        std::env::set_var("AEGIS_PIPELINE_PARALLEL", "false");
        let mut config = RuntimeConfig::default();
        let result = config.apply_env_overrides();
        std::env::remove_var("AEGIS_UNIT_BUDGET_MS");
        std::env::remove_var("AEGIS_PIPELINE_PARALLEL");

        result.expect("overrides apply");
        assert_eq!(config.pipeline.unit_budget_ms, 7);
        assert!(!config.pipeline.parallel);
    }

    #[test]
    #[serial]
    fn test_env_override_parse_failure() {
        std::env::set_var("AEGIS_MAX_PARALLELISM", "many");
        let mut config = RuntimeConfig::default();
        let result = config.apply_env_overrides();
        std::env::remove_var("AEGIS_MAX_PARALLELISM");

        assert!(result.is_err());
    }
}
