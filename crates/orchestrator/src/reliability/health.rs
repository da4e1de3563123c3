//! Health Monitoring
//!
//! A registry of named checks. Each check returns a `ComponentHealth`; the
//! aggregate report's status is the worst of its components. A check that
//! panics is reported as `Critical` rather than taking the monitor down.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, warn};

/// Health status, ordered from best to worst
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Critical,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Critical => "critical",
        }
    }

    pub fn is_operational(&self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Degraded)
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one named check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: HealthStatus,
    pub details: BTreeMap<String, serde_json::Value>,
    pub checked_at: DateTime<Utc>,
    pub duration_ms: f64,
}

impl ComponentHealth {
    pub fn new(status: HealthStatus) -> Self {
        Self {
            status,
            details: BTreeMap::new(),
            checked_at: Utc::now(),
            duration_ms: 0.0,
        }
    }

    pub fn healthy() -> Self {
        Self::new(HealthStatus::Healthy)
    }

    pub fn degraded(reason: impl Into<String>) -> Self {
        Self::new(HealthStatus::Degraded).with_detail("reason", reason.into())
    }

    pub fn unhealthy(reason: impl Into<String>) -> Self {
        Self::new(HealthStatus::Unhealthy).with_detail("reason", reason.into())
    }

    pub fn critical(reason: impl Into<String>) -> Self {
        Self::new(HealthStatus::Critical).with_detail("reason", reason.into())
    }

    pub fn with_detail(mut self, key: &str, value: impl Serialize) -> Self {
        let value = serde_json::to_value(value).unwrap_or(serde_json::Value::Null);
        self.details.insert(key.to_string(), value);
        self
    }

    /// Raise the status to `status` if it is worse than the current one
    pub fn escalate(mut self, status: HealthStatus) -> Self {
        self.status = self.status.max(status);
        self
    }
}

/// A named health check
pub trait HealthCheck: Send + Sync {
    fn check(&self) -> ComponentHealth;
}

impl<F> HealthCheck for F
where
    F: Fn() -> ComponentHealth + Send + Sync,
{
    fn check(&self) -> ComponentHealth {
        self()
    }
}

/// Aggregated health report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub components: BTreeMap<String, ComponentHealth>,
    pub generated_at: DateTime<Utc>,
    pub uptime_seconds: u64,
}

impl HealthReport {
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|e| {
            format!("{{\"status\":\"{}\",\"error\":\"{}\"}}", self.status, e)
        })
    }

    /// Components whose status is not healthy
    pub fn problems(&self) -> Vec<(&str, HealthStatus)> {
        self.components
            .iter()
            .filter(|(_, c)| c.status != HealthStatus::Healthy)
            .map(|(name, c)| (name.as_str(), c.status))
            .collect()
    }
}

pub struct HealthMonitor {
    checks: RwLock<BTreeMap<String, Arc<dyn HealthCheck>>>,
    started_at: Instant,
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("checks", &self.checks.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self {
            checks: RwLock::new(BTreeMap::new()),
            started_at: Instant::now(),
        }
    }

    /// Register a check, replacing any existing check of the same name
    pub fn register_check(&self, name: &str, check: impl HealthCheck + 'static) {
        if self
            .checks
            .write()
            .insert(name.to_string(), Arc::new(check))
            .is_some()
        {
            debug!(check = name, "Replaced health check");
        }
    }

    pub fn unregister_check(&self, name: &str) -> bool {
        self.checks.write().remove(name).is_some()
    }

    pub fn check_names(&self) -> Vec<String> {
        self.checks.read().keys().cloned().collect()
    }

    /// Run a single check by name
    pub fn check(&self, name: &str) -> Option<ComponentHealth> {
        let check = self.checks.read().get(name).cloned()?;
        Some(run_check(name, check.as_ref()))
    }

    /// Run every registered check
    pub fn full_report(&self) -> HealthReport {
        // Checks run without holding the registry lock
        let checks: Vec<(String, Arc<dyn HealthCheck>)> = self
            .checks
            .read()
            .iter()
            .map(|(name, check)| (name.clone(), Arc::clone(check)))
            .collect();

        let components: BTreeMap<String, ComponentHealth> = checks
            .into_iter()
            .map(|(name, check)| {
                let health = run_check(&name, check.as_ref());
                (name, health)
            })
            .collect();

        let status = components
            .values()
            .map(|c| c.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);

        if status >= HealthStatus::Unhealthy {
            warn!(status = %status, "Health report is not operational");
        }

        HealthReport {
            status,
            components,
            generated_at: Utc::now(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
        }
    }
}

fn run_check(name: &str, check: &dyn HealthCheck) -> ComponentHealth {
    let start = Instant::now();
    let mut health = match catch_unwind(AssertUnwindSafe(|| check.check())) {
        Ok(health) => health,
        Err(_) => {
            error!(check = name, "Health check panicked");
            ComponentHealth::critical("health check panicked")
        }
    };
    health.duration_ms = start.elapsed().as_secs_f64() * 1000.0;
    health
}
