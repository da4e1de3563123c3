//! Watchdog
//!
//! A single monitor thread polls active tokens and flags the ones past their
//! deadline exactly once. Overdue operations are cancelled cooperatively
//! through their `CancellationToken`. With the `deadlock-detection` feature
//! the same thread periodically asks `parking_lot` for lock cycles.

use common::{RuntimeError, WatchdogSettings};
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::backtrace::Backtrace;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Threads of the runtime's own pools carry this name prefix.
/// Deadlock recovery only ever targets them.
pub const WORKER_THREAD_PREFIX: &str = "aegis-worker";

const RUNNING: u8 = 0;
const COMPLETED: u8 = 1;
const OVERDUE: u8 = 2;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WatchdogError {
    #[error("Operation '{operation}' exceeded its deadline of {timeout:?}")]
    Timeout { operation: String, timeout: Duration },
}

impl From<WatchdogError> for RuntimeError {
    fn from(err: WatchdogError) -> Self {
        match err {
            WatchdogError::Timeout { operation, timeout } => RuntimeError::WatchdogTimeout {
                operation,
                timeout_ms: timeout.as_millis() as u64,
            },
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WatchdogStats {
    pub started: u64,
    pub completed: u64,
    pub overdue: u64,
    pub active: usize,
    pub deadlock_scans: u64,
    pub deadlocks_detected: u64,
    pub recoveries: u64,
}

/// Snapshot of one running operation, for health details
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveOperation {
    pub operation: String,
    pub thread: Option<String>,
    pub elapsed_ms: u64,
    pub timeout_ms: u64,
}

#[derive(Debug)]
struct TokenState {
    id: u64,
    operation: String,
    owner: ThreadId,
    owner_name: Option<String>,
    started: Instant,
    timeout: Duration,
    deadline: Instant,
    status: AtomicU8,
    cancel: CancellationToken,
    backtrace: Option<Backtrace>,
}

impl TokenState {
    fn is_worker_owned(&self) -> bool {
        self.owner_name
            .as_deref()
            .is_some_and(|name| name.starts_with(WORKER_THREAD_PREFIX))
    }
}

/// Handle returned by `Watchdog::start`
#[derive(Debug, Clone)]
pub struct WatchdogToken {
    state: Arc<TokenState>,
}

impl WatchdogToken {
    pub fn id(&self) -> u64 {
        self.state.id
    }

    pub fn operation(&self) -> &str {
        &self.state.operation
    }

    pub fn deadline(&self) -> Instant {
        self.state.deadline
    }

    /// Cancelled when the watchdog flags the operation overdue
    pub fn cancellation(&self) -> &CancellationToken {
        &self.state.cancel
    }

    pub fn is_overdue(&self) -> bool {
        self.state.status.load(Ordering::Acquire) == OVERDUE
    }

    pub fn is_completed(&self) -> bool {
        self.state.status.load(Ordering::Acquire) == COMPLETED
    }
}

#[derive(Debug)]
struct WatchdogShared {
    settings: WatchdogSettings,
    tokens: DashMap<u64, Arc<TokenState>>,
    next_id: AtomicU64,
    shutdown: Mutex<bool>,
    wake: Condvar,
    started: AtomicU64,
    completed: AtomicU64,
    overdue: AtomicU64,
    deadlock_scans: AtomicU64,
    deadlocks_detected: AtomicU64,
    recoveries: AtomicU64,
}

impl WatchdogShared {
    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.settings.poll_interval_ms.max(1))
    }

    fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.settings.deadlock_scan_interval_ms.max(1))
    }

    fn sweep_overdue(&self) -> usize {
        let now = Instant::now();
        let candidates: Vec<Arc<TokenState>> = self
            .tokens
            .iter()
            .filter(|t| now >= t.value().deadline)
            .map(|t| Arc::clone(t.value()))
            .collect();

        let mut flagged = 0;
        for token in candidates {
            // The owner may complete concurrently; only one side wins
            if token
                .status
                .compare_exchange(RUNNING, OVERDUE, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }

            flagged += 1;
            self.overdue.fetch_add(1, Ordering::Relaxed);
            self.tokens.remove(&token.id);

            let elapsed_ms = token.started.elapsed().as_millis() as u64;
            match &token.backtrace {
                Some(backtrace) => warn!(
                    operation = %token.operation,
                    thread = token.owner_name.as_deref().unwrap_or("<unnamed>"),
                    thread_id = ?token.owner,
                    elapsed_ms,
                    timeout_ms = token.timeout.as_millis() as u64,
                    backtrace = %backtrace,
                    "Watchdog: operation overdue"
                ),
                None => warn!(
                    operation = %token.operation,
                    thread = token.owner_name.as_deref().unwrap_or("<unnamed>"),
                    thread_id = ?token.owner,
                    elapsed_ms,
                    timeout_ms = token.timeout.as_millis() as u64,
                    "Watchdog: operation overdue"
                ),
            }

            if self.settings.interrupt_overdue {
                token.cancel.cancel();
            }
        }
        flagged
    }

    #[cfg(feature = "deadlock-detection")]
    fn scan_for_deadlocks(&self) -> usize {
        self.deadlock_scans.fetch_add(1, Ordering::Relaxed);
        let cycles = parking_lot::deadlock::check_deadlock();
        if cycles.is_empty() {
            return 0;
        }

        self.deadlocks_detected
            .fetch_add(cycles.len() as u64, Ordering::Relaxed);
        for (index, threads) in cycles.iter().enumerate() {
            error!(cycle = index, threads = threads.len(), "Watchdog: deadlock detected");
            for thread in threads {
                error!(
                    cycle = index,
                    thread_id = ?thread.thread_id(),
                    backtrace = ?thread.backtrace(),
                    "Watchdog: deadlocked thread"
                );
            }
        }

        self.recover_from_deadlock();
        cycles.len()
    }

    #[cfg(not(feature = "deadlock-detection"))]
    fn scan_for_deadlocks(&self) -> usize {
        self.deadlock_scans.fetch_add(1, Ordering::Relaxed);
        0
    }

    /// Cancel the oldest operation running on a runtime worker thread.
    /// Caller threads are never touched.
    fn recover_from_deadlock(&self) -> bool {
        let victim = self
            .tokens
            .iter()
            .filter(|t| t.value().is_worker_owned())
            .min_by_key(|t| t.value().started)
            .map(|t| Arc::clone(t.value()));

        match victim {
            Some(token) => {
                warn!(
                    operation = %token.operation,
                    thread = token.owner_name.as_deref().unwrap_or("<unnamed>"),
                    "Watchdog: cancelling worker operation to break deadlock"
                );
                token.cancel.cancel();
                self.recoveries.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => {
                warn!("Watchdog: no runtime worker operation available for deadlock recovery");
                false
            }
        }
    }
}

pub struct Watchdog {
    shared: Arc<WatchdogShared>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Watchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watchdog")
            .field("active", &self.shared.tokens.len())
            .field("monitor_running", &self.monitor.lock().is_some())
            .finish()
    }
}

impl Watchdog {
    /// Create the watchdog and spawn its monitor thread
    pub fn new(settings: &WatchdogSettings) -> Self {
        let watchdog = Self::without_monitor(settings);
        watchdog.spawn_monitor();
        watchdog
    }

    /// Watchdog whose sweeps are driven manually through `poll`
    pub fn without_monitor(settings: &WatchdogSettings) -> Self {
        Self {
            shared: Arc::new(WatchdogShared {
                settings: settings.clone(),
                tokens: DashMap::new(),
                next_id: AtomicU64::new(1),
                shutdown: Mutex::new(false),
                wake: Condvar::new(),
                started: AtomicU64::new(0),
                completed: AtomicU64::new(0),
                overdue: AtomicU64::new(0),
                deadlock_scans: AtomicU64::new(0),
                deadlocks_detected: AtomicU64::new(0),
                recoveries: AtomicU64::new(0),
            }),
            monitor: Mutex::new(None),
        }
    }

    fn spawn_monitor(&self) {
        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name("aegis-watchdog".to_string())
            .spawn(move || {
                debug!("Watchdog monitor started");
                let mut last_scan = Instant::now();
                loop {
                    {
                        let mut stop = shared.shutdown.lock();
                        if !*stop {
                            shared.wake.wait_for(&mut stop, shared.poll_interval());
                        }
                        if *stop {
                            break;
                        }
                    }

                    shared.sweep_overdue();

                    if last_scan.elapsed() >= shared.scan_interval() {
                        shared.scan_for_deadlocks();
                        last_scan = Instant::now();
                    }
                }
                debug!("Watchdog monitor stopped");
            });

        match spawned {
            Ok(handle) => *self.monitor.lock() = Some(handle),
            Err(e) => error!(error = %e, "Failed to spawn watchdog monitor; overdue detection only via poll()"),
        }
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.shared.settings.default_timeout_ms)
    }

    /// Start tracking an operation owned by the current thread
    pub fn start(&self, operation: &str, timeout: Duration) -> WatchdogToken {
        let current = thread::current();
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();

        let state = Arc::new(TokenState {
            id,
            operation: operation.to_string(),
            owner: current.id(),
            owner_name: current.name().map(str::to_string),
            started,
            timeout,
            deadline: started + timeout,
            status: AtomicU8::new(RUNNING),
            cancel: CancellationToken::new(),
            backtrace: self
                .shared
                .settings
                .capture_backtraces
                .then(Backtrace::force_capture),
        });

        self.shared.tokens.insert(id, Arc::clone(&state));
        self.shared.started.fetch_add(1, Ordering::Relaxed);
        WatchdogToken { state }
    }

    /// Mark the operation completed. Returns false when the monitor already
    /// flagged it overdue.
    pub fn stop(&self, token: &WatchdogToken) -> bool {
        let completed = token
            .state
            .status
            .compare_exchange(RUNNING, COMPLETED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();

        if completed {
            self.shared.tokens.remove(&token.state.id);
            self.shared.completed.fetch_add(1, Ordering::Relaxed);
        }
        completed
    }

    /// Run `op` under a deadline. The op receives the token's cancellation
    /// handle and should check it at its own yield points.
    pub fn guarded<T, F>(&self, operation: &str, timeout: Duration, op: F) -> Result<T, WatchdogError>
    where
        F: FnOnce(&CancellationToken) -> T,
    {
        let token = self.start(operation, timeout);
        let value = op(token.cancellation());

        if self.stop(&token) {
            Ok(value)
        } else {
            Err(WatchdogError::Timeout {
                operation: operation.to_string(),
                timeout,
            })
        }
    }

    /// Run one overdue sweep on the calling thread
    pub fn poll(&self) -> usize {
        self.shared.sweep_overdue()
    }

    /// Run one deadlock scan on the calling thread; returns the number of cycles
    pub fn scan_for_deadlocks(&self) -> usize {
        self.shared.scan_for_deadlocks()
    }

    pub fn active_count(&self) -> usize {
        self.shared.tokens.len()
    }

    pub fn active_operations(&self) -> Vec<ActiveOperation> {
        let mut ops: Vec<_> = self
            .shared
            .tokens
            .iter()
            .map(|t| {
                let state = t.value();
                ActiveOperation {
                    operation: state.operation.clone(),
                    thread: state.owner_name.clone(),
                    elapsed_ms: state.started.elapsed().as_millis() as u64,
                    timeout_ms: state.timeout.as_millis() as u64,
                }
            })
            .collect();
        ops.sort_by(|a, b| b.elapsed_ms.cmp(&a.elapsed_ms));
        ops
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor.lock().is_some()
    }

    pub fn stats(&self) -> WatchdogStats {
        let shared = &self.shared;
        WatchdogStats {
            started: shared.started.load(Ordering::Relaxed),
            completed: shared.completed.load(Ordering::Relaxed),
            overdue: shared.overdue.load(Ordering::Relaxed),
            active: shared.tokens.len(),
            deadlock_scans: shared.deadlock_scans.load(Ordering::Relaxed),
            deadlocks_detected: shared.deadlocks_detected.load(Ordering::Relaxed),
            recoveries: shared.recoveries.load(Ordering::Relaxed),
        }
    }

    /// Stop the monitor thread and wait for it
    pub fn shutdown(&self) {
        {
            let mut stop = self.shared.shutdown.lock();
            *stop = true;
            self.shared.wake.notify_all();
        }

        if let Some(handle) = self.monitor.lock().take() {
            if handle.join().is_err() {
                error!("Watchdog monitor thread panicked");
            } else {
                info!("Watchdog stopped");
            }
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.shutdown();
    }
}
