//! Deadlock Detection Integration Tests
//!
//! Lives in its own test binary: the lock cycle built here never resolves,
//! and `parking_lot` reports cycles process-wide.

#![cfg(feature = "deadlock-detection")]

use common::test_utils::{init_test_tracing, wait_until};
use common::WatchdogSettings;
use orchestrator::{Watchdog, WORKER_THREAD_PREFIX};
use parking_lot::Mutex;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

/// A real two-lock cycle is reported, logged per thread, and the stuck
/// worker's token is cancelled
#[test]
fn test_lock_cycle_detected_and_worker_token_cancelled() {
    init_test_tracing();
    let watchdog = Arc::new(Watchdog::without_monitor(&WatchdogSettings::default()));

    let first = Arc::new(Mutex::new(()));
    let second = Arc::new(Mutex::new(()));
    let barrier = Arc::new(Barrier::new(2));
    let (token_tx, token_rx) = crossbeam_channel::bounded(1);

    {
        let (first, second, barrier) = (first.clone(), second.clone(), barrier.clone());
        let watchdog = Arc::clone(&watchdog);
        thread::Builder::new()
            .name(format!("{WORKER_THREAD_PREFIX}-stuck"))
            .spawn(move || {
                let token = watchdog.start("stuck-unit", Duration::from_secs(600));
                let _ = token_tx.send(token.cancellation().clone());
                let _a = first.lock();
                barrier.wait();
                let _b = second.lock();
            })
            .expect("spawn worker");
    }
    thread::spawn(move || {
        let _b = second.lock();
        barrier.wait();
        let _a = first.lock();
    });

    let cancellation = token_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("worker started");

    let mut cycles = 0;
    assert!(wait_until(Duration::from_secs(5), || {
        cycles += watchdog.scan_for_deadlocks();
        cycles > 0
    }));

    assert_eq!(cycles, 1);
    let stats = watchdog.stats();
    assert_eq!(stats.deadlocks_detected, 1);
    assert_eq!(stats.recoveries, 1);
    assert!(cancellation.is_cancelled());
}
