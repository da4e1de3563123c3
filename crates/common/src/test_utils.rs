//! Shared helpers for unit and integration tests

use once_cell::sync::Lazy;
use std::time::{Duration, Instant};

static INIT_TRACING: Lazy<()> = Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
});

/// Install a test-friendly subscriber once per process
pub fn init_test_tracing() {
    Lazy::force(&INIT_TRACING);
}

/// Poll `condition` until it holds or `timeout` elapses
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_wait_until() {
        init_test_tracing();
        let counter = AtomicU32::new(0);
        assert!(wait_until(Duration::from_secs(1), || {
            counter.fetch_add(1, Ordering::SeqCst) >= 3
        }));
        assert!(!wait_until(Duration::from_millis(10), || false));
    }
}
