//! Bounded worker pool for batch transforms
//!
//! Jobs go through a bounded crossbeam queue. When the queue is full the
//! submitting thread runs the unit itself. The collecting caller also claims
//! any unit no worker has picked up yet, so a batch never waits on an idle
//! queue.

use common::RuntimeError;
use crossbeam_channel::{bounded, Sender};
use parking_lot::{Condvar, Mutex};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::transform::{SkipReason, Transform, TransformResult};
use super::PipelineCore;
use crate::reliability::WORKER_THREAD_PREFIX;

type Job = Box<dyn FnOnce() + Send + 'static>;

pub(crate) struct WorkerPool {
    sender: Mutex<Option<Sender<Job>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
}

impl WorkerPool {
    pub(crate) fn new(size: usize, queue_factor: usize) -> std::io::Result<Self> {
        let size = size.max(1);
        let (sender, receiver) = bounded::<Job>(size * queue_factor.max(1));

        let mut handles = Vec::with_capacity(size);
        for index in 0..size {
            let receiver = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("{WORKER_THREAD_PREFIX}-{index}"))
                .spawn(move || {
                    while let Ok(job) = receiver.recv() {
                        if catch_unwind(AssertUnwindSafe(job)).is_err() {
                            error!("Pipeline worker job panicked");
                        }
                    }
                })?;
            handles.push(handle);
        }

        debug!(workers = size, "Pipeline worker pool started");
        Ok(Self {
            sender: Mutex::new(Some(sender)),
            handles: Mutex::new(handles),
            size,
        })
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    /// Hands the job back when the queue is full or the pool is stopped
    fn try_submit(&self, job: Job) -> Result<(), Job> {
        let sender = self.sender.lock().clone();
        match sender {
            Some(sender) => sender.try_send(job).map_err(|e| e.into_inner()),
            None => Err(job),
        }
    }

    pub(crate) fn shutdown(&self) {
        // Workers exit once the queue is drained and the sender is gone
        self.sender.lock().take();
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                error!("Pipeline worker thread panicked");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[derive(Default)]
struct SlotState {
    started: Option<Instant>,
    cancel: Option<CancellationToken>,
    result: Option<TransformResult>,
    abandoned: bool,
}

#[derive(Default)]
struct Slot {
    claimed: AtomicBool,
    state: Mutex<SlotState>,
    ready: Condvar,
}

impl Slot {
    fn finish(&self, result: TransformResult) {
        let mut state = self.state.lock();
        if !state.abandoned {
            state.result = Some(result);
        }
        self.ready.notify_all();
    }
}

struct Batch {
    core: Arc<PipelineCore>,
    units: Vec<(String, Vec<u8>)>,
    transforms: Vec<Arc<dyn Transform>>,
    slots: Vec<Slot>,
    generation: CancellationToken,
    unit_timeout: Duration,
}

impl Batch {
    /// Claim slot `index` and run it on the current thread.
    /// Returns false when another thread already claimed it.
    fn execute(&self, index: usize) -> bool {
        let slot = &self.slots[index];
        {
            // Claim and timeout clock start together under the slot lock
            let mut state = slot.state.lock();
            if slot.claimed.swap(true, Ordering::AcqRel) {
                return false;
            }
            state.started = Some(Instant::now());
        }

        let (unit_id, bytes) = &self.units[index];
        if catch_unwind(AssertUnwindSafe(|| self.run_claimed(slot, unit_id, bytes))).is_err() {
            error!(unit_id = %unit_id, "Batch unit panicked outside transform isolation");
            self.core.record_failed();
            slot.finish(TransformResult::failed(
                unit_id,
                RuntimeError::Internal(format!("batch unit '{unit_id}' panicked")),
            ));
        }
        true
    }

    fn run_claimed(&self, slot: &Slot, unit_id: &str, bytes: &[u8]) {
        if self.generation.is_cancelled() {
            self.core.record_cancelled();
            slot.finish(TransformResult::skipped(unit_id, bytes, SkipReason::Cancelled));
            return;
        }

        let watch = self
            .core
            .watchdog()
            .map(|watchdog| watchdog.start(&format!("transform:{unit_id}"), self.unit_timeout));
        let cancel = watch
            .as_ref()
            .map(|token| token.cancellation().clone())
            .unwrap_or_else(CancellationToken::new);
        slot.state.lock().cancel = Some(cancel.clone());

        let result = self.core.run_unit(unit_id, bytes, &self.transforms, &cancel);

        if let (Some(watchdog), Some(token)) = (self.core.watchdog(), watch.as_ref()) {
            watchdog.stop(token);
        }
        slot.finish(result);
    }

    /// Wait for slot `index`, running it here if nobody picked it up
    fn collect(&self, index: usize) -> TransformResult {
        self.execute(index);

        let slot = &self.slots[index];
        let mut state = slot.state.lock();
        loop {
            if let Some(result) = state.result.take() {
                return result;
            }

            // `execute` above guarantees the slot is claimed and started
            let started = *state.started.get_or_insert_with(Instant::now);
            let elapsed = started.elapsed();
            if elapsed >= self.unit_timeout {
                state.abandoned = true;
                if let Some(cancel) = &state.cancel {
                    cancel.cancel();
                }
                drop(state);

                let (unit_id, bytes) = &self.units[index];
                warn!(
                    unit_id = %unit_id,
                    elapsed_ms = elapsed.as_millis() as u64,
                    timeout_ms = self.unit_timeout.as_millis() as u64,
                    "Batch unit timed out"
                );
                self.core.record_timeout();
                let mut result = TransformResult::skipped(unit_id, bytes, SkipReason::Timeout);
                result.duration = elapsed;
                return result;
            }
            slot.ready.wait_for(&mut state, self.unit_timeout - elapsed);
        }
    }
}

/// Fan a batch out over `pool`. Results keep input order.
pub(crate) fn run_batch(
    core: &Arc<PipelineCore>,
    pool: &WorkerPool,
    units: Vec<(String, Vec<u8>)>,
    transforms: Vec<Arc<dyn Transform>>,
    generation: CancellationToken,
    unit_timeout: Duration,
) -> Vec<TransformResult> {
    let count = units.len();
    let batch = Arc::new(Batch {
        core: Arc::clone(core),
        units,
        transforms,
        slots: (0..count).map(|_| Slot::default()).collect(),
        generation,
        unit_timeout,
    });

    for index in 0..count {
        let job_batch = Arc::clone(&batch);
        let job: Job = Box::new(move || {
            job_batch.execute(index);
        });

        if pool.try_submit(job).is_err() {
            // Saturated: caller runs
            core.record_caller_run();
            batch.execute(index);
        }
    }

    (0..count).map(|index| batch.collect(index)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_worker_threads_are_named() {
        let pool = WorkerPool::new(2, 2).expect("spawn workers");
        let (tx, rx) = crossbeam_channel::bounded(1);
        pool.try_submit(Box::new(move || {
            let _ = tx.send(thread::current().name().map(str::to_string));
        }))
        .map_err(|_| "queue full")
        .expect("submit");

        let name = rx
            .recv_timeout(Duration::from_secs(1))
            .expect("job ran")
            .expect("named thread");
        assert!(name.starts_with(WORKER_THREAD_PREFIX));
    }

    #[test]
    fn test_full_queue_hands_job_back() {
        let pool = WorkerPool::new(1, 1).expect("spawn workers");
        let gate = Arc::new((Mutex::new(false), Condvar::new()));

        let blocker = Arc::clone(&gate);
        pool.try_submit(Box::new(move || {
            let (lock, cvar) = &*blocker;
            let mut open = lock.lock();
            while !*open {
                cvar.wait_for(&mut open, Duration::from_millis(10));
            }
        }))
        .map_err(|_| "queue full")
        .expect("first job");

        // Worker busy; one more fits in the queue, the rest come back
        let ran = Arc::new(AtomicUsize::new(0));
        let mut rejected = 0;
        for _ in 0..4 {
            let ran = Arc::clone(&ran);
            if pool
                .try_submit(Box::new(move || {
                    ran.fetch_add(1, Ordering::SeqCst);
                }))
                .is_err()
            {
                rejected += 1;
            }
        }
        assert!(rejected >= 2);

        *gate.0.lock() = true;
        gate.1.notify_all();
        pool.shutdown();
        assert_eq!(ran.load(Ordering::SeqCst), 4 - rejected);
    }

    #[test]
    fn test_submit_after_shutdown_is_rejected() {
        let pool = WorkerPool::new(1, 1).expect("spawn workers");
        pool.shutdown();
        assert!(pool.try_submit(Box::new(|| {})).is_err());
    }
}
