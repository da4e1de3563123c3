use common::{PoolSettings, RuntimeError};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::ops::{Deref, DerefMut};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("Pool '{pool}' is at capacity {capacity}, object discarded")]
    AtCapacity { pool: String, capacity: usize },

    #[error("Pool '{pool}' discarded object of {bytes} bytes (limit {limit})")]
    Oversized {
        pool: String,
        bytes: usize,
        limit: usize,
    },

    #[error("Pool '{pool}' failed to reset object: {reason}")]
    ResetFailed { pool: String, reason: String },
}

impl From<PoolError> for RuntimeError {
    fn from(err: PoolError) -> Self {
        RuntimeError::Internal(err.to_string())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolStats {
    pub name: String,
    pub capacity: usize,
    pub idle: usize,
    pub created: u64,
    pub borrowed: u64,
    pub reused: u64,
    pub returned: u64,
    pub discarded: u64,
    pub reset_failures: u64,
    pub drained: u64,
}

impl PoolStats {
    pub fn reuse_rate(&self) -> f64 {
        if self.borrowed == 0 {
            0.0
        } else {
            self.reused as f64 / self.borrowed as f64
        }
    }
}

#[derive(Debug, Default)]
struct PoolCounters {
    created: AtomicU64,
    borrowed: AtomicU64,
    reused: AtomicU64,
    returned: AtomicU64,
    discarded: AtomicU64,
    reset_failures: AtomicU64,
    drained: AtomicU64,
}

type CreateFn<T> = Box<dyn Fn() -> T + Send + Sync>;
type ResetFn<T> = Box<dyn Fn(&mut T) -> anyhow::Result<()> + Send + Sync>;
type SizeFn<T> = Box<dyn Fn(&T) -> usize + Send + Sync>;

struct PoolShared<T> {
    name: String,
    capacity: usize,
    idle_tx: Sender<T>,
    idle_rx: Receiver<T>,
    create: CreateFn<T>,
    reset: Option<ResetFn<T>>,
    size_limit: Option<(usize, SizeFn<T>)>,
    counters: PoolCounters,
}

/// Ограниченный пул переиспользуемых объектов.
///
/// Idle objects live in a bounded lock-free queue, so the idle count never
/// exceeds the capacity and neither `borrow` nor `return_object` blocks.
pub struct BoundedPool<T: Send + 'static> {
    shared: Arc<PoolShared<T>>,
}

impl<T: Send + 'static> Clone for BoundedPool<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

pub struct BoundedPoolBuilder<T> {
    name: String,
    capacity: usize,
    create: CreateFn<T>,
    reset: Option<ResetFn<T>>,
    size_limit: Option<(usize, SizeFn<T>)>,
}

impl<T: Send + 'static> BoundedPoolBuilder<T> {
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Reset to the canonical empty state before an object re-enters the pool
    pub fn reset<F>(mut self, reset: F) -> Self
    where
        F: Fn(&mut T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.reset = Some(Box::new(reset));
        self
    }

    /// Discard returned objects whose measured size exceeds `max_bytes`
    pub fn max_object_size<F>(mut self, max_bytes: usize, size_of: F) -> Self
    where
        F: Fn(&T) -> usize + Send + Sync + 'static,
    {
        self.size_limit = Some((max_bytes, Box::new(size_of)));
        self
    }

    pub fn build(self) -> BoundedPool<T> {
        let (idle_tx, idle_rx) = bounded(self.capacity);
        debug!(pool = %self.name, capacity = self.capacity, "Object pool created");
        BoundedPool {
            shared: Arc::new(PoolShared {
                name: self.name,
                capacity: self.capacity,
                idle_tx,
                idle_rx,
                create: self.create,
                reset: self.reset,
                size_limit: self.size_limit,
                counters: PoolCounters::default(),
            }),
        }
    }
}

impl<T: Send + 'static> BoundedPool<T> {
    pub fn builder<F>(name: impl Into<String>, create: F) -> BoundedPoolBuilder<T>
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        BoundedPoolBuilder {
            name: name.into(),
            capacity: PoolSettings::default().max_idle,
            create: Box::new(create),
            reset: None,
            size_limit: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn idle_count(&self) -> usize {
        self.shared.idle_rx.len()
    }

    /// Pre-create up to `count` idle objects, bounded by capacity
    pub fn warm_up(&self, count: usize) -> usize {
        let mut added = 0;
        for _ in 0..count {
            let object = (self.shared.create)();
            self.shared.counters.created.fetch_add(1, Ordering::Relaxed);
            if self.shared.idle_tx.try_send(object).is_err() {
                break;
            }
            added += 1;
        }
        debug!(pool = %self.shared.name, added, "Pool warmed up");
        added
    }

    /// Take an idle object or create a new one when the pool is empty
    pub fn borrow(&self) -> Pooled<T> {
        let counters = &self.shared.counters;
        counters.borrowed.fetch_add(1, Ordering::Relaxed);

        let object = match self.shared.idle_rx.try_recv() {
            Ok(object) => {
                counters.reused.fetch_add(1, Ordering::Relaxed);
                object
            }
            Err(_) => {
                counters.created.fetch_add(1, Ordering::Relaxed);
                (self.shared.create)()
            }
        };

        Pooled {
            value: Some(object),
            pool: self.clone(),
        }
    }

    /// Reset and re-pool `object`; the error explains why it was discarded instead
    pub fn return_object(&self, mut object: T) -> Result<(), PoolError> {
        let shared = &self.shared;

        if let Some((limit, size_of)) = &shared.size_limit {
            let bytes = size_of(&object);
            if bytes > *limit {
                shared.counters.discarded.fetch_add(1, Ordering::Relaxed);
                return Err(PoolError::Oversized {
                    pool: shared.name.clone(),
                    bytes,
                    limit: *limit,
                });
            }
        }

        if let Some(reset) = &shared.reset {
            let outcome = catch_unwind(AssertUnwindSafe(|| reset(&mut object)));
            let failure = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(_) => Some("reset panicked".to_string()),
            };
            if let Some(reason) = failure {
                shared.counters.reset_failures.fetch_add(1, Ordering::Relaxed);
                shared.counters.discarded.fetch_add(1, Ordering::Relaxed);
                warn!(pool = %shared.name, %reason, "Discarding pooled object after failed reset");
                return Err(PoolError::ResetFailed {
                    pool: shared.name.clone(),
                    reason,
                });
            }
        }

        match shared.idle_tx.try_send(object) {
            Ok(()) => {
                shared.counters.returned.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                shared.counters.discarded.fetch_add(1, Ordering::Relaxed);
                Err(PoolError::AtCapacity {
                    pool: shared.name.clone(),
                    capacity: shared.capacity,
                })
            }
        }
    }

    /// Release every idle object
    pub fn drain(&self) -> usize {
        let drained = self.shared.idle_rx.try_iter().count();
        self.shared
            .counters
            .drained
            .fetch_add(drained as u64, Ordering::Relaxed);
        if drained > 0 {
            info!(pool = %self.shared.name, drained, "Object pool drained");
        }
        drained
    }

    pub fn stats(&self) -> PoolStats {
        let c = &self.shared.counters;
        PoolStats {
            name: self.shared.name.clone(),
            capacity: self.shared.capacity,
            idle: self.idle_count(),
            created: c.created.load(Ordering::Relaxed),
            borrowed: c.borrowed.load(Ordering::Relaxed),
            reused: c.reused.load(Ordering::Relaxed),
            returned: c.returned.load(Ordering::Relaxed),
            discarded: c.discarded.load(Ordering::Relaxed),
            reset_failures: c.reset_failures.load(Ordering::Relaxed),
            drained: c.drained.load(Ordering::Relaxed),
        }
    }
}

impl BoundedPool<Vec<u8>> {
    /// Byte buffer pool configured from settings
    pub fn byte_buffers(name: impl Into<String>, settings: &PoolSettings) -> Self {
        BoundedPool::builder(name, Vec::new)
            .capacity(settings.max_idle)
            .reset(|buf: &mut Vec<u8>| {
                buf.clear();
                Ok(())
            })
            .max_object_size(settings.max_object_bytes, |buf: &Vec<u8>| buf.capacity())
            .build()
    }
}

/// Объект, взятый из пула. Возвращается в пул при drop.
pub struct Pooled<T: Send + 'static> {
    value: Option<T>,
    pool: BoundedPool<T>,
}

impl<T: Send + 'static> Pooled<T> {
    /// Keep the object; it will not go back to the pool
    pub fn detach(mut self) -> T {
        match self.value.take() {
            Some(value) => value,
            None => unreachable!("pooled value is present until drop or detach"),
        }
    }
}

impl<T: Send + 'static> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.value {
            Some(value) => value,
            None => unreachable!("pooled value is present until drop or detach"),
        }
    }
}

impl<T: Send + 'static> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.value {
            Some(value) => value,
            None => unreachable!("pooled value is present until drop or detach"),
        }
    }
}

impl<T: Send + 'static> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            // Discards are counted in the pool stats
            let _ = self.pool.return_object(value);
        }
    }
}

/// Пул, который можно освободить при давлении на память
pub trait DrainablePool: Send + Sync {
    fn name(&self) -> &str;
    fn drain(&self) -> usize;
    fn stats(&self) -> PoolStats;
}

impl<T: Send + 'static> DrainablePool for BoundedPool<T> {
    fn name(&self) -> &str {
        BoundedPool::name(self)
    }

    fn drain(&self) -> usize {
        BoundedPool::drain(self)
    }

    fn stats(&self) -> PoolStats {
        BoundedPool::stats(self)
    }
}

/// Набор пулов процесса
#[derive(Default)]
pub struct PoolRegistry {
    pools: RwLock<Vec<Arc<dyn DrainablePool>>>,
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, pool: Arc<dyn DrainablePool>) {
        debug!(pool = pool.name(), "Pool registered");
        self.pools.write().push(pool);
    }

    pub fn drain_all(&self) -> usize {
        let pools = self.pools.read().clone();
        pools.iter().map(|pool| pool.drain()).sum()
    }

    pub fn stats(&self) -> Vec<PoolStats> {
        self.pools.read().iter().map(|pool| pool.stats()).collect()
    }

    pub fn len(&self) -> usize {
        self.pools.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
