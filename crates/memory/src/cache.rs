use ahash::RandomState;
use common::{CacheSettings, RuntimeError};
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, trace};

use crate::guard::{MemoryGuard, PressureLevel};

// Fixed seeds keep keys stable for the lifetime of the process and across instances
const PRIMARY_SEEDS: [u64; 4] = [
    0x243f_6a88_85a3_08d3,
    0x1319_8a2e_0370_7344,
    0xa409_3822_299f_31d0,
    0x082e_fa98_ec4e_6c89,
];
const SECONDARY_SEEDS: [u64; 4] = [
    0x4528_21e6_38d0_1377,
    0xbe54_66cf_34e9_0c6c,
    0xc0ac_29b7_c97c_50dd,
    0x3f84_d5b5_b547_0917,
];

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CacheError {
    #[error("Cache write refused under {level} memory pressure")]
    RefusedUnderPressure { level: PressureLevel },

    #[error("Entry of {bytes} bytes exceeds cache capacity of {limit} bytes")]
    EntryTooLarge { bytes: u64, limit: u64 },

    #[error("No evictable entries left to fit {bytes} bytes")]
    Full { bytes: u64 },
}

impl From<CacheError> for RuntimeError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::RefusedUnderPressure { level } => RuntimeError::MemoryPressure {
                level: level.to_string(),
            },
            other => RuntimeError::Internal(other.to_string()),
        }
    }
}

/// Запись кеша результатов трансформации
#[derive(Debug, Clone)]
pub struct CacheEntry {
    output: Vec<u8>,
    input_len: usize,
    secondary_hash: u64,
    input_copy: Option<Vec<u8>>,
    unit_id: String,
    transform_count: u32,
    created_at: Instant,
    last_access: Instant,
    access_count: u64,
}

impl CacheEntry {
    fn footprint(&self) -> u64 {
        (self.output.len() + self.input_copy.as_ref().map_or(0, Vec::len) + self.unit_id.len())
            as u64
    }

    pub fn unit_id(&self) -> &str {
        &self.unit_id
    }

    pub fn transform_count(&self) -> u32 {
        self.transform_count
    }

    pub fn access_count(&self) -> u64 {
        self.access_count
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn idle(&self) -> Duration {
        self.last_access.elapsed()
    }
}

/// Результат успешного поиска, владеет копией байтов
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedOutput {
    pub output: Vec<u8>,
    pub unit_id: String,
    pub transform_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheKey {
    pub primary: u64,
    pub secondary: u64,
    pub len: usize,
}

struct Stripe {
    entries: LruCache<u64, CacheEntry>,
    by_unit: HashMap<String, HashSet<u64>>,
    bytes: u64,
}

impl Stripe {
    fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: LruCache::new(capacity),
            by_unit: HashMap::new(),
            bytes: 0,
        }
    }

    fn unindex(&mut self, unit_id: &str, key: u64) {
        if let Some(keys) = self.by_unit.get_mut(unit_id) {
            keys.remove(&key);
            if keys.is_empty() {
                self.by_unit.remove(unit_id);
            }
        }
    }

    /// Bookkeeping for an entry that already left the LRU
    fn forget(&mut self, key: u64, entry: &CacheEntry) -> u64 {
        let bytes = entry.footprint();
        self.bytes = self.bytes.saturating_sub(bytes);
        self.unindex(&entry.unit_id, key);
        bytes
    }

    fn remove(&mut self, key: u64) -> Option<u64> {
        let entry = self.entries.pop(&key)?;
        Some(self.forget(key, &entry))
    }

    fn pop_lru(&mut self) -> Option<u64> {
        let (key, entry) = self.entries.pop_lru()?;
        Some(self.forget(key, &entry))
    }
}

#[derive(Debug, Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    puts: AtomicU64,
    refused: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    collisions: AtomicU64,
    invalidations: AtomicU64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub total_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub puts: u64,
    pub refused: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub collisions: u64,
    pub invalidations: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

/// Content-addressed кеш результатов трансформации.
///
/// Entries are spread over a fixed number of LRU stripes by the primary hash
/// of the input. A hit additionally requires the secondary hash and the input
/// length to match, and the full input when `verify_content` is enabled.
/// Without content verification two different inputs are confused only when
/// both independent 64-bit hashes and the length collide, roughly 2^-128 per
/// pair of inputs.
pub struct TransformCache {
    stripes: Vec<Mutex<Stripe>>,
    primary: RandomState,
    secondary: RandomState,
    max_entries_per_stripe: AtomicU64,
    max_total_bytes: AtomicU64,
    ttl_ms: AtomicU64,
    verify_content: bool,
    total_bytes: AtomicU64,
    /// Next stripe to evict from when the home stripe is empty
    evict_cursor: AtomicUsize,
    guard: Option<Arc<MemoryGuard>>,
    counters: CacheCounters,
}

impl TransformCache {
    pub fn new(settings: &CacheSettings) -> Self {
        let stripe_count = settings.stripes.max(1);
        let capacity = NonZeroUsize::new(settings.max_entries_per_stripe.max(1))
            .unwrap_or(NonZeroUsize::MIN);

        info!(
            stripes = stripe_count,
            entries_per_stripe = capacity.get(),
            max_total_bytes = settings.max_total_bytes,
            ttl_ms = settings.ttl_ms,
            "Transform cache initialized"
        );

        Self {
            stripes: (0..stripe_count)
                .map(|_| Mutex::new(Stripe::new(capacity)))
                .collect(),
            primary: RandomState::with_seeds(
                PRIMARY_SEEDS[0],
                PRIMARY_SEEDS[1],
                PRIMARY_SEEDS[2],
                PRIMARY_SEEDS[3],
            ),
            secondary: RandomState::with_seeds(
                SECONDARY_SEEDS[0],
                SECONDARY_SEEDS[1],
                SECONDARY_SEEDS[2],
                SECONDARY_SEEDS[3],
            ),
            max_entries_per_stripe: AtomicU64::new(capacity.get() as u64),
            max_total_bytes: AtomicU64::new(settings.max_total_bytes as u64),
            ttl_ms: AtomicU64::new(settings.ttl_ms),
            verify_content: settings.verify_content,
            total_bytes: AtomicU64::new(0),
            evict_cursor: AtomicUsize::new(0),
            guard: None,
            counters: CacheCounters::default(),
        }
    }

    /// Refuse writes while the guard reports RED or worse
    pub fn with_guard(mut self, guard: Arc<MemoryGuard>) -> Self {
        self.guard = Some(guard);
        self
    }

    /// Key of `input` under a transform-set fingerprint `salt`
    pub fn key_for(&self, input: &[u8], salt: u64) -> CacheKey {
        CacheKey {
            primary: self.primary.hash_one((salt, input)),
            secondary: self.secondary.hash_one((input, salt)),
            len: input.len(),
        }
    }

    fn stripe_index(&self, primary: u64) -> usize {
        (primary % self.stripes.len() as u64) as usize
    }

    fn ttl(&self) -> Option<Duration> {
        match self.ttl_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn get(&self, input: &[u8]) -> Option<Vec<u8>> {
        self.lookup(input, 0).map(|hit| hit.output)
    }

    pub fn lookup(&self, input: &[u8], salt: u64) -> Option<CachedOutput> {
        let key = self.key_for(input, salt);
        let ttl = self.ttl();
        let mut stripe = self.stripes[self.stripe_index(key.primary)].lock();

        let expired = stripe
            .entries
            .get(&key.primary)
            .map(|entry| ttl.is_some_and(|ttl| entry.created_at.elapsed() > ttl));

        let Some(expired) = expired else {
            drop(stripe);
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        if expired {
            if let Some(bytes) = stripe.remove(key.primary) {
                self.total_bytes.fetch_sub(bytes, Ordering::Relaxed);
            }
            drop(stripe);
            self.counters.expirations.fetch_add(1, Ordering::Relaxed);
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let verify_content = self.verify_content;
        let hit = stripe.entries.get_mut(&key.primary).and_then(|entry| {
            let verified = entry.secondary_hash == key.secondary
                && entry.input_len == key.len
                && (!verify_content
                    || entry.input_copy.as_deref().map_or(true, |copy| copy == input));
            if !verified {
                return None;
            }
            entry.access_count += 1;
            entry.last_access = Instant::now();
            Some(CachedOutput {
                output: entry.output.clone(),
                unit_id: entry.unit_id.clone(),
                transform_count: entry.transform_count,
            })
        });
        drop(stripe);

        match hit {
            Some(hit) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                trace!(unit_id = %hit.unit_id, "Cache hit");
                Some(hit)
            }
            None => {
                self.counters.collisions.fetch_add(1, Ordering::Relaxed);
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                debug!(primary = key.primary, "Cache hash collision treated as miss");
                None
            }
        }
    }

    pub fn put(
        &self,
        input: &[u8],
        output: &[u8],
        unit_id: &str,
        transform_count: u32,
    ) -> Result<(), CacheError> {
        self.put_salted(input, 0, output, unit_id, transform_count)
    }

    pub fn put_salted(
        &self,
        input: &[u8],
        salt: u64,
        output: &[u8],
        unit_id: &str,
        transform_count: u32,
    ) -> Result<(), CacheError> {
        if let Some(guard) = &self.guard {
            let level = guard.check_pressure();
            if level >= PressureLevel::Red {
                self.counters.refused.fetch_add(1, Ordering::Relaxed);
                return Err(CacheError::RefusedUnderPressure { level });
            }
        }

        let key = self.key_for(input, salt);
        let now = Instant::now();
        let entry = CacheEntry {
            output: output.to_vec(),
            input_len: input.len(),
            secondary_hash: key.secondary,
            input_copy: self.verify_content.then(|| input.to_vec()),
            unit_id: unit_id.to_string(),
            transform_count,
            created_at: now,
            last_access: now,
            access_count: 0,
        };
        let size = entry.footprint();
        let limit = self.max_total_bytes.load(Ordering::Relaxed);
        if size > limit {
            self.counters.refused.fetch_add(1, Ordering::Relaxed);
            return Err(CacheError::EntryTooLarge { bytes: size, limit });
        }

        let index = self.stripe_index(key.primary);
        if let Some(bytes) = self.stripes[index].lock().remove(key.primary) {
            self.total_bytes.fetch_sub(bytes, Ordering::Relaxed);
        }

        let mut evicted = 0u64;
        let reserved = self.reserve(size, limit, index, &mut evicted);
        self.counters.evictions.fetch_add(evicted, Ordering::Relaxed);
        if !reserved {
            self.counters.refused.fetch_add(1, Ordering::Relaxed);
            return Err(CacheError::Full { bytes: size });
        }

        let mut stripe = self.stripes[index].lock();
        // A concurrent put of the same key may have landed meanwhile
        if let Some(bytes) = stripe.remove(key.primary) {
            self.total_bytes.fetch_sub(bytes, Ordering::Relaxed);
        }

        stripe
            .by_unit
            .entry(entry.unit_id.clone())
            .or_default()
            .insert(key.primary);
        stripe.bytes += size;

        // Capacity eviction by the LRU itself
        if let Some((old_key, old_entry)) = stripe.entries.push(key.primary, entry) {
            let bytes = stripe.forget(old_key, &old_entry);
            self.total_bytes.fetch_sub(bytes, Ordering::Relaxed);
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
        }
        drop(stripe);

        self.counters.puts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Account `size` bytes against the ceiling, evicting LRU entries first
    /// from the home stripe and then round-robin from the others. The
    /// check and the add are one CAS, so concurrent puts never overshoot.
    fn reserve(&self, size: u64, limit: u64, home: usize, evicted: &mut u64) -> bool {
        loop {
            let current = self.total_bytes.load(Ordering::Acquire);
            if current + size <= limit {
                if self
                    .total_bytes
                    .compare_exchange_weak(current, current + size, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return true;
                }
                continue;
            }

            if let Some(bytes) = self.stripes[home].lock().pop_lru() {
                self.total_bytes.fetch_sub(bytes, Ordering::Relaxed);
                *evicted += 1;
                continue;
            }
            if self.evict_elsewhere(home) {
                *evicted += 1;
            } else if self.total_bytes.load(Ordering::Acquire) == current {
                // Nothing evictable and no concurrent progress
                return false;
            }
        }
    }

    /// Pop one LRU entry from the first non-empty stripe after the cursor
    fn evict_elsewhere(&self, home: usize) -> bool {
        let count = self.stripes.len();
        let start = self.evict_cursor.fetch_add(1, Ordering::Relaxed);
        for offset in 0..count {
            let index = (start + offset) % count;
            if index == home {
                continue;
            }
            if let Some(bytes) = self.stripes[index].lock().pop_lru() {
                self.total_bytes.fetch_sub(bytes, Ordering::Relaxed);
                return true;
            }
        }
        false
    }

    /// Drop every entry produced for `unit_id`
    pub fn invalidate(&self, unit_id: &str) -> usize {
        let mut removed = 0;
        for stripe in &self.stripes {
            let mut stripe = stripe.lock();
            let keys: Vec<u64> = match stripe.by_unit.get(unit_id) {
                Some(keys) => keys.iter().copied().collect(),
                None => continue,
            };
            for key in keys {
                if let Some(bytes) = stripe.remove(key) {
                    self.total_bytes.fetch_sub(bytes, Ordering::Relaxed);
                    removed += 1;
                }
            }
        }

        if removed > 0 {
            self.counters
                .invalidations
                .fetch_add(removed as u64, Ordering::Relaxed);
            debug!(unit_id, removed, "Cache entries invalidated");
        }
        removed
    }

    /// Evict the least recently used `(1 - keep_fraction)` of every stripe
    pub fn compact(&self, keep_fraction: f64) -> usize {
        let keep_fraction = keep_fraction.clamp(0.0, 1.0);
        let mut evicted = 0;

        for stripe in &self.stripes {
            let mut stripe = stripe.lock();
            let keep = (stripe.entries.len() as f64 * keep_fraction).floor() as usize;
            while stripe.entries.len() > keep {
                match stripe.pop_lru() {
                    Some(bytes) => {
                        self.total_bytes.fetch_sub(bytes, Ordering::Relaxed);
                        evicted += 1;
                    }
                    None => break,
                }
            }
        }

        self.counters
            .evictions
            .fetch_add(evicted as u64, Ordering::Relaxed);
        if evicted > 0 {
            info!(keep_fraction, evicted, "Transform cache compacted");
        }
        evicted
    }

    pub fn shrink(&self, keep_fraction: f64) -> usize {
        self.compact(keep_fraction)
    }

    /// Eagerly remove entries older than the TTL
    pub fn purge_expired(&self) -> usize {
        let Some(ttl) = self.ttl() else {
            return 0;
        };
        let mut purged = 0;

        for stripe in &self.stripes {
            let mut stripe = stripe.lock();
            let expired: Vec<u64> = stripe
                .entries
                .iter()
                .filter(|(_, entry)| entry.created_at.elapsed() > ttl)
                .map(|(key, _)| *key)
                .collect();
            for key in expired {
                if let Some(bytes) = stripe.remove(key) {
                    self.total_bytes.fetch_sub(bytes, Ordering::Relaxed);
                    purged += 1;
                }
            }
        }

        self.counters
            .expirations
            .fetch_add(purged as u64, Ordering::Relaxed);
        if purged > 0 {
            debug!(purged, "Expired cache entries purged");
        }
        purged
    }

    pub fn clear(&self) {
        for stripe in &self.stripes {
            let mut stripe = stripe.lock();
            stripe.entries.clear();
            stripe.by_unit.clear();
            self.total_bytes.fetch_sub(stripe.bytes, Ordering::Relaxed);
            stripe.bytes = 0;
        }
        info!("Transform cache cleared");
    }

    /// Apply new limits; stripes shrink by evicting their oldest entries
    pub fn configure(&self, max_entries_per_stripe: usize, max_total_bytes: u64, ttl: Duration) {
        let capacity = NonZeroUsize::new(max_entries_per_stripe.max(1)).unwrap_or(NonZeroUsize::MIN);
        self.max_entries_per_stripe
            .store(capacity.get() as u64, Ordering::Relaxed);
        self.max_total_bytes.store(max_total_bytes, Ordering::Relaxed);
        self.ttl_ms.store(ttl.as_millis() as u64, Ordering::Relaxed);

        let mut evicted = 0u64;
        for stripe in &self.stripes {
            let mut stripe = stripe.lock();
            while stripe.entries.len() > capacity.get() {
                if let Some(bytes) = stripe.pop_lru() {
                    self.total_bytes.fetch_sub(bytes, Ordering::Relaxed);
                    evicted += 1;
                }
            }
            stripe.entries.resize(capacity);
        }

        // Enforce the byte ceiling round-robin from the first stripe
        'outer: while self.total_bytes.load(Ordering::Relaxed) > max_total_bytes {
            let mut progressed = false;
            for stripe in &self.stripes {
                if self.total_bytes.load(Ordering::Relaxed) <= max_total_bytes {
                    break 'outer;
                }
                if let Some(bytes) = stripe.lock().pop_lru() {
                    self.total_bytes.fetch_sub(bytes, Ordering::Relaxed);
                    evicted += 1;
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }

        self.counters.evictions.fetch_add(evicted, Ordering::Relaxed);
        info!(
            max_entries_per_stripe = capacity.get(),
            max_total_bytes,
            ttl_ms = ttl.as_millis() as u64,
            evicted,
            "Transform cache reconfigured"
        );
    }

    pub fn len(&self) -> usize {
        self.stripes.iter().map(|s| s.lock().entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }

    pub fn stripe_count(&self) -> usize {
        self.stripes.len()
    }

    pub fn max_entries_per_stripe(&self) -> usize {
        self.max_entries_per_stripe.load(Ordering::Relaxed) as usize
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            total_bytes: self.total_bytes(),
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            puts: self.counters.puts.load(Ordering::Relaxed),
            refused: self.counters.refused.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
            collisions: self.counters.collisions.load(Ordering::Relaxed),
            invalidations: self.counters.invalidations.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::StaticMemoryProbe;
    use common::MemorySettings;
    use proptest::prelude::*;

    fn small_settings() -> CacheSettings {
        CacheSettings {
            stripes: 4,
            max_entries_per_stripe: 8,
            max_total_bytes: 1024 * 1024,
            ttl_ms: 60_000,
            verify_content: true,
        }
    }

    #[test]
    fn test_put_then_get_returns_copy() {
        let cache = TransformCache::new(&small_settings());
        cache.put(b"input", b"output", "a/B", 2).unwrap();

        let mut first = cache.get(b"input").unwrap();
        first[0] = b'X';
        assert_eq!(cache.get(b"input").unwrap(), b"output".to_vec());

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.puts, 1);
    }

    #[test]
    fn test_miss_on_unknown_input() {
        let cache = TransformCache::new(&small_settings());
        assert!(cache.get(b"nothing").is_none());
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_salt_separates_transform_sets() {
        let cache = TransformCache::new(&small_settings());
        cache.put_salted(b"in", 1, b"one", "u", 1).unwrap();
        cache.put_salted(b"in", 2, b"two", "u", 1).unwrap();

        assert_eq!(cache.lookup(b"in", 1).unwrap().output, b"one".to_vec());
        assert_eq!(cache.lookup(b"in", 2).unwrap().output, b"two".to_vec());
        assert!(cache.lookup(b"in", 3).is_none());
    }

    #[test]
    fn test_invalidate_by_unit() {
        let cache = TransformCache::new(&small_settings());
        cache.put(b"a", b"1", "unit/A", 1).unwrap();
        cache.put_salted(b"a", 7, b"2", "unit/A", 1).unwrap();
        cache.put(b"b", b"3", "unit/B", 1).unwrap();

        assert_eq!(cache.invalidate("unit/A"), 2);
        assert!(cache.get(b"a").is_none());
        assert!(cache.get(b"b").is_some());
        assert_eq!(cache.invalidate("unit/A"), 0);
    }

    #[test]
    fn test_lru_capacity_per_stripe() {
        let cache = TransformCache::new(&CacheSettings {
            stripes: 1,
            max_entries_per_stripe: 2,
            ..small_settings()
        });
        cache.put(b"1", b"a", "u1", 1).unwrap();
        cache.put(b"2", b"b", "u2", 1).unwrap();
        cache.get(b"1");
        cache.put(b"3", b"c", "u3", 1).unwrap();

        assert!(cache.get(b"1").is_some());
        assert!(cache.get(b"2").is_none());
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_byte_ceiling_evicts_then_refuses_oversized() {
        let cache = TransformCache::new(&CacheSettings {
            stripes: 1,
            max_entries_per_stripe: 100,
            max_total_bytes: 64,
            ttl_ms: 60_000,
            verify_content: false,
        });
        cache.put(b"1", &[0u8; 40], "u", 1).unwrap();
        cache.put(b"2", &[0u8; 40], "u", 1).unwrap();
        assert_eq!(cache.len(), 1);
        assert!(cache.total_bytes() <= 64);

        let err = cache.put(b"3", &[0u8; 100], "u", 1).unwrap_err();
        assert!(matches!(err, CacheError::EntryTooLarge { .. }));
    }

    #[test]
    fn test_put_into_empty_stripe_evicts_from_others() {
        let cache = TransformCache::new(&CacheSettings {
            stripes: 4,
            max_entries_per_stripe: 100,
            max_total_bytes: 64,
            ttl_ms: 60_000,
            verify_content: false,
        });
        let stripe_of = |input: &[u8]| cache.stripe_index(cache.key_for(input, 0).primary);

        let first = b"first".to_vec();
        let other = (0u32..)
            .map(|i| format!("other-{i}").into_bytes())
            .find(|candidate| stripe_of(candidate) != stripe_of(&first))
            .unwrap();

        cache.put(&first, &[1u8; 40], "a", 1).unwrap();
        cache.put(&other, &[2u8; 40], "b", 1).unwrap();

        assert!(cache.get(&first).is_none());
        assert_eq!(cache.get(&other).unwrap(), vec![2u8; 40]);
        assert_eq!(cache.total_bytes(), 41);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_concurrent_puts_respect_byte_ceiling() {
        let cache = Arc::new(TransformCache::new(&CacheSettings {
            stripes: 8,
            max_entries_per_stripe: 1000,
            max_total_bytes: 4096,
            ttl_ms: 60_000,
            verify_content: false,
        }));

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for i in 0..200 {
                        let input = format!("{t}-{i}");
                        cache.put(input.as_bytes(), &[0u8; 100], "u", 1).unwrap();
                        assert!(cache.total_bytes() <= 4096);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(cache.total_bytes() <= 4096);
        assert_eq!(cache.total_bytes(), cache.len() as u64 * 101);
    }

    #[test]
    fn test_compact_keeps_fraction() {
        let cache = TransformCache::new(&CacheSettings {
            stripes: 1,
            max_entries_per_stripe: 100,
            ..small_settings()
        });
        for i in 0..10u8 {
            cache.put(&[i], &[i], "u", 1).unwrap();
        }
        assert_eq!(cache.compact(0.5), 5);
        assert_eq!(cache.len(), 5);
        assert!(cache.get(&[9]).is_some());
        assert!(cache.get(&[0]).is_none());
    }

    #[test]
    fn test_ttl_expiry() {
        let cache = TransformCache::new(&CacheSettings {
            ttl_ms: 1,
            ..small_settings()
        });
        cache.put(b"x", b"y", "u", 1).unwrap();
        std::thread::sleep(Duration::from_millis(10));

        assert!(cache.get(b"x").is_none());
        assert_eq!(cache.stats().expirations, 1);
        assert_eq!(cache.total_bytes(), 0);
    }

    #[test]
    fn test_purge_expired() {
        let cache = TransformCache::new(&CacheSettings {
            ttl_ms: 1,
            ..small_settings()
        });
        cache.put(b"x", b"y", "u", 1).unwrap();
        cache.put(b"z", b"w", "u", 1).unwrap();
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(cache.purge_expired(), 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_put_refused_under_red_pressure() {
        let probe = Arc::new(StaticMemoryProbe::new(0.9));
        let guard = Arc::new(MemoryGuard::new(
            probe.clone(),
            &MemorySettings {
                check_interval_ms: 0,
                ..MemorySettings::default()
            },
        ));
        let cache = TransformCache::new(&small_settings()).with_guard(guard);

        let err = cache.put(b"a", b"b", "u", 1).unwrap_err();
        assert_eq!(
            err,
            CacheError::RefusedUnderPressure {
                level: PressureLevel::Red
            }
        );

        probe.set_ratio(0.1);
        assert!(cache.put(b"a", b"b", "u", 1).is_ok());
    }

    #[test]
    fn test_configure_shrinks_stripes() {
        let cache = TransformCache::new(&CacheSettings {
            stripes: 1,
            max_entries_per_stripe: 10,
            ..small_settings()
        });
        for i in 0..10u8 {
            cache.put(&[i], &[i], "u", 1).unwrap();
        }
        cache.configure(3, 1024, Duration::from_secs(60));
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.max_entries_per_stripe(), 3);
    }

    #[test]
    fn test_clear_resets_bytes() {
        let cache = TransformCache::new(&small_settings());
        cache.put(b"a", b"bbbb", "u", 1).unwrap();
        cache.clear();
        assert_eq!(cache.total_bytes(), 0);
        assert!(cache.is_empty());
    }

    proptest! {
        #[test]
        fn prop_key_is_deterministic(input in proptest::collection::vec(any::<u8>(), 0..256), salt in any::<u64>()) {
            let a = TransformCache::new(&small_settings());
            let b = TransformCache::new(&small_settings());
            prop_assert_eq!(a.key_for(&input, salt), b.key_for(&input, salt));
        }
    }
}
