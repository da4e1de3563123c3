//! Metrics primitives shared by every runtime component
//!
//! Counters, gauges and histograms are lock-free atomics; the registry only
//! takes a shard lock from `DashMap` when a metric is first created.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Monotonic counter
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.add(1);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    fn reset(&self) {
        self.value.store(0, Ordering::Relaxed);
    }
}

/// Point-in-time value that may go up and down
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicI64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Upper bounds of histogram buckets in microseconds; the last bucket is unbounded.
const BUCKET_BOUNDS_US: [u64; 17] = [
    50, 100, 250, 500, 1_000, 2_500, 5_000, 10_000, 25_000, 50_000, 100_000, 250_000, 500_000,
    1_000_000, 2_500_000, 5_000_000, 10_000_000,
];

/// Latency histogram with fixed exponential buckets
#[derive(Debug)]
pub struct Histogram {
    buckets: [AtomicU64; BUCKET_BOUNDS_US.len() + 1],
    count: AtomicU64,
    sum_us: AtomicU64,
    min_us: AtomicU64,
    max_us: AtomicU64,
}

impl Default for Histogram {
    fn default() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            count: AtomicU64::new(0),
            sum_us: AtomicU64::new(0),
            min_us: AtomicU64::new(u64::MAX),
            max_us: AtomicU64::new(0),
        }
    }
}

impl Histogram {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, duration: Duration) {
        let us = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        let index = BUCKET_BOUNDS_US
            .iter()
            .position(|bound| us <= *bound)
            .unwrap_or(BUCKET_BOUNDS_US.len());

        self.buckets[index].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_us.fetch_add(us, Ordering::Relaxed);
        self.min_us.fetch_min(us, Ordering::Relaxed);
        self.max_us.fetch_max(us, Ordering::Relaxed);
    }

    pub fn record_ms(&self, ms: f64) {
        self.record(Duration::from_secs_f64(ms.max(0.0) / 1000.0));
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn mean_ms(&self) -> f64 {
        let count = self.count();
        if count == 0 {
            0.0
        } else {
            self.sum_us.load(Ordering::Relaxed) as f64 / count as f64 / 1000.0
        }
    }

    /// Approximate percentile: the upper bound of the bucket holding the q-th sample
    pub fn percentile_ms(&self, q: f64) -> f64 {
        let count = self.count();
        if count == 0 {
            return 0.0;
        }
        let target = ((q.clamp(0.0, 1.0) * count as f64).ceil() as u64).max(1);
        let mut seen = 0;
        for (index, bucket) in self.buckets.iter().enumerate() {
            seen += bucket.load(Ordering::Relaxed);
            if seen >= target {
                let bound_us = BUCKET_BOUNDS_US
                    .get(index)
                    .copied()
                    .unwrap_or_else(|| self.max_us.load(Ordering::Relaxed));
                return bound_us as f64 / 1000.0;
            }
        }
        self.max_us.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn snapshot(&self) -> HistogramSnapshot {
        let count = self.count();
        HistogramSnapshot {
            count,
            mean_ms: self.mean_ms(),
            min_ms: if count == 0 {
                0.0
            } else {
                self.min_us.load(Ordering::Relaxed) as f64 / 1000.0
            },
            max_ms: self.max_us.load(Ordering::Relaxed) as f64 / 1000.0,
            p50_ms: self.percentile_ms(0.50),
            p90_ms: self.percentile_ms(0.90),
            p99_ms: self.percentile_ms(0.99),
        }
    }

    fn reset(&self) {
        for bucket in &self.buckets {
            bucket.store(0, Ordering::Relaxed);
        }
        self.count.store(0, Ordering::Relaxed);
        self.sum_us.store(0, Ordering::Relaxed);
        self.min_us.store(u64::MAX, Ordering::Relaxed);
        self.max_us.store(0, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistogramSnapshot {
    pub count: u64,
    pub mean_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub p50_ms: f64,
    pub p90_ms: f64,
    pub p99_ms: f64,
}

/// RAII timer: records elapsed time into its histogram when stopped or dropped
pub struct Timer {
    histogram: Arc<Histogram>,
    start: Instant,
    recorded: bool,
}

impl Timer {
    pub fn start(histogram: Arc<Histogram>) -> Self {
        Self {
            histogram,
            start: Instant::now(),
            recorded: false,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn stop(mut self) -> Duration {
        let elapsed = self.start.elapsed();
        self.histogram.record(elapsed);
        self.recorded = true;
        elapsed
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if !self.recorded {
            self.histogram.record(self.start.elapsed());
        }
    }
}

/// Serializable view of every registered metric
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, u64>,
    pub gauges: BTreeMap<String, i64>,
    pub histograms: BTreeMap<String, HistogramSnapshot>,
    pub uptime_seconds: u64,
}

/// Named metric registry owned by the runtime context
pub struct MetricsRegistry {
    counters: DashMap<String, Arc<Counter>>,
    gauges: DashMap<String, Arc<Gauge>>,
    histograms: DashMap<String, Arc<Histogram>>,
    start_time: Instant,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            counters: DashMap::new(),
            gauges: DashMap::new(),
            histograms: DashMap::new(),
            start_time: Instant::now(),
        }
    }

    pub fn counter(&self, name: &str) -> Arc<Counter> {
        if let Some(existing) = self.counters.get(name) {
            return Arc::clone(existing.value());
        }
        Arc::clone(self.counters.entry(name.to_string()).or_default().value())
    }

    pub fn gauge(&self, name: &str) -> Arc<Gauge> {
        if let Some(existing) = self.gauges.get(name) {
            return Arc::clone(existing.value());
        }
        Arc::clone(self.gauges.entry(name.to_string()).or_default().value())
    }

    pub fn histogram(&self, name: &str) -> Arc<Histogram> {
        if let Some(existing) = self.histograms.get(name) {
            return Arc::clone(existing.value());
        }
        Arc::clone(self.histograms.entry(name.to_string()).or_default().value())
    }

    pub fn timer(&self, name: &str) -> Timer {
        Timer::start(self.histogram(name))
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: self
                .counters
                .iter()
                .map(|e| (e.key().clone(), e.value().get()))
                .collect(),
            gauges: self
                .gauges
                .iter()
                .map(|e| (e.key().clone(), e.value().get()))
                .collect(),
            histograms: self
                .histograms
                .iter()
                .map(|e| (e.key().clone(), e.value().snapshot()))
                .collect(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Zero counters and histograms; gauges keep their current value
    pub fn reset(&self) {
        self.counters.iter().for_each(|e| e.value().reset());
        self.histograms.iter().for_each(|e| e.value().reset());
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_counter_and_gauge() {
        let registry = MetricsRegistry::new();
        registry.counter("units").inc();
        registry.counter("units").add(4);
        registry.gauge("active").set(3);
        registry.gauge("active").dec();

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.counters["units"], 5);
        assert_eq!(snapshot.gauges["active"], 2);
    }

    #[test]
    fn test_histogram_percentiles() {
        let histogram = Histogram::new();
        for _ in 0..90 {
            histogram.record(Duration::from_micros(800));
        }
        for _ in 0..10 {
            histogram.record(Duration::from_millis(40));
        }

        assert_eq!(histogram.count(), 100);
        assert!((histogram.percentile_ms(0.5) - 1.0).abs() < f64::EPSILON);
        assert!((histogram.percentile_ms(0.99) - 50.0).abs() < f64::EPSILON);

        let snapshot = histogram.snapshot();
        assert!((snapshot.min_ms - 0.8).abs() < 1e-9);
        assert!((snapshot.max_ms - 40.0).abs() < 1e-9);
    }

    #[test]
    fn test_timer_records_on_drop() {
        let registry = MetricsRegistry::new();
        {
            let _timer = registry.timer("transform");
        }
        let elapsed = registry.timer("transform").stop();
        assert!(elapsed < Duration::from_secs(1));
        assert_eq!(registry.histogram("transform").count(), 2);
    }

    #[test]
    fn test_reset_keeps_gauges() {
        let registry = MetricsRegistry::new();
        registry.counter("c").add(10);
        registry.gauge("g").set(7);
        registry.histogram("h").record_ms(3.0);

        registry.reset();

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.counters["c"], 0);
        assert_eq!(snapshot.gauges["g"], 7);
        assert_eq!(snapshot.histograms["h"].count, 0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let registry = MetricsRegistry::new();
        registry.counter("cache.hits").inc();
        let json = serde_json::to_string(&registry.snapshot()).expect("serialize");
        assert!(json.contains("cache.hits"));
    }

    proptest! {
        #[test]
        fn prop_percentiles_are_monotonic(samples in proptest::collection::vec(0u64..20_000_000, 1..200)) {
            let histogram = Histogram::new();
            for us in &samples {
                histogram.record(Duration::from_micros(*us));
            }
            let p50 = histogram.percentile_ms(0.5);
            let p90 = histogram.percentile_ms(0.9);
            let p99 = histogram.percentile_ms(0.99);
            prop_assert!(p50 <= p90);
            prop_assert!(p90 <= p99);
            prop_assert_eq!(histogram.count(), samples.len() as u64);
        }
    }
}
