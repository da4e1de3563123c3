//! Pipeline benchmarks
//!
//! Измеряет стоимость защитных слоёв: холодный проход, попадание в кеш,
//! параллельный batch и накладные расходы SafeExecutor.

use common::{CacheSettings, MetricsRegistry, PipelineSettings, PoolSettings, RuntimeConfig};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use memory::{BoundedPool, StaticMemoryProbe, TransformCache};
use orchestrator::{transform_fn, RuntimeContext, Transform, TransformationPipeline};
use std::sync::Arc;
use std::time::Duration;

fn transforms() -> Vec<Arc<dyn Transform>> {
    vec![
        transform_fn("xor", |unit| {
            unit.data_mut().iter_mut().for_each(|b| *b ^= 0x5a);
            Ok(true)
        })
        .into_arc(),
        transform_fn("rotate", |unit| {
            unit.data_mut().rotate_left(1);
            Ok(true)
        })
        .with_priority(1)
        .into_arc(),
    ]
}

fn pipeline(parallel: bool) -> TransformationPipeline {
    let metrics = MetricsRegistry::new();
    TransformationPipeline::new(
        &PipelineSettings {
            unit_budget_ms: 1_000,
            transform_budget_ms: 1_000,
            parallel,
            ..PipelineSettings::default()
        },
        Arc::new(TransformCache::new(&CacheSettings::default())),
        BoundedPool::byte_buffers("bench-buffers", &PoolSettings::default()),
        &metrics,
        None,
    )
}

fn bench_single_unit(c: &mut Criterion) {
    let mut group = c.benchmark_group("pipeline_unit");
    let transforms = transforms();

    for size in [256usize, 4 * 1024, 64 * 1024] {
        let input: Vec<u8> = (0..size).map(|i| i as u8).collect();
        group.throughput(Throughput::Bytes(size as u64));

        let cold = pipeline(false);
        group.bench_with_input(BenchmarkId::new("cold", size), &input, |b, input| {
            b.iter(|| {
                cold.cache().clear();
                cold.transform("bench/unit", input, &transforms)
            });
        });

        let warm = pipeline(false);
        warm.transform("bench/unit", &input, &transforms);
        group.bench_with_input(BenchmarkId::new("cached", size), &input, |b, input| {
            b.iter(|| warm.transform("bench/unit", input, &transforms));
        });
    }

    group.finish();
}

fn bench_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("pipeline_batch");
    group.measurement_time(Duration::from_secs(10));
    let transforms = transforms();

    for parallel in [false, true] {
        let pipeline = pipeline(parallel);
        group.throughput(Throughput::Elements(256));
        group.bench_function(BenchmarkId::new("units_256", parallel), |b| {
            b.iter(|| {
                pipeline.cache().clear();
                let units = (0..256)
                    .map(|i| (format!("bench/{i}"), vec![i as u8; 2048]))
                    .collect();
                pipeline.transform_batch(units, &transforms)
            });
        });
    }

    group.finish();
}

fn bench_safe_executor(c: &mut Criterion) {
    let mut group = c.benchmark_group("safe_executor");
    let mut config = RuntimeConfig::testing();
    config.rate_limiter.permits_per_second = 1_000_000_000.0;
    config.rate_limiter.burst = u32::MAX;

    let runtime = RuntimeContext::builder(config)
        .probe(Arc::new(StaticMemoryProbe::new(0.1)))
        .build()
        .expect("runtime");
    runtime.bootstrap().expect("bootstrap");
    let transforms = transforms();
    let input = vec![7u8; 1024];

    group.bench_function("guarded_transform", |b| {
        b.iter(|| runtime.transform("bench/guarded", &input, &transforms));
    });
    group.bench_function("bare_execute", |b| {
        b.iter(|| {
            runtime
                .executor()
                .execute("noop", Duration::from_secs(1), |_| Ok(1u64), |_| 0)
        });
    });

    group.finish();
    runtime.shutdown();
}

criterion_group!(benches, bench_single_unit, bench_batch, bench_safe_executor);
criterion_main!(benches);
