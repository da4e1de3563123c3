//! Pipeline Integration Tests
//!
//! Budgets, caching, failure isolation and parallel batches through the
//! public `TransformationPipeline` API.

use common::test_utils::init_test_tracing;
use common::{CacheSettings, MetricsRegistry, PipelineSettings, PoolSettings};
use memory::{BoundedPool, TransformCache};
use orchestrator::{
    transform_fn, FnTransform, ResultStatus, SkipReason, TransformError, TransformSkip,
    TransformationPipeline,
};
use proptest::prelude::*;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn pipeline(settings: PipelineSettings) -> TransformationPipeline {
    let metrics = MetricsRegistry::new();
    TransformationPipeline::new(
        &settings,
        Arc::new(TransformCache::new(&CacheSettings::default())),
        BoundedPool::byte_buffers("pipeline-buffers", &PoolSettings::default()),
        &metrics,
        None,
    )
}

fn sequential() -> TransformationPipeline {
    pipeline(PipelineSettings {
        unit_budget_ms: 1_000,
        transform_budget_ms: 500,
        parallel: false,
        ..PipelineSettings::default()
    })
}

fn xor(id: &str, mask: u8) -> FnTransform {
    transform_fn(id, move |unit| {
        unit.data_mut().iter_mut().for_each(|b| *b ^= mask);
        Ok(true)
    })
}

#[test]
fn test_critical_failure_stops_unit() {
    let pipeline = sequential();
    let transforms = vec![
        xor("first", 0x01).into_arc(),
        transform_fn("fatal", |_| Err(TransformError::failed("corrupt input")))
            .with_priority(1)
            .critical()
            .into_arc(),
        xor("never", 0x02).with_priority(2).into_arc(),
    ];

    let result = pipeline.transform("game/A", b"abc", &transforms);
    assert_eq!(result.status(), ResultStatus::Failed);
    assert_eq!(result.transforms_applied, 1);
    assert_eq!(result.applied, vec!["first".to_string()]);
    assert!(result.output.is_none());
    assert!(result.error.is_some());
}

#[test]
fn test_non_critical_failure_is_isolated() {
    let pipeline = sequential();
    let ran_after = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&ran_after);

    let transforms = vec![
        transform_fn("flaky", |_| Err(TransformError::failed("transient"))).into_arc(),
        transform_fn("after", move |unit| {
            counter.fetch_add(1, Ordering::SeqCst);
            unit.data_mut().push(b'!');
            Ok(true)
        })
        .with_priority(1)
        .into_arc(),
    ];

    let result = pipeline.transform("game/B", b"ok", &transforms);
    assert_eq!(result.status(), ResultStatus::Completed);
    assert_eq!(result.output.as_deref(), Some(&b"ok!"[..]));
    assert_eq!(ran_after.load(Ordering::SeqCst), 1);
    assert_eq!(result.failed_transforms().count(), 1);
}

#[test]
fn test_invalidate_forces_recompute() {
    let pipeline = sequential();
    let transforms = vec![xor("mask", 0x20).into_arc()];

    let first = pipeline.transform("game/C", b"Hello", &transforms);
    assert!(!first.from_cache);
    assert!(pipeline.transform("game/C", b"Hello", &transforms).from_cache);

    assert_eq!(pipeline.cache().invalidate("game/C"), 1);
    let third = pipeline.transform("game/C", b"Hello", &transforms);
    assert!(!third.from_cache);
    assert_eq!(third.output, first.output);
}

#[test]
fn test_different_transform_sets_do_not_share_cache() {
    let pipeline = sequential();
    let a = pipeline.transform("game/D", b"data", &[xor("a", 0x01).into_arc()]);
    let b = pipeline.transform("game/D", b"data", &[xor("b", 0x02).into_arc()]);
    assert!(!b.from_cache);
    assert_ne!(a.output, b.output);
}

/// 1000 юнитов, бюджет 5 мс, один юнит спит 50 мс
#[test]
fn test_parallel_batch_with_one_slow_unit() {
    init_test_tracing();
    let pipeline = pipeline(PipelineSettings {
        unit_budget_ms: 5,
        transform_budget_ms: 5,
        parallel: true,
        max_parallelism: 4,
        ..PipelineSettings::default()
    });

    let slow_id = "unit/500";
    let transforms = vec![
        transform_fn("stall", |unit| {
            thread::sleep(Duration::from_millis(50));
            unit.check_cancelled()?;
            Ok(false)
        })
        .only_for(move |id| id == slow_id)
        .into_arc(),
        xor("mask", 0x55).with_priority(1).into_arc(),
    ];

    let units: Vec<(String, Vec<u8>)> = (0..1000)
        .map(|i| (format!("unit/{i}"), format!("payload-{i}").into_bytes()))
        .collect();

    let results = pipeline.transform_batch(units, &transforms);
    assert_eq!(results.len(), 1000);

    for (i, result) in results.iter().enumerate() {
        let expected_id = format!("unit/{i}");
        assert_eq!(result.unit_id, expected_id);
        if result.unit_id == slow_id {
            let truncated = result.budget_exceeded;
            let timed_out = result.skip_reason == Some(SkipReason::Timeout)
                || result.skip_reason == Some(SkipReason::Cancelled);
            assert!(truncated || timed_out, "slow unit: {result:?}");
            if truncated {
                assert!(result
                    .skipped_transforms
                    .iter()
                    .any(|s| s.id == "mask" && s.reason == TransformSkip::BudgetExhausted));
            }
        } else {
            assert_eq!(result.status(), ResultStatus::Completed, "unit {i}");
            assert!(!result.budget_exceeded, "unit {i}");
            let expected: Vec<u8> = format!("payload-{i}").bytes().map(|b| b ^ 0x55).collect();
            assert_eq!(result.output.as_deref(), Some(expected.as_slice()));
        }
    }
}

#[test]
fn test_cancel_queued_skips_pending_units() {
    let pipeline = pipeline(PipelineSettings {
        unit_budget_ms: 1_000,
        transform_budget_ms: 1_000,
        parallel: false,
        ..PipelineSettings::default()
    });
    pipeline.cancel_queued();

    // A fresh generation: new work still runs
    let result = pipeline.transform("game/E", b"x", &[xor("mask", 0x01).into_arc()]);
    assert_eq!(result.status(), ResultStatus::Completed);
}

proptest! {
    #[test]
    fn prop_empty_transform_list_echoes_input(
        id in "[a-z]{1,8}/[A-Za-z0-9]{1,12}",
        bytes in proptest::collection::vec(any::<u8>(), 0..512),
    ) {
        let result = sequential().transform(&id, &bytes, &[]);
        prop_assert!(result.skipped);
        prop_assert_eq!(result.output.as_deref(), Some(bytes.as_slice()));
    }

    #[test]
    fn prop_second_call_is_cached_and_identical(
        bytes in proptest::collection::vec(any::<u8>(), 1..512),
        mask in any::<u8>(),
    ) {
        let pipeline = sequential();
        let transforms = vec![xor("mask", mask).into_arc()];
        let first = pipeline.transform("game/P", &bytes, &transforms);
        let second = pipeline.transform("game/P", &bytes, &transforms);
        prop_assert!(!first.from_cache);
        prop_assert!(second.from_cache);
        prop_assert_eq!(first.output, second.output);
    }
}
