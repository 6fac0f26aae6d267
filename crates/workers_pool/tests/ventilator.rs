//! Ventilation tests: flow control, iteration, shuffling, and lifecycle.
//!
//! Tests cover:
//! - Backpressure (in-flight items never exceed the configured bound)
//! - Iteration counting (finite passes, unbounded feeding, empty sequences)
//! - Per-pass shuffling (permutation of, but not equal to, the input order)
//! - Stop semantics (no submission after stop returns)
//! - Builder validation

mod common;
use common::{drain_pool, sorted_ints, IdentityWorker, SleepyWorker};

use anyhow::Result;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use workers_pool::{
    ConcurrentVentilator, Pool, PoolError, SyncPool, ThreadPool, Value, Ventilator, WorkItem,
};

fn identity_items(n: i64) -> Vec<WorkItem> {
    (0..n).map(|i| WorkItem::from_single("value", i)).collect()
}

// ============================================================================
// 1. Backpressure
// ============================================================================

#[test]
fn test_in_flight_items_never_exceed_the_ventilation_bound() -> Result<()> {
    // Nobody drains the pool, so no item is ever reported processed: the
    // ventilator must stall at exactly the bound.
    let pool = ThreadPool::with_results_capacity(2, 200)?;
    let feeder = pool.clone();
    let ventilator = ConcurrentVentilator::builder(
        move |item| feeder.ventilate(item),
        identity_items(100),
    )
    .max_ventilation_queue_size(10)
    .ventilation_interval(Duration::from_millis(1))
    .build()?;

    pool.start::<IdentityWorker>(None, Some(Box::new(ventilator.clone())))?;

    for _ in 0..50 {
        let in_flight =
            ventilator.ventilated_count().saturating_sub(ventilator.processed_count());
        assert!(
            in_flight <= 10,
            "observed {} items in flight, bound is 10",
            in_flight
        );
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(
        ventilator.ventilated_count(),
        10,
        "with zero items processed the feeder must stall at the bound"
    );

    // Release the ventilator, then drain: exactly the 10 ventilated items
    // came through, and nothing else ever will.
    ventilator.stop();
    let results = drain_pool(&pool)?;
    assert_eq!(results.len(), 10);

    pool.stop();
    pool.join()?;
    Ok(())
}

#[test]
fn test_backpressure_relief_lets_the_full_sequence_through() -> Result<()> {
    let pool = ThreadPool::with_results_capacity(4, 8)?;
    let feeder = pool.clone();
    let ventilator = ConcurrentVentilator::builder(
        move |item| feeder.ventilate(item),
        identity_items(100),
    )
    .max_ventilation_queue_size(5)
    .ventilation_interval(Duration::from_millis(1))
    .build()?;

    pool.start::<IdentityWorker>(None, Some(Box::new(ventilator.clone())))?;

    // Draining is what reports items processed and relieves the bound.
    let results = drain_pool(&pool)?;
    assert_eq!(results.len(), 100);
    assert_eq!(sorted_ints(&results), (0..100).collect::<Vec<i64>>());
    assert_eq!(ventilator.ventilated_count(), 100);
    assert_eq!(ventilator.processed_count(), 100);

    pool.stop();
    pool.join()?;
    Ok(())
}

#[test]
fn test_drain_near_the_end_of_the_sequence_never_strands_results() -> Result<()> {
    // Quick repeated runs to shake out drain/feed interleavings around the
    // final submission: the consumer must never conclude "empty" while the
    // feeder's last result is in flight.
    for trial in 0..25 {
        let pool = SyncPool::new();
        let feeder = pool.clone();
        let ventilator = ConcurrentVentilator::builder(
            move |item| feeder.ventilate(item),
            identity_items(50),
        )
        .build()?;

        pool.start::<IdentityWorker>(None, Some(Box::new(ventilator)))?;
        let results = drain_pool(&pool)?;
        assert_eq!(
            results.len(),
            50,
            "trial {}: a premature empty-result stranded delivered results",
            trial
        );

        pool.stop();
        pool.join()?;
    }
    Ok(())
}

// ============================================================================
// 2. Iteration Counting
// ============================================================================

#[test]
fn test_five_iterations_over_ten_items_yield_fifty_results() -> Result<()> {
    let pool = ThreadPool::new(4)?;
    let feeder = pool.clone();
    let ventilator = ConcurrentVentilator::builder(
        move |item| feeder.ventilate(item),
        identity_items(10),
    )
    .iterations(5)
    .build()?;

    pool.start::<IdentityWorker>(None, Some(Box::new(ventilator.clone())))?;
    let results = drain_pool(&pool)?;

    assert_eq!(results.len(), 50);
    let mut expected: Vec<i64> = (0..10i64).flat_map(|i| [i; 5]).collect();
    expected.sort_unstable();
    assert_eq!(
        sorted_ints(&results),
        expected,
        "every identity must appear exactly 5 times"
    );
    assert!(ventilator.completed());

    pool.stop();
    pool.join()?;
    Ok(())
}

#[test]
fn test_unbounded_ventilator_keeps_feeding_until_stopped() -> Result<()> {
    let pool = ThreadPool::new(2)?;
    let feeder = pool.clone();
    let ventilator = ConcurrentVentilator::builder(
        move |item| feeder.ventilate(item),
        identity_items(3),
    )
    .unbounded_iterations()
    .max_ventilation_queue_size(64)
    .build()?;

    pool.start::<IdentityWorker>(None, Some(Box::new(ventilator.clone())))?;

    // Consume well past one pass over the 3-item sequence.
    for _ in 0..30 {
        pool.get_results(Some(Duration::from_secs(10)))?;
    }
    assert!(!ventilator.completed(), "unbounded feeding has no end");

    ventilator.stop();
    let ventilated_at_stop = ventilator.ventilated_count();
    thread::sleep(Duration::from_millis(100));
    assert_eq!(
        ventilator.ventilated_count(),
        ventilated_at_stop,
        "no submission may occur after stop() returns"
    );
    assert!(ventilator.completed());

    pool.stop();
    pool.join()?;
    Ok(())
}

#[test]
fn test_empty_item_sequence_is_completed_from_the_start() -> Result<()> {
    let pool = SyncPool::new();
    let feeder = pool.clone();
    let ventilator =
        ConcurrentVentilator::builder(move |item| feeder.ventilate(item), Vec::new()).build()?;
    assert!(ventilator.completed());

    pool.start::<IdentityWorker>(None, Some(Box::new(ventilator.clone())))?;
    assert!(matches!(
        pool.get_results(Some(Duration::from_secs(1))),
        Err(PoolError::EmptyResult)
    ));
    assert_eq!(ventilator.ventilated_count(), 0);

    pool.stop();
    pool.join()?;
    Ok(())
}

// ============================================================================
// 3. Shuffling
// ============================================================================

#[test]
fn test_unshuffled_ventilation_preserves_input_order() -> Result<()> {
    let pool = SyncPool::new();
    let feeder = pool.clone();
    let ventilator = ConcurrentVentilator::builder(
        move |item| feeder.ventilate(item),
        identity_items(30),
    )
    .build()?;

    pool.start::<IdentityWorker>(None, Some(Box::new(ventilator)))?;
    let results = drain_pool(&pool)?;

    let values: Vec<i64> = results.iter().filter_map(Value::as_i64).collect();
    assert_eq!(values, (0..30).collect::<Vec<i64>>());

    pool.stop();
    pool.join()?;
    Ok(())
}

#[test]
fn test_shuffled_ventilation_is_a_permutation_but_not_the_input_order() -> Result<()> {
    // With 30 items the odds of shuffling into the identity order are
    // 1/30!, so a single trial is decisive.
    let pool = SyncPool::new();
    let feeder = pool.clone();
    let ventilator = ConcurrentVentilator::builder(
        move |item| feeder.ventilate(item),
        identity_items(30),
    )
    .randomize_item_order(true)
    .build()?;

    pool.start::<IdentityWorker>(None, Some(Box::new(ventilator)))?;
    let results = drain_pool(&pool)?;

    let values: Vec<i64> = results.iter().filter_map(Value::as_i64).collect();
    let ordered: Vec<i64> = (0..30).collect();
    assert_eq!(sorted_ints(&results), ordered, "every item exactly once");
    assert_ne!(values, ordered, "shuffled order must differ from input order");

    pool.stop();
    pool.join()?;
    Ok(())
}

// ============================================================================
// 4. Stop Semantics and Builder Validation
// ============================================================================

#[test]
fn test_ventilator_stop_joins_the_control_thread_promptly() -> Result<()> {
    let pool = ThreadPool::new(2)?;
    let feeder = pool.clone();
    let ventilator = ConcurrentVentilator::builder(
        move |item| feeder.ventilate(item),
        identity_items(10),
    )
    .unbounded_iterations()
    .build()?;

    pool.start::<IdentityWorker>(None, Some(Box::new(ventilator.clone())))?;
    thread::sleep(Duration::from_millis(50));

    let started = Instant::now();
    ventilator.stop();
    assert!(
        started.elapsed() < Duration::from_secs(2),
        "stop must join the control loop, not hang"
    );

    pool.stop();
    pool.join()?;
    Ok(())
}

#[test]
fn test_stopping_a_sync_pool_mid_ventilation_does_not_hang() -> Result<()> {
    // The control thread submits inline into the sync pool and reports
    // processed items through the pool's ventilator slot; stopping the
    // pool while it is mid-item must not hold that slot across the
    // control-thread join.
    let pool = SyncPool::new();
    let feeder = pool.clone();
    let items: Vec<WorkItem> = (0..500)
        .map(|i| WorkItem::from_single("sleep_ms", 20).with("value", i))
        .collect();
    let ventilator =
        ConcurrentVentilator::builder(move |item| feeder.ventilate(item), items).build()?;

    pool.start::<SleepyWorker>(None, Some(Box::new(ventilator)))?;
    thread::sleep(Duration::from_millis(100));

    let started = Instant::now();
    pool.stop();
    assert!(
        started.elapsed() < Duration::from_secs(5),
        "stop() must only wait out the in-flight item, took {:?}",
        started.elapsed()
    );
    pool.join()?;
    Ok(())
}

#[test]
fn test_stop_during_an_in_flight_submission_is_waited_out() -> Result<()> {
    // stop() zeroes the remaining iterations while a pass is still in
    // flight; the loop must absorb that at the end-of-pass bookkeeping
    // instead of underflowing and feeding forever.
    let submitted = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&submitted);
    let ventilator = ConcurrentVentilator::builder(
        move |_item| {
            thread::sleep(Duration::from_millis(300));
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        },
        identity_items(1),
    )
    .build()?;

    ventilator.start()?;
    thread::sleep(Duration::from_millis(50));
    ventilator.stop();

    assert!(ventilator.completed(), "stop() must leave the feeder completed");
    assert_eq!(
        submitted.load(Ordering::SeqCst),
        1,
        "the in-flight submission is waited out, never interrupted"
    );
    thread::sleep(Duration::from_millis(400));
    assert_eq!(
        ventilator.ventilated_count(),
        1,
        "no submission may occur after stop() returns"
    );
    Ok(())
}

#[test]
fn test_ventilator_cannot_start_twice() -> Result<()> {
    let ventilator =
        ConcurrentVentilator::builder(|_item| Ok(()), identity_items(2)).build()?;
    ventilator.start()?;
    assert!(matches!(
        ventilator.start(),
        Err(PoolError::ContractViolation(_))
    ));
    ventilator.stop();
    Ok(())
}

#[test]
fn test_builder_rejects_invalid_configurations() {
    let zero_iterations = ConcurrentVentilator::builder(|_item| Ok(()), identity_items(3))
        .iterations(0)
        .build();
    assert!(matches!(zero_iterations, Err(PoolError::InvalidConfig(_))));

    let zero_queue = ConcurrentVentilator::builder(|_item| Ok(()), identity_items(3))
        .max_ventilation_queue_size(0)
        .build();
    assert!(matches!(zero_queue, Err(PoolError::InvalidConfig(_))));
}
