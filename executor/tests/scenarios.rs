// /////////////////////////////////////////////////////////////////////////////
// Pipeline Executor
// SPDX-License-Identifier: BSD-3-Clause
// /////////////////////////////////////////////////////////////////////////////

//! End-to-end scenarios exercising `Executor::build`/`build_batching` as a
//! caller would, rather than the unit-level worker/coordinator tests that
//! live alongside the implementation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pipeline_executor::{CancellationToken, Executor, ExecutorHandle, ExecutorInput};
use pipeline_executor_domain::{ExecutorConfigBuilder, ExecutorError, ProcessingFn};
use tokio::sync::mpsc;

fn identity_config(name: &str, concurrency: usize) -> pipeline_executor_domain::ExecutorConfig<u32, u32> {
    let identity = ProcessingFn::InputOutput(Arc::new(|_token, input, _meta| Box::pin(async move { Ok(input) })));
    ExecutorConfigBuilder::new(name, identity)
        .concurrency(concurrency)
        .empty_input_interval(Duration::from_millis(50))
        .build()
        .unwrap()
}

/// One stage, refilled mid-run with the same range twice, identity function.
/// `wait()` succeeds, and the output multiset is exactly two copies of the
/// input range.
#[tokio::test]
async fn one_stage_refilled_mid_run_preserves_every_value() {
    const N: u32 = 20;
    let (tx, rx) = mpsc::channel(64);
    let mut handle =
        Executor::build(CancellationToken::new(), identity_config("identity", 4), ExecutorInput::Queue(rx)).unwrap();

    for i in 1..=N {
        tx.send(i).await.unwrap();
    }
    for i in 1..=N {
        tx.send(i).await.unwrap();
    }
    drop(tx);

    let mut outputs = Vec::new();
    while let Some(v) = handle.output_queue().unwrap().recv().await {
        outputs.push(v);
    }

    assert!(handle.wait().await.is_ok());
    assert_eq!(outputs.len(), (2 * N) as usize);
    assert_eq!(*outputs.iter().max().unwrap(), N);

    let mut expected: Vec<u32> = (1..=N).chain(1..=N).collect();
    let mut actual = outputs;
    expected.sort_unstable();
    actual.sort_unstable();
    assert_eq!(actual, expected);
}

/// Batching on size alone (`batch_max_age` zero): an input range closed
/// immediately produces exactly `ceil(N / batch_size)` windows, every one of
/// them full except possibly the last.
#[tokio::test]
async fn batching_by_size_splits_into_full_windows_and_a_remainder() {
    const N: u32 = 250;
    const BATCH_SIZE: usize = 100;

    let (tx, rx) = mpsc::channel(512);
    for i in 1..=N {
        tx.send(i).await.unwrap();
    }
    drop(tx);

    let identity = ProcessingFn::InputOutput(Arc::new(|_token, input: u32, _meta| Box::pin(async move { Ok(input) })));
    let config = ExecutorConfigBuilder::new("batch-by-size", identity)
        .concurrency(1)
        .batching(BATCH_SIZE, Duration::ZERO)
        .empty_input_interval(Duration::from_millis(50))
        .build()
        .unwrap();

    let mut handle = Executor::build_batching(CancellationToken::new(), config, ExecutorInput::Queue(rx)).unwrap();

    let mut batches = Vec::new();
    while let Some(b) = handle.output_queue().unwrap().recv().await {
        batches.push(b);
    }
    assert!(handle.wait().await.is_ok());

    let expected_batches = (N as usize).div_ceil(BATCH_SIZE);
    assert_eq!(batches.len(), expected_batches);
    for full in &batches[..batches.len() - 1] {
        assert_eq!(full.len(), BATCH_SIZE);
    }
    let remainder = N as usize % BATCH_SIZE;
    let expected_last = if remainder == 0 { BATCH_SIZE } else { remainder };
    assert_eq!(batches.last().unwrap().len(), expected_last);
}

/// Batching with an age threshold, where the processing function stalls
/// (awaiting cancellation) once it sees a late enough input. The two full
/// windows that accumulated before the stall arrive normally; the run then
/// only terminates once the caller cancels, and `wait()` reports that as a
/// cancellation.
///
/// Note: because the age deadline is only checked between input pulls, a
/// partial window can't flush *while* a routine is blocked inside the
/// processing function for the next input — the age timer and an in-flight
/// call are never raced against each other. That's a known limitation of
/// the single-loop worker design, recorded in DESIGN.md, not exercised here.
#[tokio::test]
async fn batching_by_age_stalls_then_adopts_cancellation() {
    const N: u32 = 1000;
    const BATCH_SIZE: usize = 100;
    const STALL_AT: u64 = 250;

    let (tx, rx) = mpsc::channel(2000);
    for i in 1..=N {
        tx.send(i).await.unwrap();
    }
    drop(tx);

    let stall_fn = ProcessingFn::InputOutput(Arc::new(move |token: CancellationToken, input: u32, meta: pipeline_executor_domain::RoutineMetadata| {
        Box::pin(async move {
            if meta.global_input_index >= STALL_AT {
                token.cancelled().await;
                return Err(ExecutorError::cancelled("stalled routine observed cancellation"));
            }
            Ok(input)
        })
    }));

    let config = ExecutorConfigBuilder::new("batch-by-age", stall_fn)
        .concurrency(1)
        .batching(BATCH_SIZE, Duration::from_millis(100))
        .empty_input_interval(Duration::from_millis(50))
        .build()
        .unwrap();

    let caller_token = CancellationToken::new();
    let mut handle = Executor::build_batching(caller_token.clone(), config, ExecutorInput::Queue(rx)).unwrap();

    let mut batches = Vec::new();
    for _ in 0..2 {
        let b = handle.output_queue().unwrap().recv().await.unwrap();
        batches.push(b);
    }
    assert!(batches.iter().all(|b| b.len() == BATCH_SIZE));

    caller_token.cancel();
    let result = handle.wait().await;
    assert!(result.is_err());
    assert!(result.unwrap_err().is_cancellation());
}

/// A stage erroring partway through its input stream: the error wins
/// `wait()`, and every other worker in the stage is cancelled rather than
/// left running or leaking its queue.
#[tokio::test]
async fn error_past_a_threshold_cancels_remaining_workers_and_closes_output() {
    const N: u32 = 10;
    let threshold = N / 2;

    let (tx, rx) = mpsc::channel(32);
    for i in 1..=N {
        tx.send(i).await.unwrap();
    }
    drop(tx);

    let erroring_fn = ProcessingFn::InputOutput(Arc::new(move |_token, input: u32, _meta| {
        Box::pin(async move {
            if input > threshold {
                Err(ExecutorError::processing_failed(format!("{input} exceeds threshold")))
            } else {
                Ok(input)
            }
        })
    }));

    let config = ExecutorConfigBuilder::new("erroring", erroring_fn)
        .concurrency(N as usize)
        .empty_input_interval(Duration::from_millis(50))
        .build()
        .unwrap();

    let mut handle = Executor::build(CancellationToken::new(), config, ExecutorInput::Queue(rx)).unwrap();

    // The output queue must close on its own once the stage tears itself
    // down, whether or not every value made it out before the error fired.
    while handle.output_queue().unwrap().recv().await.is_some() {}

    let result = handle.wait().await;
    assert!(matches!(result, Err(ExecutorError::ProcessingFailed(_))));
}

/// A sink stage (no output queue at all): `wait()` succeeds once every
/// input has been consumed, and the side-effecting counter matches the
/// input count exactly.
#[tokio::test]
async fn sink_stage_has_no_output_queue_and_counts_every_input() {
    const N: u32 = 37;
    let (tx, rx) = mpsc::channel(64);
    for i in 1..=N {
        tx.send(i).await.unwrap();
    }
    drop(tx);

    let counter = Arc::new(AtomicUsize::new(0));
    let counter_for_fn = counter.clone();
    let sink_fn = ProcessingFn::InputOnly(Arc::new(move |_token, _input: u32, _meta| {
        let counter = counter_for_fn.clone();
        Box::pin(async move {
            counter.fetch_add(1, Ordering::AcqRel);
            Ok(())
        })
    }));

    let config: pipeline_executor_domain::ExecutorConfig<u32, u32> = ExecutorConfigBuilder::new("sink", sink_fn)
        .concurrency(4)
        .empty_input_interval(Duration::from_millis(50))
        .build()
        .unwrap();

    let mut handle: ExecutorHandle<u32> = Executor::build(CancellationToken::new(), config, ExecutorInput::Queue(rx)).unwrap();
    assert!(handle.output_queue().is_none());

    assert!(handle.wait().await.is_ok());
    assert_eq!(counter.load(Ordering::Acquire), N as usize);
}

/// A two-stage chain where upstream errors partway through. The downstream
/// stage, built with `process_upstream_outputs_after_upstream_error`, and
/// chained by passing upstream's own `cancellation_token()` as its caller
/// token, keeps draining everything upstream already produced before its
/// own `wait()` adopts upstream's error.
#[tokio::test]
async fn downstream_drains_fully_before_adopting_upstream_error() {
    const N: u32 = 20;
    let threshold = N / 2;

    let (tx, rx) = mpsc::channel(64);
    for i in 1..=N {
        tx.send(i).await.unwrap();
    }
    drop(tx);

    let upstream_fn = ProcessingFn::InputOutput(Arc::new(move |_token, input: u32, _meta| {
        Box::pin(async move {
            if input > threshold {
                Err(ExecutorError::processing_failed("upstream boom"))
            } else {
                Ok(input)
            }
        })
    }));
    let upstream_config = ExecutorConfigBuilder::new("upstream", upstream_fn)
        .concurrency(1)
        .empty_input_interval(Duration::from_millis(50))
        .build()
        .unwrap();
    let upstream = Executor::build(CancellationToken::new(), upstream_config, ExecutorInput::Queue(rx)).unwrap();
    let upstream_passthrough = upstream.cancellation_token();

    let collected = Arc::new(Mutex::new(Vec::new()));
    let collected_for_fn = collected.clone();
    let downstream_fn = ProcessingFn::InputOutput(Arc::new(move |_token, input: u32, _meta| {
        let collected = collected_for_fn.clone();
        Box::pin(async move {
            collected.lock().unwrap().push(input);
            Ok(input)
        })
    }));
    let downstream_config = ExecutorConfigBuilder::new("downstream", downstream_fn)
        .concurrency(1)
        .process_upstream_outputs_after_upstream_error(true)
        .empty_input_interval(Duration::from_millis(50))
        .build()
        .unwrap();
    let mut downstream =
        Executor::build(upstream_passthrough, downstream_config, ExecutorInput::Upstream(upstream)).unwrap();

    while downstream.output_queue().unwrap().recv().await.is_some() {}

    let result = downstream.wait().await;
    assert!(matches!(result, Err(ExecutorError::UpstreamFailed(_))));

    let collected = collected.lock().unwrap();
    assert_eq!(collected.len(), threshold as usize);
    assert!(collected.iter().all(|v| *v <= threshold));
}
