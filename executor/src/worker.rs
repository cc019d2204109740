// /////////////////////////////////////////////////////////////////////////////
// Pipeline Executor
// SPDX-License-Identifier: BSD-3-Clause
// /////////////////////////////////////////////////////////////////////////////

//! # Worker Loop
//!
//! The per-routine pull-process-push state machine (§4.1). One instance of
//! [`run_worker`] runs per routine, inside a task spawned by
//! [`crate::supervisor::spawn_supervised`].

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use pipeline_executor_domain::callback::{
    Callbacks, EmptyInputContext, FullOutputContext, RoutineCancelledContext, RoutineErrorContext, RoutineSuccessContext,
};
use pipeline_executor_domain::{ExecutorConfig, ExecutorError, ProcessingFn, RoutineMetadata, RoutineState, StatusTracker};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A shared, lockable receiver: `mpsc::Receiver` is not `Clone`, so
/// `concurrency` workers share one via a mutex, each briefly holding the lock
/// only long enough to attempt a `recv`.
pub type SharedReceiver<In> = Arc<AsyncMutex<mpsc::Receiver<In>>>;

/// Everything one worker routine needs, pre-assembled by
/// [`crate::handle::Executor::build`].
pub struct WorkerContext<In, Out> {
    pub executor_name: Arc<str>,
    pub routine_index: usize,
    pub config: Arc<ExecutorConfig<In, Out>>,
    pub internal_token: CancellationToken,
    pub input: Option<SharedReceiver<In>>,
    pub output: Option<mpsc::Sender<Out>>,
    pub status_tracker: Arc<StatusTracker>,
    pub input_index_counter: Arc<AtomicU64>,
    pub output_index_counter: Arc<AtomicU64>,
    pub chain_trackers: Arc<HashMap<Arc<str>, Arc<StatusTracker>>>,
    pub chain_order: Arc<Vec<Arc<str>>>,
}

impl<In, Out> WorkerContext<In, Out> {
    pub(crate) fn build_metadata(&self, global_input_index: u64, routine_input_index: u64) -> RoutineMetadata {
        RoutineMetadata {
            executor_name: self.executor_name.clone(),
            routine_index: self.routine_index,
            global_input_index,
            routine_input_index,
            status_tracker: self.status_tracker.clone(),
            chain_trackers: self.chain_trackers.clone(),
            chain_order: self.chain_order.clone(),
        }
    }

    fn callbacks(&self) -> &Callbacks {
        &self.config.callbacks
    }
}

/// Outcome of one input-acquisition attempt (§4.1 step 2).
enum InputOutcome<In> {
    Value(In),
    Closed,
    Cancelled,
}

/// Waits for a value on `rx`, racing it against cancellation and an
/// idle-timer that fires `on_idle` (diagnostic only) and re-arms.
///
/// A value or a drained-and-closed queue is checked synchronously first
/// (`try_recv`) so neither is ever lost to a race against cancellation
/// (§4.1 tie-break note); only a genuinely empty queue proceeds to the
/// `select!` race between cancellation, arrival, and the idle timer.
async fn recv_with_timeout<In>(
    rx: &SharedReceiver<In>,
    token: &CancellationToken,
    idle_interval: Duration,
    mut on_idle: impl FnMut(),
) -> InputOutcome<In> {
    loop {
        let mut guard = rx.lock().await;
        match guard.try_recv() {
            Ok(v) => return InputOutcome::Value(v),
            Err(mpsc::error::TryRecvError::Disconnected) => return InputOutcome::Closed,
            Err(mpsc::error::TryRecvError::Empty) => {}
        }
        tokio::select! {
            _ = token.cancelled() => return InputOutcome::Cancelled,
            maybe_val = guard.recv() => {
                return match maybe_val {
                    Some(v) => InputOutcome::Value(v),
                    None => InputOutcome::Closed,
                };
            }
            _ = tokio::time::sleep(idle_interval) => {
                drop(guard);
                on_idle();
            }
        }
    }
}

/// Outcome of one output-emission attempt (§4.1 step 4).
pub(crate) enum OutputOutcome {
    Sent,
    Cancelled,
}

/// Sends `value` on `tx`, racing it against cancellation and a
/// full-queue-timer that fires `on_full` (which may abort the send with an
/// error) and re-arms. Shared with the batching worker loop, which sends
/// `Vec<T>` windows through the same mechanism.
pub(crate) async fn send_with_timeout<Out>(
    tx: &mpsc::Sender<Out>,
    value: Out,
    token: &CancellationToken,
    full_interval: Duration,
    mut on_full: impl FnMut() -> Option<ExecutorError>,
) -> Result<OutputOutcome, ExecutorError> {
    tokio::pin! {
        let send_fut = tx.reserve();
    }
    loop {
        tokio::select! {
            _ = token.cancelled() => return Ok(OutputOutcome::Cancelled),
            permit = &mut send_fut => {
                return match permit {
                    Ok(permit) => {
                        permit.send(value);
                        Ok(OutputOutcome::Sent)
                    }
                    Err(_) => Ok(OutputOutcome::Cancelled),
                };
            }
            _ = tokio::time::sleep(full_interval) => {
                if let Some(err) = on_full() {
                    return Err(err);
                }
            }
        }
    }
}

fn panic_payload_to_string(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "processing function panicked with a non-string payload".to_string()
    }
}

/// Runs one worker routine to completion (§4.1). Returns `Ok(())` on a clean
/// exit (queue drained, or a no-input variant cancelled cleanly is still
/// reported via `Err` — see below) and `Err` for any error or cancellation,
/// mirroring what the lifecycle coordinator needs to tell a real failure from
/// a clean finish.
pub async fn run_worker<In, Out>(ctx: WorkerContext<In, Out>, shared: Arc<crate::coordinator::SharedState<Out>>) -> Result<(), ExecutorError>
where
    In: Send + 'static,
    Out: Send + Clone + PartialEq + Default + 'static,
{
    ctx.status_tracker.set_routine_state(ctx.routine_index, RoutineState::Running);
    debug!(executor = %ctx.executor_name, routine = ctx.routine_index, "worker started");

    let mut routine_input_index: u64 = 0;

    loop {
        let global_input_index = ctx.input_index_counter.fetch_add(1, Ordering::AcqRel);

        let input_value = if ctx.config.processing_fn.consumes_input() {
            let rx = ctx.input.as_ref().expect("consumes_input implies an input queue was wired");
            let wait_meta = ctx.build_metadata(global_input_index, routine_input_index);
            let callbacks = ctx.callbacks().clone();
            let executor_name = ctx.executor_name.clone();
            let outcome = recv_with_timeout(rx, &ctx.internal_token, ctx.config.empty_input_interval, || {
                if let Some(cb) = &callbacks.on_empty_input {
                    cb(&EmptyInputContext { executor_name: executor_name.clone(), routine_metadata: wait_meta.clone() });
                }
            })
            .await;
            match outcome {
                InputOutcome::Cancelled => return exit_cancelled(&ctx, &shared, None).await,
                InputOutcome::Closed => return exit_success(&ctx, &shared).await,
                InputOutcome::Value(v) => {
                    routine_input_index += 1;
                    Some(v)
                }
            }
        } else {
            None
        };

        if ctx.internal_token.is_cancelled() {
            return exit_cancelled(&ctx, &shared, None).await;
        }

        let metadata = ctx.build_metadata(global_input_index, routine_input_index);
        let process_result = invoke_processing_fn(&ctx, input_value, metadata.clone()).await;

        let output = match process_result {
            Ok(output) => output,
            Err(err) => {
                if ctx.internal_token.is_cancelled() {
                    return exit_cancelled(&ctx, &shared, Some(err)).await;
                }
                let replaced = ctx.callbacks().on_routine_error.as_ref().and_then(|cb| {
                    cb(&RoutineErrorContext { executor_name: ctx.executor_name.clone(), routine_metadata: metadata.clone(), error: err.clone() })
                });
                return exit_errored(&ctx, &shared, replaced.unwrap_or(err)).await;
            }
        };

        let Some(output) = output else {
            continue;
        };

        ctx.output_index_counter.fetch_add(1, Ordering::AcqRel);

        if ctx.config.ignore_zero_value_outputs && output == Out::default() {
            continue;
        }

        let tx = ctx.output.as_ref().expect("produces_output implies an output queue was wired");
        let callbacks = ctx.callbacks().clone();
        let executor_name = ctx.executor_name.clone();
        let full_meta = metadata.clone();
        let send_outcome = send_with_timeout(tx, output, &ctx.internal_token, ctx.config.full_output_interval, || {
            callbacks
                .on_full_output
                .as_ref()
                .and_then(|cb| cb(&FullOutputContext { executor_name: executor_name.clone(), routine_metadata: full_meta.clone() }))
        })
        .await;

        match send_outcome {
            Ok(OutputOutcome::Sent) => continue,
            Ok(OutputOutcome::Cancelled) => return exit_cancelled(&ctx, &shared, None).await,
            Err(err) => return exit_errored(&ctx, &shared, err).await,
        }
    }
}

/// Invokes the configured processing function, catching a panic and
/// converting it into `PanicInProcessingFn` (§4.1 edge cases) rather than
/// letting it unwind the worker task.
pub(crate) async fn invoke_processing_fn<In, Out>(
    ctx: &WorkerContext<In, Out>,
    input: Option<In>,
    metadata: RoutineMetadata,
) -> Result<Option<Out>, ExecutorError> {
    let token = ctx.internal_token.clone();
    let result = match (&ctx.config.processing_fn, input) {
        (ProcessingFn::InputOutput(f), Some(input)) => {
            AssertUnwindSafe(f(token, input, metadata)).catch_unwind().await.map(|r| r.map(Some))
        }
        (ProcessingFn::InputOnly(f), Some(input)) => {
            AssertUnwindSafe(f(token, input, metadata)).catch_unwind().await.map(|r| r.map(|()| None))
        }
        (ProcessingFn::OutputOnly(f), None) => {
            AssertUnwindSafe(f(token, metadata)).catch_unwind().await.map(|r| r.map(Some))
        }
        (ProcessingFn::Neither(f), None) => {
            AssertUnwindSafe(f(token, metadata)).catch_unwind().await.map(|r| r.map(|()| None))
        }
        _ => unreachable!("ExecutorConfig::validate rejects variant/queue-presence mismatches"),
    };

    match result {
        Ok(inner) => inner,
        Err(panic_payload) => Err(ExecutorError::panic_in_processing_fn(panic_payload_to_string(panic_payload))),
    }
}

pub(crate) async fn exit_success<In, Out, ChannelOut>(
    ctx: &WorkerContext<In, Out>,
    shared: &Arc<crate::coordinator::SharedState<ChannelOut>>,
) -> Result<(), ExecutorError> {
    ctx.status_tracker.set_routine_state(ctx.routine_index, RoutineState::Finished);
    debug!(executor = %ctx.executor_name, routine = ctx.routine_index, "worker finished cleanly");
    if let Some(cb) = &ctx.callbacks().on_routine_success {
        cb(&RoutineSuccessContext {
            executor_name: ctx.executor_name.clone(),
            routine_metadata: ctx.build_metadata(ctx.input_index_counter.load(Ordering::Acquire), 0),
        });
    }
    let result = Ok(());
    crate::coordinator::record_exit(shared, &result).await;
    result
}

pub(crate) async fn exit_cancelled<In, Out, ChannelOut>(
    ctx: &WorkerContext<In, Out>,
    shared: &Arc<crate::coordinator::SharedState<ChannelOut>>,
    err: Option<ExecutorError>,
) -> Result<(), ExecutorError> {
    ctx.status_tracker.set_routine_state(ctx.routine_index, RoutineState::Cancelled);
    let error = err.unwrap_or_else(|| ExecutorError::cancelled(format!("{} routine {} cancelled", ctx.executor_name, ctx.routine_index)));
    warn!(executor = %ctx.executor_name, routine = ctx.routine_index, "worker cancelled");
    if let Some(cb) = &ctx.callbacks().on_routine_cancelled {
        cb(&RoutineCancelledContext {
            executor_name: ctx.executor_name.clone(),
            routine_metadata: ctx.build_metadata(ctx.input_index_counter.load(Ordering::Acquire), 0),
            error: error.clone(),
        });
    }
    let result = Err(error);
    crate::coordinator::record_exit(shared, &result).await;
    result
}

pub(crate) async fn exit_errored<In, Out, ChannelOut>(
    ctx: &WorkerContext<In, Out>,
    shared: &Arc<crate::coordinator::SharedState<ChannelOut>>,
    error: ExecutorError,
) -> Result<(), ExecutorError> {
    ctx.status_tracker.set_routine_state(ctx.routine_index, RoutineState::Errored);
    debug!(executor = %ctx.executor_name, routine = ctx.routine_index, error = %error, "worker exited with error");
    let result = Err(error);
    crate::coordinator::record_exit(shared, &result).await;
    result
}
