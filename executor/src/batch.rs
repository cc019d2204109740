// /////////////////////////////////////////////////////////////////////////////
// Pipeline Executor
// SPDX-License-Identifier: BSD-3-Clause
// /////////////////////////////////////////////////////////////////////////////

//! # Batching Adapter
//!
//! The batching worker loop (§4.4): a per-worker buffer of the processing
//! function's scalar result type `T`, flushed onto an output queue of
//! `Vec<T>` windows on a size or age threshold. Kept as its own loop rather
//! than folded into [`crate::worker::run_worker`] because the output
//! channel's element type (`Vec<T>`) differs from the processing function's
//! declared scalar output type (`T`), and the age-based flush needs an extra
//! `select!` arm the non-batching loop has no use for.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use pipeline_executor_domain::callback::EmptyInputContext;
use pipeline_executor_domain::{BatchConfig, ExecutorError, RoutineState};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::coordinator::SharedState;
use crate::worker::{exit_cancelled, exit_errored, exit_success, invoke_processing_fn, send_with_timeout, OutputOutcome, WorkerContext};

/// Resolves at `deadline` if set, otherwise never resolves — used as a
/// `select!` arm that is a no-op until a batch has a first scalar in it.
async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

/// Runs one batching worker routine to completion.
///
/// `ctx`'s own `output` field is unused (batching workers send `Vec<T>`
/// windows on `batch_output`, not scalar `T` on `ctx.output`); it exists only
/// so [`WorkerContext`] can be shared verbatim with the non-batching loop.
pub async fn run_batch_worker<In, T>(
    ctx: WorkerContext<In, T>,
    shared: Arc<SharedState<Vec<T>>>,
    batch_output: mpsc::Sender<Vec<T>>,
    batch: BatchConfig,
) -> Result<(), ExecutorError>
where
    In: Send + 'static,
    T: Send + 'static,
{
    ctx.status_tracker.set_routine_state(ctx.routine_index, RoutineState::Running);

    let mut buffer: Vec<T> = Vec::with_capacity(batch.batch_size);
    let mut deadline: Option<Instant> = None;
    let mut routine_input_index: u64 = 0;

    loop {
        let global_input_index = ctx.input_index_counter.fetch_add(1, Ordering::AcqRel);
        let rx = ctx.input.as_ref().expect("batching requires an input-consuming variant");

        let input_value = loop {
            let mut guard = rx.lock().await;
            match guard.try_recv() {
                Ok(v) => break v,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    drop(guard);
                    if !buffer.is_empty() {
                        if let Err(err) = flush(&ctx, &batch_output, &mut buffer, global_input_index, routine_input_index).await {
                            return exit_on_flush_failure(&ctx, &shared, err).await;
                        }
                    }
                    return exit_success(&ctx, &shared).await;
                }
                Err(mpsc::error::TryRecvError::Empty) => {}
            }

            let wait_meta = ctx.build_metadata(global_input_index, routine_input_index);
            tokio::select! {
                _ = ctx.internal_token.cancelled() => {
                    buffer.clear();
                    return exit_cancelled(&ctx, &shared, None).await;
                }
                maybe_val = guard.recv() => {
                    drop(guard);
                    match maybe_val {
                        Some(v) => break v,
                        None => {
                            if !buffer.is_empty() {
                                if let Err(err) = flush(&ctx, &batch_output, &mut buffer, global_input_index, routine_input_index).await {
                                    return exit_on_flush_failure(&ctx, &shared, err).await;
                                }
                            }
                            return exit_success(&ctx, &shared).await;
                        }
                    }
                }
                _ = tokio::time::sleep(ctx.config.empty_input_interval) => {
                    drop(guard);
                    if let Some(cb) = &ctx.config.callbacks.on_empty_input {
                        cb(&EmptyInputContext { executor_name: ctx.executor_name.clone(), routine_metadata: wait_meta });
                    }
                }
                _ = sleep_until_deadline(deadline) => {
                    drop(guard);
                    if !buffer.is_empty() {
                        if let Err(err) = flush(&ctx, &batch_output, &mut buffer, global_input_index, routine_input_index).await {
                            return exit_on_flush_failure(&ctx, &shared, err).await;
                        }
                        deadline = None;
                    }
                }
            }
        };
        routine_input_index += 1;

        if ctx.internal_token.is_cancelled() {
            buffer.clear();
            return exit_cancelled(&ctx, &shared, None).await;
        }

        let metadata = ctx.build_metadata(global_input_index, routine_input_index);
        let scalar = match invoke_processing_fn(&ctx, Some(input_value), metadata.clone()).await {
            Ok(scalar) => scalar,
            Err(err) => {
                buffer.clear();
                if ctx.internal_token.is_cancelled() {
                    return exit_cancelled(&ctx, &shared, Some(err)).await;
                }
                let replaced = ctx.config.callbacks.on_routine_error.as_ref().and_then(|cb| {
                    cb(&pipeline_executor_domain::callback::RoutineErrorContext {
                        executor_name: ctx.executor_name.clone(),
                        routine_metadata: metadata,
                        error: err.clone(),
                    })
                });
                return exit_errored(&ctx, &shared, replaced.unwrap_or(err)).await;
            }
        };

        let Some(scalar) = scalar else {
            continue;
        };

        ctx.output_index_counter.fetch_add(1, Ordering::AcqRel);

        if buffer.is_empty() && batch.batch_max_age > std::time::Duration::ZERO {
            deadline = Some(Instant::now() + batch.batch_max_age);
        }
        buffer.push(scalar);

        if buffer.len() >= batch.batch_size {
            if let Err(err) = flush(&ctx, &batch_output, &mut buffer, global_input_index, routine_input_index).await {
                return exit_on_flush_failure(&ctx, &shared, err).await;
            }
            deadline = None;
        }
    }
}

/// Routes a flush failure to the matching worker exit path, preserving the
/// cancellation-vs-error distinction the non-batching loop makes on send.
async fn exit_on_flush_failure<In, T: Send + 'static>(
    ctx: &WorkerContext<In, T>,
    shared: &Arc<SharedState<Vec<T>>>,
    err: ExecutorError,
) -> Result<(), ExecutorError> {
    if err.is_cancellation() {
        exit_cancelled(ctx, shared, Some(err)).await
    } else {
        exit_errored(ctx, shared, err).await
    }
}

/// Flushes the current buffer as one `Vec<T>` window, racing the send
/// against cancellation like any other output emission.
async fn flush<In, T: Send + 'static>(
    ctx: &WorkerContext<In, T>,
    tx: &mpsc::Sender<Vec<T>>,
    buffer: &mut Vec<T>,
    global_input_index: u64,
    routine_input_index: u64,
) -> Result<(), ExecutorError> {
    let window = std::mem::take(buffer);
    let callbacks = ctx.config.callbacks.clone();
    let executor_name = ctx.executor_name.clone();
    let metadata = ctx.build_metadata(global_input_index, routine_input_index);
    match send_with_timeout(tx, window, &ctx.internal_token, ctx.config.full_output_interval, || {
        callbacks.on_full_output.as_ref().and_then(|cb| {
            cb(&pipeline_executor_domain::callback::FullOutputContext {
                executor_name: executor_name.clone(),
                routine_metadata: metadata.clone(),
            })
        })
    })
    .await?
    {
        OutputOutcome::Sent => Ok(()),
        OutputOutcome::Cancelled => Err(ExecutorError::cancelled(format!("{executor_name} batch flush cancelled"))),
    }
}
