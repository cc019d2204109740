// /////////////////////////////////////////////////////////////////////////////
// Pipeline Executor
// SPDX-License-Identifier: BSD-3-Clause
// /////////////////////////////////////////////////////////////////////////////

//! # Executor Construction & Handles
//!
//! [`Executor::build`] and [`Executor::build_batching`] are the only places
//! that know whether an input queue was supplied externally, created fresh,
//! or inherited from an upstream stage (§3); everything built in `worker`,
//! `batch`, `coordinator`, `chain`, and `supervisor` gets wired together
//! here. The result is an [`ExecutorHandle`], consumed exactly once — either
//! read from directly or handed to the next stage's `build()` call.

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use pipeline_executor_domain::status::DepthProbe;
use pipeline_executor_domain::{ExecutorConfig, ExecutorError, QueueOwnership, StatusTracker};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;

use crate::batch::run_batch_worker;
use crate::chain::{extend_chain, root_chain, UpstreamLink};
use crate::coordinator::{CompletionReceiver, SharedState};
use crate::supervisor::{spawn_supervised, supervise_worker};
use crate::worker::{run_worker, SharedReceiver, WorkerContext};

/// What an executor's input is sourced from at construction time (§3).
pub enum ExecutorInput<In> {
    /// The processing function's variant consumes no input.
    None,
    /// A freestanding queue supplied by the caller — the first stage of a
    /// chain, or a standalone executor.
    Queue(mpsc::Receiver<In>),
    /// Chained directly onto a previously built executor's output.
    Upstream(ExecutorHandle<In>),
}

/// A chain-extension bundle inherited from an upstream executor: its
/// completion watch, the chain-wide tracker map and order, and its own link
/// in the upstream-cancel chain.
type UpstreamMeta = (CompletionReceiver, Arc<HashMap<Arc<str>, Arc<StatusTracker>>>, Arc<Vec<Arc<str>>>, Arc<UpstreamLink>);

/// A running (or already-finished) executor.
///
/// Not `Clone`: its output queue and completion watch are each meant to be
/// consumed exactly once, whether that's an external caller reading them or
/// the next stage's `Executor::build` taking them via [`ExecutorHandle::into_chain_parts`].
pub struct ExecutorHandle<Out> {
    name: Arc<str>,
    output: Option<mpsc::Receiver<Out>>,
    completion_rx: CompletionReceiver,
    passthrough_token: CancellationToken,
    errored_signal: CancellationToken,
    status_tracker: Arc<StatusTracker>,
    chain_order: Arc<Vec<Arc<str>>>,
    chain_trackers: Arc<HashMap<Arc<str>, Arc<StatusTracker>>>,
    upstream_link: Arc<UpstreamLink>,
}

impl<Out> ExecutorHandle<Out> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status_tracker(&self) -> &Arc<StatusTracker> {
        &self.status_tracker
    }

    /// The passthrough token (§3, §4.6): cancelled by this executor's own
    /// lifecycle coordinator only after every routine has exited and any
    /// owned output queue has been closed, or unconditionally once [`Self::wait`]
    /// returns.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.passthrough_token.clone()
    }

    /// Resolves when this executor's aggregate disposition is a real error —
    /// distinct from a clean finish or a plain cancellation (§4.6).
    pub fn cancelled_signal(&self) -> impl std::future::Future<Output = ()> + 'static {
        self.errored_signal.clone().cancelled_owned()
    }

    /// The output queue, for a caller reading this executor's results
    /// directly rather than chaining another stage onto it.
    pub fn output_queue(&mut self) -> Option<&mut mpsc::Receiver<Out>> {
        self.output.as_mut()
    }

    /// Waits for this executor's aggregate disposition (§4.2). After this
    /// returns, the passthrough token is unconditionally cancelled (§4.6),
    /// regardless of whether the result was success, cancellation, or error.
    pub async fn wait(&mut self) -> Result<(), ExecutorError> {
        let result = crate::coordinator::wait_for_completion(&mut self.completion_rx).await;
        self.passthrough_token.cancel();
        result
    }

    /// Consumed by [`Executor::build`] when this handle becomes the upstream
    /// of a new stage.
    fn into_chain_parts(self) -> (Option<mpsc::Receiver<Out>>, UpstreamMeta) {
        (self.output, (self.completion_rx, self.chain_trackers, self.chain_order, self.upstream_link))
    }
}

/// Resolves an executor's input source into the shared receiver the worker
/// loop needs, plus whatever chain-extension metadata an upstream handle
/// carried (§4.3).
fn resolve_input<In: Send + 'static>(
    consumes_input: bool,
    input: ExecutorInput<In>,
) -> Result<(Option<SharedReceiver<In>>, Option<UpstreamMeta>), ExecutorError> {
    match input {
        ExecutorInput::None => {
            if consumes_input {
                return Err(ExecutorError::invalid_configuration(
                    "processing function consumes input but no input source was supplied",
                ));
            }
            Ok((None, None))
        }
        ExecutorInput::Queue(rx) => {
            if !consumes_input {
                return Err(ExecutorError::invalid_configuration(
                    "processing function consumes no input but a queue was supplied",
                ));
            }
            Ok((Some(Arc::new(AsyncMutex::new(rx))), None))
        }
        ExecutorInput::Upstream(handle) => {
            if !consumes_input {
                return Err(ExecutorError::invalid_configuration(
                    "processing function consumes no input but an upstream executor was supplied",
                ));
            }
            let (rx, meta) = handle.into_chain_parts();
            let rx = rx.ok_or_else(|| {
                ExecutorError::invalid_configuration("upstream executor has no output queue to chain from")
            })?;
            Ok((Some(Arc::new(AsyncMutex::new(rx))), Some(meta)))
        }
    }
}

/// A lock-free depth probe for an `mpsc::Receiver` guarded by an async
/// mutex: best-effort, since a worker may hold the lock mid-`recv`, in which
/// case the probe reports `0` rather than blocking.
fn input_depth_probe<In: Send + 'static>(rx: &Option<SharedReceiver<In>>) -> DepthProbe {
    match rx {
        Some(rx) => {
            let rx = rx.clone();
            Arc::new(move || rx.try_lock().map(|g| g.len()).unwrap_or(0))
        }
        None => Arc::new(|| 0),
    }
}

/// A lock-free depth probe derived from a sender's remaining capacity —
/// avoids needing to also retain the receiver, which has already been moved
/// into the new `ExecutorHandle`.
///
/// Holds only a `WeakSender`: this probe is stored in the `StatusTracker`,
/// which outlives the executor itself (it's kept in the chain-wide tracker
/// map and every downstream `RoutineMetadata`), so a strong clone here would
/// keep the channel's sender count above zero forever and the output queue
/// would never close, even after every worker exits and `finalize` drops its
/// own sender.
fn output_depth_probe<T: Send + 'static>(tx: &mpsc::Sender<T>) -> DepthProbe {
    let weak = tx.downgrade();
    Arc::new(move || weak.upgrade().map(|tx| tx.max_capacity().saturating_sub(tx.capacity())).unwrap_or(0))
}

/// Extends the chain-wide tracker map/order by one stage, or starts a fresh
/// one if there's no upstream.
fn chain_for(
    upstream: &Option<UpstreamMeta>,
    name: Arc<str>,
    status_tracker: Arc<StatusTracker>,
) -> Result<(Arc<Vec<Arc<str>>>, Arc<HashMap<Arc<str>, Arc<StatusTracker>>>), ExecutorError> {
    let (order, trackers) = match upstream {
        Some((_, trackers, order, _)) => extend_chain(order, trackers, name, status_tracker)?,
        None => root_chain(name, status_tracker),
    };
    Ok((Arc::new(order), Arc::new(trackers)))
}

/// The internal token (a fresh token if `process_upstream_outputs_after_upstream_error`,
/// otherwise a child of `caller_token`) and the passthrough token (always a
/// child of `caller_token`) — §3's token pair.
fn build_tokens(caller_token: &CancellationToken, fresh_internal: bool) -> (CancellationToken, CancellationToken) {
    let internal_token = if fresh_internal { CancellationToken::new() } else { caller_token.child_token() };
    let passthrough_token = caller_token.child_token();
    (internal_token, passthrough_token)
}

/// This stage's own link in the upstream-cancel chain (§9), extending the
/// upstream handle's link if there is one.
fn link_for(upstream: &Option<UpstreamMeta>, internal_token: CancellationToken) -> Arc<UpstreamLink> {
    match upstream {
        Some((_, _, _, parent)) => UpstreamLink::extend(internal_token, parent.clone()),
        None => UpstreamLink::root(internal_token),
    }
}

// `link_for`'s result is used two ways: it becomes the new stage's own
// `SharedState::upstream_link` (so a local error cancels this stage's own
// internal token, stopping its siblings, and then walks up through every
// ancestor), and it's handed out on the returned handle for the *next*
// stage to extend from. Both uses need the link to include this stage's
// own token, which is why there is no separate "ancestors only" link.

/// The upstream handle's completion receiver to adopt, if any (§4.2's "wait
/// upstream").
fn upstream_completion_of(upstream: Option<UpstreamMeta>) -> Option<CompletionReceiver> {
    upstream.map(|(completion_rx, _, _, _)| completion_rx)
}

/// Entry point for building a runnable executor from an [`ExecutorConfig`]
/// (§3, §6).
pub struct Executor;

impl Executor {
    /// Builds a non-batching executor. Rejects a config with a batching
    /// adapter configured — use [`Self::build_batching`] for that.
    ///
    /// `caller_token` is this stage's own cancellation source (§3): for the
    /// first stage of a chain it is typically the application's own
    /// shutdown token; for a stage built with [`ExecutorInput::Upstream`],
    /// passing the upstream handle's own [`ExecutorHandle::cancellation_token`]
    /// is what makes this stage stop the moment upstream's passthrough token
    /// fires, unless `process_upstream_outputs_after_upstream_error` is set,
    /// in which case this stage ignores whatever `caller_token` does and
    /// instead keeps draining upstream's output queue until it closes.
    pub fn build<In, Out>(
        caller_token: CancellationToken,
        config: ExecutorConfig<In, Out>,
        input: ExecutorInput<In>,
    ) -> Result<ExecutorHandle<Out>, ExecutorError>
    where
        In: Send + 'static,
        Out: Send + Clone + PartialEq + Default + 'static,
    {
        config.validate()?;
        if config.batching.is_some() {
            return Err(ExecutorError::invalid_configuration(
                "config has a batching adapter configured; use Executor::build_batching",
            ));
        }

        let (input_rx, upstream) = resolve_input(config.processing_fn.consumes_input(), input)?;
        let name: Arc<str> = Arc::from(config.name.as_str());
        let input_index_counter = Arc::new(AtomicU64::new(0));
        let output_index_counter = Arc::new(AtomicU64::new(0));

        let produces_output = config.processing_fn.produces_output();
        let (output_tx, output_rx, out_probe) = if produces_output {
            let (tx, rx) = mpsc::channel::<Out>(config.output_queue_size);
            let probe = output_depth_probe(&tx);
            (Some(tx), Some(rx), Some(probe))
        } else {
            (None, None, None)
        };

        let status_tracker = Arc::new(StatusTracker::new(
            config.name.clone(),
            config.concurrency,
            input_index_counter.clone(),
            output_index_counter.clone(),
            input_depth_probe(&input_rx),
            out_probe,
        ));

        let (chain_order, chain_trackers) = chain_for(&upstream, name.clone(), status_tracker.clone())?;
        let (internal_token, passthrough_token) = build_tokens(&caller_token, config.process_upstream_outputs_after_upstream_error);
        let this_link = link_for(&upstream, internal_token.clone());
        let upstream_completion = upstream_completion_of(upstream);

        let config = Arc::new(config);
        let (shared, completion_rx) = SharedState::new(
            name.clone(),
            status_tracker.clone(),
            Some(this_link.clone()),
            upstream_completion,
            output_tx.clone().map(|tx| (tx, QueueOwnership::Owned)),
            passthrough_token.clone(),
            config.callbacks.clone(),
        );

        for routine_index in 0..config.concurrency {
            let ctx = WorkerContext {
                executor_name: name.clone(),
                routine_index,
                config: config.clone(),
                internal_token: internal_token.clone(),
                input: input_rx.clone(),
                output: output_tx.clone(),
                status_tracker: status_tracker.clone(),
                input_index_counter: input_index_counter.clone(),
                output_index_counter: output_index_counter.clone(),
                chain_trackers: chain_trackers.clone(),
                chain_order: chain_order.clone(),
            };
            let handle = spawn_supervised(format!("{name}#{routine_index}"), run_worker(ctx, shared.clone()));
            tokio::spawn(supervise_worker(handle, shared.clone()));
        }

        Ok(ExecutorHandle {
            name,
            output: output_rx,
            completion_rx,
            passthrough_token,
            errored_signal: shared.errored_signal.clone(),
            status_tracker,
            chain_order,
            chain_trackers,
            upstream_link: this_link,
        })
    }

    /// Builds a batching executor (§4.4): the returned handle's output queue
    /// carries `Vec<Out>` windows rather than scalar `Out` values.
    pub fn build_batching<In, Out>(
        caller_token: CancellationToken,
        config: ExecutorConfig<In, Out>,
        input: ExecutorInput<In>,
    ) -> Result<ExecutorHandle<Vec<Out>>, ExecutorError>
    where
        In: Send + 'static,
        Out: Send + 'static,
    {
        config.validate()?;
        let batch = config.batching.ok_or_else(|| {
            ExecutorError::invalid_configuration("config has no batching adapter configured; use Executor::build")
        })?;

        let (input_rx, upstream) = resolve_input(config.processing_fn.consumes_input(), input)?;
        let name: Arc<str> = Arc::from(config.name.as_str());
        let input_index_counter = Arc::new(AtomicU64::new(0));
        let output_index_counter = Arc::new(AtomicU64::new(0));

        let (output_tx, output_rx) = mpsc::channel::<Vec<Out>>(config.output_queue_size);
        let out_probe = output_depth_probe(&output_tx);

        let status_tracker = Arc::new(StatusTracker::new(
            config.name.clone(),
            config.concurrency,
            input_index_counter.clone(),
            output_index_counter.clone(),
            input_depth_probe(&input_rx),
            Some(out_probe),
        ));

        let (chain_order, chain_trackers) = chain_for(&upstream, name.clone(), status_tracker.clone())?;
        let (internal_token, passthrough_token) = build_tokens(&caller_token, config.process_upstream_outputs_after_upstream_error);
        let this_link = link_for(&upstream, internal_token.clone());
        let upstream_completion = upstream_completion_of(upstream);

        let config = Arc::new(config);
        let (shared, completion_rx) = SharedState::new(
            name.clone(),
            status_tracker.clone(),
            Some(this_link.clone()),
            upstream_completion,
            Some((output_tx.clone(), QueueOwnership::Owned)),
            passthrough_token.clone(),
            config.callbacks.clone(),
        );

        for routine_index in 0..config.concurrency {
            let ctx: WorkerContext<In, Out> = WorkerContext {
                executor_name: name.clone(),
                routine_index,
                config: config.clone(),
                internal_token: internal_token.clone(),
                input: input_rx.clone(),
                output: None,
                status_tracker: status_tracker.clone(),
                input_index_counter: input_index_counter.clone(),
                output_index_counter: output_index_counter.clone(),
                chain_trackers: chain_trackers.clone(),
                chain_order: chain_order.clone(),
            };
            let handle = spawn_supervised(
                format!("{name}#{routine_index}"),
                run_batch_worker(ctx, shared.clone(), output_tx.clone(), batch),
            );
            tokio::spawn(supervise_worker(handle, shared.clone()));
        }

        Ok(ExecutorHandle {
            name,
            output: Some(output_rx),
            completion_rx,
            passthrough_token,
            errored_signal: shared.errored_signal.clone(),
            status_tracker,
            chain_order,
            chain_trackers,
            upstream_link: this_link,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_executor_domain::{ExecutorConfigBuilder, ProcessingFn};
    use std::time::Duration;

    fn identity_config(name: &str) -> ExecutorConfig<u32, u32> {
        ExecutorConfigBuilder::new(name, ProcessingFn::InputOutput(Arc::new(|_token, input, _meta| Box::pin(async move { Ok(input) }))))
            .concurrency(2)
            .empty_input_interval(Duration::from_millis(50))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn refill_mid_run_preserves_identity() {
        let (tx, rx) = mpsc::channel(8);
        let mut handle = Executor::build(CancellationToken::new(), identity_config("identity"), ExecutorInput::Queue(rx)).unwrap();

        for i in 0..4u32 {
            tx.send(i).await.unwrap();
        }
        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(handle.output_queue().unwrap().recv().await.unwrap());
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3]);

        for i in 4..8u32 {
            tx.send(i).await.unwrap();
        }
        drop(tx);
        let mut seen2 = Vec::new();
        while let Some(v) = handle.output_queue().unwrap().recv().await {
            seen2.push(v);
        }
        seen2.sort_unstable();
        assert_eq!(seen2, vec![4, 5, 6, 7]);

        assert!(handle.wait().await.is_ok());
        assert!(handle.cancellation_token().is_cancelled());
    }

    #[tokio::test]
    async fn rejects_mismatched_input_shape() {
        let sink: ProcessingFn<u32, u32> = ProcessingFn::InputOnly(Arc::new(|_token, _input, _meta| Box::pin(async { Ok(()) })));
        let config = ExecutorConfigBuilder::new("sink", sink).build().unwrap();
        let err = Executor::build(CancellationToken::new(), config, ExecutorInput::None).unwrap_err();
        assert!(matches!(err, ExecutorError::InvalidConfiguration(_)));
    }

    #[tokio::test]
    async fn two_stage_chain_propagates_output_as_next_stage_input() {
        let (tx, rx) = mpsc::channel(8);
        let first = Executor::build(CancellationToken::new(), identity_config("first"), ExecutorInput::Queue(rx)).unwrap();
        let mut second = Executor::build(CancellationToken::new(), identity_config("second"), ExecutorInput::Upstream(first)).unwrap();

        tx.send(7).await.unwrap();
        drop(tx);

        assert_eq!(second.output_queue().unwrap().recv().await, Some(7));
        assert!(second.wait().await.is_ok());
    }
}
