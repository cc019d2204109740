// /////////////////////////////////////////////////////////////////////////////
// Pipeline Executor
// SPDX-License-Identifier: BSD-3-Clause
// /////////////////////////////////////////////////////////////////////////////

//! # Lifecycle Coordinator
//!
//! The per-executor exit protocol (§4.2). Every worker, on exit, calls
//! [`record_exit`] with its own terminal result. The `StatusTracker`'s
//! atomic `routine_exited` decrement is what already guarantees exactly one
//! routine observes the zero count — there is no separate supervisor task
//! racing the workers for this: the decrement itself *is* the
//! once-only gate the spec describes, so the worker that sees zero simply
//! performs the aggregate work inline before returning.

use std::sync::Arc;

use parking_lot::Mutex;
use pipeline_executor_domain::callback::{Callbacks, ExecutorCancelledContext, ExecutorErrorContext, ExecutorSuccessContext};
use pipeline_executor_domain::{ExecutorError, QueueOwnership, StatusTracker};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::chain::UpstreamLink;

/// The externally observable completion signal an `ExecutorHandle::wait`
/// reads and an upstream link's downstream stage adopts (§4.2 "wait
/// upstream and adopt its error").
pub type CompletionReceiver = watch::Receiver<Option<Result<(), ExecutorError>>>;
pub type CompletionSender = watch::Sender<Option<Result<(), ExecutorError>>>;

/// Blocks until an upstream executor's completion watch reports a result.
pub async fn wait_for_completion(rx: &mut CompletionReceiver) -> Result<(), ExecutorError> {
    loop {
        if let Some(result) = rx.borrow().clone() {
            return result;
        }
        if rx.changed().await.is_err() {
            // Sender dropped without ever publishing a result; this only
            // happens if every one of the upstream executor's routines
            // panicked before `record_exit` ran for them, which
            // `supervisor::supervise_worker` already reports through this
            // stage's own worker loop. Treat as success here to avoid
            // double-reporting the same failure.
            return Ok(());
        }
    }
}

/// The three possible aggregate outcomes from §4.2's table.
#[derive(Debug, Clone)]
pub enum Disposition {
    Success,
    Cancelled(ExecutorError),
    Errored(ExecutorError),
}

fn compute_disposition(local_error: Option<ExecutorError>, upstream_result: Option<Result<(), ExecutorError>>) -> Disposition {
    match local_error {
        None => match upstream_result {
            Some(Err(upstream_err)) => Disposition::Cancelled(ExecutorError::upstream_failed(upstream_err.to_string())),
            _ => Disposition::Success,
        },
        Some(err) if err.is_cancellation() => {
            let adopted = match upstream_result {
                Some(Err(upstream_err)) => upstream_err,
                _ => err,
            };
            Disposition::Cancelled(adopted)
        }
        Some(err) => Disposition::Errored(err),
    }
}

fn fire_disposition_callback(callbacks: &Callbacks, executor_name: &Arc<str>, disposition: &Disposition) -> Option<ExecutorError> {
    match disposition {
        Disposition::Success => {
            callbacks.on_executor_success.as_ref().and_then(|cb| cb(&ExecutorSuccessContext { executor_name: executor_name.clone() }))
        }
        Disposition::Cancelled(err) => callbacks
            .on_executor_cancelled
            .as_ref()
            .and_then(|cb| cb(&ExecutorCancelledContext { executor_name: executor_name.clone(), error: err.clone() })),
        Disposition::Errored(err) => callbacks
            .on_executor_error
            .as_ref()
            .and_then(|cb| cb(&ExecutorErrorContext { executor_name: executor_name.clone(), error: err.clone() })),
    }
}

/// Everything the exit protocol needs, shared (via `Arc`) across every
/// routine of one executor.
pub struct SharedState<Out> {
    pub executor_name: Arc<str>,
    pub status_tracker: Arc<StatusTracker>,
    pub exit_error_slot: Mutex<Option<ExecutorError>>,
    pub upstream_link: Option<Arc<UpstreamLink>>,
    pub upstream_completion: Option<Mutex<CompletionReceiver>>,
    pub owned_output: Mutex<Option<mpsc::Sender<Out>>>,
    pub passthrough_token: CancellationToken,
    pub errored_signal: CancellationToken,
    pub completion_tx: CompletionSender,
    pub callbacks: Callbacks,
}

impl<Out> SharedState<Out> {
    pub fn new(
        executor_name: Arc<str>,
        status_tracker: Arc<StatusTracker>,
        upstream_link: Option<Arc<UpstreamLink>>,
        upstream_completion: Option<CompletionReceiver>,
        output: Option<(mpsc::Sender<Out>, QueueOwnership)>,
        passthrough_token: CancellationToken,
        callbacks: Callbacks,
    ) -> (Arc<Self>, CompletionReceiver) {
        let (completion_tx, completion_rx) = watch::channel(None);
        let owned_output = match output {
            Some((sender, QueueOwnership::Owned)) => Some(sender),
            _ => None,
        };
        let shared = Arc::new(Self {
            executor_name,
            status_tracker,
            exit_error_slot: Mutex::new(None),
            upstream_link,
            upstream_completion: upstream_completion.map(Mutex::new),
            owned_output: Mutex::new(owned_output),
            passthrough_token,
            errored_signal: CancellationToken::new(),
            completion_tx,
            callbacks,
        });
        (shared, completion_rx)
    }
}

/// Called by a worker routine as the very last thing it does before
/// returning. `local_result` is this routine's own terminal `Ok`/`Err`; the
/// routine's own `RoutineState` (Finished/Errored/Cancelled) must already
/// have been set by the caller.
pub async fn record_exit<Out>(shared: &Arc<SharedState<Out>>, local_result: &Result<(), ExecutorError>) {
    {
        let mut slot = shared.exit_error_slot.lock();
        if slot.is_none() {
            if let Err(err) = local_result {
                *slot = Some(err.clone());
            }
        }
    }

    if local_result.is_err() {
        if let Some(link) = &shared.upstream_link {
            link.cancel_all();
        }
    }

    if shared.status_tracker.routine_exited() != 0 {
        return;
    }

    finalize(shared).await;
}

async fn finalize<Out>(shared: &Arc<SharedState<Out>>) {
    let local_error = shared.exit_error_slot.lock().clone();

    let upstream_result = match &shared.upstream_completion {
        Some(rx) => {
            let mut rx = rx.lock().clone();
            Some(wait_for_completion(&mut rx).await)
        }
        None => None,
    };

    let disposition = compute_disposition(local_error, upstream_result);
    let overridden = fire_disposition_callback(&shared.callbacks, &shared.executor_name, &disposition);

    if let Some(sender) = shared.owned_output.lock().take() {
        drop(sender);
    }

    let final_result: Result<(), ExecutorError> = match disposition {
        Disposition::Success => match overridden {
            Some(err) => Err(err),
            None => Ok(()),
        },
        Disposition::Cancelled(err) => Err(overridden.unwrap_or(err)),
        Disposition::Errored(err) => Err(overridden.unwrap_or(err)),
    };

    match &final_result {
        Ok(()) => {}
        Err(err) if err.is_cancellation() => warn!(executor = %shared.executor_name, category = err.category(), "executor cancelled"),
        Err(err) => error!(executor = %shared.executor_name, category = err.category(), error = %err, "executor errored"),
    }

    if let Err(err) = &final_result {
        if !err.is_cancellation() {
            shared.errored_signal.cancel();
        }
        shared.passthrough_token.cancel();
    }

    let _ = shared.completion_tx.send(Some(final_result));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_disposition_when_no_local_or_upstream_error() {
        assert!(matches!(compute_disposition(None, None), Disposition::Success));
        assert!(matches!(compute_disposition(None, Some(Ok(()))), Disposition::Success));
    }

    #[test]
    fn upstream_error_with_no_local_error_is_cancelled_not_errored() {
        let d = compute_disposition(None, Some(Err(ExecutorError::processing_failed("upstream boom"))));
        assert!(matches!(d, Disposition::Cancelled(_)));
    }

    #[test]
    fn local_cancellation_adopts_upstream_error_if_present() {
        let d = compute_disposition(Some(ExecutorError::cancelled("local")), Some(Err(ExecutorError::processing_failed("upstream"))));
        match d {
            Disposition::Cancelled(err) => assert!(matches!(err, ExecutorError::ProcessingFailed(_))),
            _ => panic!("expected Cancelled"),
        }
    }

    #[test]
    fn local_cancellation_keeps_own_error_without_upstream_failure() {
        let d = compute_disposition(Some(ExecutorError::cancelled("local")), Some(Ok(())));
        match d {
            Disposition::Cancelled(err) => assert!(err.is_cancellation()),
            _ => panic!("expected Cancelled"),
        }
    }

    #[test]
    fn real_local_error_wins_and_discards_upstream() {
        let d = compute_disposition(Some(ExecutorError::processing_failed("local")), Some(Err(ExecutorError::processing_failed("upstream"))));
        match d {
            Disposition::Errored(err) => assert_eq!(err.to_string(), "processing failed: local"),
            _ => panic!("expected Errored"),
        }
    }
}
