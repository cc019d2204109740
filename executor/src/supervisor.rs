// /////////////////////////////////////////////////////////////////////////////
// Pipeline Executor
// SPDX-License-Identifier: BSD-3-Clause
// /////////////////////////////////////////////////////////////////////////////

//! # Task Supervision Utilities
//!
//! Wraps `tokio::spawn` so worker tasks never fail silently: every task's
//! start and outcome is logged, and a raw panic that bypasses the worker's
//! own exit path is still turned into a recorded
//! `ExecutorError::PanicInProcessingFn` exit (via [`supervise_worker`])
//! rather than leaving the executor's "last worker out" count short
//! forever.

use std::sync::Arc;

use pipeline_executor_domain::ExecutorError;
use tokio::task::JoinHandle;
use tracing::{debug, error};

pub type SupervisedResult<T> = Result<T, ExecutorError>;

/// Spawns a supervised task, logging its start and outcome.
pub fn spawn_supervised<F, T>(task: impl Into<String>, fut: F) -> JoinHandle<SupervisedResult<T>>
where
    F: std::future::Future<Output = SupervisedResult<T>> + Send + 'static,
    T: Send + 'static,
{
    let task = task.into();
    debug!(%task, "task starting");
    tokio::spawn(async move {
        let result = fut.await;
        match &result {
            Ok(_) => debug!(%task, "task completed successfully"),
            Err(e) => debug!(%task, error = %e, "task exited with error"),
        }
        result
    })
}

/// Joins a worker task and, only if the task itself panicked before reaching
/// any of its own exit paths (so [`crate::coordinator::record_exit`] never
/// ran for it), records that exit here instead. A worker's normal exit
/// paths (`exit_success`/`exit_cancelled`/`exit_errored`) already call
/// `record_exit` themselves; this is the backstop for a raw panic in this
/// crate's own loop code, not in the user-supplied processing function
/// (those panics are already caught by `worker::invoke_processing_fn` and
/// surfaced as a normal `Err` return, which does go through `record_exit`).
pub async fn supervise_worker<ChannelOut>(
    handle: JoinHandle<SupervisedResult<()>>,
    shared: Arc<crate::coordinator::SharedState<ChannelOut>>,
) {
    if let Err(join_err) = handle.await {
        let err = if join_err.is_panic() {
            error!(error = %join_err, "worker task panicked outside its own exit path");
            ExecutorError::panic_in_processing_fn(format!("{join_err}"))
        } else {
            ExecutorError::internal_error(format!("worker task join failed: {join_err}"))
        };
        crate::coordinator::record_exit(&shared, &Err(err)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test-only: joins a supervised task, converting a panic into
    /// `PanicInProcessingFn` the way a worker's panic would be categorized.
    /// Production code never joins a worker handle directly — `Executor::build`
    /// hands it straight to `supervise_worker` instead — so this exists only
    /// to let these tests observe `spawn_supervised`'s outcome synchronously.
    async fn join_worker<T>(handle: JoinHandle<SupervisedResult<T>>) -> SupervisedResult<T> {
        match handle.await {
            Ok(result) => result,
            Err(join_err) if join_err.is_panic() => Err(ExecutorError::panic_in_processing_fn(format!("{join_err}"))),
            Err(join_err) => Err(ExecutorError::internal_error(format!("worker task join failed: {join_err}"))),
        }
    }

    #[tokio::test]
    async fn spawn_and_join_success() {
        let handle = spawn_supervised("test-success", async { Ok::<i32, ExecutorError>(42) });
        let result = join_worker(handle).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn spawn_and_join_error() {
        let handle = spawn_supervised("test-error", async { Err::<(), _>(ExecutorError::processing_failed("boom")) });
        let result = join_worker(handle).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn join_worker_converts_panic() {
        let handle: JoinHandle<SupervisedResult<()>> = tokio::spawn(async { panic!("widget exploded") });
        let result = join_worker(handle).await;
        assert!(matches!(result, Err(ExecutorError::PanicInProcessingFn(_))));
    }
}
