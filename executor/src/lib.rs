// /////////////////////////////////////////////////////////////////////////////
// Pipeline Executor
// SPDX-License-Identifier: BSD-3-Clause
// /////////////////////////////////////////////////////////////////////////////

//! # Pipeline Executor
//!
//! The concurrent runtime half of the pipeline executor: worker pools over
//! bounded `tokio::sync::mpsc` queues, the batching adapter, and the
//! per-executor lifecycle coordinator that `pipeline-executor-domain`'s
//! config and callback types get wired into by [`Executor::build`] and
//! [`Executor::build_batching`].
//!
//! ## Module Structure
//!
//! - [`handle`]: `Executor::build`/`build_batching` and the `ExecutorHandle`/
//!   `ExecutorInput` types user code interacts with directly.
//! - [`worker`]: the per-routine pull-process-push state machine.
//! - [`batch`]: the batching adapter's own worker loop, since its output
//!   channel's element type differs from the processing function's.
//! - [`coordinator`]: the per-executor exit protocol and aggregate
//!   disposition once every routine has exited.
//! - [`chain`]: the upstream-cancel chain and the chain-wide name -> tracker
//!   map every `RoutineMetadata` carries.
//! - [`supervisor`]: task-spawning wrapper that converts a worker panic into
//!   a reported `ExecutorError` instead of a silently dropped task.

pub mod batch;
pub mod chain;
pub mod coordinator;
pub mod handle;
pub mod supervisor;
pub mod worker;

pub use handle::{Executor, ExecutorHandle, ExecutorInput};
pub use pipeline_executor_domain::{
    BatchConfig, Callbacks, ExecutorConfig, ExecutorConfigBuilder, ExecutorError, ProcessingFn, QueueOwnership,
    RoutineMetadata, RoutineState, StatusTracker,
};

/// Re-exported so downstream crates never need a direct `tokio-util`
/// dependency just to name the cancellation token type passed to
/// `Executor::build`.
pub use tokio_util::sync::CancellationToken;
