//! # Pipeline Executor Domain
//!
//! The model types shared by every executor in a chain: the error taxonomy,
//! the immutable configuration an executor is built from, the per-routine
//! metadata passed into every invocation of a processing function, and the
//! status tracker each executor exposes for observability.
//!
//! This crate is deliberately thin and runtime-agnostic beyond the
//! cancellation hierarchy (`tokio_util::sync::CancellationToken`, re-exported
//! here because `RoutineMetadata` and the processing-function contract both
//! name it). Worker loops, queues, and task spawning live in the
//! `pipeline-executor` crate; this crate has no `tokio` runtime dependency.
//!
//! ## Module Structure
//!
//! - [`error`]: `ExecutorError`, the single error type surfaced anywhere in a
//!   chain.
//! - [`config`]: `ExecutorConfig`, the four-variant `ProcessingFn` sum type,
//!   and the construction-time validation that rejects shape mismatches.
//! - [`metadata`]: `RoutineMetadata`, passed to every processing-function
//!   invocation.
//! - [`status`]: `StatusTracker` and `RoutineState`, the per-executor
//!   observability surface.
//! - [`callback`]: the context structs passed to each of the optional
//!   lifecycle callbacks.

pub mod callback;
pub mod config;
pub mod error;
pub mod metadata;
pub mod status;

pub use callback::Callbacks;
pub use config::{BatchConfig, ExecutorConfig, ExecutorConfigBuilder, ProcessingFn, QueueOwnership};
pub use error::ExecutorError;
pub use metadata::RoutineMetadata;
pub use status::{RoutineState, StatusTracker};

/// Re-exported so downstream crates and user code never need a direct
/// `tokio-util` dependency just to name the cancellation token type.
pub use tokio_util::sync::CancellationToken;
