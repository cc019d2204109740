// /////////////////////////////////////////////////////////////////////////////
// Pipeline Executor
// SPDX-License-Identifier: BSD-3-Clause
// /////////////////////////////////////////////////////////////////////////////

//! # Callback Plumbing
//!
//! Context structs passed to each of the eight optional lifecycle callbacks
//! (§3, §6), plus the `Callbacks` bundle an `ExecutorConfig` carries.
//!
//! Callbacks are treated as opaque, synchronous, `Send + Sync` closures: the
//! spec never requires them to suspend, and keeping them synchronous means a
//! callback can never itself introduce a new cancellation-race to reason
//! about. Each is wrapped in `Arc` so cloning a `Callbacks` bundle across
//! `concurrency` worker tasks is cheap.

use std::sync::Arc;

use crate::error::ExecutorError;
use crate::metadata::RoutineMetadata;

/// Fired when a worker's idle timer elapses without a value on the input
/// queue. Diagnostic only — it cannot abort the routine or replace an error.
#[derive(Debug, Clone)]
pub struct EmptyInputContext {
    pub executor_name: Arc<str>,
    pub routine_metadata: RoutineMetadata,
}

/// Fired when a worker's output-send timer elapses because the output queue
/// is full. A `Some` return aborts the routine with that error.
#[derive(Debug, Clone)]
pub struct FullOutputContext {
    pub executor_name: Arc<str>,
    pub routine_metadata: RoutineMetadata,
}

/// Fired when the processing function returns an error (not a cancellation).
/// A `Some` return replaces the error the routine exits with.
#[derive(Clone)]
pub struct RoutineErrorContext {
    pub executor_name: Arc<str>,
    pub routine_metadata: RoutineMetadata,
    pub error: ExecutorError,
}

/// Fired when a routine exits cleanly because its input queue closed and
/// drained. Diagnostic only.
#[derive(Debug, Clone)]
pub struct RoutineSuccessContext {
    pub executor_name: Arc<str>,
    pub routine_metadata: RoutineMetadata,
}

/// Fired when a routine exits via the cancellation path. Diagnostic only.
#[derive(Clone)]
pub struct RoutineCancelledContext {
    pub executor_name: Arc<str>,
    pub routine_metadata: RoutineMetadata,
    pub error: ExecutorError,
}

/// Fired once, by the last worker out, when the executor's aggregate
/// disposition (§4.2) is a real error. A `Some` return replaces the
/// surfaced error.
#[derive(Debug, Clone)]
pub struct ExecutorErrorContext {
    pub executor_name: Arc<str>,
    pub error: ExecutorError,
}

/// Fired once, by the last worker out, when every routine finished cleanly
/// and no upstream error was observed. A `Some` return turns a clean exit
/// into an error.
#[derive(Debug, Clone)]
pub struct ExecutorSuccessContext {
    pub executor_name: Arc<str>,
}

/// Fired once, by the last worker out, when the aggregate disposition is
/// `cancelled` (whether from this executor's own cancellation or an adopted
/// upstream error). A `Some` return replaces the surfaced error.
#[derive(Debug, Clone)]
pub struct ExecutorCancelledContext {
    pub executor_name: Arc<str>,
    pub error: ExecutorError,
}

pub type OnEmptyInput = Arc<dyn Fn(&EmptyInputContext) + Send + Sync>;
pub type OnFullOutput = Arc<dyn Fn(&FullOutputContext) -> Option<ExecutorError> + Send + Sync>;
pub type OnRoutineError = Arc<dyn Fn(&RoutineErrorContext) -> Option<ExecutorError> + Send + Sync>;
pub type OnRoutineSuccess = Arc<dyn Fn(&RoutineSuccessContext) + Send + Sync>;
pub type OnRoutineCancelled = Arc<dyn Fn(&RoutineCancelledContext) + Send + Sync>;
pub type OnExecutorError = Arc<dyn Fn(&ExecutorErrorContext) -> Option<ExecutorError> + Send + Sync>;
pub type OnExecutorSuccess = Arc<dyn Fn(&ExecutorSuccessContext) -> Option<ExecutorError> + Send + Sync>;
pub type OnExecutorCancelled = Arc<dyn Fn(&ExecutorCancelledContext) -> Option<ExecutorError> + Send + Sync>;

/// The full set of optional lifecycle callbacks an `ExecutorConfig` may
/// carry. Every field defaults to `None`.
#[derive(Clone, Default)]
pub struct Callbacks {
    pub on_empty_input: Option<OnEmptyInput>,
    pub on_full_output: Option<OnFullOutput>,
    pub on_routine_error: Option<OnRoutineError>,
    pub on_routine_success: Option<OnRoutineSuccess>,
    pub on_routine_cancelled: Option<OnRoutineCancelled>,
    pub on_executor_error: Option<OnExecutorError>,
    pub on_executor_success: Option<OnExecutorSuccess>,
    pub on_executor_cancelled: Option<OnExecutorCancelled>,
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_empty_input", &self.on_empty_input.is_some())
            .field("on_full_output", &self.on_full_output.is_some())
            .field("on_routine_error", &self.on_routine_error.is_some())
            .field("on_routine_success", &self.on_routine_success.is_some())
            .field("on_routine_cancelled", &self.on_routine_cancelled.is_some())
            .field("on_executor_error", &self.on_executor_error.is_some())
            .field("on_executor_success", &self.on_executor_success.is_some())
            .field("on_executor_cancelled", &self.on_executor_cancelled.is_some())
            .finish()
    }
}
