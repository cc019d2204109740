// /////////////////////////////////////////////////////////////////////////////
// Pipeline Executor
// SPDX-License-Identifier: BSD-3-Clause
// /////////////////////////////////////////////////////////////////////////////

//! # Executor Error System
//!
//! A single, flat, categorized error type shared by every executor in a
//! chain. Each variant corresponds to one of the disjoint error kinds an
//! executor can surface (construction-time, per-routine, or per-executor).
//!
//! ## Propagation policy
//!
//! - The first per-executor error wins; later workers' errors are dropped.
//! - Local errors dominate upstream errors; upstream errors only surface when
//!   this executor itself succeeded.
//! - Cancellations are subordinate to real errors within the same executor.
//! - Callbacks may replace an error but a `None` return always preserves the
//!   original — callbacks never silently swallow an error.

use thiserror::Error;

/// Errors surfaced by the executor engine.
#[derive(Error, Debug, Clone)]
pub enum ExecutorError {
    /// Config was rejected at `build()` time; no worker ever ran.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The processing function returned `Err`.
    #[error("processing failed: {0}")]
    ProcessingFailed(String),

    /// The processing function panicked; the panic payload (if a string) is
    /// preserved as the message.
    #[error("panic in processing function: {0}")]
    PanicInProcessingFn(String),

    /// A callback (`on_routine_error`, `on_executor_error`, ...) returned
    /// `Some(err)`, replacing whatever error triggered it.
    #[error("callback returned error: {0}")]
    CallbackFailed(String),

    /// The caller's token, the internal token, or the upstream-cancel chain
    /// was triggered.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// The last worker out observed a non-`None` result from `wait()` on the
    /// upstream handle.
    #[error("upstream stage failed: {0}")]
    UpstreamFailed(String),

    /// A task join failed for a reason other than a captured panic (for
    /// example the runtime was shut down out from under the task).
    #[error("internal error: {0}")]
    InternalError(String),
}

impl ExecutorError {
    /// Creates an invalid-configuration error.
    pub fn invalid_configuration(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    /// Creates a processing-failed error.
    pub fn processing_failed(msg: impl Into<String>) -> Self {
        Self::ProcessingFailed(msg.into())
    }

    /// Creates a panic-in-processing-fn error.
    pub fn panic_in_processing_fn(msg: impl Into<String>) -> Self {
        Self::PanicInProcessingFn(msg.into())
    }

    /// Creates a callback-failed error.
    pub fn callback_failed(msg: impl Into<String>) -> Self {
        Self::CallbackFailed(msg.into())
    }

    /// Creates a cancelled error.
    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    /// Creates an upstream-failed error wrapping the upstream's message.
    pub fn upstream_failed(msg: impl Into<String>) -> Self {
        Self::UpstreamFailed(msg.into())
    }

    /// Creates an internal error.
    pub fn internal_error(msg: impl Into<String>) -> Self {
        Self::InternalError(msg.into())
    }

    /// True for errors arising from cancellation rather than a genuine
    /// processing failure. Used by the coordinator to choose between the
    /// `Errored` and `Cancelled` routine-state transitions.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, ExecutorError::Cancelled(_))
    }

    /// Coarse category, used for structured logging fields.
    pub fn category(&self) -> &'static str {
        match self {
            ExecutorError::InvalidConfiguration(_) => "configuration",
            ExecutorError::ProcessingFailed(_) => "processing",
            ExecutorError::PanicInProcessingFn(_) => "panic",
            ExecutorError::CallbackFailed(_) => "callback",
            ExecutorError::Cancelled(_) => "cancellation",
            ExecutorError::UpstreamFailed(_) => "upstream",
            ExecutorError::InternalError(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_matches_variant() {
        assert_eq!(ExecutorError::invalid_configuration("x").category(), "configuration");
        assert_eq!(ExecutorError::cancelled("x").category(), "cancellation");
        assert!(ExecutorError::cancelled("x").is_cancellation());
        assert!(!ExecutorError::processing_failed("x").is_cancellation());
    }
}
