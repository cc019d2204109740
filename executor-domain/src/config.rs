// /////////////////////////////////////////////////////////////////////////////
// Pipeline Executor
// SPDX-License-Identifier: BSD-3-Clause
// /////////////////////////////////////////////////////////////////////////////

//! # Executor Configuration
//!
//! The immutable configuration an executor is built from (§3), including the
//! closed, four-variant `ProcessingFn` sum type (§9 "Variant dispatch").
//!
//! Queue *handles* (the actual `tokio::sync::mpsc` sender/receiver pair) are
//! deliberately not part of this crate's `ExecutorConfig` — they are wired up
//! by `pipeline_executor::Executor::build`, which is the only place that
//! knows whether a queue was supplied externally or needs to be created.
//! This config only carries the *shape* (does this executor consume input,
//! does it produce output) and the tuning knobs.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::callback::Callbacks;
use crate::error::ExecutorError;
use crate::metadata::RoutineMetadata;

/// Default output queue capacity, expressed as a multiple of `concurrency`.
pub const DEFAULT_OUTPUT_QUEUE_SIZE_MULTIPLIER: usize = 2;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Whether an executor created a queue itself (and must close it) or
/// received it from the caller / upstream executor (and must never close
/// it). See the queue-ownership invariant in §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOwnership {
    Owned,
    Borrowed,
}

/// The closed sum type of processing-function shapes (§3, §9).
///
/// Exhaustively matched by the worker loop; there is no `dyn Any` dispatch
/// or runtime type reflection anywhere in this crate.
#[derive(Clone)]
pub enum ProcessingFn<In, Out> {
    /// Consumes one input, produces one output.
    InputOutput(
        Arc<dyn Fn(CancellationToken, In, RoutineMetadata) -> BoxFuture<'static, Result<Out, ExecutorError>> + Send + Sync>,
    ),
    /// Consumes one input, produces nothing (a sink).
    InputOnly(Arc<dyn Fn(CancellationToken, In, RoutineMetadata) -> BoxFuture<'static, Result<(), ExecutorError>> + Send + Sync>),
    /// Consumes nothing, produces one output (a continuous producer).
    OutputOnly(Arc<dyn Fn(CancellationToken, RoutineMetadata) -> BoxFuture<'static, Result<Out, ExecutorError>> + Send + Sync>),
    /// Consumes nothing, produces nothing (runs for side effects until
    /// cancelled or erroring).
    Neither(Arc<dyn Fn(CancellationToken, RoutineMetadata) -> BoxFuture<'static, Result<(), ExecutorError>> + Send + Sync>),
}

impl<In, Out> ProcessingFn<In, Out> {
    /// True for variants that pull from the input queue.
    pub fn consumes_input(&self) -> bool {
        matches!(self, ProcessingFn::InputOutput(_) | ProcessingFn::InputOnly(_))
    }

    /// True for variants that push to the output queue.
    pub fn produces_output(&self) -> bool {
        matches!(self, ProcessingFn::InputOutput(_) | ProcessingFn::OutputOnly(_))
    }
}

/// Batching-adapter tuning (§4.4). Present only when the executor is built
/// as the batching variant.
#[derive(Debug, Clone, Copy)]
pub struct BatchConfig {
    pub batch_size: usize,
    pub batch_max_age: Duration,
}

/// Immutable executor configuration (§3), minus queue handles.
#[derive(Clone)]
pub struct ExecutorConfig<In, Out> {
    pub name: String,
    pub concurrency: usize,
    pub processing_fn: ProcessingFn<In, Out>,
    pub output_queue_size: usize,
    pub ignore_zero_value_outputs: bool,
    pub process_upstream_outputs_after_upstream_error: bool,
    pub empty_input_interval: Duration,
    pub full_output_interval: Duration,
    pub batching: Option<BatchConfig>,
    pub callbacks: Callbacks,
}

impl<In, Out> ExecutorConfig<In, Out> {
    /// Construction-time validation (§4.3): shape-checks that don't depend
    /// on concrete queue handles. `Executor::build` layers queue-presence
    /// checks on top of this.
    pub fn validate(&self) -> Result<(), ExecutorError> {
        if self.name.trim().is_empty() {
            return Err(ExecutorError::invalid_configuration("executor name must not be empty"));
        }
        if self.concurrency == 0 {
            return Err(ExecutorError::invalid_configuration("concurrency must be at least 1"));
        }
        if let Some(batch) = self.batching {
            if !self.processing_fn.produces_output() {
                return Err(ExecutorError::invalid_configuration(
                    "batching requires a processing function variant that produces output",
                ));
            }
            if batch.batch_size == 0 {
                return Err(ExecutorError::invalid_configuration("batch_size must be at least 1"));
            }
        }
        Ok(())
    }
}

/// Builder for `ExecutorConfig`, mirroring the teacher codebase's preference
/// for validated construction over public mutable structs.
pub struct ExecutorConfigBuilder<In, Out> {
    name: String,
    concurrency: usize,
    processing_fn: ProcessingFn<In, Out>,
    output_queue_size: Option<usize>,
    ignore_zero_value_outputs: bool,
    process_upstream_outputs_after_upstream_error: bool,
    empty_input_interval: Duration,
    full_output_interval: Duration,
    batching: Option<BatchConfig>,
    callbacks: Callbacks,
}

impl<In, Out> ExecutorConfigBuilder<In, Out> {
    pub fn new(name: impl Into<String>, processing_fn: ProcessingFn<In, Out>) -> Self {
        Self {
            name: name.into(),
            concurrency: 1,
            processing_fn,
            output_queue_size: None,
            ignore_zero_value_outputs: false,
            process_upstream_outputs_after_upstream_error: false,
            empty_input_interval: Duration::from_secs(30),
            full_output_interval: Duration::from_secs(30),
            batching: None,
            callbacks: Callbacks::default(),
        }
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn output_queue_size(mut self, size: usize) -> Self {
        self.output_queue_size = Some(size);
        self
    }

    pub fn ignore_zero_value_outputs(mut self, ignore: bool) -> Self {
        self.ignore_zero_value_outputs = ignore;
        self
    }

    pub fn process_upstream_outputs_after_upstream_error(mut self, enabled: bool) -> Self {
        self.process_upstream_outputs_after_upstream_error = enabled;
        self
    }

    pub fn empty_input_interval(mut self, interval: Duration) -> Self {
        self.empty_input_interval = interval;
        self
    }

    pub fn full_output_interval(mut self, interval: Duration) -> Self {
        self.full_output_interval = interval;
        self
    }

    pub fn batching(mut self, batch_size: usize, batch_max_age: Duration) -> Self {
        self.batching = Some(BatchConfig { batch_size, batch_max_age });
        self
    }

    pub fn callbacks(mut self, callbacks: Callbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn build(self) -> Result<ExecutorConfig<In, Out>, ExecutorError> {
        let output_queue_size =
            self.output_queue_size.unwrap_or(self.concurrency * DEFAULT_OUTPUT_QUEUE_SIZE_MULTIPLIER);
        let config = ExecutorConfig {
            name: self.name,
            concurrency: self.concurrency,
            processing_fn: self.processing_fn,
            output_queue_size,
            ignore_zero_value_outputs: self.ignore_zero_value_outputs,
            process_upstream_outputs_after_upstream_error: self.process_upstream_outputs_after_upstream_error,
            empty_input_interval: self.empty_input_interval,
            full_output_interval: self.full_output_interval,
            batching: self.batching,
            callbacks: self.callbacks,
        };
        config.validate()?;
        Ok(config)
    }
}
