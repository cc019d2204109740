// /////////////////////////////////////////////////////////////////////////////
// Pipeline Executor
// SPDX-License-Identifier: BSD-3-Clause
// /////////////////////////////////////////////////////////////////////////////

//! # Status Tracker
//!
//! Per-executor observability: the live state of every routine and live
//! queue-depth probes. Writers are worker routines updating only their own
//! slot, so there is no cross-routine write contention; probes are
//! lock-free reads of `AtomicUsize`/`AtomicU64` counters.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Lifecycle state of a single worker routine.
///
/// `Initializing -> Running -> (Finished | Errored | Cancelled)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutineState {
    Initializing,
    Running,
    Finished,
    Errored,
    Cancelled,
}

impl RoutineState {
    fn to_u8(self) -> u8 {
        match self {
            RoutineState::Initializing => 0,
            RoutineState::Running => 1,
            RoutineState::Finished => 2,
            RoutineState::Errored => 3,
            RoutineState::Cancelled => 4,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => RoutineState::Initializing,
            1 => RoutineState::Running,
            2 => RoutineState::Finished,
            3 => RoutineState::Errored,
            _ => RoutineState::Cancelled,
        }
    }
}

impl fmt::Display for RoutineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RoutineState::Initializing => "initializing",
            RoutineState::Running => "running",
            RoutineState::Finished => "finished",
            RoutineState::Errored => "errored",
            RoutineState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// A queue-depth probe: a cheap, lock-free read of "how many items are
/// currently sitting in this queue". Kept as a boxed closure so this crate
/// never has to name `tokio::sync::mpsc` directly; the `pipeline-executor`
/// crate supplies the real probe at construction time.
pub type DepthProbe = Arc<dyn Fn() -> usize + Send + Sync>;

/// Per-executor observability object.
///
/// Owns one atomic state slot per routine plus the shared input/output
/// index counters (the same `AtomicU64`s the worker loop uses for
/// fetch-and-increment, surfaced here read-only for diagnostics).
pub struct StatusTracker {
    name: String,
    num_routines_running: AtomicUsize,
    routine_states: Vec<AtomicU8Cell>,
    input_index: Arc<AtomicU64>,
    output_index: Arc<AtomicU64>,
    input_depth_probe: DepthProbe,
    output_depth_probe: Option<DepthProbe>,
}

/// A single-byte atomic cell. `std::sync::atomic::AtomicU8` is available on
/// every platform this crate targets, but spelling it out as a newtype keeps
/// the intent ("one routine's state") obvious at the call site.
struct AtomicU8Cell(std::sync::atomic::AtomicU8);

impl AtomicU8Cell {
    fn new(state: RoutineState) -> Self {
        Self(std::sync::atomic::AtomicU8::new(state.to_u8()))
    }
}

impl StatusTracker {
    /// Builds a tracker for `concurrency` routines, all initially
    /// `Initializing`.
    pub fn new(
        name: impl Into<String>,
        concurrency: usize,
        input_index: Arc<AtomicU64>,
        output_index: Arc<AtomicU64>,
        input_depth_probe: DepthProbe,
        output_depth_probe: Option<DepthProbe>,
    ) -> Self {
        let routine_states = (0..concurrency).map(|_| AtomicU8Cell::new(RoutineState::Initializing)).collect();
        Self {
            name: name.into(),
            num_routines_running: AtomicUsize::new(concurrency),
            routine_states,
            input_index,
            output_index,
            input_depth_probe,
            output_depth_probe,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Updates routine `idx`'s state. Called only by the owning routine.
    pub fn set_routine_state(&self, idx: usize, state: RoutineState) {
        if let Some(cell) = self.routine_states.get(idx) {
            cell.0.store(state.to_u8(), Ordering::Release);
        }
    }

    pub fn routine_state(&self, idx: usize) -> Option<RoutineState> {
        self.routine_states.get(idx).map(|c| RoutineState::from_u8(c.0.load(Ordering::Acquire)))
    }

    /// Snapshot of every routine's state, in routine-index order.
    pub fn routine_states(&self) -> Vec<RoutineState> {
        self.routine_states.iter().map(|c| RoutineState::from_u8(c.0.load(Ordering::Acquire))).collect()
    }

    pub fn num_routines_running(&self) -> usize {
        self.num_routines_running.load(Ordering::Acquire)
    }

    /// Decrements the running count and returns the new value. Called once
    /// per routine, on exit.
    pub fn routine_exited(&self) -> usize {
        self.num_routines_running.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub fn concurrency(&self) -> usize {
        self.routine_states.len()
    }

    /// Total input-pull attempts so far (the next fetch-and-increment value).
    pub fn input_index(&self) -> u64 {
        self.input_index.load(Ordering::Acquire)
    }

    /// Total outputs labeled so far.
    pub fn output_index(&self) -> u64 {
        self.output_index.load(Ordering::Acquire)
    }

    /// Current number of items sitting in the input queue.
    pub fn input_queue_depth(&self) -> usize {
        (self.input_depth_probe)()
    }

    /// Current number of items sitting in the output queue, or `None` if
    /// this executor has no output queue.
    pub fn output_queue_depth(&self) -> Option<usize> {
        self.output_depth_probe.as_ref().map(|probe| probe())
    }
}

impl fmt::Debug for StatusTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusTracker")
            .field("name", &self.name)
            .field("num_routines_running", &self.num_routines_running())
            .field("routine_states", &self.routine_states())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(concurrency: usize) -> StatusTracker {
        StatusTracker::new(
            "stage",
            concurrency,
            Arc::new(AtomicU64::new(0)),
            Arc::new(AtomicU64::new(0)),
            Arc::new(|| 0),
            None,
        )
    }

    #[test]
    fn starts_initializing_with_full_concurrency() {
        let t = tracker(3);
        assert_eq!(t.num_routines_running(), 3);
        assert!(t.routine_states().iter().all(|s| *s == RoutineState::Initializing));
    }

    #[test]
    fn routine_exit_decrements_and_only_owner_writes_state() {
        let t = tracker(2);
        t.set_routine_state(0, RoutineState::Running);
        t.set_routine_state(1, RoutineState::Running);
        assert_eq!(t.routine_exited(), 1);
        t.set_routine_state(0, RoutineState::Finished);
        assert_eq!(t.routine_exited(), 0);
        t.set_routine_state(1, RoutineState::Finished);
        assert_eq!(t.routine_state(0), Some(RoutineState::Finished));
        assert_eq!(t.routine_state(1), Some(RoutineState::Finished));
    }

    #[test]
    fn output_depth_is_none_without_a_probe() {
        let t = tracker(1);
        assert_eq!(t.output_queue_depth(), None);
    }
}
