// /////////////////////////////////////////////////////////////////////////////
// Pipeline Executor
// SPDX-License-Identifier: BSD-3-Clause
// /////////////////////////////////////////////////////////////////////////////

//! # Routine Metadata
//!
//! The block passed to every invocation of a processing function, carrying
//! enough context to correlate this call with its executor, its routine, and
//! the rest of the chain.

use std::collections::HashMap;
use std::sync::Arc;

use crate::status::StatusTracker;

/// Metadata passed alongside the input (if any) to every processing-function
/// invocation.
///
/// `chain_trackers` and `chain_order` are built once per chain at
/// construction time (§4.3) and shared (via `Arc`) across every routine of
/// every stage, so cloning `RoutineMetadata` per call is cheap.
#[derive(Clone)]
pub struct RoutineMetadata {
    /// This executor's name.
    pub executor_name: Arc<str>,
    /// This routine's index within its executor, in `[0, concurrency)`.
    pub routine_index: usize,
    /// The global (executor-wide) input index assigned to this call, from
    /// the fetch-and-increment counter described in §4.1 step 1.
    pub global_input_index: u64,
    /// How many inputs *this* routine specifically has pulled so far,
    /// including the current one.
    pub routine_input_index: u64,
    /// This routine's own executor's status tracker.
    pub status_tracker: Arc<StatusTracker>,
    /// Name -> tracker for every executor in the chain, this one included.
    pub chain_trackers: Arc<HashMap<Arc<str>, Arc<StatusTracker>>>,
    /// Chain order (upstream-first), as executor names, for callers that
    /// want the trackers in pipeline order rather than by name.
    pub chain_order: Arc<Vec<Arc<str>>>,
}

impl RoutineMetadata {
    /// Look up another executor's status tracker by name, anywhere in the
    /// chain.
    pub fn tracker_for(&self, executor_name: &str) -> Option<&Arc<StatusTracker>> {
        self.chain_trackers.get(executor_name)
    }

    /// All trackers in upstream-first chain order.
    pub fn ordered_trackers(&self) -> Vec<&Arc<StatusTracker>> {
        self.chain_order.iter().filter_map(|name| self.chain_trackers.get(name)).collect()
    }
}

impl std::fmt::Debug for RoutineMetadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutineMetadata")
            .field("executor_name", &self.executor_name)
            .field("routine_index", &self.routine_index)
            .field("global_input_index", &self.global_input_index)
            .field("routine_input_index", &self.routine_input_index)
            .finish()
    }
}
