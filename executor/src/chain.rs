// /////////////////////////////////////////////////////////////////////////////
// Pipeline Executor
// SPDX-License-Identifier: BSD-3-Clause
// /////////////////////////////////////////////////////////////////////////////

//! # Upstream-Cancel Chain & Tracker Map
//!
//! The singly-linked list of cancel operations (§9 "Upstream-cancel chain")
//! that lets a failing stage tear down every stage upstream of it without
//! reflective traversal, plus the helper that builds the name -> tracker map
//! each `RoutineMetadata` carries (§4.3).

use std::collections::HashMap;
use std::sync::Arc;

use pipeline_executor_domain::{ExecutorError, StatusTracker};
use tokio_util::sync::CancellationToken;

/// One link in the upstream-cancel chain (§9). `cancel()` cancels this
/// stage's own internal token and then walks to the parent, so calling it on
/// the most-downstream link tears down the entire chain above it.
pub struct UpstreamLink {
    internal_token: CancellationToken,
    parent: Option<Arc<UpstreamLink>>,
}

impl UpstreamLink {
    /// A link with no ancestor — the first stage of a chain.
    pub fn root(internal_token: CancellationToken) -> Arc<Self> {
        Arc::new(Self { internal_token, parent: None })
    }

    /// Extends `parent`'s chain by one link (§4.3: "Extends the
    /// upstream-cancel chain by one link whose local cancel invokes this
    /// stage's internal-token cancel and whose parent is the upstream's
    /// link.").
    pub fn extend(internal_token: CancellationToken, parent: Arc<UpstreamLink>) -> Arc<Self> {
        Arc::new(Self { internal_token, parent: Some(parent) })
    }

    /// Cancels this stage and every stage upstream of it.
    pub fn cancel_all(&self) {
        self.internal_token.cancel();
        if let Some(parent) = &self.parent {
            parent.cancel_all();
        }
    }
}

/// Builds the chain-wide name -> tracker map and ordered (upstream-first)
/// name list a new stage's `RoutineMetadata` must carry (§4.3).
///
/// `upstream_order` and `upstream_trackers` are the upstream handle's own
/// chain-order list and tracker map; `this_name`/`this_tracker` describe the
/// stage being constructed. Returns `InvalidConfiguration` if `this_name`
/// already appears upstream, per the duplicate-name construction error in
/// §4.3 and the resolved Open Question in §9.
pub fn extend_chain(
    upstream_order: &[Arc<str>],
    upstream_trackers: &HashMap<Arc<str>, Arc<StatusTracker>>,
    this_name: Arc<str>,
    this_tracker: Arc<StatusTracker>,
) -> Result<(Vec<Arc<str>>, HashMap<Arc<str>, Arc<StatusTracker>>), ExecutorError> {
    if upstream_trackers.contains_key(&this_name) {
        return Err(ExecutorError::invalid_configuration(format!(
            "duplicate executor name in chain: {this_name}"
        )));
    }
    let mut order = Vec::with_capacity(upstream_order.len() + 1);
    order.extend(upstream_order.iter().cloned());
    order.push(this_name.clone());

    let mut trackers = upstream_trackers.clone();
    trackers.insert(this_name, this_tracker);

    Ok((order, trackers))
}

/// The single-stage (no upstream) case of [`extend_chain`].
pub fn root_chain(
    this_name: Arc<str>,
    this_tracker: Arc<StatusTracker>,
) -> (Vec<Arc<str>>, HashMap<Arc<str>, Arc<StatusTracker>>) {
    let order = vec![this_name.clone()];
    let mut trackers = HashMap::new();
    trackers.insert(this_name, this_tracker);
    (order, trackers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    fn tracker(name: &str) -> Arc<StatusTracker> {
        Arc::new(StatusTracker::new(name, 1, Arc::new(AtomicU64::new(0)), Arc::new(AtomicU64::new(0)), Arc::new(|| 0), None))
    }

    #[test]
    fn cancel_all_walks_every_ancestor() {
        let root_token = CancellationToken::new();
        let root = UpstreamLink::root(root_token.clone());
        let mid_token = CancellationToken::new();
        let mid = UpstreamLink::extend(mid_token.clone(), root.clone());
        let leaf_token = CancellationToken::new();
        let leaf = UpstreamLink::extend(leaf_token.clone(), mid);

        leaf.cancel_all();

        assert!(root_token.is_cancelled());
        assert!(mid_token.is_cancelled());
        assert!(leaf_token.is_cancelled());
    }

    #[test]
    fn extend_chain_rejects_duplicate_name() {
        let (order, trackers) = root_chain(Arc::from("a"), tracker("a"));
        let err = extend_chain(&order, &trackers, Arc::from("a"), tracker("a")).unwrap_err();
        assert!(matches!(err, ExecutorError::InvalidConfiguration(_)));
    }

    #[test]
    fn extend_chain_appends_in_upstream_first_order() {
        let (order, trackers) = root_chain(Arc::from("a"), tracker("a"));
        let (order, trackers) = extend_chain(&order, &trackers, Arc::from("b"), tracker("b")).unwrap();
        assert_eq!(order.iter().map(|s| s.as_ref()).collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(trackers.len(), 2);
    }
}
