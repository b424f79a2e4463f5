//! Cluster state - the versioned, immutable snapshot every node agrees on.
//!
//! The master never mutates a published state. It derives a successor with
//! a strictly greater version and publishes it; every other node swaps its
//! `Arc` to the new snapshot and rejects anything not newer than what it
//! already holds.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tessel_core::{IndexId, LifecycleRecord, NodeId, NodeInfo, StateVersion, TermId};

use crate::shard_map::{Health, ShardChange, ShardMap, ShardMapError};

/// One published version of the cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterState {
    /// Strictly increasing version.
    pub version: StateVersion,
    /// Election term of the master that published it.
    pub term: TermId,
    /// Publishing master.
    pub master: Option<NodeId>,
    /// Membership directory contents.
    pub nodes: BTreeMap<NodeId, NodeInfo>,
    /// Placement of every shard copy.
    pub shard_map: ShardMap,
    /// Lifecycle bookkeeping per index.
    pub lifecycle: BTreeMap<IndexId, LifecycleRecord>,
    /// Next index id to hand out.
    pub next_index_id: IndexId,
}

impl ClusterState {
    /// The state every node starts from before anything is published.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            version: StateVersion::new(0),
            term: TermId::new(0),
            master: None,
            nodes: BTreeMap::new(),
            shard_map: ShardMap::new(),
            lifecycle: BTreeMap::new(),
            next_index_id: IndexId::new(1),
        }
    }

    /// Derives the next version for publication by `master`.
    ///
    /// `floor` is the highest version the master has seen anywhere; the
    /// successor is strictly greater than both it and this state.
    #[must_use]
    pub fn successor(&self, master: NodeId, term: TermId, floor: StateVersion) -> Self {
        let version = self.version.max(floor).next();
        Self {
            version,
            term,
            master: Some(master),
            ..self.clone()
        }
    }

    /// Applies shard map changes in order.
    ///
    /// # Errors
    /// Returns the first failing change; `self` may be partially updated,
    /// so callers apply to a scratch successor only.
    pub fn apply_changes(&mut self, changes: &[ShardChange]) -> Result<(), ShardMapError> {
        for change in changes {
            self.shard_map.apply(change)?;
            if let ShardChange::RemoveIndex(index) = change {
                self.lifecycle.remove(index);
            }
        }
        debug_assert!(self.shard_map.validate().is_ok());
        Ok(())
    }

    /// Cluster health.
    #[must_use]
    pub fn health(&self) -> Health {
        self.shard_map.health()
    }

    /// Returns true if `node` is known and holds copies.
    #[must_use]
    pub fn node_holds_copies(&self, node: NodeId) -> bool {
        self.nodes.get(&node).is_some_and(|n| n.liveness.holds_copies())
    }
}

impl Default for ClusterState {
    fn default() -> Self {
        Self::empty()
    }
}

/// Returned when a published state is not newer than the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaleVersion {
    /// Version offered.
    pub offered: StateVersion,
    /// Version already applied.
    pub current: StateVersion,
}

impl std::fmt::Display for StaleVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "stale cluster state {} (current {})",
            self.offered, self.current
        )
    }
}

impl std::error::Error for StaleVersion {}

/// A node's handle on the latest applied cluster state.
#[derive(Debug, Clone)]
pub struct ClusterStateView {
    current: Arc<ClusterState>,
}

impl ClusterStateView {
    /// Starts from `state`.
    #[must_use]
    pub fn new(state: ClusterState) -> Self {
        Self {
            current: Arc::new(state),
        }
    }

    /// The current snapshot.
    #[must_use]
    pub fn current(&self) -> Arc<ClusterState> {
        Arc::clone(&self.current)
    }

    /// The current version.
    #[must_use]
    pub fn version(&self) -> StateVersion {
        self.current.version
    }

    /// Applies a newer state.
    ///
    /// # Errors
    /// Returns [`StaleVersion`] if `state` is not strictly newer.
    pub fn apply(&mut self, state: Arc<ClusterState>) -> Result<Arc<ClusterState>, StaleVersion> {
        if state.version <= self.current.version {
            return Err(StaleVersion {
                offered: state.version,
                current: self.current.version,
            });
        }
        let previous = std::mem::replace(&mut self.current, state);
        Ok(previous)
    }
}

impl Default for ClusterStateView {
    fn default() -> Self {
        Self::new(ClusterState::empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard_map::IndexMetadata;

    #[test]
    fn test_successor_exceeds_floor() {
        let state = ClusterState::empty();
        let next = state.successor(NodeId::new(1), TermId::new(3), StateVersion::new(9));
        assert_eq!(next.version, StateVersion::new(10));
        assert_eq!(next.master, Some(NodeId::new(1)));
        assert_eq!(next.term, TermId::new(3));

        let after = next.successor(NodeId::new(1), TermId::new(3), StateVersion::new(0));
        assert_eq!(after.version, StateVersion::new(11));
    }

    #[test]
    fn test_view_rejects_stale_versions() {
        let mut view = ClusterStateView::default();
        let v1 = ClusterState::empty().successor(NodeId::new(1), TermId::new(1), StateVersion::new(0));
        let v2 = v1.successor(NodeId::new(1), TermId::new(1), StateVersion::new(0));

        view.apply(Arc::new(v2.clone())).unwrap();
        let err = view.apply(Arc::new(v1)).unwrap_err();
        assert_eq!(err.current, v2.version);
        let err = view.apply(Arc::new(v2)).unwrap_err();
        assert_eq!(err.offered, err.current);
    }

    #[test]
    fn test_remove_index_drops_lifecycle_record() {
        let mut state = ClusterState::empty();
        let meta = IndexMetadata::new(IndexId::new(1), "logs", 1, 0, 0);
        state.apply_changes(&[ShardChange::AddIndex(meta)]).unwrap();
        state.lifecycle.insert(
            IndexId::new(1),
            LifecycleRecord::new(IndexId::new(1), tessel_core::LifecyclePolicy::default(), 0),
        );

        state
            .apply_changes(&[ShardChange::RemoveIndex(IndexId::new(1))])
            .unwrap();
        assert!(state.lifecycle.is_empty());
        assert!(state.shard_map.index(IndexId::new(1)).is_none());
    }

    #[test]
    fn test_state_round_trips_through_json() {
        let mut state = ClusterState::empty();
        let meta = IndexMetadata::new(IndexId::new(4), "metrics", 2, 1, 0);
        state.apply_changes(&[ShardChange::AddIndex(meta)]).unwrap();

        let json = serde_json::to_string(&state).unwrap();
        let back: ClusterState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }
}
