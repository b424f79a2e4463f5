//! Rebalancer - evens out shard counts across data nodes.
//!
//! Runs on the master after allocation has settled. Each pass moves at most
//! one copy, from the most loaded node to the least loaded node that the
//! allocator's filters accept. Relocations are throttled: a global cap, and
//! at most one in flight between any pair of nodes.

use std::collections::BTreeMap;

use tessel_core::NodeId;
use tracing::info;

use crate::allocator::{AllocationPlan, Allocator};
use crate::cluster_state::ClusterState;
use crate::shard_map::{CopyRole, CopyState, ShardChange};

/// Default variance of per-node shard counts tolerated before moving copies.
pub const IMBALANCE_THRESHOLD_DEFAULT: f64 = 0.5;

/// Rebalancer settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RebalanceConfig {
    /// Variance of shard counts above which a pass moves a copy.
    pub imbalance_threshold: f64,
    /// Cap on relocations in flight across the cluster.
    pub max_concurrent_relocations: usize,
}

impl Default for RebalanceConfig {
    fn default() -> Self {
        Self {
            imbalance_threshold: IMBALANCE_THRESHOLD_DEFAULT,
            max_concurrent_relocations: crate::allocator::RELOCATIONS_CONCURRENT_MAX,
        }
    }
}

/// Plans relocations that reduce shard-count imbalance.
#[derive(Debug, Clone, Default)]
pub struct Rebalancer {
    config: RebalanceConfig,
}

impl Rebalancer {
    /// Creates a rebalancer.
    #[must_use]
    pub const fn new(config: RebalanceConfig) -> Self {
        Self { config }
    }

    /// Variance of copy counts over alive data nodes.
    #[must_use]
    pub fn imbalance(state: &ClusterState) -> f64 {
        let counts = eligible_counts(state);
        if counts.is_empty() {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let n = counts.len() as f64;
        let mean = counts.values().map(|&c| f64::from(c)).sum::<f64>() / n;
        counts
            .values()
            .map(|&c| (f64::from(c) - mean).powi(2))
            .sum::<f64>()
            / n
    }

    /// Plans at most one relocation.
    ///
    /// Returns an empty plan while any copy is initializing, while the
    /// relocation cap is reached, or when the imbalance is within threshold.
    #[must_use]
    pub fn plan(&self, state: &ClusterState, allocator: &Allocator) -> AllocationPlan {
        let in_flight = state.shard_map.relocations_in_flight();
        if in_flight >= self.config.max_concurrent_relocations {
            return AllocationPlan::default();
        }
        let recovering = state
            .shard_map
            .groups()
            .flat_map(|g| &g.copies)
            .any(|c| c.state == CopyState::Initializing);
        if recovering {
            return AllocationPlan::default();
        }
        if Self::imbalance(state) <= self.config.imbalance_threshold {
            return AllocationPlan::default();
        }

        let counts = eligible_counts(state);
        let mut heaviest: Vec<(NodeId, u32)> = counts.iter().map(|(n, c)| (*n, *c)).collect();
        heaviest.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        let mut lightest = heaviest.clone();
        lightest.sort_by_key(|&(n, c)| (c, n));

        for &(from, from_count) in &heaviest {
            for &(to, to_count) in &lightest {
                if from_count <= to_count + 1 {
                    break;
                }
                if pair_busy(state, from, to) {
                    continue;
                }
                if let Some(change) = Self::pick_move(state, allocator, from, to) {
                    info!(from = %from, to = %to, from_count, to_count, "rebalancing copy");
                    return AllocationPlan {
                        changes: vec![change],
                    };
                }
            }
        }
        AllocationPlan::default()
    }

    /// Finds a copy on `from` that may move to `to`, preferring replicas.
    fn pick_move(
        state: &ClusterState,
        allocator: &Allocator,
        from: NodeId,
        to: NodeId,
    ) -> Option<ShardChange> {
        let target = state.nodes.get(&to)?;
        let mut candidates: Vec<_> = state
            .shard_map
            .indices()
            .filter(|r| !r.meta.reference_only)
            .flat_map(|r| r.groups.iter().map(move |g| (&r.meta, g)))
            .filter_map(|(meta, g)| {
                let copy = g.copy_on(from)?;
                (copy.state == CopyState::InSync).then_some((meta, g, copy.role))
            })
            .collect();
        candidates.sort_by_key(|(_, g, role)| (*role == CopyRole::Primary, g.shard));

        candidates.into_iter().find_map(|(meta, group, _)| {
            // Judge the target as if the copy had already left `from`.
            let mut without = group.clone();
            without.copies.retain(|c| c.node != Some(from));
            allocator
                .veto(&state.nodes, &without, meta, target)
                .is_none()
                .then_some(ShardChange::StartRelocation {
                    shard: group.shard,
                    from,
                    to,
                })
        })
    }
}

fn eligible_counts(state: &ClusterState) -> BTreeMap<NodeId, u32> {
    let placed = state.shard_map.shard_counts();
    state
        .nodes
        .values()
        .filter(|n| n.can_host_data())
        .map(|n| (n.id, placed.get(&n.id).copied().unwrap_or(0)))
        .collect()
}

fn pair_busy(state: &ClusterState, a: NodeId, b: NodeId) -> bool {
    state.shard_map.groups().flat_map(|g| &g.copies).any(|c| {
        matches!(
            (c.node, c.relocating_to),
            (Some(x), Some(y)) if (x == a && y == b) || (x == b && y == a)
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessel_core::{IndexId, Liveness, NodeAttributes, NodeInfo, NodeRoles, ShardId, ShardOrdinal};

    use crate::shard_map::{IndexMetadata, ShardChange};

    fn node(id: u64) -> NodeInfo {
        let mut info = NodeInfo::new(NodeId::new(id), NodeRoles::ALL, NodeAttributes::new());
        info.liveness = Liveness::Alive;
        info
    }

    /// Four primaries, all on node 1; nodes 2 and 3 are empty.
    fn lopsided() -> ClusterState {
        let mut state = ClusterState::empty();
        for id in 1..=3 {
            state.nodes.insert(NodeId::new(id), node(id));
        }
        let meta = IndexMetadata::new(IndexId::new(1), "logs", 4, 0, 0);
        state.apply_changes(&[ShardChange::AddIndex(meta)]).unwrap();
        for ordinal in 0..4 {
            let shard = ShardId::new(IndexId::new(1), ShardOrdinal::new(ordinal));
            state
                .apply_changes(&[
                    ShardChange::Assign {
                        shard,
                        role: CopyRole::Primary,
                        node: NodeId::new(1),
                    },
                    ShardChange::Started {
                        shard,
                        node: NodeId::new(1),
                    },
                ])
                .unwrap();
        }
        state
    }

    #[test]
    fn test_rebalance_moves_from_heaviest_to_lightest() {
        let state = lopsided();
        let plan = Rebalancer::default().plan(&state, &Allocator::default());
        assert_eq!(plan.changes.len(), 1);
        let ShardChange::StartRelocation { from, to, .. } = &plan.changes[0] else {
            panic!("expected relocation, got {:?}", plan.changes[0]);
        };
        assert_eq!(*from, NodeId::new(1));
        assert_eq!(*to, NodeId::new(2));
    }

    #[test]
    fn test_rebalance_one_relocation_per_node_pair() {
        let mut state = lopsided();
        state.nodes.remove(&NodeId::new(3));
        let rebalancer = Rebalancer::default();
        let allocator = Allocator::default();

        let first = rebalancer.plan(&state, &allocator);
        assert_eq!(first.changes.len(), 1);
        state.apply_changes(&first.changes).unwrap();

        // Still imbalanced, but 1 -> 2 is already moving a copy.
        assert!(Rebalancer::imbalance(&state) > IMBALANCE_THRESHOLD_DEFAULT);
        assert!(rebalancer.plan(&state, &allocator).is_empty());
    }

    #[test]
    fn test_rebalance_converges() {
        let mut state = lopsided();
        let rebalancer = Rebalancer::default();
        let allocator = Allocator::default();

        for _ in 0..10 {
            let plan = rebalancer.plan(&state, &allocator);
            if plan.is_empty() {
                break;
            }
            state.apply_changes(&plan.changes).unwrap();
            let ShardChange::StartRelocation { shard, from, .. } = plan.changes[0].clone() else {
                panic!("expected relocation");
            };
            state
                .apply_changes(&[ShardChange::CompleteRelocation { shard, from }])
                .unwrap();
        }

        let counts = state.shard_map.shard_counts();
        let max = counts.values().max().copied().unwrap_or(0);
        let min = (1..=3)
            .map(|id| counts.get(&NodeId::new(id)).copied().unwrap_or(0))
            .min()
            .unwrap_or(0);
        assert!(max - min <= 1, "counts: {counts:?}");
    }

    #[test]
    fn test_balanced_cluster_is_left_alone() {
        let mut state = lopsided();
        state.nodes.remove(&NodeId::new(2));
        state.nodes.remove(&NodeId::new(3));
        let plan = Rebalancer::default().plan(&state, &Allocator::default());
        assert!(plan.is_empty());
        assert!(Rebalancer::imbalance(&state).abs() < f64::EPSILON);
    }
}
