//! Property definitions and checkers for Tessel cluster tests.
//!
//! Properties are invariants that must hold after every step of a run. The
//! [`PropertyChecker`] is fed every live node's applied cluster state and
//! master status, and accumulates violations instead of panicking so that a
//! failing run reports everything it saw.

use std::collections::{BTreeMap, BTreeSet};

use tessel_core::{NodeId, ShardId, StateVersion, TermId};
use tessel_routing::{ClusterState, Health};

// ============================================================================
// Property Violation Types
// ============================================================================

/// A violation of a cluster safety property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyViolation {
    /// Two copies of one shard placed on the same node.
    CoLocatedCopies {
        /// Node holding the copies.
        node: NodeId,
        /// The shard.
        shard: ShardId,
        /// Version of the offending state.
        version: StateVersion,
    },
    /// A node applied an older cluster state after a newer one.
    VersionRegressed {
        /// The node.
        node: NodeId,
        /// Version applied before.
        from: StateVersion,
        /// Version applied after.
        to: StateVersion,
    },
    /// More than one node acted as master in the same term.
    MultipleMastersInTerm {
        /// The term.
        term: TermId,
        /// Nodes that acted as master.
        masters: Vec<NodeId>,
    },
    /// Two states with the same version differ.
    DivergentVersion {
        /// The version.
        version: StateVersion,
        /// First node.
        node_a: NodeId,
        /// Second node.
        node_b: NodeId,
    },
}

impl std::fmt::Display for PropertyViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CoLocatedCopies {
                node,
                shard,
                version,
            } => write!(f, "two copies of {shard} on {node} in {version}"),
            Self::VersionRegressed { node, from, to } => {
                write!(f, "{node} applied {to} after {from}")
            }
            Self::MultipleMastersInTerm { term, masters } => {
                write!(f, "multiple masters in {term}: {masters:?}")
            }
            Self::DivergentVersion {
                version,
                node_a,
                node_b,
            } => write!(f, "{node_a} and {node_b} hold different states for {version}"),
        }
    }
}

// ============================================================================
// Property Checker
// ============================================================================

/// What one node exposed after a step.
#[derive(Debug, Clone)]
pub struct NodeObservation<'a> {
    /// The node.
    pub node: NodeId,
    /// Its applied cluster state.
    pub state: &'a ClusterState,
    /// Its election term, for master-eligible nodes.
    pub term: Option<TermId>,
    /// True if it is acting as master.
    pub is_master: bool,
}

/// Tracks state across a run for property verification.
#[derive(Debug, Default)]
pub struct PropertyChecker {
    /// Last version applied by each node.
    applied: BTreeMap<NodeId, StateVersion>,
    /// Nodes seen acting as master, per term.
    masters_by_term: BTreeMap<TermId, BTreeSet<NodeId>>,
    /// First state seen for each version, with the node that held it.
    states_by_version: BTreeMap<StateVersion, (NodeId, ClusterState)>,
    /// Worst health observed by any node.
    worst_health: Option<Health>,
    /// Violations found.
    violations: Vec<PropertyViolation>,
}

impl PropertyChecker {
    /// Creates a new property checker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one step's observations.
    pub fn record<'a>(&mut self, observations: impl IntoIterator<Item = NodeObservation<'a>>) {
        for obs in observations {
            self.record_node(&obs);
        }
    }

    fn record_node(&mut self, obs: &NodeObservation<'_>) {
        let version = obs.state.version;

        if let Some(&previous) = self.applied.get(&obs.node) {
            if version < previous {
                self.push(PropertyViolation::VersionRegressed {
                    node: obs.node,
                    from: previous,
                    to: version,
                });
            }
        }
        self.applied.insert(obs.node, version);

        if let Some(violation) = check_no_colocation(obs.state) {
            self.push(violation);
        }

        match self.states_by_version.get(&version) {
            Some((holder, state)) => {
                if !same_published_state(state, obs.state) {
                    self.push(PropertyViolation::DivergentVersion {
                        version,
                        node_a: *holder,
                        node_b: obs.node,
                    });
                }
            }
            None => {
                self.states_by_version
                    .insert(version, (obs.node, obs.state.clone()));
            }
        }

        if obs.is_master {
            if let Some(term) = obs.term {
                let masters = self.masters_by_term.entry(term).or_default();
                masters.insert(obs.node);
                if masters.len() > 1 {
                    let masters = masters.iter().copied().collect();
                    self.push(PropertyViolation::MultipleMastersInTerm { term, masters });
                }
            }
        }

        // Only states published by some master count toward health.
        if obs.state.master.is_some() && obs.state.shard_map.indices().next().is_some() {
            let health = obs.state.health();
            self.worst_health = Some(self.worst_health.map_or(health, |w| w.max(health)));
        }
    }

    fn push(&mut self, violation: PropertyViolation) {
        if !self.violations.contains(&violation) {
            self.violations.push(violation);
        }
    }

    /// Violations found so far.
    #[must_use]
    pub fn violations(&self) -> &[PropertyViolation] {
        &self.violations
    }

    /// Worst health any node reported while an index existed.
    #[must_use]
    pub const fn worst_health(&self) -> Option<Health> {
        self.worst_health
    }

    /// Clears the worst health, starting a new observation window.
    pub fn reset_health(&mut self) {
        self.worst_health = None;
    }

    /// Terms in which some node acted as master.
    #[must_use]
    pub fn master_terms(&self) -> Vec<TermId> {
        self.masters_by_term.keys().copied().collect()
    }

    /// Panics with every violation if any were found.
    ///
    /// # Panics
    /// Panics if a property was violated.
    pub fn assert_ok(&self) {
        assert!(
            self.violations.is_empty(),
            "property violations:\n{}",
            self.violations
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("\n")
        );
    }
}

// ============================================================================
// Property Check Functions
// ============================================================================

/// Returns the first shard with two copies on one node, if any.
#[must_use]
pub fn check_no_colocation(state: &ClusterState) -> Option<PropertyViolation> {
    for group in state.shard_map.groups() {
        let mut seen = BTreeSet::new();
        let placements = group
            .copies
            .iter()
            .flat_map(|c| c.node.into_iter().chain(c.relocating_to));
        for node in placements {
            if !seen.insert(node) {
                return Some(PropertyViolation::CoLocatedCopies {
                    node,
                    shard: group.shard,
                    version: state.version,
                });
            }
        }
    }
    None
}

/// Compares the parts of two states that every node must agree on for one
/// version. Node stats and heartbeat times are refreshed by the master
/// between publications and are ignored.
fn same_published_state(a: &ClusterState, b: &ClusterState) -> bool {
    a.term == b.term
        && a.master == b.master
        && a.shard_map == b.shard_map
        && a.lifecycle == b.lifecycle
        && a.nodes.keys().eq(b.nodes.keys())
}

/// Returns the number of nodes acting as master.
#[must_use]
pub fn master_count(observations: &[NodeObservation<'_>]) -> usize {
    observations.iter().filter(|o| o.is_master).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessel_core::IndexId;
    use tessel_routing::{IndexMetadata, ShardChange};

    fn state_with_index(version: u64) -> ClusterState {
        let mut state = ClusterState::empty();
        state.version = StateVersion::new(version);
        state.master = Some(NodeId::new(1));
        let meta = IndexMetadata::new(IndexId::new(1), "docs", 1, 1, 0);
        state
            .apply_changes(&[ShardChange::AddIndex(meta)])
            .expect("add index");
        state
    }

    fn observe(node: u64, state: &ClusterState) -> NodeObservation<'_> {
        NodeObservation {
            node: NodeId::new(node),
            state,
            term: Some(TermId::new(1)),
            is_master: false,
        }
    }

    #[test]
    fn test_version_regression_detected() {
        let newer = state_with_index(5);
        let older = state_with_index(4);
        let mut checker = PropertyChecker::new();
        checker.record([observe(1, &newer)]);
        checker.record([observe(1, &older)]);

        assert_eq!(
            checker.violations(),
            &[PropertyViolation::VersionRegressed {
                node: NodeId::new(1),
                from: StateVersion::new(5),
                to: StateVersion::new(4),
            }]
        );
    }

    #[test]
    fn test_two_masters_in_one_term_detected() {
        let state = state_with_index(1);
        let mut checker = PropertyChecker::new();
        let mut a = observe(1, &state);
        a.is_master = true;
        let mut b = observe(2, &state);
        b.is_master = true;
        checker.record([a, b]);

        assert!(matches!(
            checker.violations(),
            [PropertyViolation::MultipleMastersInTerm { .. }]
        ));
    }

    #[test]
    fn test_unassigned_replica_reports_yellow() {
        let state = state_with_index(1);
        let mut checker = PropertyChecker::new();
        checker.record([observe(1, &state)]);

        assert!(checker.violations().is_empty());
        assert_eq!(checker.worst_health(), Some(state.health()));
    }
}
