//! Node configuration.

use std::path::PathBuf;

use tessel_core::{Limits, Millis, NodeAttributes, NodeId, NodeRoles};
use tessel_lifecycle::BackoffConfig;
use tessel_quorum::QuorumConfig;
use tessel_replication::ReplicationConfig;
use tessel_routing::{AllocatorConfig, RebalanceConfig};

/// Default interval between node ticks.
pub const TICK_INTERVAL_MS_DEFAULT: Millis = 50;

/// Default delay between recovery attempts for the same replica.
pub const RECOVERY_RETRY_MS_DEFAULT: Millis = 1_000;

/// Configuration of one node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// This node's id.
    pub node_id: NodeId,
    /// Capabilities.
    pub roles: NodeRoles,
    /// Awareness attributes (zone, rack, data tier).
    pub attributes: NodeAttributes,
    /// The configured master-eligible set. Also used as join seeds.
    pub voters: Vec<NodeId>,
    /// Interval between ticks.
    pub tick_interval_ms: Millis,
    /// Election timeout in ticks.
    pub election_tick: u32,
    /// Master heartbeat interval in ticks.
    pub heartbeat_tick: u32,
    /// System limits and membership timings.
    pub limits: Limits,
    /// Write path settings.
    pub replication: ReplicationConfig,
    /// Placement settings.
    pub allocator: AllocatorConfig,
    /// Rebalancing settings.
    pub rebalance: RebalanceConfig,
    /// Lifecycle retry policy.
    pub backoff: BackoffConfig,
    /// Delay between recovery attempts for the same replica.
    pub recovery_retry_ms: Millis,
    /// Directory holding the persisted cluster state (None = in-memory).
    pub data_dir: Option<PathBuf>,
    /// Seed for election jitter.
    pub seed: u64,
}

impl NodeConfig {
    /// Production defaults for `node_id` in a cluster whose
    /// master-eligible nodes are `voters`.
    #[must_use]
    pub fn new(node_id: NodeId, voters: Vec<NodeId>) -> Self {
        Self {
            node_id,
            roles: NodeRoles::ALL,
            attributes: NodeAttributes::new(),
            voters,
            tick_interval_ms: TICK_INTERVAL_MS_DEFAULT,
            election_tick: tessel_quorum::limits::ELECTION_TICK_DEFAULT,
            heartbeat_tick: tessel_quorum::limits::HEARTBEAT_TICK_DEFAULT,
            limits: Limits::new(),
            replication: ReplicationConfig::default(),
            allocator: AllocatorConfig::default(),
            rebalance: RebalanceConfig::default(),
            backoff: BackoffConfig::default(),
            recovery_retry_ms: RECOVERY_RETRY_MS_DEFAULT,
            data_dir: None,
            seed: node_id.get(),
        }
    }

    /// Short timings for in-process clusters.
    ///
    /// Membership timeouts shrink so that node loss is detected within a few
    /// dozen ticks.
    #[must_use]
    pub fn for_testing(node_id: NodeId, voters: Vec<NodeId>) -> Self {
        let mut limits = Limits::new();
        limits.heartbeat_interval_ms = 100;
        limits.suspect_after_ms = 400;
        limits.leave_after_ms = 1_000;
        limits.removal_grace_ms = 5_000;
        limits.default_timeout_ms = 500;

        Self {
            limits,
            replication: ReplicationConfig::for_testing(),
            backoff: BackoffConfig::for_testing(),
            recovery_retry_ms: 100,
            ..Self::new(node_id, voters)
        }
    }

    /// Sets the roles.
    #[must_use]
    pub const fn with_roles(mut self, roles: NodeRoles) -> Self {
        self.roles = roles;
        self
    }

    /// Sets the attributes.
    #[must_use]
    pub fn with_attributes(mut self, attributes: NodeAttributes) -> Self {
        self.attributes = attributes;
        self
    }

    /// Persists the cluster state under `data_dir`.
    #[must_use]
    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(data_dir.into());
        self
    }

    /// Sets the limits.
    #[must_use]
    pub const fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    /// Sets the allocator settings.
    #[must_use]
    pub fn with_allocator(mut self, allocator: AllocatorConfig) -> Self {
        self.allocator = allocator;
        self
    }

    /// Sets the election seed.
    #[must_use]
    pub const fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Returns true if this node takes part in elections.
    #[must_use]
    pub fn is_voter(&self) -> bool {
        self.roles.master_eligible && self.voters.contains(&self.node_id)
    }

    /// Election configuration, for master-eligible nodes.
    #[must_use]
    pub fn quorum_config(&self) -> Option<QuorumConfig> {
        self.is_voter().then(|| {
            QuorumConfig::new(self.node_id, self.voters.clone())
                .with_ticks(self.election_tick, self.heartbeat_tick)
                .with_seed(self.seed)
        })
    }

    /// Validates the configuration.
    ///
    /// # Errors
    /// Returns an error if the limits are inconsistent or the voter set is
    /// empty.
    pub fn validate(&self) -> tessel_core::Result<()> {
        self.limits.validate()?;
        if self.voters.is_empty() {
            return Err(tessel_core::Error::InvalidArgument {
                name: "voters",
                reason: "at least one master-eligible node is required",
            });
        }
        if self.tick_interval_ms == 0 {
            return Err(tessel_core::Error::InvalidArgument {
                name: "tick_interval_ms",
                reason: "must be positive",
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(raw: &[u64]) -> Vec<NodeId> {
        raw.iter().copied().map(NodeId::new).collect()
    }

    #[test]
    fn test_testing_config_is_valid() {
        let config = NodeConfig::for_testing(NodeId::new(1), ids(&[1, 2, 3]));
        assert!(config.validate().is_ok());
        assert!(config.limits.leave_after_ms < Limits::new().leave_after_ms);
    }

    #[test]
    fn test_only_configured_master_eligible_nodes_vote() {
        let voter = NodeConfig::new(NodeId::new(1), ids(&[1, 2, 3]));
        assert!(voter.quorum_config().is_some());

        let data = NodeConfig::new(NodeId::new(4), ids(&[1, 2, 3]));
        assert!(data.quorum_config().is_none());

        let demoted = NodeConfig::new(NodeId::new(2), ids(&[1, 2, 3]))
            .with_roles(NodeRoles::DATA_ONLY);
        assert!(demoted.quorum_config().is_none());
    }

    #[test]
    fn test_empty_voter_set_is_rejected() {
        let config = NodeConfig::new(NodeId::new(1), Vec::new());
        assert!(config.validate().is_err());
    }
}
