//! Quorum configuration.

use tessel_core::NodeId;

use crate::limits::{
    ELECTION_TICK_DEFAULT, ELECTION_TICK_MIN, HEARTBEAT_TICK_DEFAULT, VOTERS_MAX,
};

/// Configuration for a master-eligible node.
///
/// `voters` is the configured master-eligible set. Majorities are always
/// computed against this set, never against the currently reachable nodes.
#[derive(Debug, Clone)]
pub struct QuorumConfig {
    /// This node's ID.
    pub node_id: NodeId,

    /// All configured master-eligible nodes (including this one), sorted.
    pub voters: Vec<NodeId>,

    /// Base election timeout in ticks.
    pub election_tick: u32,

    /// Extra ticks added per rank position; lower node ids campaign first.
    pub rank_step_ticks: u32,

    /// Random jitter added on top, in `[0, jitter_ticks)`.
    pub jitter_ticks: u32,

    /// Heartbeat interval in ticks.
    pub heartbeat_tick: u32,

    /// Seed for the election jitter RNG.
    pub seed: u64,
}

impl QuorumConfig {
    /// Creates a new quorum configuration.
    ///
    /// # Panics
    /// Panics if the voter set is empty or too large, or if this node is not a voter.
    #[must_use]
    pub fn new(node_id: NodeId, mut voters: Vec<NodeId>) -> Self {
        voters.sort_unstable();
        voters.dedup();
        assert!(!voters.is_empty(), "voter set cannot be empty");
        assert!(
            voters.len() <= VOTERS_MAX,
            "voter count {} exceeds maximum {}",
            voters.len(),
            VOTERS_MAX
        );
        assert!(voters.contains(&node_id), "node_id must be a voter");

        Self {
            node_id,
            voters,
            election_tick: ELECTION_TICK_DEFAULT,
            rank_step_ticks: 2,
            jitter_ticks: 2,
            heartbeat_tick: HEARTBEAT_TICK_DEFAULT,
            seed: node_id.get(),
        }
    }

    /// Returns the quorum size (strict majority of configured voters).
    #[must_use]
    pub fn quorum_size(&self) -> usize {
        self.voters.len() / 2 + 1
    }

    /// Returns the other voters (excluding this node).
    #[must_use]
    pub fn peers(&self) -> Vec<NodeId> {
        self.voters
            .iter()
            .copied()
            .filter(|&id| id != self.node_id)
            .collect()
    }

    /// Position of this node in the sorted voter list.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn rank(&self) -> u32 {
        // Safety: voters.len() <= VOTERS_MAX, fits in u32.
        self.voters
            .iter()
            .position(|&id| id == self.node_id)
            .unwrap_or(0) as u32
    }

    /// Returns true if `node` is a configured voter.
    #[must_use]
    pub fn is_voter(&self, node: NodeId) -> bool {
        self.voters.binary_search(&node).is_ok()
    }

    /// Sets custom tick timings.
    ///
    /// # Panics
    /// Panics if the heartbeat is not shorter than the election timeout.
    #[must_use]
    pub fn with_ticks(mut self, election_tick: u32, heartbeat_tick: u32) -> Self {
        assert!(election_tick >= ELECTION_TICK_MIN, "election_tick below minimum");
        assert!(heartbeat_tick < election_tick, "heartbeat must be < election timeout");
        self.election_tick = election_tick;
        self.heartbeat_tick = heartbeat_tick;
        self
    }

    /// Sets the RNG seed.
    #[must_use]
    pub const fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.voters.is_empty() {
            return Err("voter set cannot be empty");
        }
        if self.voters.len() > VOTERS_MAX {
            return Err("voter set too large");
        }
        if !self.is_voter(self.node_id) {
            return Err("node_id not a voter");
        }
        if self.heartbeat_tick == 0 || self.heartbeat_tick >= self.election_tick {
            return Err("heartbeat interval must be in (0, election_tick)");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(ids: &[u64]) -> Vec<NodeId> {
        ids.iter().copied().map(NodeId::new).collect()
    }

    #[test]
    fn test_config_basics() {
        let config = QuorumConfig::new(NodeId::new(2), nodes(&[3, 1, 2]));

        assert_eq!(config.voters, nodes(&[1, 2, 3]));
        assert_eq!(config.quorum_size(), 2);
        assert_eq!(config.peers(), nodes(&[1, 3]));
        assert_eq!(config.rank(), 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    #[should_panic(expected = "voter set cannot be empty")]
    fn test_empty_voters_panics() {
        let _ = QuorumConfig::new(NodeId::new(1), vec![]);
    }

    #[test]
    #[should_panic(expected = "node_id must be a voter")]
    fn test_non_voter_panics() {
        let _ = QuorumConfig::new(NodeId::new(1), nodes(&[2, 3]));
    }

    #[test]
    fn test_quorum_sizes() {
        assert_eq!(QuorumConfig::new(NodeId::new(1), nodes(&[1])).quorum_size(), 1);
        assert_eq!(QuorumConfig::new(NodeId::new(1), nodes(&[1, 2])).quorum_size(), 2);
        assert_eq!(QuorumConfig::new(NodeId::new(1), nodes(&[1, 2, 3])).quorum_size(), 2);
        assert_eq!(
            QuorumConfig::new(NodeId::new(1), nodes(&[1, 2, 3, 4, 5])).quorum_size(),
            3
        );
    }
}
