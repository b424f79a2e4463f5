//! Shard router - maps routing keys to shards and shards to nodes.
//!
//! Routing is a pure function of the cluster state: a write goes to the node
//! holding the active primary, a read goes to any active copy. Reads rotate
//! through copies so that replicas share the load.

use std::sync::atomic::{AtomicU64, Ordering};

use tessel_core::{IndexId, NodeId, ShardId, ShardOrdinal};
use xxhash_rust::xxh3::xxh3_64;

use crate::cluster_state::ClusterState;
use crate::shard_map::IndexRouting;

/// Hashes a routing key to a shard ordinal.
///
/// # Panics
/// Panics if `primary_shards` is zero.
#[must_use]
pub fn shard_for_key(routing_key: &[u8], primary_shards: u32) -> ShardOrdinal {
    assert!(primary_shards > 0, "index must have at least one primary");
    let hash = xxh3_64(routing_key);
    // Safety: result < primary_shards which is a u32.
    #[allow(clippy::cast_possible_truncation)]
    let ordinal = (hash % u64::from(primary_shards)) as u32;
    ShardOrdinal::new(ordinal)
}

/// Where a write must go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteRoute {
    /// Target shard.
    pub shard: ShardId,
    /// Node holding its active primary.
    pub primary: NodeId,
}

/// Candidate copies for one shard of a read, in preferred order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadTarget {
    /// The shard.
    pub shard: ShardId,
    /// Nodes holding active copies; try in order.
    pub copies: Vec<NodeId>,
}

/// Errors from routing operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingError {
    /// No index with that name.
    IndexNotFound {
        /// The name.
        name: String,
    },
    /// The shard has no active primary.
    PrimaryUnavailable {
        /// The shard.
        shard: ShardId,
    },
}

impl std::fmt::Display for RoutingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IndexNotFound { name } => write!(f, "index not found: {name}"),
            Self::PrimaryUnavailable { shard } => {
                write!(f, "no active primary for {shard}")
            }
        }
    }
}

impl std::error::Error for RoutingError {}

/// Routes requests against a cluster state.
#[derive(Debug, Default)]
pub struct ShardRouter {
    read_cursor: AtomicU64,
}

impl ShardRouter {
    /// Creates a router.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            read_cursor: AtomicU64::new(0),
        }
    }

    /// Resolves an index by name.
    ///
    /// # Errors
    /// Returns `IndexNotFound` if no index has that name.
    pub fn resolve<'a>(
        state: &'a ClusterState,
        index: &str,
    ) -> Result<&'a IndexRouting, RoutingError> {
        state
            .shard_map
            .index_by_name(index)
            .ok_or_else(|| RoutingError::IndexNotFound {
                name: index.to_string(),
            })
    }

    /// Routes a write.
    ///
    /// # Errors
    /// Returns an error if the index is unknown or the shard has no active primary.
    pub fn route_write(
        state: &ClusterState,
        index: &str,
        routing_key: &[u8],
    ) -> Result<WriteRoute, RoutingError> {
        let routing = Self::resolve(state, index)?;
        let ordinal = shard_for_key(routing_key, routing.meta.primary_shards);
        let shard = ShardId::new(routing.meta.id, ordinal);
        let primary = routing
            .group(ordinal)
            .and_then(crate::shard_map::ShardGroup::active_primary_node)
            .ok_or(RoutingError::PrimaryUnavailable { shard })?;
        Ok(WriteRoute { shard, primary })
    }

    /// Lists copies to query for every shard of an index.
    ///
    /// Shards with no active copy are returned with an empty candidate list
    /// so that the caller can report them as missing.
    #[must_use]
    pub fn read_targets(&self, routing: &IndexRouting) -> Vec<ReadTarget> {
        let offset = self.read_cursor.fetch_add(1, Ordering::Relaxed);
        routing
            .groups
            .iter()
            .map(|group| {
                let mut copies = group.active_nodes();
                if !copies.is_empty() {
                    // Safety: remainder is below copies.len().
                    #[allow(clippy::cast_possible_truncation)]
                    let start = (offset % copies.len() as u64) as usize;
                    copies.rotate_left(start);
                }
                ReadTarget {
                    shard: group.shard,
                    copies,
                }
            })
            .collect()
    }

    /// Finds the index id for a name, if any.
    #[must_use]
    pub fn index_id(state: &ClusterState, index: &str) -> Option<IndexId> {
        state.shard_map.index_by_name(index).map(|r| r.meta.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard_map::{CopyRole, IndexMetadata, ShardChange};

    fn state_with_index() -> ClusterState {
        let mut state = ClusterState::empty();
        let meta = IndexMetadata::new(IndexId::new(1), "logs", 3, 1, 0);
        state.apply_changes(&[ShardChange::AddIndex(meta)]).unwrap();
        for ordinal in 0..3 {
            let shard = ShardId::new(IndexId::new(1), ShardOrdinal::new(ordinal));
            let changes = [
                ShardChange::Assign { shard, role: CopyRole::Primary, node: NodeId::new(1) },
                ShardChange::Started { shard, node: NodeId::new(1) },
                ShardChange::Assign { shard, role: CopyRole::Replica, node: NodeId::new(2) },
                ShardChange::Started { shard, node: NodeId::new(2) },
            ];
            state.apply_changes(&changes).unwrap();
        }
        state
    }

    #[test]
    fn test_shard_for_key_is_deterministic() {
        let a = shard_for_key(b"doc-1", 5);
        let b = shard_for_key(b"doc-1", 5);
        assert_eq!(a, b);
        assert!(a.get() < 5);
    }

    #[test]
    fn test_keys_spread_over_shards() {
        let mut seen = [false; 4];
        for i in 0..200 {
            let key = format!("doc-{i}");
            seen[shard_for_key(key.as_bytes(), 4).get() as usize] = true;
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn test_route_write_to_primary() {
        let state = state_with_index();
        let route = ShardRouter::route_write(&state, "logs", b"doc-1").unwrap();
        assert_eq!(route.primary, NodeId::new(1));
        assert_eq!(route.shard.ordinal, shard_for_key(b"doc-1", 3));
    }

    #[test]
    fn test_route_write_unknown_index() {
        let state = state_with_index();
        let err = ShardRouter::route_write(&state, "nope", b"doc-1").unwrap_err();
        assert!(matches!(err, RoutingError::IndexNotFound { .. }));
    }

    #[test]
    fn test_route_write_without_primary() {
        let mut state = ClusterState::empty();
        let meta = IndexMetadata::new(IndexId::new(1), "logs", 1, 0, 0);
        state.apply_changes(&[ShardChange::AddIndex(meta)]).unwrap();
        let err = ShardRouter::route_write(&state, "logs", b"k").unwrap_err();
        assert!(matches!(err, RoutingError::PrimaryUnavailable { .. }));
    }

    #[test]
    fn test_read_targets_rotate() {
        let state = state_with_index();
        let router = ShardRouter::new();
        let routing = state.shard_map.index_by_name("logs").unwrap();

        let first = router.read_targets(routing);
        let second = router.read_targets(routing);
        assert_eq!(first.len(), 3);
        assert_ne!(first[0].copies[0], second[0].copies[0]);
        assert_eq!(first[0].copies.len(), 2);
    }
}
