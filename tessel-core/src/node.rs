//! Node identity, roles and attributes.
//!
//! Roles are a fixed set of capability flags rather than node "kinds": a
//! single process may be master-eligible and hold data at the same time.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{Millis, NodeId};

/// Attribute key used for zone awareness.
pub const ATTR_ZONE: &str = "zone";
/// Attribute key used for rack awareness.
pub const ATTR_RACK: &str = "rack";
/// Attribute key naming the storage tier a node serves (`hot`, `warm`, `cold`).
pub const ATTR_DATA_TIER: &str = "data_tier";

/// Capability flags of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct NodeRoles {
    /// May vote in and stand for master elections.
    pub master_eligible: bool,
    /// May host shard copies.
    pub data: bool,
    /// May accept client requests and route them.
    pub coordinating: bool,
    /// May run ingest pre-processing.
    pub ingest: bool,
}

impl NodeRoles {
    /// All roles enabled.
    pub const ALL: Self = Self {
        master_eligible: true,
        data: true,
        coordinating: true,
        ingest: true,
    };

    /// A dedicated master-eligible node that holds no data.
    pub const MASTER_ONLY: Self = Self {
        master_eligible: true,
        data: false,
        coordinating: true,
        ingest: false,
    };

    /// A data node that never stands for election.
    pub const DATA_ONLY: Self = Self {
        master_eligible: false,
        data: true,
        coordinating: true,
        ingest: false,
    };

    /// A pure request router.
    pub const COORDINATING_ONLY: Self = Self {
        master_eligible: false,
        data: false,
        coordinating: true,
        ingest: false,
    };
}

impl Default for NodeRoles {
    fn default() -> Self {
        Self::ALL
    }
}

/// Free-form key/value attributes used by allocation awareness.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAttributes(BTreeMap<String, String>);

impl NodeAttributes {
    /// Creates an empty attribute set.
    #[must_use]
    pub const fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Returns an attribute value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// The node's zone, if set.
    #[must_use]
    pub fn zone(&self) -> Option<&str> {
        self.get(ATTR_ZONE)
    }

    /// The node's rack, if set.
    #[must_use]
    pub fn rack(&self) -> Option<&str> {
        self.get(ATTR_RACK)
    }

    /// The storage tier the node serves, if set.
    #[must_use]
    pub fn data_tier(&self) -> Option<&str> {
        self.get(ATTR_DATA_TIER)
    }
}

/// Liveness of a node as seen by the membership directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Liveness {
    /// Handshake accepted, no heartbeat seen yet.
    Joining,
    /// Heartbeating normally.
    Alive,
    /// Missed heartbeats; still counted as a member but not trusted.
    Suspected,
    /// Considered gone. Its shard copies are reallocated.
    Left,
}

impl Liveness {
    /// Returns true if the node may receive new shard copies.
    #[must_use]
    pub const fn is_available(self) -> bool {
        matches!(self, Self::Alive)
    }

    /// Returns true if shard copies on the node should be kept in place.
    ///
    /// A suspected node keeps its copies; only leaving triggers reallocation.
    #[must_use]
    pub const fn holds_copies(self) -> bool {
        matches!(self, Self::Joining | Self::Alive | Self::Suspected)
    }
}

/// Resource usage reported with each heartbeat.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeStats {
    /// Fraction of local disk in use, 0.0 to 1.0.
    pub disk_used_ratio: f64,
}

/// Everything the cluster knows about one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Node id.
    pub id: NodeId,
    /// Capability flags.
    pub roles: NodeRoles,
    /// Awareness attributes.
    pub attributes: NodeAttributes,
    /// Current liveness.
    pub liveness: Liveness,
    /// Timestamp of the last heartbeat (or join).
    pub last_heartbeat_ms: Millis,
    /// Last reported resource usage.
    pub stats: NodeStats,
}

impl NodeInfo {
    /// Creates a node descriptor in the `Joining` state.
    #[must_use]
    pub const fn new(id: NodeId, roles: NodeRoles, attributes: NodeAttributes) -> Self {
        Self {
            id,
            roles,
            attributes,
            liveness: Liveness::Joining,
            last_heartbeat_ms: 0,
            stats: NodeStats {
                disk_used_ratio: 0.0,
            },
        }
    }

    /// Returns true if this node can accept new data copies right now.
    #[must_use]
    pub const fn can_host_data(&self) -> bool {
        self.roles.data && self.liveness.is_available()
    }
}
