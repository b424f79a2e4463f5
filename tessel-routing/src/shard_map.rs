//! Shard map - placement of every shard copy on the cluster's nodes.
//!
//! The map is a plain value: it is cloned into each published cluster state
//! and only ever changed through [`ShardMap::apply`], one [`ShardChange`] at
//! a time. Every change keeps the placement invariants:
//!
//! - no two copies of the same shard ordinal on one node (relocation
//!   targets included),
//! - exactly one primary copy per shard ordinal.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use tessel_core::{IndexId, Millis, NodeId, ShardId, ShardOrdinal};

/// Maximum primary shards per index.
pub const SHARDS_PER_INDEX_MAX: u32 = 1024;

/// Role of a copy within its shard group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CopyRole {
    /// The writable copy; assigns sequence numbers.
    Primary,
    /// A read-serving duplicate.
    Replica,
}

/// Recovery state of a copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CopyState {
    /// Assigned, recovering data; not yet serving.
    Initializing,
    /// Holds every acknowledged operation.
    InSync,
    /// In sync and being copied to another node.
    Relocating,
    /// Not placed on any node.
    Unassigned,
}

impl CopyState {
    /// True for copies that hold all acknowledged writes.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::InSync | Self::Relocating)
    }
}

/// A reason a filter refused a node for a copy.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Veto {
    /// The node does not have the data role.
    NotDataNode,
    /// The node is not alive.
    NotAlive,
    /// Another copy of the same shard is already on the node.
    SameShard,
    /// The node is above the disk high watermark.
    DiskWatermark,
    /// Placing here would exceed the per-value limit of an awareness attribute.
    Awareness {
        /// Attribute key, e.g. `zone`.
        attribute: String,
    },
    /// The node does not serve the index's required tier.
    Tier {
        /// The required tier.
        required: String,
    },
}

impl fmt::Display for Veto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotDataNode => write!(f, "not_data_node"),
            Self::NotAlive => write!(f, "not_alive"),
            Self::SameShard => write!(f, "same_shard"),
            Self::DiskWatermark => write!(f, "disk_watermark"),
            Self::Awareness { attribute } => write!(f, "awareness({attribute})"),
            Self::Tier { required } => write!(f, "tier({required})"),
        }
    }
}

/// Machine-readable reason a copy is unassigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnassignedReason {
    /// The index was just created.
    IndexCreated,
    /// The replica count was raised.
    ReplicaAdded,
    /// The hosting node left the cluster.
    NodeLeft,
    /// The primary has no active copy; its data is only on `last_node`.
    AwaitingLastNode,
    /// A replica waits for its primary to become active.
    PrimaryInactive,
    /// Every candidate node was refused; the distinct vetoes are listed.
    NoEligibleNode {
        /// Distinct vetoes across all candidates.
        vetoes: Vec<Veto>,
    },
}

impl fmt::Display for UnassignedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IndexCreated => write!(f, "index_created"),
            Self::ReplicaAdded => write!(f, "replica_added"),
            Self::NodeLeft => write!(f, "node_left"),
            Self::AwaitingLastNode => write!(f, "awaiting_last_node"),
            Self::PrimaryInactive => write!(f, "primary_inactive"),
            Self::NoEligibleNode { vetoes } => {
                write!(f, "no_eligible_node[")?;
                for (i, veto) in vetoes.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{veto}")?;
                }
                write!(f, "]")
            }
        }
    }
}

/// One copy of a shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardCopy {
    /// Primary or replica.
    pub role: CopyRole,
    /// Hosting node, `None` while unassigned.
    pub node: Option<NodeId>,
    /// Recovery state.
    pub state: CopyState,
    /// Target node while relocating.
    pub relocating_to: Option<NodeId>,
    /// Node that last hosted this copy.
    pub last_node: Option<NodeId>,
    /// Why the copy is unassigned, if it is.
    pub unassigned_reason: Option<UnassignedReason>,
}

impl ShardCopy {
    /// Creates an unassigned copy.
    #[must_use]
    pub const fn unassigned(role: CopyRole, reason: UnassignedReason) -> Self {
        Self {
            role,
            node: None,
            state: CopyState::Unassigned,
            relocating_to: None,
            last_node: None,
            unassigned_reason: Some(reason),
        }
    }

    /// Returns true if the copy is assigned to `node` (as source or target).
    #[must_use]
    pub fn occupies(&self, node: NodeId) -> bool {
        self.node == Some(node) || self.relocating_to == Some(node)
    }
}

/// All copies of one shard ordinal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardGroup {
    /// The shard.
    pub shard: ShardId,
    /// Copies, primary first.
    pub copies: Vec<ShardCopy>,
    /// Incremented every time a new node becomes primary.
    pub primary_term: u64,
    /// True once a snapshot of this shard is in the repository.
    pub snapshot_done: bool,
}

impl ShardGroup {
    /// Returns the primary copy.
    #[must_use]
    pub fn primary(&self) -> Option<&ShardCopy> {
        self.copies.iter().find(|c| c.role == CopyRole::Primary)
    }

    /// Node hosting the primary, if it is active.
    #[must_use]
    pub fn active_primary_node(&self) -> Option<NodeId> {
        self.primary()
            .filter(|c| c.state.is_active())
            .and_then(|c| c.node)
    }

    /// Replica copies.
    pub fn replicas(&self) -> impl Iterator<Item = &ShardCopy> {
        self.copies.iter().filter(|c| c.role == CopyRole::Replica)
    }

    /// Nodes holding active (readable) copies, primary first.
    #[must_use]
    pub fn active_nodes(&self) -> Vec<NodeId> {
        self.copies
            .iter()
            .filter(|c| c.state.is_active())
            .filter_map(|c| c.node)
            .collect()
    }

    /// Every node occupied by this group, relocation targets included.
    #[must_use]
    pub fn occupied_nodes(&self) -> BTreeSet<NodeId> {
        self.copies
            .iter()
            .flat_map(|c| c.node.into_iter().chain(c.relocating_to))
            .collect()
    }

    /// Returns the copy hosted on `node` (not as relocation target).
    #[must_use]
    pub fn copy_on(&self, node: NodeId) -> Option<&ShardCopy> {
        self.copies.iter().find(|c| c.node == Some(node))
    }

    /// Health of this group.
    #[must_use]
    pub fn health(&self) -> Health {
        let active = self.copies.iter().filter(|c| c.state.is_active()).count();
        if active == 0 {
            return Health::Red;
        }
        let primary_active = self.primary().is_some_and(|c| c.state.is_active());
        if !primary_active || active < self.copies.len() {
            return Health::Yellow;
        }
        Health::Green
    }

    fn copy_on_mut(&mut self, node: NodeId) -> Option<&mut ShardCopy> {
        self.copies.iter_mut().find(|c| c.node == Some(node))
    }
}

/// Snapshot request state of an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SnapshotStatus {
    /// No snapshot requested.
    #[default]
    None,
    /// Primaries should upload a snapshot.
    Requested,
}

/// Per-index settings carried in the shard map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMetadata {
    /// Index id.
    pub id: IndexId,
    /// Index name (unique).
    pub name: String,
    /// Number of primary shards. Immutable.
    pub primary_shards: u32,
    /// Replicas per primary.
    pub replicas: u32,
    /// Writes are refused.
    pub read_only: bool,
    /// Copies may only live on nodes serving this tier.
    pub tier: Option<String>,
    /// Copies are served from the snapshot repository.
    pub reference_only: bool,
    /// Consolidation target, if consolidation was requested.
    pub max_segments: Option<u32>,
    /// Snapshot request state.
    pub snapshot: SnapshotStatus,
    /// Creation time.
    pub created_at_ms: Millis,
}

impl IndexMetadata {
    /// Creates metadata for a new writable index.
    #[must_use]
    pub fn new(
        id: IndexId,
        name: impl Into<String>,
        primary_shards: u32,
        replicas: u32,
        created_at_ms: Millis,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            primary_shards,
            replicas,
            read_only: false,
            tier: None,
            reference_only: false,
            max_segments: None,
            snapshot: SnapshotStatus::None,
            created_at_ms,
        }
    }

    /// Total copies per shard ordinal.
    #[must_use]
    pub const fn copies_per_shard(&self) -> u32 {
        1 + self.replicas
    }
}

/// An index: its settings and its shard groups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRouting {
    /// Settings.
    pub meta: IndexMetadata,
    /// One group per ordinal, ordered by ordinal.
    pub groups: Vec<ShardGroup>,
}

impl IndexRouting {
    /// Returns the group for `ordinal`.
    #[must_use]
    pub fn group(&self, ordinal: ShardOrdinal) -> Option<&ShardGroup> {
        self.groups.get(ordinal.get() as usize)
    }

    /// Health of the index (worst group).
    #[must_use]
    pub fn health(&self) -> Health {
        self.groups
            .iter()
            .map(ShardGroup::health)
            .max()
            .unwrap_or(Health::Green)
    }

    /// Returns true if any copy is initializing or relocating.
    #[must_use]
    pub fn has_recoveries_in_flight(&self) -> bool {
        self.groups.iter().flat_map(|g| &g.copies).any(|c| {
            matches!(c.state, CopyState::Initializing | CopyState::Relocating)
        })
    }
}

/// Cluster or index health.
///
/// Ordered so that `max` yields the worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Health {
    /// Every copy is active.
    Green,
    /// Every shard is readable but some copy is not active.
    Yellow,
    /// At least one shard has no active copy.
    Red,
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Green => write!(f, "green"),
            Self::Yellow => write!(f, "yellow"),
            Self::Red => write!(f, "red"),
        }
    }
}

/// A field change on an index's settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetaUpdate {
    /// Set the replica count.
    Replicas(u32),
    /// Set the read-only flag.
    ReadOnly(bool),
    /// Restrict copies to a tier.
    Tier(Option<String>),
    /// Serve from the snapshot repository.
    ReferenceOnly(bool),
    /// Request consolidation down to this many segments.
    MaxSegments(Option<u32>),
    /// Request or clear a snapshot.
    Snapshot(SnapshotStatus),
}

/// One atomic edit of the shard map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardChange {
    /// Add a new index with every copy unassigned.
    AddIndex(IndexMetadata),
    /// Remove an index and all its copies.
    RemoveIndex(IndexId),
    /// Change an index setting.
    UpdateMeta {
        /// Index.
        index: IndexId,
        /// The change.
        update: MetaUpdate,
    },
    /// Place an unassigned copy of `role` on `node` (state: initializing).
    Assign {
        /// Shard.
        shard: ShardId,
        /// Role of the unassigned copy to place.
        role: CopyRole,
        /// Target node.
        node: NodeId,
    },
    /// Remove the copy on `node` from its node.
    Unassign {
        /// Shard.
        shard: ShardId,
        /// Node that held the copy.
        node: NodeId,
        /// Why.
        reason: UnassignedReason,
    },
    /// Record why an unassigned copy could not be placed.
    Explain {
        /// Shard.
        shard: ShardId,
        /// Role of the unassigned copy.
        role: CopyRole,
        /// Why.
        reason: UnassignedReason,
    },
    /// Turn the active replica on `node` into the primary. The old primary
    /// copy becomes an unassigned replica. Every other replica re-syncs
    /// from the new primary.
    Promote {
        /// Shard.
        shard: ShardId,
        /// Replica to promote.
        node: NodeId,
    },
    /// Initializing copy on `node` finished recovery.
    Started {
        /// Shard.
        shard: ShardId,
        /// Node.
        node: NodeId,
    },
    /// Active replica on `node` missed operations and must re-sync.
    MarkStale {
        /// Shard.
        shard: ShardId,
        /// Node.
        node: NodeId,
    },
    /// Add an unassigned replica slot.
    AddReplica {
        /// Shard.
        shard: ShardId,
    },
    /// Drop a replica slot, preferring unassigned, then initializing copies.
    RemoveReplica {
        /// Shard.
        shard: ShardId,
    },
    /// Begin moving the copy on `from` to `to`.
    StartRelocation {
        /// Shard.
        shard: ShardId,
        /// Source node.
        from: NodeId,
        /// Target node.
        to: NodeId,
    },
    /// The relocation target caught up; the copy now lives on the target.
    CompleteRelocation {
        /// Shard.
        shard: ShardId,
        /// Source node.
        from: NodeId,
    },
    /// Abort a relocation; the copy stays on the source.
    CancelRelocation {
        /// Shard.
        shard: ShardId,
        /// Source node.
        from: NodeId,
    },
    /// A snapshot of the shard is in the repository.
    Snapshotted {
        /// Shard.
        shard: ShardId,
    },
}

/// Errors from shard map edits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardMapError {
    /// The index does not exist.
    IndexNotFound {
        /// The index.
        index: IndexId,
    },
    /// An index with this id or name already exists.
    IndexExists {
        /// The name.
        name: String,
    },
    /// The shard ordinal is out of range.
    ShardNotFound {
        /// The shard.
        shard: ShardId,
    },
    /// No copy matches the change.
    CopyNotFound {
        /// The shard.
        shard: ShardId,
        /// What was looked for.
        what: &'static str,
    },
    /// The change would put two copies of a shard on one node.
    CoLocation {
        /// The shard.
        shard: ShardId,
        /// The node.
        node: NodeId,
    },
    /// Invalid primary count.
    InvalidShardCount {
        /// The count.
        count: u32,
    },
}

impl fmt::Display for ShardMapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IndexNotFound { index } => write!(f, "index not found: {index}"),
            Self::IndexExists { name } => write!(f, "index already exists: {name}"),
            Self::ShardNotFound { shard } => write!(f, "shard not found: {shard}"),
            Self::CopyNotFound { shard, what } => write!(f, "no {what} copy of {shard}"),
            Self::CoLocation { shard, node } => {
                write!(f, "two copies of {shard} on {node}")
            }
            Self::InvalidShardCount { count } => {
                write!(f, "invalid primary shard count {count} (max {SHARDS_PER_INDEX_MAX})")
            }
        }
    }
}

impl std::error::Error for ShardMapError {}

/// Placement of every shard copy of every index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardMap {
    indices: BTreeMap<IndexId, IndexRouting>,
}

impl ShardMap {
    /// Creates an empty shard map.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            indices: BTreeMap::new(),
        }
    }

    /// Returns an index.
    #[must_use]
    pub fn index(&self, index: IndexId) -> Option<&IndexRouting> {
        self.indices.get(&index)
    }

    /// Looks up an index by name.
    #[must_use]
    pub fn index_by_name(&self, name: &str) -> Option<&IndexRouting> {
        self.indices.values().find(|r| r.meta.name == name)
    }

    /// All indices ordered by id.
    pub fn indices(&self) -> impl Iterator<Item = &IndexRouting> {
        self.indices.values()
    }

    /// Returns a shard group.
    #[must_use]
    pub fn group(&self, shard: ShardId) -> Option<&ShardGroup> {
        self.indices.get(&shard.index)?.group(shard.ordinal)
    }

    /// All shard groups across all indices.
    pub fn groups(&self) -> impl Iterator<Item = &ShardGroup> {
        self.indices.values().flat_map(|r| r.groups.iter())
    }

    /// Number of copies placed on each node (relocation targets included).
    #[must_use]
    pub fn shard_counts(&self) -> BTreeMap<NodeId, u32> {
        let mut counts = BTreeMap::new();
        for copy in self.groups().flat_map(|g| &g.copies) {
            for node in copy.node.into_iter().chain(copy.relocating_to) {
                *counts.entry(node).or_insert(0) += 1;
            }
        }
        counts
    }

    /// Shards with a copy on `node`.
    #[must_use]
    pub fn shards_on(&self, node: NodeId) -> Vec<(ShardId, &ShardCopy)> {
        self.groups()
            .flat_map(|g| {
                g.copies
                    .iter()
                    .filter(move |c| c.occupies(node))
                    .map(move |c| (g.shard, c))
            })
            .collect()
    }

    /// Number of relocations in flight.
    #[must_use]
    pub fn relocations_in_flight(&self) -> usize {
        self.groups()
            .flat_map(|g| &g.copies)
            .filter(|c| c.relocating_to.is_some())
            .count()
    }

    /// Worst health over all indices; green when empty.
    #[must_use]
    pub fn health(&self) -> Health {
        self.indices
            .values()
            .map(IndexRouting::health)
            .max()
            .unwrap_or(Health::Green)
    }

    /// Checks the placement invariants.
    ///
    /// # Errors
    /// Returns the first violation found.
    pub fn validate(&self) -> Result<(), ShardMapError> {
        for group in self.groups() {
            let mut seen = BTreeSet::new();
            for copy in &group.copies {
                for node in copy.node.into_iter().chain(copy.relocating_to) {
                    if !seen.insert(node) {
                        return Err(ShardMapError::CoLocation {
                            shard: group.shard,
                            node,
                        });
                    }
                }
            }
            let primaries = group
                .copies
                .iter()
                .filter(|c| c.role == CopyRole::Primary)
                .count();
            if primaries != 1 {
                return Err(ShardMapError::CopyNotFound {
                    shard: group.shard,
                    what: "single primary",
                });
            }
        }
        Ok(())
    }

    /// Applies one change.
    ///
    /// # Errors
    /// Returns an error if the change does not match the map or would break
    /// a placement invariant. The map is unchanged on error.
    pub fn apply(&mut self, change: &ShardChange) -> Result<(), ShardMapError> {
        match change {
            ShardChange::AddIndex(meta) => self.add_index(meta),
            ShardChange::RemoveIndex(index) => self
                .indices
                .remove(index)
                .map(|_| ())
                .ok_or(ShardMapError::IndexNotFound { index: *index }),
            ShardChange::UpdateMeta { index, update } => {
                let routing = self
                    .indices
                    .get_mut(index)
                    .ok_or(ShardMapError::IndexNotFound { index: *index })?;
                apply_meta(&mut routing.meta, update);
                Ok(())
            }
            ShardChange::Assign { shard, role, node } => {
                let group = self.group_mut(*shard)?;
                if group.occupied_nodes().contains(node) {
                    return Err(ShardMapError::CoLocation {
                        shard: *shard,
                        node: *node,
                    });
                }
                let copy = group
                    .copies
                    .iter_mut()
                    .find(|c| c.role == *role && c.state == CopyState::Unassigned)
                    .ok_or(ShardMapError::CopyNotFound {
                        shard: *shard,
                        what: "unassigned",
                    })?;
                copy.node = Some(*node);
                copy.state = CopyState::Initializing;
                copy.unassigned_reason = None;
                if *role == CopyRole::Primary {
                    group.primary_term += 1;
                }
                Ok(())
            }
            ShardChange::Unassign {
                shard,
                node,
                reason,
            } => {
                let group = self.group_mut(*shard)?;
                let copy = group.copy_on_mut(*node).ok_or(ShardMapError::CopyNotFound {
                    shard: *shard,
                    what: "assigned",
                })?;
                copy.last_node = Some(*node);
                copy.node = None;
                copy.relocating_to = None;
                copy.state = CopyState::Unassigned;
                copy.unassigned_reason = Some(reason.clone());
                Ok(())
            }
            ShardChange::Explain {
                shard,
                role,
                reason,
            } => {
                let group = self.group_mut(*shard)?;
                let copy = group
                    .copies
                    .iter_mut()
                    .find(|c| c.role == *role && c.state == CopyState::Unassigned)
                    .ok_or(ShardMapError::CopyNotFound {
                        shard: *shard,
                        what: "unassigned",
                    })?;
                copy.unassigned_reason = Some(reason.clone());
                Ok(())
            }
            ShardChange::Promote { shard, node } => self.promote(*shard, *node),
            ShardChange::Started { shard, node } => {
                let group = self.group_mut(*shard)?;
                let copy = group
                    .copies
                    .iter_mut()
                    .find(|c| c.node == Some(*node) && c.state == CopyState::Initializing)
                    .ok_or(ShardMapError::CopyNotFound {
                        shard: *shard,
                        what: "initializing",
                    })?;
                copy.state = CopyState::InSync;
                copy.last_node = Some(*node);
                Ok(())
            }
            ShardChange::MarkStale { shard, node } => {
                let group = self.group_mut(*shard)?;
                let copy = group
                    .copies
                    .iter_mut()
                    .find(|c| {
                        c.node == Some(*node) && c.role == CopyRole::Replica && c.state.is_active()
                    })
                    .ok_or(ShardMapError::CopyNotFound {
                        shard: *shard,
                        what: "active replica",
                    })?;
                copy.state = CopyState::Initializing;
                copy.relocating_to = None;
                Ok(())
            }
            ShardChange::AddReplica { shard } => {
                let group = self.group_mut(*shard)?;
                group.copies.push(ShardCopy::unassigned(
                    CopyRole::Replica,
                    UnassignedReason::ReplicaAdded,
                ));
                Ok(())
            }
            ShardChange::RemoveReplica { shard } => {
                let group = self.group_mut(*shard)?;
                let rank = |c: &ShardCopy| match c.state {
                    CopyState::Unassigned => 0,
                    CopyState::Initializing => 1,
                    CopyState::InSync => 2,
                    CopyState::Relocating => 3,
                };
                let victim = group
                    .copies
                    .iter()
                    .enumerate()
                    .filter(|(_, c)| c.role == CopyRole::Replica)
                    .min_by_key(|(i, c)| (rank(c), std::cmp::Reverse(*i)))
                    .map(|(i, _)| i)
                    .ok_or(ShardMapError::CopyNotFound {
                        shard: *shard,
                        what: "replica",
                    })?;
                group.copies.remove(victim);
                Ok(())
            }
            ShardChange::StartRelocation { shard, from, to } => {
                let group = self.group_mut(*shard)?;
                if group.occupied_nodes().contains(to) {
                    return Err(ShardMapError::CoLocation {
                        shard: *shard,
                        node: *to,
                    });
                }
                let copy = group
                    .copies
                    .iter_mut()
                    .find(|c| c.node == Some(*from) && c.state == CopyState::InSync)
                    .ok_or(ShardMapError::CopyNotFound {
                        shard: *shard,
                        what: "in-sync",
                    })?;
                copy.state = CopyState::Relocating;
                copy.relocating_to = Some(*to);
                Ok(())
            }
            ShardChange::CompleteRelocation { shard, from } => {
                let group = self.group_mut(*shard)?;
                let copy = group
                    .copies
                    .iter_mut()
                    .find(|c| c.node == Some(*from) && c.state == CopyState::Relocating)
                    .ok_or(ShardMapError::CopyNotFound {
                        shard: *shard,
                        what: "relocating",
                    })?;
                let is_primary = copy.role == CopyRole::Primary;
                copy.node = copy.relocating_to.take();
                copy.last_node = copy.node;
                copy.state = CopyState::InSync;
                if is_primary {
                    group.primary_term += 1;
                }
                Ok(())
            }
            ShardChange::CancelRelocation { shard, from } => {
                let group = self.group_mut(*shard)?;
                let copy = group
                    .copies
                    .iter_mut()
                    .find(|c| c.node == Some(*from) && c.state == CopyState::Relocating)
                    .ok_or(ShardMapError::CopyNotFound {
                        shard: *shard,
                        what: "relocating",
                    })?;
                copy.relocating_to = None;
                copy.state = CopyState::InSync;
                Ok(())
            }
            ShardChange::Snapshotted { shard } => {
                self.group_mut(*shard)?.snapshot_done = true;
                Ok(())
            }
        }
    }

    fn add_index(&mut self, meta: &IndexMetadata) -> Result<(), ShardMapError> {
        if meta.primary_shards == 0 || meta.primary_shards > SHARDS_PER_INDEX_MAX {
            return Err(ShardMapError::InvalidShardCount {
                count: meta.primary_shards,
            });
        }
        if self.indices.contains_key(&meta.id) || self.index_by_name(&meta.name).is_some() {
            return Err(ShardMapError::IndexExists {
                name: meta.name.clone(),
            });
        }

        let groups = (0..meta.primary_shards)
            .map(|ordinal| {
                let mut copies = vec![ShardCopy::unassigned(
                    CopyRole::Primary,
                    UnassignedReason::IndexCreated,
                )];
                copies.extend((0..meta.replicas).map(|_| {
                    ShardCopy::unassigned(CopyRole::Replica, UnassignedReason::IndexCreated)
                }));
                ShardGroup {
                    shard: ShardId::new(meta.id, ShardOrdinal::new(ordinal)),
                    copies,
                    primary_term: 0,
                    snapshot_done: false,
                }
            })
            .collect();

        self.indices.insert(
            meta.id,
            IndexRouting {
                meta: meta.clone(),
                groups,
            },
        );
        Ok(())
    }

    fn promote(&mut self, shard: ShardId, node: NodeId) -> Result<(), ShardMapError> {
        let group = self.group_mut(shard)?;
        let candidate = group
            .copies
            .iter()
            .position(|c| {
                c.node == Some(node) && c.role == CopyRole::Replica && c.state.is_active()
            })
            .ok_or(ShardMapError::CopyNotFound {
                shard,
                what: "active replica",
            })?;

        for copy in &mut group.copies {
            if copy.role == CopyRole::Primary {
                copy.role = CopyRole::Replica;
                if copy.node.is_some() {
                    copy.last_node = copy.node;
                }
                copy.node = None;
                copy.relocating_to = None;
                copy.state = CopyState::Unassigned;
                copy.unassigned_reason = Some(UnassignedReason::NodeLeft);
            } else if copy.node.is_some() && copy.node != Some(node) {
                // Replicas re-sync from the new primary before serving again.
                copy.state = CopyState::Initializing;
                copy.relocating_to = None;
            }
        }

        let promoted = &mut group.copies[candidate];
        promoted.role = CopyRole::Primary;
        promoted.state = CopyState::InSync;
        promoted.relocating_to = None;
        group.primary_term += 1;

        // Keep the primary first.
        group.copies.swap(0, candidate);
        Ok(())
    }

    fn group_mut(&mut self, shard: ShardId) -> Result<&mut ShardGroup, ShardMapError> {
        self.indices
            .get_mut(&shard.index)
            .ok_or(ShardMapError::IndexNotFound { index: shard.index })?
            .groups
            .get_mut(shard.ordinal.get() as usize)
            .ok_or(ShardMapError::ShardNotFound { shard })
    }
}

fn apply_meta(meta: &mut IndexMetadata, update: &MetaUpdate) {
    match update {
        MetaUpdate::Replicas(n) => meta.replicas = *n,
        MetaUpdate::ReadOnly(v) => meta.read_only = *v,
        MetaUpdate::Tier(t) => meta.tier.clone_from(t),
        MetaUpdate::ReferenceOnly(v) => meta.reference_only = *v,
        MetaUpdate::MaxSegments(n) => meta.max_segments = *n,
        MetaUpdate::Snapshot(s) => meta.snapshot = *s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shard(ordinal: u32) -> ShardId {
        ShardId::new(IndexId::new(1), ShardOrdinal::new(ordinal))
    }

    fn map_with_index(primaries: u32, replicas: u32) -> ShardMap {
        let mut map = ShardMap::new();
        map.apply(&ShardChange::AddIndex(IndexMetadata::new(
            IndexId::new(1),
            "logs",
            primaries,
            replicas,
            0,
        )))
        .unwrap();
        map
    }

    fn place(map: &mut ShardMap, s: ShardId, role: CopyRole, node: u64) {
        map.apply(&ShardChange::Assign {
            shard: s,
            role,
            node: NodeId::new(node),
        })
        .unwrap();
        map.apply(&ShardChange::Started {
            shard: s,
            node: NodeId::new(node),
        })
        .unwrap();
    }

    #[test]
    fn test_new_index_is_red_and_unassigned() {
        let map = map_with_index(3, 1);
        let routing = map.index(IndexId::new(1)).unwrap();
        assert_eq!(routing.groups.len(), 3);
        assert!(routing.groups.iter().all(|g| g.copies.len() == 2));
        assert_eq!(map.health(), Health::Red);
        assert!(map.validate().is_ok());
    }

    #[test]
    fn test_duplicate_index_rejected() {
        let mut map = map_with_index(1, 0);
        let err = map
            .apply(&ShardChange::AddIndex(IndexMetadata::new(
                IndexId::new(2),
                "logs",
                1,
                0,
                0,
            )))
            .unwrap_err();
        assert!(matches!(err, ShardMapError::IndexExists { .. }));
    }

    #[test]
    fn test_health_transitions() {
        let mut map = map_with_index(1, 1);
        place(&mut map, shard(0), CopyRole::Primary, 1);
        assert_eq!(map.health(), Health::Yellow);
        place(&mut map, shard(0), CopyRole::Replica, 2);
        assert_eq!(map.health(), Health::Green);
    }

    #[test]
    fn test_co_location_rejected() {
        let mut map = map_with_index(1, 1);
        place(&mut map, shard(0), CopyRole::Primary, 1);
        let err = map
            .apply(&ShardChange::Assign {
                shard: shard(0),
                role: CopyRole::Replica,
                node: NodeId::new(1),
            })
            .unwrap_err();
        assert!(matches!(err, ShardMapError::CoLocation { .. }));
    }

    #[test]
    fn test_promote_replica() {
        let mut map = map_with_index(1, 2);
        place(&mut map, shard(0), CopyRole::Primary, 1);
        place(&mut map, shard(0), CopyRole::Replica, 2);
        place(&mut map, shard(0), CopyRole::Replica, 3);
        let term_before = map.group(shard(0)).unwrap().primary_term;

        map.apply(&ShardChange::Promote {
            shard: shard(0),
            node: NodeId::new(2),
        })
        .unwrap();

        let group = map.group(shard(0)).unwrap();
        assert_eq!(group.active_primary_node(), Some(NodeId::new(2)));
        assert_eq!(group.primary_term, term_before + 1);
        assert_eq!(group.copy_on(NodeId::new(3)).unwrap().state, CopyState::Initializing);
        let old = group.replicas().find(|c| c.node.is_none()).unwrap();
        assert_eq!(old.last_node, Some(NodeId::new(1)));
        assert_eq!(map.health(), Health::Yellow);
        assert!(map.validate().is_ok());
    }

    #[test]
    fn test_relocation_lifecycle() {
        let mut map = map_with_index(1, 0);
        place(&mut map, shard(0), CopyRole::Primary, 1);

        map.apply(&ShardChange::StartRelocation {
            shard: shard(0),
            from: NodeId::new(1),
            to: NodeId::new(2),
        })
        .unwrap();
        assert_eq!(map.relocations_in_flight(), 1);
        // Relocating source still counts as active.
        assert_eq!(map.health(), Health::Green);
        assert_eq!(map.shard_counts().get(&NodeId::new(2)), Some(&1));

        map.apply(&ShardChange::CompleteRelocation {
            shard: shard(0),
            from: NodeId::new(1),
        })
        .unwrap();
        let group = map.group(shard(0)).unwrap();
        assert_eq!(group.active_primary_node(), Some(NodeId::new(2)));
        assert_eq!(map.relocations_in_flight(), 0);
    }

    #[test]
    fn test_remove_replica_prefers_unassigned() {
        let mut map = map_with_index(1, 2);
        place(&mut map, shard(0), CopyRole::Primary, 1);
        place(&mut map, shard(0), CopyRole::Replica, 2);

        map.apply(&ShardChange::RemoveReplica { shard: shard(0) }).unwrap();
        let group = map.group(shard(0)).unwrap();
        assert_eq!(group.copies.len(), 2);
        assert!(group.copy_on(NodeId::new(2)).is_some());
    }

    #[test]
    fn test_unassign_keeps_last_node() {
        let mut map = map_with_index(1, 0);
        place(&mut map, shard(0), CopyRole::Primary, 1);
        map.apply(&ShardChange::Unassign {
            shard: shard(0),
            node: NodeId::new(1),
            reason: UnassignedReason::NodeLeft,
        })
        .unwrap();
        let primary = map.group(shard(0)).unwrap().primary().unwrap().clone();
        assert_eq!(primary.last_node, Some(NodeId::new(1)));
        assert_eq!(primary.state, CopyState::Unassigned);
        assert_eq!(map.health(), Health::Red);
    }

    #[test]
    fn test_unassigned_reason_display() {
        let reason = UnassignedReason::NoEligibleNode {
            vetoes: vec![Veto::SameShard, Veto::DiskWatermark],
        };
        assert_eq!(reason.to_string(), "no_eligible_node[same_shard,disk_watermark]");
    }
}
