//! Allocator - decides where shard copies live.
//!
//! Runs on the master. Every entry point takes the current cluster state and
//! returns an [`AllocationPlan`]: an ordered list of [`ShardChange`]s that,
//! applied to the same state's shard map, yields the target placement. The
//! master publishes the plan as part of the next cluster-state version.
//!
//! Placement is greedy. For each unsatisfied copy the candidate nodes are
//! first passed through hard filters (data role, liveness, same-shard
//! co-location, disk watermark, tier, attribute awareness); survivors are
//! ranked by shard count, then zone diversity, then node id. A copy that no
//! node accepts stays unassigned with the list of vetoes as its reason and
//! is retried on the next reroute.

use std::collections::{BTreeMap, BTreeSet};

use tessel_core::{IndexId, NodeId, NodeInfo, ShardId};
use tracing::{debug, info, warn};

use crate::cluster_state::ClusterState;
use crate::shard_map::{
    CopyRole, CopyState, IndexMetadata, MetaUpdate, ShardChange, ShardGroup, ShardMap,
    ShardMapError, SnapshotStatus, UnassignedReason, Veto,
};

/// Default disk usage above which a node takes no new copies.
pub const DISK_HIGH_WATERMARK_DEFAULT: f64 = 0.90;

/// Default cap on relocations in flight across the cluster.
pub const RELOCATIONS_CONCURRENT_MAX: usize = 4;

/// Allocator settings.
#[derive(Debug, Clone, PartialEq)]
pub struct AllocatorConfig {
    /// Disk usage ratio at or above which a node is excluded.
    pub disk_high_watermark: f64,
    /// Node attributes whose values copies must be spread across.
    pub awareness_attributes: Vec<String>,
    /// Cap on relocations in flight across the cluster.
    pub max_concurrent_relocations: usize,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            disk_high_watermark: DISK_HIGH_WATERMARK_DEFAULT,
            awareness_attributes: vec![tessel_core::ATTR_ZONE.to_string()],
            max_concurrent_relocations: RELOCATIONS_CONCURRENT_MAX,
        }
    }
}

/// Requests the lifecycle engine sends to the allocator.
///
/// Every request is idempotent: repeating it after it took effect yields an
/// empty plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleRequest {
    /// Set the replica count.
    SetReplicas(u32),
    /// Refuse further writes.
    MarkReadOnly,
    /// Ask data nodes to consolidate down to `max_segments`.
    ConsolidateSegments {
        /// Segment target.
        max_segments: u32,
    },
    /// Restrict copies to nodes serving `tier`.
    RequireTier(String),
    /// Upload every shard to the snapshot repository.
    TakeSnapshot,
    /// Serve the index from the snapshot repository; drops replicas.
    ConvertToReferenceOnly,
    /// Delete the index.
    RemoveAllCopies,
}

/// Errors from allocation requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocationError {
    /// The index does not exist.
    IndexNotFound {
        /// The index.
        index: IndexId,
    },
    /// The request cannot be satisfied yet; retry later.
    Busy {
        /// The index.
        index: IndexId,
        /// What it is waiting for.
        reason: &'static str,
    },
    /// The shard map refused a change.
    ShardMap(ShardMapError),
}

impl std::fmt::Display for AllocationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IndexNotFound { index } => write!(f, "index not found: {index}"),
            Self::Busy { index, reason } => write!(f, "{index} busy: {reason}"),
            Self::ShardMap(e) => write!(f, "shard map: {e}"),
        }
    }
}

impl std::error::Error for AllocationError {}

impl From<ShardMapError> for AllocationError {
    fn from(e: ShardMapError) -> Self {
        Self::ShardMap(e)
    }
}

/// An ordered diff against a shard map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocationPlan {
    /// Changes, in application order.
    pub changes: Vec<ShardChange>,
}

impl AllocationPlan {
    /// Returns true if nothing changes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Appends another plan computed against the result of this one.
    pub fn extend(&mut self, other: Self) {
        self.changes.extend(other.changes);
    }
}

/// The allocation policy engine.
#[derive(Debug, Clone, Default)]
pub struct Allocator {
    config: AllocatorConfig,
}

impl Allocator {
    /// Creates an allocator.
    #[must_use]
    pub const fn new(config: AllocatorConfig) -> Self {
        Self { config }
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    /// Full reroute: fail copies on departed nodes, place unassigned copies,
    /// move copies that violate their tier.
    #[must_use]
    pub fn reroute(&self, state: &ClusterState) -> AllocationPlan {
        let mut scratch = Scratch::new(state);
        scratch.fail_departed();
        self.assign_unassigned(&mut scratch);
        self.relocate_misplaced(&mut scratch);
        scratch.into_plan()
    }

    /// Reacts to membership changes already reflected in `state.nodes`.
    #[must_use]
    pub fn on_membership_change(&self, state: &ClusterState) -> AllocationPlan {
        let plan = self.reroute(state);
        if !plan.is_empty() {
            info!(changes = plan.changes.len(), "rerouted after membership change");
        }
        plan
    }

    /// Adds a new index and places its copies.
    ///
    /// # Errors
    /// Returns an error if the index already exists or the shard count is invalid.
    pub fn create_index(
        &self,
        state: &ClusterState,
        meta: IndexMetadata,
    ) -> Result<AllocationPlan, AllocationError> {
        let mut scratch = Scratch::new(state);
        scratch.try_push(ShardChange::AddIndex(meta))?;
        self.assign_unassigned(&mut scratch);
        Ok(scratch.into_plan())
    }

    /// A copy on `node` finished recovering.
    #[must_use]
    pub fn on_shard_started(
        &self,
        state: &ClusterState,
        shard: ShardId,
        node: NodeId,
    ) -> AllocationPlan {
        let mut scratch = Scratch::new(state);
        let Some(group) = scratch.map.group(shard) else {
            return AllocationPlan::default();
        };

        let change = if group
            .copy_on(node)
            .is_some_and(|c| c.state == CopyState::Initializing)
        {
            Some(ShardChange::Started { shard, node })
        } else {
            group
                .copies
                .iter()
                .find(|c| c.relocating_to == Some(node))
                .and_then(|c| c.node)
                .map(|from| ShardChange::CompleteRelocation { shard, from })
        };

        match change {
            Some(change) => scratch.push(change),
            None => {
                debug!(shard = %shard, node = %node, "ignoring stale shard-started");
                return AllocationPlan::default();
            }
        }
        self.assign_unassigned(&mut scratch);
        self.relocate_misplaced(&mut scratch);
        scratch.into_plan()
    }

    /// A copy on `node` missed operations (or a relocation target failed).
    #[must_use]
    pub fn on_shard_failed(
        &self,
        state: &ClusterState,
        shard: ShardId,
        node: NodeId,
    ) -> AllocationPlan {
        let mut scratch = Scratch::new(state);
        let Some(group) = scratch.map.group(shard) else {
            return AllocationPlan::default();
        };

        if let Some(from) = group
            .copies
            .iter()
            .find(|c| c.relocating_to == Some(node))
            .and_then(|c| c.node)
        {
            scratch.push(ShardChange::CancelRelocation { shard, from });
        } else if group
            .copy_on(node)
            .is_some_and(|c| c.role == CopyRole::Replica && c.state.is_active())
        {
            warn!(shard = %shard, node = %node, "marking replica stale");
            scratch.push(ShardChange::MarkStale { shard, node });
        }
        scratch.into_plan()
    }

    /// A primary uploaded its snapshot.
    #[must_use]
    pub fn on_shard_snapshotted(&self, state: &ClusterState, shard: ShardId) -> AllocationPlan {
        let mut scratch = Scratch::new(state);
        if scratch.map.group(shard).is_some_and(|g| !g.snapshot_done) {
            scratch.push(ShardChange::Snapshotted { shard });
        }
        scratch.into_plan()
    }

    /// Handles a lifecycle request for `index`.
    ///
    /// # Errors
    /// Returns `Busy` when the request cannot be satisfied yet and
    /// `IndexNotFound` for unknown indices (except `RemoveAllCopies`, which
    /// is a no-op on a missing index).
    pub fn on_lifecycle_request(
        &self,
        state: &ClusterState,
        index: IndexId,
        request: &LifecycleRequest,
    ) -> Result<AllocationPlan, AllocationError> {
        let Some(routing) = state.shard_map.index(index) else {
            if *request == LifecycleRequest::RemoveAllCopies {
                return Ok(AllocationPlan::default());
            }
            return Err(AllocationError::IndexNotFound { index });
        };
        let meta = &routing.meta;
        let mut scratch = Scratch::new(state);

        match request {
            LifecycleRequest::SetReplicas(replicas) => {
                let settled = routing
                    .groups
                    .iter()
                    .all(|g| g.replicas().count() == *replicas as usize);
                if meta.replicas == *replicas && settled {
                    return Ok(AllocationPlan::default());
                }
                if routing.has_recoveries_in_flight() {
                    return Err(AllocationError::Busy {
                        index,
                        reason: "recoveries in flight",
                    });
                }
                scratch.try_push(ShardChange::UpdateMeta {
                    index,
                    update: MetaUpdate::Replicas(*replicas),
                })?;
                resize_replicas(&mut scratch, index, *replicas)?;
                self.assign_unassigned(&mut scratch);
            }
            LifecycleRequest::MarkReadOnly => {
                if !meta.read_only {
                    scratch.try_push(ShardChange::UpdateMeta {
                        index,
                        update: MetaUpdate::ReadOnly(true),
                    })?;
                }
            }
            LifecycleRequest::ConsolidateSegments { max_segments } => {
                if meta.max_segments != Some(*max_segments) {
                    scratch.try_push(ShardChange::UpdateMeta {
                        index,
                        update: MetaUpdate::MaxSegments(Some(*max_segments)),
                    })?;
                }
            }
            LifecycleRequest::RequireTier(tier) => {
                if meta.tier.as_deref() != Some(tier.as_str()) {
                    scratch.try_push(ShardChange::UpdateMeta {
                        index,
                        update: MetaUpdate::Tier(Some(tier.clone())),
                    })?;
                }
                self.relocate_misplaced(&mut scratch);
            }
            LifecycleRequest::TakeSnapshot => {
                if meta.snapshot != SnapshotStatus::Requested {
                    scratch.try_push(ShardChange::UpdateMeta {
                        index,
                        update: MetaUpdate::Snapshot(SnapshotStatus::Requested),
                    })?;
                }
            }
            LifecycleRequest::ConvertToReferenceOnly => {
                if meta.reference_only {
                    return Ok(AllocationPlan::default());
                }
                if !routing.groups.iter().all(|g| g.snapshot_done) {
                    return Err(AllocationError::Busy {
                        index,
                        reason: "snapshot pending",
                    });
                }
                if routing.has_recoveries_in_flight() {
                    return Err(AllocationError::Busy {
                        index,
                        reason: "recoveries in flight",
                    });
                }
                scratch.try_push(ShardChange::UpdateMeta {
                    index,
                    update: MetaUpdate::ReferenceOnly(true),
                })?;
                scratch.try_push(ShardChange::UpdateMeta {
                    index,
                    update: MetaUpdate::Replicas(0),
                })?;
                resize_replicas(&mut scratch, index, 0)?;
            }
            LifecycleRequest::RemoveAllCopies => {
                scratch.try_push(ShardChange::RemoveIndex(index))?;
            }
        }

        let plan = scratch.into_plan();
        if !plan.is_empty() {
            info!(index = %index, request = ?request, changes = plan.changes.len(), "lifecycle request planned");
        }
        Ok(plan)
    }

    /// Checks the hard filters for placing a copy of `group` on `node`.
    ///
    /// Returns the first veto, or `None` if the node is eligible.
    #[must_use]
    pub fn veto(
        &self,
        nodes: &BTreeMap<NodeId, NodeInfo>,
        group: &ShardGroup,
        meta: &IndexMetadata,
        node: &NodeInfo,
    ) -> Option<Veto> {
        if !node.roles.data {
            return Some(Veto::NotDataNode);
        }
        if !node.liveness.is_available() {
            return Some(Veto::NotAlive);
        }
        if group.occupied_nodes().contains(&node.id) {
            return Some(Veto::SameShard);
        }
        if node.stats.disk_used_ratio >= self.config.disk_high_watermark {
            return Some(Veto::DiskWatermark);
        }
        if let Some(required) = &meta.tier {
            if node.attributes.data_tier().is_some_and(|t| t != required) {
                return Some(Veto::Tier {
                    required: required.clone(),
                });
            }
        }
        for attribute in &self.config.awareness_attributes {
            if !self.awareness_allows(nodes, group, meta, node, attribute) {
                return Some(Veto::Awareness {
                    attribute: attribute.clone(),
                });
            }
        }
        None
    }

    /// Picks the best node for a new copy of `group`, or the vetoes that
    /// ruled every node out.
    ///
    /// # Errors
    /// Returns the distinct vetoes when no node is eligible.
    pub fn choose_node(
        &self,
        nodes: &BTreeMap<NodeId, NodeInfo>,
        map: &ShardMap,
        group: &ShardGroup,
        meta: &IndexMetadata,
    ) -> Result<NodeId, Vec<Veto>> {
        let counts = map.shard_counts();
        let used_zones: BTreeSet<&str> = group
            .occupied_nodes()
            .iter()
            .filter_map(|id| nodes.get(id))
            .filter_map(|n| n.attributes.zone())
            .collect();

        let mut vetoes = BTreeSet::new();
        let mut best: Option<(u32, bool, NodeId)> = None;
        for node in nodes.values() {
            if let Some(veto) = self.veto(nodes, group, meta, node) {
                vetoes.insert(veto);
                continue;
            }
            let count = counts.get(&node.id).copied().unwrap_or(0);
            let same_zone = node.attributes.zone().is_some_and(|z| used_zones.contains(z));
            let key = (count, same_zone, node.id);
            if best.map_or(true, |b| key < b) {
                best = Some(key);
            }
        }

        best.map(|(_, _, id)| id)
            .ok_or_else(|| vetoes.into_iter().collect())
    }

    fn awareness_allows(
        &self,
        nodes: &BTreeMap<NodeId, NodeInfo>,
        group: &ShardGroup,
        meta: &IndexMetadata,
        node: &NodeInfo,
        attribute: &str,
    ) -> bool {
        let Some(value) = node.attributes.get(attribute) else {
            return true;
        };
        let values: BTreeSet<&str> = nodes
            .values()
            .filter(|n| n.can_host_data())
            .filter_map(|n| n.attributes.get(attribute))
            .collect();
        if values.len() <= 1 {
            return true;
        }
        // Safety: values.len() is bounded by the node limit.
        #[allow(clippy::cast_possible_truncation)]
        let max_per_value = meta.copies_per_shard().div_ceil(values.len() as u32);
        let existing = group
            .occupied_nodes()
            .iter()
            .filter_map(|id| nodes.get(id))
            .filter(|n| n.attributes.get(attribute) == Some(value))
            .count();
        existing < max_per_value as usize
    }

    fn assign_unassigned(&self, scratch: &mut Scratch<'_>) {
        // Primaries first: replicas recover from them.
        for role in [CopyRole::Primary, CopyRole::Replica] {
            for shard in scratch.shard_ids() {
                loop {
                    let Some(group) = scratch.map.group(shard) else {
                        break;
                    };
                    let pending = group
                        .copies
                        .iter()
                        .filter(|c| c.role == role && c.state == CopyState::Unassigned)
                        .count();
                    if pending == 0 {
                        break;
                    }
                    if !self.assign_one(scratch, shard, role) {
                        break;
                    }
                }
            }
        }
    }

    /// Places one unassigned copy of `role`. Returns true if it was placed.
    fn assign_one(&self, scratch: &mut Scratch<'_>, shard: ShardId, role: CopyRole) -> bool {
        let Some(routing) = scratch.map.index(shard.index) else {
            return false;
        };
        let meta = routing.meta.clone();
        let Some(group) = scratch.map.group(shard).cloned() else {
            return false;
        };
        let state = scratch.state;
        let nodes = &state.nodes;

        let decision = if role == CopyRole::Primary {
            let promotable = group
                .replicas()
                .filter(|c| c.state.is_active())
                .filter_map(|c| c.node)
                .filter(|n| state.node_holds_copies(*n))
                .min();
            if let Some(node) = promotable {
                scratch.push(ShardChange::Promote { shard, node });
                return true;
            }
            let last = group.primary().and_then(|c| c.last_node);
            match last {
                Some(last) => {
                    let back = nodes.get(&last).is_some_and(NodeInfo::can_host_data)
                        && !group.occupied_nodes().contains(&last);
                    if back {
                        Ok(last)
                    } else {
                        Err(UnassignedReason::AwaitingLastNode)
                    }
                }
                None => self
                    .choose_node(nodes, &scratch.map, &group, &meta)
                    .map_err(|vetoes| UnassignedReason::NoEligibleNode { vetoes }),
            }
        } else if group.active_primary_node().is_none() {
            Err(UnassignedReason::PrimaryInactive)
        } else {
            self.choose_node(nodes, &scratch.map, &group, &meta)
                .map_err(|vetoes| UnassignedReason::NoEligibleNode { vetoes })
        };

        match decision {
            Ok(node) => {
                debug!(shard = %shard, role = ?role, node = %node, "assigning copy");
                scratch.push(ShardChange::Assign { shard, role, node });
                true
            }
            Err(reason) => {
                let current = group
                    .copies
                    .iter()
                    .find(|c| c.role == role && c.state == CopyState::Unassigned)
                    .and_then(|c| c.unassigned_reason.clone());
                if current.as_ref() != Some(&reason) {
                    debug!(shard = %shard, role = ?role, reason = %reason, "copy stays unassigned");
                    scratch.push(ShardChange::Explain { shard, role, reason });
                }
                false
            }
        }
    }

    /// Starts relocations for copies that sit outside their index's tier.
    fn relocate_misplaced(&self, scratch: &mut Scratch<'_>) {
        for shard in scratch.shard_ids() {
            if scratch.map.relocations_in_flight() >= self.config.max_concurrent_relocations {
                return;
            }
            let Some(routing) = scratch.map.index(shard.index) else {
                continue;
            };
            let Some(required) = routing.meta.tier.clone() else {
                continue;
            };
            let meta = routing.meta.clone();
            let Some(group) = scratch.map.group(shard).cloned() else {
                continue;
            };

            let misplaced: Vec<NodeId> = group
                .copies
                .iter()
                .filter(|c| c.state == CopyState::InSync)
                .filter_map(|c| c.node)
                .filter(|n| {
                    scratch
                        .state
                        .nodes
                        .get(n)
                        .and_then(|info| info.attributes.data_tier())
                        .is_some_and(|t| t != required)
                })
                .collect();

            for from in misplaced {
                let Some(group) = scratch.map.group(shard).cloned() else {
                    break;
                };
                match self.choose_node(&scratch.state.nodes, &scratch.map, &group, &meta) {
                    Ok(to) => {
                        info!(shard = %shard, from = %from, to = %to, tier = %required, "relocating to tier");
                        scratch.push(ShardChange::StartRelocation { shard, from, to });
                        if scratch.map.relocations_in_flight()
                            >= self.config.max_concurrent_relocations
                        {
                            return;
                        }
                    }
                    Err(vetoes) => {
                        debug!(shard = %shard, from = %from, ?vetoes, "no node in tier");
                    }
                }
            }
        }
    }
}

fn resize_replicas(
    scratch: &mut Scratch<'_>,
    index: IndexId,
    replicas: u32,
) -> Result<(), AllocationError> {
    let groups: Vec<(ShardId, usize)> = scratch
        .map
        .index(index)
        .ok_or(AllocationError::IndexNotFound { index })?
        .groups
        .iter()
        .map(|g| (g.shard, g.replicas().count()))
        .collect();

    let target = replicas as usize;
    for (shard, current) in groups {
        for _ in target..current {
            scratch.try_push(ShardChange::RemoveReplica { shard })?;
        }
        for _ in current..target {
            scratch.try_push(ShardChange::AddReplica { shard })?;
        }
    }
    Ok(())
}

/// Working copy of the shard map that records every change applied to it.
struct Scratch<'a> {
    state: &'a ClusterState,
    map: ShardMap,
    changes: Vec<ShardChange>,
}

impl<'a> Scratch<'a> {
    fn new(state: &'a ClusterState) -> Self {
        Self {
            state,
            map: state.shard_map.clone(),
            changes: Vec::new(),
        }
    }

    fn try_push(&mut self, change: ShardChange) -> Result<(), ShardMapError> {
        self.map.apply(&change)?;
        self.changes.push(change);
        Ok(())
    }

    /// Applies a change the allocator derived from the map itself.
    fn push(&mut self, change: ShardChange) {
        if let Err(e) = self.try_push(change) {
            // Changes are derived from the scratch map, so this is a bug.
            debug_assert!(false, "allocator produced invalid change: {e}");
            warn!(error = %e, "allocator produced invalid change");
        }
    }

    fn shard_ids(&self) -> Vec<ShardId> {
        self.map.groups().map(|g| g.shard).collect()
    }

    /// Fails every copy hosted on a node that no longer holds copies,
    /// promoting an active replica where the primary is lost.
    fn fail_departed(&mut self) {
        for shard in self.shard_ids() {
            let Some(group) = self.map.group(shard).cloned() else {
                continue;
            };

            for copy in &group.copies {
                if let (Some(from), Some(to)) = (copy.node, copy.relocating_to) {
                    if !self.state.node_holds_copies(to) {
                        self.push(ShardChange::CancelRelocation { shard, from });
                    }
                }
            }

            let primary_lost = group
                .primary()
                .and_then(|c| c.node)
                .filter(|n| !self.state.node_holds_copies(*n));
            if let Some(lost) = primary_lost {
                let group = self.map.group(shard).cloned().unwrap_or_else(|| group.clone());
                let promotable = group
                    .replicas()
                    .filter(|c| c.state.is_active())
                    .filter_map(|c| c.node)
                    .filter(|n| self.state.node_holds_copies(*n))
                    .min();
                match promotable {
                    Some(node) => {
                        info!(shard = %shard, lost = %lost, promoted = %node, "promoting replica");
                        self.push(ShardChange::Promote { shard, node });
                    }
                    None => {
                        warn!(shard = %shard, lost = %lost, "primary lost with no active replica");
                        self.push(ShardChange::Unassign {
                            shard,
                            node: lost,
                            reason: UnassignedReason::NodeLeft,
                        });
                    }
                }
            }

            let Some(group) = self.map.group(shard).cloned() else {
                continue;
            };
            for node in group.copies.iter().filter_map(|c| c.node) {
                if !self.state.node_holds_copies(node) {
                    self.push(ShardChange::Unassign {
                        shard,
                        node,
                        reason: UnassignedReason::NodeLeft,
                    });
                }
            }
        }
    }

    fn into_plan(self) -> AllocationPlan {
        AllocationPlan {
            changes: self.changes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessel_core::{Liveness, NodeAttributes, NodeRoles, NodeStats, ShardOrdinal};

    use crate::shard_map::Health;

    fn data_node(id: u64, zone: &str) -> NodeInfo {
        let mut info = NodeInfo::new(
            NodeId::new(id),
            NodeRoles::ALL,
            NodeAttributes::new().with("zone", zone),
        );
        info.liveness = Liveness::Alive;
        info
    }

    fn state_with_nodes(nodes: Vec<NodeInfo>) -> ClusterState {
        let mut state = ClusterState::empty();
        for n in nodes {
            state.nodes.insert(n.id, n);
        }
        state
    }

    fn apply(state: &mut ClusterState, plan: &AllocationPlan) {
        state.apply_changes(&plan.changes).unwrap();
        state.shard_map.validate().unwrap();
    }

    /// Marks every initializing copy as started, repeatedly rerouting.
    fn settle(allocator: &Allocator, state: &mut ClusterState) {
        for _ in 0..20 {
            let started: Vec<(ShardId, NodeId)> = state
                .shard_map
                .groups()
                .flat_map(|g| {
                    g.copies
                        .iter()
                        .filter(|c| c.state == CopyState::Initializing)
                        .filter_map(move |c| c.node.map(|n| (g.shard, n)))
                        .chain(
                            g.copies
                                .iter()
                                .filter_map(move |c| c.relocating_to.map(|n| (g.shard, n))),
                        )
                })
                .collect();
            if started.is_empty() {
                let plan = allocator.reroute(state);
                if plan.is_empty() {
                    return;
                }
                apply(state, &plan);
                continue;
            }
            for (shard, node) in started {
                let plan = allocator.on_shard_started(state, shard, node);
                apply(state, &plan);
            }
        }
    }

    fn create(allocator: &Allocator, state: &mut ClusterState, primaries: u32, replicas: u32) {
        let meta = IndexMetadata::new(IndexId::new(1), "logs", primaries, replicas, 0);
        let plan = allocator.create_index(state, meta).unwrap();
        apply(state, &plan);
    }

    fn shard(ordinal: u32) -> ShardId {
        ShardId::new(IndexId::new(1), ShardOrdinal::new(ordinal))
    }

    #[test]
    fn test_replica_limited_by_node_count_is_yellow_not_red() {
        let allocator = Allocator::default();
        let mut state = state_with_nodes(vec![data_node(1, "a"), data_node(2, "b")]);
        create(&allocator, &mut state, 3, 2);
        settle(&allocator, &mut state);

        assert_eq!(state.health(), Health::Yellow);
        let unassigned: Vec<_> = state
            .shard_map
            .groups()
            .flat_map(|g| &g.copies)
            .filter(|c| c.state == CopyState::Unassigned)
            .collect();
        assert_eq!(unassigned.len(), 3);
        for copy in unassigned {
            assert!(matches!(
                copy.unassigned_reason,
                Some(UnassignedReason::NoEligibleNode { .. })
            ));
        }
    }

    #[test]
    fn test_primaries_and_replicas_balance_across_nodes() {
        let allocator = Allocator::default();
        let mut state = state_with_nodes(vec![
            data_node(1, "a"),
            data_node(2, "b"),
            data_node(3, "c"),
            data_node(4, "d"),
        ]);
        create(&allocator, &mut state, 2, 1);
        settle(&allocator, &mut state);

        assert_eq!(state.health(), Health::Green);
        let counts = state.shard_map.shard_counts();
        assert_eq!(counts.len(), 4);
        assert!(counts.values().all(|&c| c == 1), "counts: {counts:?}");
    }

    #[test]
    fn test_node_left_promotes_lowest_id_replica() {
        let allocator = Allocator::default();
        let mut state =
            state_with_nodes(vec![data_node(1, "a"), data_node(2, "b"), data_node(3, "c")]);
        create(&allocator, &mut state, 1, 2);
        settle(&allocator, &mut state);

        let primary = state.shard_map.group(shard(0)).unwrap().active_primary_node().unwrap();
        state.nodes.get_mut(&primary).unwrap().liveness = Liveness::Left;
        let plan = allocator.on_membership_change(&state);
        apply(&mut state, &plan);

        let group = state.shard_map.group(shard(0)).unwrap();
        let expected = [1, 2, 3]
            .into_iter()
            .map(NodeId::new)
            .filter(|n| *n != primary)
            .min()
            .unwrap();
        assert_eq!(group.active_primary_node(), Some(expected));
        // Never a version without a primary.
        assert_ne!(state.health(), Health::Red);
    }

    #[test]
    fn test_lost_primary_without_replica_waits_for_last_node() {
        let allocator = Allocator::default();
        let mut state = state_with_nodes(vec![data_node(1, "a"), data_node(2, "b")]);
        create(&allocator, &mut state, 1, 0);
        settle(&allocator, &mut state);

        let primary = state.shard_map.group(shard(0)).unwrap().active_primary_node().unwrap();
        state.nodes.get_mut(&primary).unwrap().liveness = Liveness::Left;
        let plan = allocator.on_membership_change(&state);
        apply(&mut state, &plan);

        let copy = state.shard_map.group(shard(0)).unwrap().primary().unwrap().clone();
        assert_eq!(copy.state, CopyState::Unassigned);
        assert_eq!(copy.unassigned_reason, Some(UnassignedReason::AwaitingLastNode));
        assert_eq!(state.health(), Health::Red);

        // The node comes back and gets its primary back.
        state.nodes.get_mut(&primary).unwrap().liveness = Liveness::Alive;
        let plan = allocator.reroute(&state);
        apply(&mut state, &plan);
        let copy = state.shard_map.group(shard(0)).unwrap().primary().unwrap().clone();
        assert_eq!(copy.node, Some(primary));
    }

    #[test]
    fn test_disk_watermark_excludes_node() {
        let allocator = Allocator::default();
        let mut full = data_node(2, "b");
        full.stats = NodeStats {
            disk_used_ratio: 0.95,
        };
        let mut state = state_with_nodes(vec![data_node(1, "a"), full]);
        create(&allocator, &mut state, 1, 1);
        settle(&allocator, &mut state);

        let group = state.shard_map.group(shard(0)).unwrap();
        let replica = group.replicas().next().unwrap();
        assert_eq!(replica.state, CopyState::Unassigned);
        let Some(UnassignedReason::NoEligibleNode { vetoes }) = &replica.unassigned_reason else {
            panic!("expected no eligible node, got {:?}", replica.unassigned_reason);
        };
        assert!(vetoes.contains(&Veto::DiskWatermark));
    }

    #[test]
    fn test_zone_awareness_spreads_copies() {
        let allocator = Allocator::default();
        let mut state = state_with_nodes(vec![
            data_node(1, "a"),
            data_node(2, "a"),
            data_node(3, "b"),
        ]);
        create(&allocator, &mut state, 2, 1);
        settle(&allocator, &mut state);

        for group in state.shard_map.groups() {
            let zones: BTreeSet<&str> = group
                .occupied_nodes()
                .iter()
                .filter_map(|n| state.nodes.get(n))
                .filter_map(|n| n.attributes.zone())
                .collect();
            assert_eq!(zones.len(), 2, "group {} in one zone", group.shard);
        }
    }

    #[test]
    fn test_set_replicas_busy_while_recovering() {
        let allocator = Allocator::default();
        let mut state = state_with_nodes(vec![data_node(1, "a"), data_node(2, "b")]);
        create(&allocator, &mut state, 1, 1);

        let err = allocator
            .on_lifecycle_request(&state, IndexId::new(1), &LifecycleRequest::SetReplicas(0))
            .unwrap_err();
        assert!(matches!(err, AllocationError::Busy { .. }));

        settle(&allocator, &mut state);
        let plan = allocator
            .on_lifecycle_request(&state, IndexId::new(1), &LifecycleRequest::SetReplicas(0))
            .unwrap();
        apply(&mut state, &plan);
        assert_eq!(state.shard_map.group(shard(0)).unwrap().copies.len(), 1);

        // Idempotent.
        let again = allocator
            .on_lifecycle_request(&state, IndexId::new(1), &LifecycleRequest::SetReplicas(0))
            .unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn test_reference_only_waits_for_snapshot() {
        let allocator = Allocator::default();
        let mut state = state_with_nodes(vec![data_node(1, "a"), data_node(2, "b")]);
        create(&allocator, &mut state, 1, 1);
        settle(&allocator, &mut state);

        let request = LifecycleRequest::ConvertToReferenceOnly;
        let err = allocator
            .on_lifecycle_request(&state, IndexId::new(1), &request)
            .unwrap_err();
        assert_eq!(
            err,
            AllocationError::Busy {
                index: IndexId::new(1),
                reason: "snapshot pending"
            }
        );

        let plan = allocator.on_shard_snapshotted(&state, shard(0));
        apply(&mut state, &plan);
        let plan = allocator
            .on_lifecycle_request(&state, IndexId::new(1), &request)
            .unwrap();
        apply(&mut state, &plan);

        let routing = state.shard_map.index(IndexId::new(1)).unwrap();
        assert!(routing.meta.reference_only);
        assert_eq!(routing.meta.replicas, 0);
        assert_eq!(routing.groups[0].copies.len(), 1);
    }

    #[test]
    fn test_require_tier_relocates_copies() {
        let allocator = Allocator::default();
        let hot = |id, zone| {
            let mut n = data_node(id, zone);
            n.attributes = n.attributes.clone().with("data_tier", "hot");
            n
        };
        let warm = |id, zone| {
            let mut n = data_node(id, zone);
            n.attributes = n.attributes.clone().with("data_tier", "warm");
            n
        };
        let mut state = state_with_nodes(vec![hot(1, "a"), warm(2, "b")]);
        let mut meta = IndexMetadata::new(IndexId::new(1), "logs", 1, 0, 0);
        meta.tier = Some("hot".to_string());
        let plan = allocator.create_index(&state, meta).unwrap();
        apply(&mut state, &plan);
        settle(&allocator, &mut state);
        assert_eq!(
            state.shard_map.group(shard(0)).unwrap().active_primary_node(),
            Some(NodeId::new(1))
        );

        let plan = allocator
            .on_lifecycle_request(
                &state,
                IndexId::new(1),
                &LifecycleRequest::RequireTier("warm".to_string()),
            )
            .unwrap();
        apply(&mut state, &plan);
        assert_eq!(state.shard_map.relocations_in_flight(), 1);

        settle(&allocator, &mut state);
        assert_eq!(
            state.shard_map.group(shard(0)).unwrap().active_primary_node(),
            Some(NodeId::new(2))
        );
    }

    #[test]
    fn test_remove_all_copies_is_idempotent() {
        let allocator = Allocator::default();
        let mut state = state_with_nodes(vec![data_node(1, "a")]);
        create(&allocator, &mut state, 1, 0);

        let plan = allocator
            .on_lifecycle_request(&state, IndexId::new(1), &LifecycleRequest::RemoveAllCopies)
            .unwrap();
        apply(&mut state, &plan);
        assert!(state.shard_map.index(IndexId::new(1)).is_none());

        let again = allocator
            .on_lifecycle_request(&state, IndexId::new(1), &LifecycleRequest::RemoveAllCopies)
            .unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn test_stale_replica_reported() {
        let allocator = Allocator::default();
        let mut state = state_with_nodes(vec![data_node(1, "a"), data_node(2, "b")]);
        create(&allocator, &mut state, 1, 1);
        settle(&allocator, &mut state);

        let replica = state
            .shard_map
            .group(shard(0))
            .unwrap()
            .replicas()
            .next()
            .and_then(|c| c.node)
            .unwrap();
        let plan = allocator.on_shard_failed(&state, shard(0), replica);
        apply(&mut state, &plan);
        assert_eq!(state.health(), Health::Yellow);

        let plan = allocator.on_shard_started(&state, shard(0), replica);
        apply(&mut state, &plan);
        assert_eq!(state.health(), Health::Green);
    }
}
