//! Master duties.
//!
//! While elected, a node owns the membership directory and is the only
//! writer of the cluster state. Every change follows the same path: derive
//! a successor of the applied state, mutate it, persist it, apply it
//! locally, then broadcast it. Successors that change nothing but
//! heartbeat timestamps are not published.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::join_all;
use tessel_core::{IndexId, LifecycleRecord, Liveness, Millis, NodeId, NodeInfo, StateVersion, TermId};
use tessel_lifecycle::{IndexStats, LifecycleEngine};
use tessel_quorum::{MembershipDirectory, MembershipError, MembershipEvent, MembershipTimings};
use tessel_routing::{AllocationPlan, Allocator, ClusterState, IndexMetadata};
use tracing::{debug, info, warn};

use super::{NodeInner, NodeState};
use crate::api::IndexSpec;
use crate::error::{ApiError, ApiResult};
use crate::transport::{ClusterRequest, ClusterResponse, ClusterTransport, NodeHeartbeat, ShardReport};

/// State only the elected master keeps.
pub(super) struct MasterState {
    term: TermId,
    membership: MembershipDirectory,
    /// Latest shard reports per node.
    reports: BTreeMap<NodeId, Vec<ShardReport>>,
    lifecycle: LifecycleEngine,
    /// Highest version seen anywhere; successors are numbered above it.
    floor: StateVersion,
}

impl MasterState {
    /// Index sizes from primaries and segment counts from every copy.
    fn index_stats(&self) -> BTreeMap<IndexId, IndexStats> {
        let mut stats: BTreeMap<IndexId, IndexStats> = BTreeMap::new();
        for report in self.reports.values().flatten() {
            let entry = stats.entry(report.shard.index).or_default();
            if report.primary {
                entry.size_bytes += report.stats.size_bytes;
            }
            entry.max_segment_count = entry.max_segment_count.max(report.stats.segment_count);
        }
        stats
    }
}

impl<C: ClusterTransport> NodeInner<C> {
    /// Takes over master duties after winning the election for `term`.
    pub(super) async fn assume_master(&self, term: TermId, max_seen: StateVersion, now: Millis) {
        // Another voter may hold a newer state than ours.
        if max_seen > self.lock().view.version() {
            for peer in self.config.voters.iter().copied().filter(|&p| p != self.me()) {
                self.fetch_state_from(peer).await;
                if self.lock().view.version() >= max_seen {
                    break;
                }
            }
        }

        let mut guard = self.lock();
        let still_master = guard
            .quorum
            .as_ref()
            .is_some_and(|q| q.is_master() && q.term() == term);
        if !still_master {
            debug!(node = %self.me(), term = term.get(), "lost election before assuming duties");
            return;
        }
        let current = guard.view.current();
        if current.version < max_seen {
            warn!(
                node = %self.me(),
                version = current.version.get(),
                max_seen = max_seen.get(),
                "assuming master duties without the newest cluster state"
            );
        }
        guard.master = Some(MasterState {
            term,
            membership: MembershipDirectory::from_nodes(
                MembershipTimings::from_limits(&self.config.limits),
                current.nodes.values().cloned(),
                now,
            ),
            reports: BTreeMap::new(),
            lifecycle: LifecycleEngine::new(self.config.backoff),
            floor: max_seen.max(current.version),
        });
        guard.joined_master = None;
        info!(
            node = %self.me(),
            term = term.get(),
            version = current.version.get(),
            nodes = current.nodes.len(),
            "assumed master duties"
        );
    }

    /// The next state to publish, before any change is applied.
    fn draft(&self, guard: &NodeState<C>) -> Option<ClusterState> {
        let master = guard.master.as_ref()?;
        let mut next = guard
            .view
            .current()
            .successor(self.me(), master.term, master.floor);
        next.nodes = master
            .membership
            .nodes()
            .map(|n| (n.id, n.clone()))
            .collect();
        Some(next)
    }

    /// Periodic master work: liveness sweep, reroute, lifecycle and
    /// rebalancing. Publishes if anything changed.
    pub(super) async fn master_tick(&self, now: Millis) {
        if self.lock().master.is_none() {
            return;
        }
        let _publish = self.publish_lock.lock().await;

        let next = {
            let mut guard = self.lock();
            let Some(mut next) = self.draft(&guard) else {
                return;
            };
            let current = guard.view.current();
            let Some(master) = guard.master.as_mut() else {
                return;
            };

            for event in master.membership.sweep(now) {
                if let MembershipEvent::Left(node) | MembershipEvent::Removed(node) = event {
                    master.reports.remove(&node);
                }
                debug!(event = ?event, "membership event");
            }
            next.nodes = master
                .membership
                .nodes()
                .map(|n| (n.id, n.clone()))
                .collect();

            let plan = self.allocator.on_membership_change(&next);
            apply_plan(&mut next, plan);

            let stats = master.index_stats();
            let report = master.lifecycle.run(&mut next, &self.allocator, &stats, now);
            for (index, phase) in &report.completed {
                debug!(index = %index, phase = ?phase, "lifecycle step applied");
            }

            let plan = self.rebalancer.plan(&next, &self.allocator);
            apply_plan(&mut next, plan);

            if same_content(&current, &next) {
                return;
            }
            next
        };

        if let Err(e) = self.publish(next).await {
            warn!(node = %self.me(), error = %e, "publication failed");
        }
    }

    /// Publishes `next` in two rounds. The state is staged on every node;
    /// once a majority of the configured voters staged it, the master
    /// persists and applies it and tells everyone to commit. Callers hold
    /// the publish lock.
    async fn publish(&self, next: ClusterState) -> ApiResult<Arc<ClusterState>> {
        let next = Arc::new(next);
        let targets: Vec<NodeId> = {
            let mut guard = self.lock();
            let Some(master) = guard.master.as_mut() else {
                return Err(ApiError::NoMaster);
            };
            // A failed round never reuses its version.
            master.floor = next.version;

            let mut targets: Vec<NodeId> = next
                .nodes
                .values()
                .filter(|n| n.liveness != Liveness::Left)
                .map(|n| n.id)
                .chain(self.config.voters.iter().copied())
                .filter(|&n| n != self.me())
                .collect();
            targets.sort_unstable();
            targets.dedup();
            targets
        };

        let sends = targets.iter().map(|&to| {
            let state = Arc::clone(&next);
            async move { (to, self.transport.send(to, ClusterRequest::Publish(state)).await) }
        });
        let staged_by_voters = join_all(sends)
            .await
            .into_iter()
            .filter(|(to, r)| {
                self.config.voters.contains(to)
                    && matches!(r, Ok(ClusterResponse::Published { version }) if *version == next.version)
            })
            .count();
        let votes = staged_by_voters + usize::from(self.config.is_voter());
        let quorum = self.config.voters.len() / 2 + 1;
        if votes < quorum {
            warn!(
                node = %self.me(),
                version = next.version.get(),
                term = next.term.get(),
                votes,
                quorum,
                "publication not staged by a majority"
            );
            return Err(ApiError::NoMaster);
        }

        {
            let mut guard = self.lock();
            let still_master = guard.master.as_ref().is_some_and(|m| m.term == next.term);
            if !still_master {
                return Err(ApiError::NoMaster);
            }
            let vote = guard
                .quorum
                .as_ref()
                .map(tessel_quorum::QuorumNode::persistent_vote)
                .unwrap_or_default();
            self.persist(vote, &next)?;
            self.install(&mut guard, Arc::clone(&next))
                .map_err(ApiError::internal)?;
        }

        let commits = targets.iter().map(|&to| {
            self.transport.send(
                to,
                ClusterRequest::Commit {
                    term: next.term,
                    version: next.version,
                },
            )
        });
        let applied = join_all(commits)
            .await
            .into_iter()
            .filter(|r| {
                matches!(r, Ok(ClusterResponse::Published { version }) if *version >= next.version)
            })
            .count();

        info!(
            node = %self.me(),
            version = next.version.get(),
            term = next.term.get(),
            health = ?next.health(),
            votes,
            applied,
            targets = targets.len(),
            "published cluster state"
        );
        Ok(next)
    }

    /// Runs `change` against a successor and publishes it.
    async fn mutate<T, F>(&self, change: F) -> ApiResult<T>
    where
        T: Send,
        F: FnOnce(&mut ClusterState, &Allocator, Millis) -> ApiResult<T> + Send,
    {
        let _publish = self.publish_lock.lock().await;
        let now = self.clock.now_ms();
        let (current, mut next) = {
            let guard = self.lock();
            let next = self.draft(&guard).ok_or(ApiError::NoMaster)?;
            (guard.view.current(), next)
        };
        let value = change(&mut next, &self.allocator, now)?;
        if !same_content(&current, &next) {
            self.publish(next).await?;
        }
        Ok(value)
    }

    pub(super) async fn create_index_on_master(&self, spec: IndexSpec) -> ApiResult<IndexId> {
        self.validate_index(&spec)?;
        let max_indices = self.config.limits.max_indices as usize;
        self.mutate(move |next, allocator, now| {
            if next.shard_map.index_by_name(&spec.name).is_some() {
                return Err(ApiError::AlreadyExists { name: spec.name });
            }
            if next.shard_map.indices().count() >= max_indices {
                return Err(ApiError::InvalidArgument {
                    name: "name",
                    reason: format!("cluster already holds {max_indices} indices"),
                });
            }

            let id = next.next_index_id;
            next.next_index_id = id.next();
            let meta = IndexMetadata::new(id, spec.name.clone(), spec.primary_shards, spec.replicas, now);
            let plan = allocator.create_index(next, meta)?;
            next.apply_changes(&plan.changes).map_err(ApiError::internal)?;
            next.lifecycle
                .insert(id, LifecycleRecord::new(id, spec.policy, now));
            info!(
                index = %id,
                name = %spec.name,
                primary_shards = spec.primary_shards,
                replicas = spec.replicas,
                "index created"
            );
            Ok(id)
        })
        .await
    }

    /// Applies an allocator reaction to a shard report.
    pub(super) async fn on_shard_event<F>(&self, react: F) -> ClusterResponse
    where
        F: FnOnce(&ClusterState, &Allocator) -> AllocationPlan + Send,
    {
        let result = self
            .mutate(|next, allocator, _| {
                let plan = react(next, allocator);
                next.apply_changes(&plan.changes).map_err(ApiError::internal)
            })
            .await;
        match result {
            Ok(()) => ClusterResponse::Ack,
            Err(ApiError::NoMaster) => ClusterResponse::NotMaster {
                master: self.lock().master_hint,
            },
            Err(e) => ClusterResponse::Api(e),
        }
    }

    pub(super) fn handle_join(&self, info: NodeInfo) -> ClusterResponse {
        let now = self.clock.now_ms();
        let mut guard = self.lock();
        let hint = self.current_master_at(&guard, now);
        let Some(master) = guard.master.as_mut() else {
            return ClusterResponse::NotMaster { master: hint };
        };
        let node = info.id;
        let (outcome, event) = master.membership.join(info, now);
        if let Some(event) = event {
            debug!(node = %node, event = ?event, "membership event");
        }
        ClusterResponse::Joined(outcome)
    }

    pub(super) fn handle_heartbeat(&self, heartbeat: NodeHeartbeat) -> ClusterResponse {
        let now = self.clock.now_ms();
        let mut guard = self.lock();
        let hint = self.current_master_at(&guard, now);
        let version = guard.view.version();
        let Some(master) = guard.master.as_mut() else {
            return ClusterResponse::NotMaster { master: hint };
        };
        match master
            .membership
            .heartbeat(heartbeat.node, heartbeat.stats, now)
        {
            Ok(event) => {
                if let Some(event) = event {
                    debug!(node = %heartbeat.node, event = ?event, "membership event");
                }
                master.reports.insert(heartbeat.node, heartbeat.shards);
                ClusterResponse::HeartbeatAck { version }
            }
            Err(MembershipError::UnknownNode { .. } | MembershipError::MustRejoin { .. }) => {
                ClusterResponse::MustRejoin
            }
        }
    }
}

fn apply_plan(next: &mut ClusterState, plan: AllocationPlan) {
    if plan.is_empty() {
        return;
    }
    let mut scratch = next.clone();
    match scratch.apply_changes(&plan.changes) {
        Ok(()) => *next = scratch,
        Err(e) => warn!(error = %e, changes = plan.changes.len(), "discarding allocation plan"),
    }
}

/// Returns true if publishing `b` after `a` would tell nodes nothing new.
///
/// Heartbeat timestamps and resource stats are not compared.
fn same_content(a: &ClusterState, b: &ClusterState) -> bool {
    a.term == b.term
        && a.master == b.master
        && a.next_index_id == b.next_index_id
        && a.shard_map == b.shard_map
        && a.lifecycle == b.lifecycle
        && a.nodes.len() == b.nodes.len()
        && a.nodes.values().zip(b.nodes.values()).all(|(x, y)| {
            x.id == y.id
                && x.roles == y.roles
                && x.attributes == y.attributes
                && x.liveness == y.liveness
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessel_core::{NodeAttributes, NodeRoles, ShardId, ShardOrdinal};
    use tessel_replication::ShardStats;

    fn node(id: u64) -> NodeInfo {
        NodeInfo::new(NodeId::new(id), NodeRoles::ALL, NodeAttributes::new())
    }

    fn state_with(nodes: &[NodeInfo]) -> ClusterState {
        let mut state = ClusterState::empty().successor(NodeId::new(1), TermId::new(1), StateVersion::new(0));
        state.nodes = nodes.iter().map(|n| (n.id, n.clone())).collect();
        state
    }

    #[test]
    fn test_heartbeat_timestamps_do_not_count_as_changes() {
        let a = state_with(&[node(1), node(2)]);
        let mut b = a.successor(NodeId::new(1), TermId::new(1), a.version);
        if let Some(n) = b.nodes.get_mut(&NodeId::new(2)) {
            n.last_heartbeat_ms = 9_999;
            n.stats.disk_used_ratio = 0.5;
        }
        assert!(same_content(&a, &b));

        if let Some(n) = b.nodes.get_mut(&NodeId::new(2)) {
            n.liveness = Liveness::Suspected;
        }
        assert!(!same_content(&a, &b));
    }

    #[test]
    fn test_new_master_is_a_change() {
        let a = state_with(&[node(1)]);
        let b = a.successor(NodeId::new(2), TermId::new(2), a.version);
        assert!(!same_content(&a, &b));
    }

    #[test]
    fn test_index_stats_sum_primaries_and_max_segments() {
        let shard = |ordinal| ShardId::new(IndexId::new(3), ShardOrdinal::new(ordinal));
        let report = |ordinal, primary, size_bytes, segment_count| ShardReport {
            shard: shard(ordinal),
            primary,
            stats: ShardStats {
                size_bytes,
                segment_count,
                ..ShardStats::default()
            },
        };
        let mut reports = BTreeMap::new();
        reports.insert(NodeId::new(1), vec![report(0, true, 100, 2), report(1, false, 70, 5)]);
        reports.insert(NodeId::new(2), vec![report(0, false, 100, 1), report(1, true, 70, 3)]);

        let master = MasterState {
            term: TermId::new(1),
            membership: MembershipDirectory::new(MembershipTimings::default()),
            reports,
            lifecycle: LifecycleEngine::default(),
            floor: StateVersion::new(0),
        };
        let stats = master.index_stats();
        assert_eq!(
            stats.get(&IndexId::new(3)),
            Some(&IndexStats {
                size_bytes: 170,
                max_segment_count: 5,
            })
        );
    }
}
