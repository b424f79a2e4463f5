//! Local shard copies.
//!
//! Every applied cluster state is reconciled against the local copies:
//! copies the shard map no longer places here are dropped, new ones get an
//! empty engine, and the node holding an active primary runs the write
//! path for it. Work that needs the network (replica recovery, snapshot
//! upload, reference mounts, reports to the master) is planned under the
//! state lock and run afterwards, at most once per `recovery_retry_ms` for
//! the same shard, node and kind.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use tessel_core::{Millis, NodeId, ShardId};
use tessel_lifecycle::{ReferenceStorage, ShardSnapshot};
use tessel_replication::{
    MemoryShardStorage, PrimaryShard, Query, ReplicatedOp, ReplicationError, ShardEngine,
    SharedEngine, StorageConfig,
};
use tessel_routing::{
    ClusterState, CopyRole, CopyState, IndexMetadata, ShardGroup, SnapshotStatus,
};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{node_stats, NodeInner, NodeState};
use crate::api::{WriteAck, WriteRequest};
use crate::error::ApiError;
use crate::transport::{
    ClusterRequest, ClusterResponse, ClusterTransport, NodeHeartbeat, ShardReport, ShardRpc,
};

/// Pause between attempts to report a replica that missed a write.
const FAILED_REPORT_RETRY_MS: u64 = 50;

/// One shard copy hosted by this node.
pub(super) struct LocalShard<C: ClusterTransport> {
    engine: SharedEngine,
    /// Present while this node holds the active primary.
    primary: Option<Arc<PrimaryShard<ShardRpc<C>>>>,
    /// Storage replaced by the repository snapshot.
    mounted: bool,
    /// Snapshot acknowledged by the master.
    snapshot_reported: bool,
}

/// Background shard work, throttled per shard, node and kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(super) enum TaskKind {
    Started,
    Recover,
    Snapshot,
    Mount,
}

enum ShardTask<C: ClusterTransport> {
    /// Tell the master a copy finished recovering.
    Started { shard: ShardId, node: NodeId },
    /// Tell the master a replica missed operations.
    Failed { shard: ShardId, node: NodeId },
    /// Bring a replica or relocation target up to date.
    Recover {
        primary: Arc<PrimaryShard<ShardRpc<C>>>,
        node: NodeId,
        report: bool,
    },
    /// Upload the primary's snapshot.
    Snapshot { shard: ShardId, engine: SharedEngine },
    /// Replace local storage with the repository snapshot.
    Mount { shard: ShardId, report: bool },
}

impl<C: ClusterTransport> NodeInner<C> {
    pub(super) fn engine(&self, shard: ShardId) -> Option<SharedEngine> {
        self.lock()
            .shards
            .get(&shard)
            .map(|local| Arc::clone(&local.engine))
    }

    fn new_engine(&self, shard: ShardId) -> SharedEngine {
        let storage = MemoryShardStorage::new(shard, StorageConfig::default());
        Arc::new(RwLock::new(ShardEngine::new(
            shard,
            Box::new(storage),
            Arc::clone(&self.scorer),
        )))
    }

    /// Aligns local copies with `state`.
    pub(super) fn reconcile_shards(
        &self,
        shards: &mut BTreeMap<ShardId, LocalShard<C>>,
        state: &ClusterState,
    ) {
        let me = self.me();
        let wanted: BTreeMap<ShardId, (&ShardGroup, &IndexMetadata)> = state
            .shard_map
            .indices()
            .flat_map(|routing| {
                routing
                    .groups
                    .iter()
                    .filter(|g| g.copies.iter().any(|c| c.occupies(me)))
                    .map(move |g| (g.shard, (g, &routing.meta)))
            })
            .collect();

        shards.retain(|shard, _| {
            let keep = wanted.contains_key(shard);
            if !keep {
                info!(node = %me, shard = %shard, "dropping local copy");
            }
            keep
        });

        for (shard, (group, meta)) in wanted {
            let local = shards.entry(shard).or_insert_with(|| {
                info!(node = %me, shard = %shard, "allocating local copy");
                LocalShard {
                    engine: self.new_engine(shard),
                    primary: None,
                    mounted: false,
                    snapshot_reported: false,
                }
            });

            {
                let mut engine = local.engine.write().expect("engine lock poisoned");
                engine.observe_primary_term(group.primary_term);
                engine.set_read_only(meta.read_only || meta.reference_only);
                if let Some(max_segments) = meta.max_segments {
                    if let Err(e) = engine.consolidate(max_segments) {
                        warn!(shard = %shard, error = %e, "consolidation failed");
                    }
                }
            }

            let is_primary = group
                .primary()
                .is_some_and(|c| c.node == Some(me) && c.state.is_active());
            if !is_primary {
                if local.primary.take().is_some() {
                    info!(node = %me, shard = %shard, "no longer primary");
                }
                continue;
            }

            let current = local
                .primary
                .as_ref()
                .filter(|p| p.primary_term() == group.primary_term)
                .cloned();
            if let Some(primary) = current {
                let assigned: BTreeSet<NodeId> =
                    recovery_targets(group, me).into_iter().map(|(n, _)| n).collect();
                for node in primary.replicas() {
                    if !assigned.contains(&node) {
                        primary.remove_replica(node);
                    }
                }
            } else {
                local.primary = Some(Arc::new(PrimaryShard::new(
                    Arc::clone(&local.engine),
                    group.primary_term,
                    Arc::clone(&self.rpc),
                    self.config.replication,
                )));
            }
        }
    }

    /// Local copy stats for the next heartbeat.
    pub(super) fn heartbeat_body(&self, guard: &NodeState<C>) -> NodeHeartbeat {
        let shards = guard
            .shards
            .iter()
            .map(|(shard, local)| ShardReport {
                shard: *shard,
                primary: local.primary.is_some(),
                stats: local.engine.read().expect("engine lock poisoned").stats(),
            })
            .collect();
        NodeHeartbeat {
            node: self.me(),
            stats: node_stats(guard.disk_used_ratio),
            shards,
            version: guard.view.version(),
        }
    }

    /// Plans and runs background work for local copies.
    pub(super) async fn shard_tick(&self, now: Millis) {
        let tasks = {
            let mut guard = self.lock();
            self.plan_shard_tasks(&mut guard, now)
        };
        if tasks.is_empty() {
            return;
        }
        join_all(tasks.into_iter().map(|task| self.run_shard_task(task))).await;
    }

    fn plan_shard_tasks(&self, guard: &mut NodeState<C>, now: Millis) -> Vec<ShardTask<C>> {
        let me = self.me();
        let retry_ms = self.config.recovery_retry_ms;
        let state = guard.view.current();
        let mut tasks = Vec::new();
        let due = |attempts: &mut BTreeMap<(ShardId, NodeId, TaskKind), Millis>,
                       shard: ShardId,
                       node: NodeId,
                       kind: TaskKind| {
            let key = (shard, node, kind);
            let ready = attempts
                .get(&key)
                .map_or(true, |&at| now.saturating_sub(at) >= retry_ms);
            if ready {
                attempts.insert(key, now);
            }
            ready
        };

        let NodeState {
            shards, attempts, ..
        } = guard;
        for (&shard, local) in shards.iter() {
            let (Some(group), Some(routing)) = (
                state.shard_map.group(shard),
                state.shard_map.index(shard.index),
            ) else {
                continue;
            };
            let meta = &routing.meta;

            // Our own copy: a new primary, or the target of a relocation.
            let own = group.copies.iter().find(|c| c.node == Some(me));
            let initializing_primary =
                own.is_some_and(|c| c.role == CopyRole::Primary && c.state == CopyState::Initializing);
            let relocation_target = group.copies.iter().any(|c| c.relocating_to == Some(me));
            if meta.reference_only {
                if !local.mounted && due(attempts, shard, me, TaskKind::Mount) {
                    tasks.push(ShardTask::Mount {
                        shard,
                        report: initializing_primary || relocation_target,
                    });
                }
            } else if initializing_primary && due(attempts, shard, me, TaskKind::Started) {
                tasks.push(ShardTask::Started { shard, node: me });
            }

            let Some(primary) = &local.primary else {
                continue;
            };
            for node in primary.take_failed() {
                tasks.push(ShardTask::Failed { shard, node });
            }

            let fanout: BTreeSet<NodeId> = primary.replicas().into_iter().collect();
            for (node, initializing) in recovery_targets(group, me) {
                if meta.reference_only {
                    continue;
                }
                if fanout.contains(&node) {
                    if initializing && due(attempts, shard, node, TaskKind::Started) {
                        tasks.push(ShardTask::Started { shard, node });
                    }
                } else if due(attempts, shard, node, TaskKind::Recover) {
                    tasks.push(ShardTask::Recover {
                        primary: Arc::clone(primary),
                        node,
                        report: initializing,
                    });
                }
            }

            if meta.snapshot == SnapshotStatus::Requested
                && !group.snapshot_done
                && !local.snapshot_reported
                && due(attempts, shard, me, TaskKind::Snapshot)
            {
                tasks.push(ShardTask::Snapshot {
                    shard,
                    engine: Arc::clone(&local.engine),
                });
            }
        }
        tasks
    }

    async fn run_shard_task(&self, task: ShardTask<C>) {
        match task {
            ShardTask::Started { shard, node } => {
                self.report(ClusterRequest::ShardStarted { shard, node }).await;
            }
            ShardTask::Failed { shard, node } => {
                warn!(shard = %shard, node = %node, "reporting failed replica");
                self.report(ClusterRequest::ShardFailed { shard, node }).await;
            }
            ShardTask::Recover {
                primary,
                node,
                report,
            } => match primary.recover_replica(node).await {
                Ok(outcome) => {
                    debug!(
                        shard = %primary.shard(),
                        node = %node,
                        ops = outcome.ops_sent,
                        full_resync = outcome.full_resync,
                        "replica caught up"
                    );
                    if report {
                        self.report(ClusterRequest::ShardStarted {
                            shard: primary.shard(),
                            node,
                        })
                        .await;
                    }
                }
                Err(e) => debug!(shard = %primary.shard(), node = %node, error = %e, "replica recovery failed"),
            },
            ShardTask::Snapshot { shard, engine } => {
                let snapshot = {
                    let engine = engine.read().expect("engine lock poisoned");
                    ShardSnapshot::capture(&engine)
                };
                if let Err(e) = snapshot.upload(self.repository.as_ref()).await {
                    warn!(shard = %shard, error = %e, "snapshot upload failed");
                    return;
                }
                if self.report(ClusterRequest::ShardSnapshotted { shard }).await {
                    if let Some(local) = self.lock().shards.get_mut(&shard) {
                        local.snapshot_reported = true;
                    }
                }
            }
            ShardTask::Mount { shard, report } => {
                let storage = match ReferenceStorage::mount(self.repository.as_ref(), shard).await {
                    Ok(storage) => storage,
                    Err(e) => {
                        warn!(shard = %shard, error = %e, "reference mount failed");
                        return;
                    }
                };
                let mounted = {
                    let mut guard = self.lock();
                    guard.shards.get_mut(&shard).map_or(false, |local| {
                        local
                            .engine
                            .write()
                            .expect("engine lock poisoned")
                            .replace_storage(Box::new(storage));
                        local.mounted = true;
                        true
                    })
                };
                if mounted {
                    info!(node = %self.me(), shard = %shard, "serving reference copy");
                    if report {
                        self.report(ClusterRequest::ShardStarted {
                            shard,
                            node: self.me(),
                        })
                        .await;
                    }
                }
            }
        }
    }

    pub(super) async fn handle_write(&self, request: WriteRequest) -> ClusterResponse {
        let shard = request.shard;
        let primary = self
            .lock()
            .shards
            .get(&shard)
            .and_then(|local| local.primary.clone());
        let Some(primary) = primary else {
            return ClusterResponse::Api(ApiError::PrimaryUnavailable { shard });
        };
        let deadline = Instant::now() + request.timeout;

        match primary
            .write(request.op, request.consistency, request.timeout)
            .await
        {
            Ok(outcome) => {
                // A replica that missed the write must be out of sync in the
                // cluster state before the write is acknowledged, or it could
                // be promoted without it.
                let mut failed: BTreeSet<NodeId> = outcome.failed_replicas.iter().copied().collect();
                failed.extend(primary.take_failed());
                let unreported = self.report_failed(shard, failed, deadline).await;
                if !unreported.is_empty() {
                    warn!(
                        shard = %shard,
                        seq_no = %outcome.seq_no,
                        nodes = ?unreported,
                        "master did not accept failed replicas; write not acknowledged"
                    );
                    primary.restore_failed(&unreported);
                    return ClusterResponse::Api(ApiError::Timeout {
                        missing: Vec::new(),
                    });
                }
                ClusterResponse::Written(WriteAck {
                    shard,
                    seq_no: outcome.seq_no,
                    primary_term: outcome.primary_term,
                })
            }
            Err(e) => ClusterResponse::Api(ApiError::from_write(shard, e)),
        }
    }

    /// Reports each failed replica until the master accepts it or `deadline`
    /// passes. Returns the replicas that were not accepted.
    async fn report_failed(
        &self,
        shard: ShardId,
        mut pending: BTreeSet<NodeId>,
        deadline: Instant,
    ) -> Vec<NodeId> {
        while !pending.is_empty() {
            for node in pending.clone() {
                let report = self.report(ClusterRequest::ShardFailed { shard, node });
                if let Ok(true) = tokio::time::timeout_at(deadline, report).await {
                    pending.remove(&node);
                }
            }
            let retry_at = Instant::now() + Duration::from_millis(FAILED_REPORT_RETRY_MS);
            if pending.is_empty() || retry_at >= deadline {
                break;
            }
            tokio::time::sleep_until(retry_at).await;
        }
        pending.into_iter().collect()
    }

    pub(super) fn handle_replicate(
        &self,
        shard: ShardId,
        primary_term: u64,
        ops: &[Bytes],
    ) -> ClusterResponse {
        let ops: Result<Vec<ReplicatedOp>, ReplicationError> =
            ops.iter().map(|op| ReplicatedOp::decode(op)).collect();
        let ops = match ops {
            Ok(ops) => ops,
            Err(e) => return ClusterResponse::Replication(e),
        };
        let Some(engine) = self.engine(shard) else {
            return self.not_hosted(shard);
        };
        let result = engine
            .write()
            .expect("engine lock poisoned")
            .apply_all(primary_term, &ops);
        match result {
            Ok(_) => ClusterResponse::Ack,
            Err(e) => ClusterResponse::Replication(e),
        }
    }

    pub(super) fn handle_checkpoint(&self, shard: ShardId) -> ClusterResponse {
        match self.engine(shard) {
            Some(engine) => {
                ClusterResponse::Checkpoint(engine.read().expect("engine lock poisoned").checkpoint())
            }
            None => self.not_hosted(shard),
        }
    }

    pub(super) fn handle_reset(&self, shard: ShardId, primary_term: u64) -> ClusterResponse {
        let Some(engine) = self.engine(shard) else {
            return self.not_hosted(shard);
        };
        let result = engine
            .write()
            .expect("engine lock poisoned")
            .reset(primary_term);
        match result {
            Ok(()) => ClusterResponse::Ack,
            Err(e) => ClusterResponse::Replication(e),
        }
    }

    pub(super) fn handle_query(&self, shard: ShardId, query: &Query) -> ClusterResponse {
        match self.engine(shard) {
            Some(engine) => ClusterResponse::QueryResult(
                engine.read().expect("engine lock poisoned").execute(query),
            ),
            None => self.not_hosted(shard),
        }
    }

    fn not_hosted(&self, shard: ShardId) -> ClusterResponse {
        ClusterResponse::Replication(ReplicationError::ShardNotHosted {
            node: self.me(),
            shard,
        })
    }
}

/// Copies the primary on `me` must keep in sync, with whether each still
/// has to be reported started.
fn recovery_targets(group: &ShardGroup, me: NodeId) -> Vec<(NodeId, bool)> {
    let mut targets = Vec::new();
    for copy in &group.copies {
        if copy.role == CopyRole::Replica && copy.state != CopyState::Unassigned {
            if let Some(node) = copy.node.filter(|&n| n != me) {
                targets.push((node, copy.state == CopyState::Initializing));
            }
        }
        if let Some(target) = copy.relocating_to.filter(|&n| n != me) {
            targets.push((target, true));
        }
    }
    targets
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessel_core::{IndexId, ShardOrdinal};
    use tessel_routing::ShardCopy;

    fn copy(role: CopyRole, node: Option<u64>, state: CopyState) -> ShardCopy {
        ShardCopy {
            role,
            node: node.map(NodeId::new),
            state,
            relocating_to: None,
            last_node: None,
            unassigned_reason: None,
        }
    }

    #[test]
    fn test_recovery_targets_cover_replicas_and_relocations() {
        let mut primary = copy(CopyRole::Primary, Some(1), CopyState::Relocating);
        primary.relocating_to = Some(NodeId::new(4));
        let group = ShardGroup {
            shard: ShardId::new(IndexId::new(1), ShardOrdinal::new(0)),
            copies: vec![
                primary,
                copy(CopyRole::Replica, Some(2), CopyState::InSync),
                copy(CopyRole::Replica, Some(3), CopyState::Initializing),
                copy(CopyRole::Replica, None, CopyState::Unassigned),
            ],
            primary_term: 2,
            snapshot_done: false,
        };

        let targets = recovery_targets(&group, NodeId::new(1));
        assert_eq!(
            targets,
            vec![
                (NodeId::new(4), true),
                (NodeId::new(2), false),
                (NodeId::new(3), true),
            ]
        );
    }
}
