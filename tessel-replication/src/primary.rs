//! Primary write path.
//!
//! A [`PrimaryShard`] is the single writer for one shard. A write takes the
//! shard's write lock, assigns the next sequence number, applies locally and
//! enqueues the stamped operation on every in-sync replica's outbound queue
//! before releasing the lock. Each replica has its own queue and task, so
//! operations reach a replica in sequence order while different replicas
//! (and different shards) proceed in parallel.
//!
//! The caller then waits, up to its deadline, for as many acknowledgements
//! as the [`WriteConsistency`] requires. A replica that fails or misses the
//! deadline is dropped from the fan-out set and listed in
//! [`WriteOutcome::failed_replicas`]; it rejoins through
//! [`PrimaryShard::recover_replica`].

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use tessel_core::{NodeId, SeqNo, ShardId};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::engine::ShardEngine;
use crate::error::{ReplicationError, ReplicationResult};
use crate::operation::{Operation, ReplicatedOp};
use crate::transport::ReplicaTransport;

/// A local shard copy shared between the write path and readers.
pub type SharedEngine = Arc<RwLock<ShardEngine>>;

/// Default replica acknowledgement timeout.
pub const ACK_TIMEOUT_MS_DEFAULT: u64 = 2000;

/// Default outbound queue depth per replica.
pub const QUEUE_DEPTH_DEFAULT: usize = 1024;

/// Default operations per recovery or replication batch.
pub const BATCH_OPS_DEFAULT: usize = 256;

/// How many copies must acknowledge a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteConsistency {
    /// Every replica that was in sync when the write was assigned. Replicas
    /// that fail are marked out of sync; the write still succeeds.
    #[default]
    AllInSync,
    /// A majority of all copies, primary included.
    Quorum,
    /// The primary alone; replicas are updated asynchronously.
    PrimaryOnly,
}

impl WriteConsistency {
    /// Copies (primary included) that must acknowledge when `replicas`
    /// replicas are in sync.
    #[must_use]
    pub const fn required_copies(self, replicas: usize) -> usize {
        match self {
            Self::AllInSync => 1 + replicas,
            Self::Quorum => (1 + replicas) / 2 + 1,
            Self::PrimaryOnly => 1,
        }
    }
}

/// Replication settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicationConfig {
    /// Per-batch replica acknowledgement timeout.
    pub ack_timeout: Duration,
    /// Outbound queue depth per replica.
    pub queue_depth: usize,
    /// Operations per replication or recovery batch.
    pub batch_ops: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_millis(ACK_TIMEOUT_MS_DEFAULT),
            queue_depth: QUEUE_DEPTH_DEFAULT,
            batch_ops: BATCH_OPS_DEFAULT,
        }
    }
}

impl ReplicationConfig {
    /// Short timeouts for tests.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            ack_timeout: Duration::from_millis(200),
            queue_depth: 64,
            batch_ops: 16,
        }
    }
}

/// Result of a successful write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    /// Assigned sequence number.
    pub seq_no: SeqNo,
    /// Term of the primary that assigned it.
    pub primary_term: u64,
    /// Replicas that acknowledged.
    pub acked: Vec<NodeId>,
    /// Replicas that failed or timed out; now out of sync.
    pub failed_replicas: Vec<NodeId>,
}

/// Result of a replica recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryOutcome {
    /// The recovered replica.
    pub node: NodeId,
    /// True if the replica's history diverged and was replaced.
    pub full_resync: bool,
    /// Operations streamed.
    pub ops_sent: usize,
}

struct Outbound {
    op: ReplicatedOp,
    ack: oneshot::Sender<ReplicationResult<()>>,
}

struct ReplicaLink {
    tx: mpsc::Sender<Outbound>,
    task: JoinHandle<()>,
}

impl Drop for ReplicaLink {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// The single writer of one shard.
pub struct PrimaryShard<T: ReplicaTransport> {
    shard: ShardId,
    primary_term: u64,
    engine: SharedEngine,
    transport: Arc<T>,
    config: ReplicationConfig,
    write_lock: tokio::sync::Mutex<()>,
    links: Mutex<BTreeMap<NodeId, ReplicaLink>>,
    failed: Arc<Mutex<BTreeSet<NodeId>>>,
}

impl<T: ReplicaTransport> PrimaryShard<T> {
    /// Takes over `engine` as primary at `primary_term`.
    #[must_use]
    pub fn new(
        engine: SharedEngine,
        primary_term: u64,
        transport: Arc<T>,
        config: ReplicationConfig,
    ) -> Self {
        let shard = {
            let mut engine = engine.write().expect("engine lock poisoned");
            engine.observe_primary_term(primary_term);
            engine.shard()
        };
        info!(shard = %shard, primary_term, "acting as primary");
        Self {
            shard,
            primary_term,
            engine,
            transport,
            config,
            write_lock: tokio::sync::Mutex::new(()),
            links: Mutex::new(BTreeMap::new()),
            failed: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    /// The shard.
    #[must_use]
    pub const fn shard(&self) -> ShardId {
        self.shard
    }

    /// This primary's term.
    #[must_use]
    pub const fn primary_term(&self) -> u64 {
        self.primary_term
    }

    /// The local copy.
    #[must_use]
    pub fn engine(&self) -> SharedEngine {
        Arc::clone(&self.engine)
    }

    /// Replicas currently in the fan-out set.
    #[must_use]
    pub fn replicas(&self) -> Vec<NodeId> {
        self.links
            .lock()
            .expect("links lock poisoned")
            .keys()
            .copied()
            .collect()
    }

    /// Adds an in-sync replica to the fan-out set without recovery.
    ///
    /// Used when a primary is created for a copy whose replicas are already
    /// known to be in sync.
    pub fn add_in_sync_replica(&self, node: NodeId) {
        let mut links = self.links.lock().expect("links lock poisoned");
        if !links.contains_key(&node) {
            links.insert(node, self.spawn_link(node));
        }
    }

    /// Removes a replica from the fan-out set.
    pub fn remove_replica(&self, node: NodeId) {
        if self
            .links
            .lock()
            .expect("links lock poisoned")
            .remove(&node)
            .is_some()
        {
            debug!(shard = %self.shard, node = %node, "replica removed from fan-out");
        }
    }

    /// Returns and clears replicas that failed since the last call.
    #[must_use]
    pub fn take_failed(&self) -> Vec<NodeId> {
        let mut failed = self.failed.lock().expect("failed lock poisoned");
        std::mem::take(&mut *failed).into_iter().collect()
    }

    /// Puts back failures a caller took but could not hand on.
    pub fn restore_failed(&self, nodes: &[NodeId]) {
        self.failed
            .lock()
            .expect("failed lock poisoned")
            .extend(nodes.iter().copied());
    }

    /// Assigns a sequence number to `op`, applies it and replicates it.
    ///
    /// The deadline also bounds the wait for the write lock and for space on
    /// each replica queue. A replica whose queue stays full is dropped from
    /// the fan-out set like one that failed.
    ///
    /// # Errors
    /// `ReadOnly` if the shard refuses writes, `Timeout` if the write lock is
    /// not acquired by the deadline, `InsufficientAcks` if the consistency
    /// level cannot be met by the deadline, or a local apply error.
    pub async fn write(
        &self,
        op: Operation,
        consistency: WriteConsistency,
        timeout: Duration,
    ) -> ReplicationResult<WriteOutcome> {
        let deadline = Instant::now() + timeout;

        let (stamped, pending, dropped) = {
            let Ok(_guard) = tokio::time::timeout_at(deadline, self.write_lock.lock()).await else {
                debug!(shard = %self.shard, "write lock not acquired before deadline");
                return Err(ReplicationError::Timeout {
                    missing: Vec::new(),
                });
            };
            let stamped = {
                let mut engine = self.engine.write().expect("engine lock poisoned");
                if engine.is_read_only() {
                    return Err(ReplicationError::ReadOnly { shard: self.shard });
                }
                let stamped = ReplicatedOp {
                    seq_no: engine.next_seq_no(),
                    primary_term: self.primary_term,
                    op,
                };
                engine.apply(self.primary_term, &stamped)?;
                stamped
            };

            // Enqueue under the write lock so every queue sees sequence order.
            // A replica whose queue does not take the operation has missed it.
            let mut pending = Vec::new();
            let mut dropped = Vec::new();
            for (node, tx) in self.senders() {
                let (ack_tx, ack_rx) = oneshot::channel();
                let outbound = Outbound {
                    op: stamped.clone(),
                    ack: ack_tx,
                };
                match tokio::time::timeout_at(deadline, tx.send(outbound)).await {
                    Ok(Ok(())) => pending.push((node, ack_rx)),
                    Ok(Err(_)) => {
                        self.fail_replica(node, "outbound queue closed");
                        dropped.push(node);
                    }
                    Err(_) => {
                        self.fail_replica(node, "outbound queue full at deadline");
                        dropped.push(node);
                    }
                }
            }
            (stamped, pending, dropped)
        };

        let in_sync = pending.len();
        let required = consistency.required_copies(in_sync);
        let mut outcome = WriteOutcome {
            seq_no: stamped.seq_no,
            primary_term: stamped.primary_term,
            acked: Vec::new(),
            failed_replicas: dropped,
        };
        if consistency == WriteConsistency::PrimaryOnly {
            outcome.failed_replicas.sort();
            return Ok(outcome);
        }

        let mut waiting: BTreeSet<NodeId> = pending.iter().map(|(n, _)| *n).collect();
        let mut acks: FuturesUnordered<_> = pending
            .into_iter()
            .map(|(node, rx)| async move { (node, rx.await) })
            .collect();

        while 1 + outcome.acked.len() < required {
            match tokio::time::timeout_at(deadline, acks.next()).await {
                Ok(Some((node, Ok(Ok(()))))) => {
                    waiting.remove(&node);
                    outcome.acked.push(node);
                }
                Ok(Some((node, result))) => {
                    waiting.remove(&node);
                    let reason = match result {
                        Ok(Err(e)) => e.to_string(),
                        _ => "replica task stopped".to_string(),
                    };
                    self.fail_replica(node, &reason);
                    outcome.failed_replicas.push(node);
                }
                Ok(None) => break,
                Err(_) => {
                    if consistency == WriteConsistency::AllInSync {
                        for node in std::mem::take(&mut waiting) {
                            self.fail_replica(node, "ack timeout");
                            outcome.failed_replicas.push(node);
                        }
                    }
                    break;
                }
            }
        }

        let acked_copies = 1 + outcome.acked.len();
        match consistency {
            WriteConsistency::Quorum if acked_copies < required => {
                Err(ReplicationError::InsufficientAcks {
                    shard: self.shard,
                    acked: acked_copies,
                    required,
                })
            }
            _ => {
                outcome.failed_replicas.sort();
                Ok(outcome)
            }
        }
    }

    /// Brings the copy on `node` up to date and adds it to the fan-out set.
    ///
    /// Writes are paused for the duration. If the replica's history
    /// diverged from this primary's (it holds operations this primary never
    /// had, or a different term at its checkpoint) its copy is reset and
    /// rebuilt from scratch; otherwise only the missing tail is sent. Each
    /// call to the replica is bounded by the acknowledgement timeout.
    ///
    /// # Errors
    /// Returns a transport or apply error, or `ReplicaFailed` if the replica
    /// stops answering; the replica stays out of the fan-out set.
    pub async fn recover_replica(&self, node: NodeId) -> ReplicationResult<RecoveryOutcome> {
        let _guard = self.write_lock.lock().await;
        self.remove_replica(node);

        let remote = self
            .bounded(node, self.transport.checkpoint(node, self.shard))
            .await?;
        let (full_resync, ops) = {
            let engine = self.engine.read().expect("engine lock poisoned");
            let local = engine.checkpoint();
            let diverged = remote.max_seq_no > local.max_seq_no
                || (remote.max_seq_no.get() > 0
                    && engine.term_at(remote.max_seq_no) != Some(remote.term));
            if diverged {
                (true, engine.ops_after(SeqNo::new(0)))
            } else {
                (false, engine.ops_after(remote.max_seq_no))
            }
        };

        if full_resync {
            warn!(shard = %self.shard, node = %node, remote = %remote.max_seq_no, "replica diverged; full resync");
            self.bounded(node, self.transport.reset(node, self.shard, self.primary_term))
                .await?;
        }
        for batch in ops.chunks(self.config.batch_ops.max(1)) {
            self.bounded(
                node,
                self.transport
                    .replicate(node, self.shard, self.primary_term, batch.to_vec()),
            )
            .await?;
        }

        self.add_in_sync_replica(node);
        self.failed.lock().expect("failed lock poisoned").remove(&node);
        info!(shard = %self.shard, node = %node, ops = ops.len(), full_resync, "replica recovered");
        Ok(RecoveryOutcome {
            node,
            full_resync,
            ops_sent: ops.len(),
        })
    }

    async fn bounded<R>(
        &self,
        node: NodeId,
        call: impl Future<Output = ReplicationResult<R>> + Send,
    ) -> ReplicationResult<R> {
        tokio::time::timeout(self.config.ack_timeout, call)
            .await
            .unwrap_or_else(|_| {
                Err(ReplicationError::ReplicaFailed {
                    node,
                    shard: self.shard,
                    reason: "recovery timeout".to_string(),
                })
            })
    }

    fn senders(&self) -> Vec<(NodeId, mpsc::Sender<Outbound>)> {
        self.links
            .lock()
            .expect("links lock poisoned")
            .iter()
            .map(|(node, link)| (*node, link.tx.clone()))
            .collect()
    }

    fn fail_replica(&self, node: NodeId, reason: &str) {
        warn!(shard = %self.shard, node = %node, reason, "replica out of sync");
        self.remove_replica(node);
        self.failed.lock().expect("failed lock poisoned").insert(node);
    }

    fn spawn_link(&self, node: NodeId) -> ReplicaLink {
        let (tx, rx) = mpsc::channel(self.config.queue_depth.max(1));
        let task = tokio::spawn(run_link(
            Arc::clone(&self.transport),
            node,
            self.shard,
            self.primary_term,
            rx,
            Arc::clone(&self.failed),
            self.config,
        ));
        ReplicaLink { tx, task }
    }
}

/// Drains one replica's queue in order, batching what is already queued.
async fn run_link<T: ReplicaTransport>(
    transport: Arc<T>,
    node: NodeId,
    shard: ShardId,
    primary_term: u64,
    mut rx: mpsc::Receiver<Outbound>,
    failed: Arc<Mutex<BTreeSet<NodeId>>>,
    config: ReplicationConfig,
) {
    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        while batch.len() < config.batch_ops {
            match rx.try_recv() {
                Ok(next) => batch.push(next),
                Err(_) => break,
            }
        }

        let ops = batch.iter().map(|o| o.op.clone()).collect();
        let result = match tokio::time::timeout(
            config.ack_timeout,
            transport.replicate(node, shard, primary_term, ops),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ReplicationError::ReplicaFailed {
                node,
                shard,
                reason: "ack timeout".to_string(),
            }),
        };

        let failure = result.as_ref().err().cloned();
        for outbound in batch {
            // The writer may have stopped waiting.
            let _ = outbound.ack.send(result.clone());
        }

        if let Some(error) = failure {
            debug!(shard = %shard, node = %node, error = %error, "replica link stopped");
            failed.lock().expect("failed lock poisoned").insert(node);
            rx.close();
            while let Some(outbound) = rx.recv().await {
                let _ = outbound.ack.send(Err(error.clone()));
            }
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;

    use crate::query::{Query, QueryResult};
    use crate::storage::Checkpoint;
    use crate::testing::{engine_for, shard, LocalReplicas};

    /// A replica that accepts connections and never answers.
    struct Unresponsive;

    #[async_trait]
    impl ReplicaTransport for Unresponsive {
        async fn replicate(
            &self,
            _to: NodeId,
            _shard: ShardId,
            _primary_term: u64,
            _ops: Vec<ReplicatedOp>,
        ) -> ReplicationResult<()> {
            futures::future::pending().await
        }

        async fn checkpoint(&self, _to: NodeId, _shard: ShardId) -> ReplicationResult<Checkpoint> {
            futures::future::pending().await
        }

        async fn reset(&self, _to: NodeId, _shard: ShardId, _primary_term: u64) -> ReplicationResult<()> {
            futures::future::pending().await
        }

        async fn query(&self, _to: NodeId, _shard: ShardId, _query: &Query) -> ReplicationResult<QueryResult> {
            futures::future::pending().await
        }
    }

    fn unresponsive_primary(config: ReplicationConfig) -> Arc<PrimaryShard<Unresponsive>> {
        Arc::new(PrimaryShard::new(
            engine_for(shard()),
            1,
            Arc::new(Unresponsive),
            config,
        ))
    }

    fn index(id: &str) -> Operation {
        Operation::Index {
            doc_id: id.to_string(),
            source: Bytes::from_static(br#"{"v":1}"#),
        }
    }

    #[tokio::test]
    async fn test_write_replicates_to_all_in_sync() {
        let replicas = LocalReplicas::new(&[2, 3]);
        let primary = replicas.primary(1);
        primary.add_in_sync_replica(NodeId::new(2));
        primary.add_in_sync_replica(NodeId::new(3));

        for i in 0..5 {
            let outcome = primary
                .write(index(&format!("doc-{i}")), WriteConsistency::AllInSync, Duration::from_secs(1))
                .await
                .unwrap();
            assert_eq!(outcome.seq_no, SeqNo::new(i + 1));
            assert_eq!(outcome.acked.len(), 2);
            assert!(outcome.failed_replicas.is_empty());
        }
        for node in [2, 3] {
            assert_eq!(replicas.checkpoint(node).max_seq_no, SeqNo::new(5));
        }
    }

    #[tokio::test]
    async fn test_failed_replica_is_reported_and_write_succeeds() {
        let replicas = LocalReplicas::new(&[2, 3]);
        let primary = replicas.primary(1);
        primary.add_in_sync_replica(NodeId::new(2));
        primary.add_in_sync_replica(NodeId::new(3));

        replicas.set_down(3, true);
        let outcome = primary
            .write(index("a"), WriteConsistency::AllInSync, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(outcome.acked, vec![NodeId::new(2)]);
        assert_eq!(outcome.failed_replicas, vec![NodeId::new(3)]);
        assert_eq!(primary.replicas(), vec![NodeId::new(2)]);
        assert_eq!(primary.take_failed(), vec![NodeId::new(3)]);
    }

    #[tokio::test]
    async fn test_quorum_write_fails_without_majority() {
        let replicas = LocalReplicas::new(&[2, 3]);
        let primary = replicas.primary(1);
        primary.add_in_sync_replica(NodeId::new(2));
        primary.add_in_sync_replica(NodeId::new(3));
        replicas.set_down(2, true);
        replicas.set_down(3, true);

        let err = primary
            .write(index("a"), WriteConsistency::Quorum, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicationError::InsufficientAcks { acked: 1, required: 2, .. }));
    }

    #[tokio::test]
    async fn test_recover_replica_sends_missing_tail() {
        let replicas = LocalReplicas::new(&[2]);
        let primary = replicas.primary(1);
        primary.add_in_sync_replica(NodeId::new(2));
        primary
            .write(index("a"), WriteConsistency::AllInSync, Duration::from_secs(1))
            .await
            .unwrap();

        replicas.set_down(2, true);
        for id in ["b", "c"] {
            primary
                .write(index(id), WriteConsistency::AllInSync, Duration::from_secs(1))
                .await
                .unwrap();
        }
        assert_eq!(replicas.checkpoint(2).max_seq_no, SeqNo::new(1));

        replicas.set_down(2, false);
        let outcome = primary.recover_replica(NodeId::new(2)).await.unwrap();
        assert!(!outcome.full_resync);
        assert_eq!(outcome.ops_sent, 2);
        assert_eq!(replicas.checkpoint(2).max_seq_no, SeqNo::new(3));
        assert_eq!(primary.replicas(), vec![NodeId::new(2)]);
    }

    #[tokio::test]
    async fn test_recover_diverged_replica_resets() {
        let replicas = LocalReplicas::new(&[2]);
        // The replica holds an operation the new primary never saw.
        replicas.apply(
            2,
            1,
            &ReplicatedOp {
                seq_no: SeqNo::new(1),
                primary_term: 1,
                op: index("ghost"),
            },
        );
        let primary = replicas.primary_at_term(1, 2);
        let outcome = primary.recover_replica(NodeId::new(2)).await.unwrap();
        assert!(outcome.full_resync);
        assert_eq!(replicas.checkpoint(2).max_seq_no, SeqNo::new(0));
        assert!(replicas.get(2, "ghost").is_none());

        primary
            .write(index("a"), WriteConsistency::AllInSync, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(replicas.checkpoint(2).max_seq_no, SeqNo::new(1));
        assert_eq!(replicas.checkpoint(2).term, 2);
    }

    #[tokio::test]
    async fn test_write_deadline_covers_wait_behind_recovery() {
        let primary = unresponsive_primary(ReplicationConfig {
            ack_timeout: Duration::from_secs(1),
            ..ReplicationConfig::for_testing()
        });
        let recovering = {
            let primary = Arc::clone(&primary);
            tokio::spawn(async move { primary.recover_replica(NodeId::new(2)).await })
        };
        // Let the recovery take the write lock.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let started = Instant::now();
        let err = primary
            .write(index("a"), WriteConsistency::PrimaryOnly, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert_eq!(err, ReplicationError::Timeout { missing: vec![] });
        assert!(started.elapsed() < Duration::from_millis(800));

        let recovered = recovering.await.unwrap();
        assert!(matches!(recovered, Err(ReplicationError::ReplicaFailed { .. })));
        assert!(primary.replicas().is_empty());
    }

    #[tokio::test]
    async fn test_full_replica_queue_drops_replica_at_deadline() {
        let primary = unresponsive_primary(ReplicationConfig {
            ack_timeout: Duration::from_secs(5),
            queue_depth: 1,
            ..ReplicationConfig::for_testing()
        });
        primary.add_in_sync_replica(NodeId::new(2));

        // The link task holds the first operation; the second fills the queue.
        for id in ["a", "b"] {
            primary
                .write(index(id), WriteConsistency::PrimaryOnly, Duration::from_millis(100))
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let started = Instant::now();
        let outcome = primary
            .write(index("c"), WriteConsistency::PrimaryOnly, Duration::from_millis(100))
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(outcome.seq_no, SeqNo::new(3));
        assert_eq!(outcome.failed_replicas, vec![NodeId::new(2)]);
        assert!(primary.replicas().is_empty());
        assert_eq!(primary.take_failed(), vec![NodeId::new(2)]);
    }

    #[tokio::test]
    async fn test_read_only_refuses_writes() {
        let replicas = LocalReplicas::new(&[]);
        let primary = replicas.primary(1);
        primary.engine().write().unwrap().set_read_only(true);
        let err = primary
            .write(index("a"), WriteConsistency::PrimaryOnly, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err, ReplicationError::ReadOnly { shard: shard() });
    }
}
