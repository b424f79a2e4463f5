//! Inter-node messaging.
//!
//! Every request between nodes goes through [`ClusterTransport`]: election
//! traffic, membership, cluster-state publication, write forwarding,
//! replication and shard queries. The receiving side is a
//! [`RequestHandler`].
//!
//! [`LocalNetwork`] is an in-process hub that delivers requests by calling
//! the target's handler directly. Links can be cut in either direction to
//! simulate partitions and crashed nodes. A request over a cut link fails;
//! so does the response if the reverse link is cut while the request is in
//! flight.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use tessel_core::{IndexId, NodeId, NodeInfo, NodeStats, ShardId, StateVersion, TermId};
use tessel_quorum::{JoinOutcome, QuorumMessage};
use tessel_replication::{
    Checkpoint, Query, QueryResult, ReplicaTransport, ReplicatedOp, ReplicationError,
    ReplicationResult, ShardStats,
};
use tessel_routing::ClusterState;
use thiserror::Error;
use tracing::trace;

use crate::api::{IndexSpec, WriteAck, WriteRequest};
use crate::error::ApiError;

/// Stats of one local shard copy, reported with heartbeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardReport {
    /// The shard.
    pub shard: ShardId,
    /// True if this node holds the primary.
    pub primary: bool,
    /// Copy stats.
    pub stats: ShardStats,
}

/// Periodic liveness report from a node to the master.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeHeartbeat {
    /// Reporting node.
    pub node: NodeId,
    /// Resource usage.
    pub stats: NodeStats,
    /// Local shard copies.
    pub shards: Vec<ShardReport>,
    /// Cluster-state version the node has applied.
    pub version: StateVersion,
}

/// Requests exchanged between nodes.
#[derive(Debug, Clone)]
pub enum ClusterRequest {
    /// Election traffic between master-eligible nodes.
    Quorum(QuorumMessage),
    /// Join handshake, sent to the master.
    Join(NodeInfo),
    /// Liveness report, sent to the master.
    Heartbeat(NodeHeartbeat),
    /// A proposed cluster-state version from the master. Receivers stage
    /// it until the matching [`ClusterRequest::Commit`].
    Publish(Arc<ClusterState>),
    /// Apply the staged state with this term and version.
    Commit {
        /// Term of the publishing master.
        term: TermId,
        /// Version to apply.
        version: StateVersion,
    },
    /// A state the sender already committed, for a lagging node.
    CatchUp(Arc<ClusterState>),
    /// Ask for the receiver's latest applied cluster state.
    FetchState,
    /// Create an index, sent to the master.
    CreateIndex(IndexSpec),
    /// A copy finished recovering, sent to the master.
    ShardStarted {
        /// The shard.
        shard: ShardId,
        /// Node holding the copy.
        node: NodeId,
    },
    /// A replica missed operations, sent to the master.
    ShardFailed {
        /// The shard.
        shard: ShardId,
        /// Node holding the copy.
        node: NodeId,
    },
    /// A primary uploaded its snapshot, sent to the master.
    ShardSnapshotted {
        /// The shard.
        shard: ShardId,
    },
    /// A write forwarded to the primary's node.
    Write(WriteRequest),
    /// Encoded operations for a replica, in sequence order.
    Replicate {
        /// The shard.
        shard: ShardId,
        /// Sender's primary term.
        primary_term: u64,
        /// Operations in the binary codec.
        ops: Vec<Bytes>,
    },
    /// Ask for a copy's checkpoint.
    Checkpoint {
        /// The shard.
        shard: ShardId,
    },
    /// Drop a copy's data ahead of a full resync.
    Reset {
        /// The shard.
        shard: ShardId,
        /// Sender's primary term.
        primary_term: u64,
    },
    /// Run a query on a copy.
    Query {
        /// The shard.
        shard: ShardId,
        /// The query.
        query: Query,
    },
}

impl ClusterRequest {
    /// Short name for logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Quorum(_) => "quorum",
            Self::Join(_) => "join",
            Self::Heartbeat(_) => "heartbeat",
            Self::Publish(_) => "publish",
            Self::Commit { .. } => "commit",
            Self::CatchUp(_) => "catch_up",
            Self::FetchState => "fetch_state",
            Self::CreateIndex(_) => "create_index",
            Self::ShardStarted { .. } => "shard_started",
            Self::ShardFailed { .. } => "shard_failed",
            Self::ShardSnapshotted { .. } => "shard_snapshotted",
            Self::Write(_) => "write",
            Self::Replicate { .. } => "replicate",
            Self::Checkpoint { .. } => "checkpoint",
            Self::Reset { .. } => "reset",
            Self::Query { .. } => "query",
        }
    }
}

/// Responses to [`ClusterRequest`]s.
#[derive(Debug, Clone)]
pub enum ClusterResponse {
    /// Accepted, nothing to return.
    Ack,
    /// The receiver is not the master; `master` is its best guess.
    NotMaster {
        /// Master known to the receiver.
        master: Option<NodeId>,
    },
    /// Join result.
    Joined(JoinOutcome),
    /// Heartbeat accepted; the master's current version.
    HeartbeatAck {
        /// Master's published version.
        version: StateVersion,
    },
    /// The master does not know the sender; it must join again.
    MustRejoin,
    /// Version the receiver holds after a publication.
    Published {
        /// Receiver's current version.
        version: StateVersion,
    },
    /// The publication was refused: it comes from an older term or is not
    /// newer than what the receiver applied.
    PublishRejected {
        /// Receiver's applied version.
        current: StateVersion,
    },
    /// The receiver's latest applied state.
    State(Arc<ClusterState>),
    /// The index was created.
    IndexCreated(IndexId),
    /// The write was acknowledged.
    Written(WriteAck),
    /// A copy's checkpoint.
    Checkpoint(Checkpoint),
    /// A query result.
    QueryResult(QueryResult),
    /// The request failed on the receiver.
    Api(ApiError),
    /// A shard-level request failed on the receiver.
    Replication(ReplicationError),
}

/// Errors delivering a request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The link to the target is down.
    #[error("{to} unreachable from {from}")]
    Unreachable {
        /// Sender.
        from: NodeId,
        /// Target.
        to: NodeId,
    },

    /// No node with that id is attached.
    #[error("unknown node {node}")]
    UnknownNode {
        /// The node.
        node: NodeId,
    },

    /// The target answered with a response of the wrong kind.
    #[error("unexpected response to {request}")]
    UnexpectedResponse {
        /// The request kind.
        request: &'static str,
    },
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Delivers requests to other nodes.
#[async_trait]
pub trait ClusterTransport: Send + Sync + 'static {
    /// The sending node.
    fn local_node(&self) -> NodeId;

    /// Sends `request` to `to` and waits for its response.
    ///
    /// # Errors
    /// Returns an error if the request or its response could not be
    /// delivered. Failures on the receiver come back as responses.
    async fn send(&self, to: NodeId, request: ClusterRequest) -> TransportResult<ClusterResponse>;
}

/// Receives requests addressed to one node.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Handles `request` from `from`.
    async fn handle(&self, from: NodeId, request: ClusterRequest) -> ClusterResponse;
}

/// In-process hub connecting every node of a test cluster.
#[derive(Default)]
pub struct LocalNetwork {
    handlers: Mutex<BTreeMap<NodeId, Weak<dyn RequestHandler>>>,
    cut: Mutex<BTreeSet<(NodeId, NodeId)>>,
    delivered: AtomicU64,
}

impl std::fmt::Debug for LocalNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalNetwork")
            .field("delivered", &self.delivered.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl LocalNetwork {
    /// Creates an empty network.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Returns the transport `node` sends through.
    #[must_use]
    pub fn endpoint(self: &Arc<Self>, node: NodeId) -> LocalTransport {
        LocalTransport {
            network: Arc::clone(self),
            local: node,
        }
    }

    /// Attaches `node`'s request handler. Replaces any previous handler.
    pub fn attach(&self, node: NodeId, handler: Weak<dyn RequestHandler>) {
        self.handlers
            .lock()
            .expect("handlers lock poisoned")
            .insert(node, handler);
    }

    /// Detaches `node`; requests to it fail with `UnknownNode`.
    pub fn detach(&self, node: NodeId) {
        self.handlers
            .lock()
            .expect("handlers lock poisoned")
            .remove(&node);
    }

    /// Cuts the link from `from` to `to` (one direction).
    pub fn cut(&self, from: NodeId, to: NodeId) {
        self.cut.lock().expect("cut lock poisoned").insert((from, to));
    }

    /// Cuts every link between the two groups, both directions.
    pub fn partition(&self, left: &[NodeId], right: &[NodeId]) {
        let mut cut = self.cut.lock().expect("cut lock poisoned");
        for &a in left {
            for &b in right {
                cut.insert((a, b));
                cut.insert((b, a));
            }
        }
    }

    /// Cuts every link to and from `node`.
    pub fn isolate(&self, node: NodeId) {
        let peers: Vec<NodeId> = self
            .handlers
            .lock()
            .expect("handlers lock poisoned")
            .keys()
            .copied()
            .filter(|&n| n != node)
            .collect();
        self.partition(&[node], &peers);
    }

    /// Restores every link to and from `node`.
    pub fn reconnect(&self, node: NodeId) {
        self.cut
            .lock()
            .expect("cut lock poisoned")
            .retain(|&(a, b)| a != node && b != node);
    }

    /// Restores every link.
    pub fn heal(&self) {
        self.cut.lock().expect("cut lock poisoned").clear();
    }

    /// Returns true if `from` can currently reach `to`.
    #[must_use]
    pub fn is_reachable(&self, from: NodeId, to: NodeId) -> bool {
        from == to || !self.cut.lock().expect("cut lock poisoned").contains(&(from, to))
    }

    /// Requests delivered so far.
    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    async fn deliver(
        &self,
        from: NodeId,
        to: NodeId,
        request: ClusterRequest,
    ) -> TransportResult<ClusterResponse> {
        if !self.is_reachable(from, to) {
            return Err(TransportError::Unreachable { from, to });
        }
        let handler = self
            .handlers
            .lock()
            .expect("handlers lock poisoned")
            .get(&to)
            .and_then(Weak::upgrade)
            .ok_or(TransportError::UnknownNode { node: to })?;

        let kind = request.kind();
        self.delivered.fetch_add(1, Ordering::Relaxed);
        let response = handler.handle(from, request).await;

        if !self.is_reachable(to, from) {
            trace!(from = %from, to = %to, kind, "response lost");
            return Err(TransportError::Unreachable { from: to, to: from });
        }
        Ok(response)
    }
}

/// One node's endpoint on a [`LocalNetwork`].
#[derive(Debug, Clone)]
pub struct LocalTransport {
    network: Arc<LocalNetwork>,
    local: NodeId,
}

impl LocalTransport {
    /// The network this endpoint belongs to.
    #[must_use]
    pub fn network(&self) -> &Arc<LocalNetwork> {
        &self.network
    }
}

#[async_trait]
impl ClusterTransport for LocalTransport {
    fn local_node(&self) -> NodeId {
        self.local
    }

    async fn send(&self, to: NodeId, request: ClusterRequest) -> TransportResult<ClusterResponse> {
        self.network.deliver(self.local, to, request).await
    }
}

/// Shard-level operations over a [`ClusterTransport`].
///
/// Operations travel in their binary codec; the receiver decodes them
/// before applying.
#[derive(Debug)]
pub struct ShardRpc<C: ClusterTransport> {
    transport: Arc<C>,
}

impl<C: ClusterTransport> ShardRpc<C> {
    /// Wraps `transport`.
    #[must_use]
    pub const fn new(transport: Arc<C>) -> Self {
        Self { transport }
    }

    async fn call(&self, to: NodeId, request: ClusterRequest) -> ReplicationResult<ClusterResponse> {
        let kind = request.kind();
        match self.transport.send(to, request).await {
            Ok(ClusterResponse::Replication(e)) => Err(e),
            Ok(ClusterResponse::Api(e)) => Err(ReplicationError::Transport(e.to_string())),
            Ok(response) => Ok(response),
            Err(e) => {
                trace!(to = %to, kind, error = %e, "shard request failed");
                Err(ReplicationError::Transport(e.to_string()))
            }
        }
    }

    fn unexpected(kind: &'static str) -> ReplicationError {
        ReplicationError::Transport(TransportError::UnexpectedResponse { request: kind }.to_string())
    }
}

#[async_trait]
impl<C: ClusterTransport> ReplicaTransport for ShardRpc<C> {
    async fn replicate(
        &self,
        to: NodeId,
        shard: ShardId,
        primary_term: u64,
        ops: Vec<ReplicatedOp>,
    ) -> ReplicationResult<()> {
        let ops = ops.iter().map(ReplicatedOp::encode).collect();
        match self
            .call(
                to,
                ClusterRequest::Replicate {
                    shard,
                    primary_term,
                    ops,
                },
            )
            .await?
        {
            ClusterResponse::Ack => Ok(()),
            _ => Err(Self::unexpected("replicate")),
        }
    }

    async fn checkpoint(&self, to: NodeId, shard: ShardId) -> ReplicationResult<Checkpoint> {
        match self.call(to, ClusterRequest::Checkpoint { shard }).await? {
            ClusterResponse::Checkpoint(checkpoint) => Ok(checkpoint),
            _ => Err(Self::unexpected("checkpoint")),
        }
    }

    async fn reset(&self, to: NodeId, shard: ShardId, primary_term: u64) -> ReplicationResult<()> {
        match self
            .call(to, ClusterRequest::Reset { shard, primary_term })
            .await?
        {
            ClusterResponse::Ack => Ok(()),
            _ => Err(Self::unexpected("reset")),
        }
    }

    async fn query(&self, to: NodeId, shard: ShardId, query: &Query) -> ReplicationResult<QueryResult> {
        match self
            .call(
                to,
                ClusterRequest::Query {
                    shard,
                    query: query.clone(),
                },
            )
            .await?
        {
            ClusterResponse::QueryResult(result) => Ok(result),
            _ => Err(Self::unexpected("query")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Answers every request with its own id as a version.
    struct Echo(NodeId);

    #[async_trait]
    impl RequestHandler for Echo {
        async fn handle(&self, _from: NodeId, _request: ClusterRequest) -> ClusterResponse {
            ClusterResponse::Published {
                version: StateVersion::new(self.0.get()),
            }
        }
    }

    fn network_of(ids: &[u64]) -> (Arc<LocalNetwork>, Vec<Arc<dyn RequestHandler>>) {
        let network = LocalNetwork::new();
        let handlers: Vec<Arc<dyn RequestHandler>> = ids
            .iter()
            .map(|&id| Arc::new(Echo(NodeId::new(id))) as Arc<dyn RequestHandler>)
            .collect();
        for (&id, handler) in ids.iter().zip(&handlers) {
            network.attach(NodeId::new(id), Arc::downgrade(handler));
        }
        (network, handlers)
    }

    #[tokio::test]
    async fn test_delivers_to_attached_handler() {
        let (network, _handlers) = network_of(&[1, 2]);
        let response = network
            .endpoint(NodeId::new(1))
            .send(NodeId::new(2), ClusterRequest::FetchState)
            .await
            .unwrap();
        assert!(matches!(
            response,
            ClusterResponse::Published { version } if version == StateVersion::new(2)
        ));
        assert_eq!(network.delivered(), 1);
    }

    #[tokio::test]
    async fn test_partition_blocks_both_directions_until_healed() {
        let (network, _handlers) = network_of(&[1, 2, 3]);
        network.partition(&[NodeId::new(1)], &[NodeId::new(2), NodeId::new(3)]);

        let one = network.endpoint(NodeId::new(1));
        let two = network.endpoint(NodeId::new(2));
        assert!(matches!(
            one.send(NodeId::new(2), ClusterRequest::FetchState).await,
            Err(TransportError::Unreachable { .. })
        ));
        assert!(two.send(NodeId::new(1), ClusterRequest::FetchState).await.is_err());
        assert!(two.send(NodeId::new(3), ClusterRequest::FetchState).await.is_ok());

        network.heal();
        assert!(one.send(NodeId::new(2), ClusterRequest::FetchState).await.is_ok());
    }

    #[tokio::test]
    async fn test_one_way_cut_loses_the_response() {
        let (network, _handlers) = network_of(&[1, 2]);
        network.cut(NodeId::new(2), NodeId::new(1));
        let result = network
            .endpoint(NodeId::new(1))
            .send(NodeId::new(2), ClusterRequest::FetchState)
            .await;
        assert!(result.is_err());
        // The request itself was delivered.
        assert_eq!(network.delivered(), 1);
    }

    #[tokio::test]
    async fn test_dropped_handler_is_unknown() {
        let (network, mut handlers) = network_of(&[1, 2]);
        handlers.pop();
        let result = network
            .endpoint(NodeId::new(1))
            .send(NodeId::new(2), ClusterRequest::FetchState)
            .await;
        assert_eq!(
            result.unwrap_err(),
            TransportError::UnknownNode {
                node: NodeId::new(2)
            }
        );
    }
}
