//! Transport seam between a primary, its replicas and read coordinators.
//!
//! Production wires this to the cluster transport; tests use in-process
//! implementations. Messages may be duplicated or reordered across calls;
//! the receiving [`ShardEngine`](crate::ShardEngine) tolerates both through
//! sequence numbers.

use async_trait::async_trait;
use tessel_core::{NodeId, ShardId};

use crate::error::ReplicationResult;
use crate::operation::ReplicatedOp;
use crate::query::{Query, QueryResult};
use crate::storage::Checkpoint;

/// Operations a node performs on shard copies hosted by other nodes.
///
/// Implementations must be `Send + Sync` for use across tasks.
#[async_trait]
pub trait ReplicaTransport: Send + Sync + 'static {
    /// Applies `ops` in order on the copy of `shard` hosted by `to`.
    ///
    /// `primary_term` is the sender's term; the receiver refuses senders
    /// older than the newest primary it has seen.
    ///
    /// # Errors
    /// Returns the receiver's apply error or a transport failure.
    async fn replicate(
        &self,
        to: NodeId,
        shard: ShardId,
        primary_term: u64,
        ops: Vec<ReplicatedOp>,
    ) -> ReplicationResult<()>;

    /// Returns the checkpoint of the copy of `shard` hosted by `to`.
    ///
    /// # Errors
    /// Returns an error if the node is unreachable or does not host the shard.
    async fn checkpoint(&self, to: NodeId, shard: ShardId) -> ReplicationResult<Checkpoint>;

    /// Drops the copy's data ahead of a full resync.
    ///
    /// # Errors
    /// Returns an error if the node is unreachable or does not host the shard.
    async fn reset(&self, to: NodeId, shard: ShardId, primary_term: u64) -> ReplicationResult<()>;

    /// Runs `query` on the copy of `shard` hosted by `to`.
    ///
    /// # Errors
    /// Returns an error if the node is unreachable or does not host the shard.
    async fn query(&self, to: NodeId, shard: ShardId, query: &Query) -> ReplicationResult<QueryResult>;
}
