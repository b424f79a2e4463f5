//! Request and response bodies of the node API.

use std::time::Duration;

use tessel_core::{LifecyclePolicy, SeqNo, ShardId};
use tessel_replication::{Operation, WriteConsistency};

/// Parameters of a new index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    /// Unique name.
    pub name: String,
    /// Primary shard count, fixed for the life of the index.
    pub primary_shards: u32,
    /// Replicas per primary.
    pub replicas: u32,
    /// Lifecycle policy.
    pub policy: LifecyclePolicy,
}

impl IndexSpec {
    /// An index kept hot forever.
    #[must_use]
    pub fn new(name: impl Into<String>, primary_shards: u32, replicas: u32) -> Self {
        Self {
            name: name.into(),
            primary_shards,
            replicas,
            policy: LifecyclePolicy::keep_hot("default"),
        }
    }

    /// Sets the lifecycle policy.
    #[must_use]
    pub fn with_policy(mut self, policy: LifecyclePolicy) -> Self {
        self.policy = policy;
        self
    }
}

/// A document write routed to one shard's primary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRequest {
    /// Target shard, resolved by the coordinating node.
    pub shard: ShardId,
    /// The operation.
    pub op: Operation,
    /// Copies that must acknowledge.
    pub consistency: WriteConsistency,
    /// Time left for the primary.
    pub timeout: Duration,
}

/// An acknowledged write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteAck {
    /// Shard the document lives in.
    pub shard: ShardId,
    /// Sequence number assigned by the primary.
    pub seq_no: SeqNo,
    /// Term of the primary that assigned it.
    pub primary_term: u64,
}
