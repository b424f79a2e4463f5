//! Replication error types.

use tessel_core::{NodeId, SeqNo, ShardId, ShardOrdinal};
use thiserror::Error;

/// Result type for replication operations.
pub type ReplicationResult<T> = Result<T, ReplicationError>;

/// Errors from the write and read paths.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplicationError {
    /// An operation arrived out of order.
    #[error("sequence gap on {shard}: expected {expected}, got {got}")]
    SequenceGap {
        /// The shard.
        shard: ShardId,
        /// Next sequence number the copy can accept.
        expected: SeqNo,
        /// Sequence number received.
        got: SeqNo,
    },

    /// An operation came from a deposed primary.
    #[error("stale primary term on {shard}: {got} < {current}")]
    StaleTerm {
        /// The shard.
        shard: ShardId,
        /// Highest primary term this copy has seen.
        current: u64,
        /// Term carried by the operation.
        got: u64,
    },

    /// The copy holds a different operation at an already-applied sequence number.
    #[error("history diverged on {shard} at {seq_no}")]
    Diverged {
        /// The shard.
        shard: ShardId,
        /// Sequence number where the histories differ.
        seq_no: SeqNo,
    },

    /// The local copy cannot accept writes.
    #[error("{shard} is read-only")]
    ReadOnly {
        /// The shard.
        shard: ShardId,
    },

    /// Not enough copies acknowledged a write.
    #[error("{shard}: {acked} of {required} required copies acknowledged")]
    InsufficientAcks {
        /// The shard.
        shard: ShardId,
        /// Copies that acknowledged, primary included.
        acked: usize,
        /// Copies required.
        required: usize,
    },

    /// A replica could not be reached or refused an operation.
    #[error("replica {node} failed for {shard}: {reason}")]
    ReplicaFailed {
        /// The replica.
        node: NodeId,
        /// The shard.
        shard: ShardId,
        /// Why.
        reason: String,
    },

    /// The node does not host the shard.
    #[error("{shard} not hosted on {node}")]
    ShardNotHosted {
        /// The node.
        node: NodeId,
        /// The shard.
        shard: ShardId,
    },

    /// A read or write did not complete in time.
    #[error("timed out; missing shards {missing:?}")]
    Timeout {
        /// Ordinals that did not answer (empty for writes).
        missing: Vec<ShardOrdinal>,
    },

    /// Transport failure.
    #[error("transport: {0}")]
    Transport(String),

    /// An operation or message could not be decoded.
    #[error("codec: {0}")]
    Codec(&'static str),
}

impl ReplicationError {
    /// Returns true if the receiving copy must be re-synced from its primary.
    #[must_use]
    pub const fn needs_resync(&self) -> bool {
        matches!(self, Self::SequenceGap { .. } | Self::Diverged { .. })
    }
}
