//! Tessel Replication - shard copies, the primary write path and scatter-gather reads.
//!
//! Every shard has one primary copy and zero or more replicas. The primary
//! assigns each write a per-shard sequence number and fans it out to its
//! in-sync replicas; replicas apply operations strictly in sequence order.
//! Reads fan out to one copy of every shard and merge per-shard results.
//!
//! # Design
//!
//! - [`ShardStorage`]: the storage seam a copy is built on
//! - [`ShardEngine`]: one local copy, with term fencing and ordered apply
//! - [`PrimaryShard`]: sequence assignment, replica fan-out and recovery
//! - [`ScatterGather`]: parallel per-shard reads with copy failover
//! - [`ReplicaTransport`]: how a node reaches copies hosted elsewhere
//!
//! # `TigerStyle` Principles
//!
//! - Bounded queues and batches per replica
//! - Explicit deadlines on every remote call
//! - No unsafe code

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod engine;
mod error;
mod operation;
mod primary;
mod query;
mod scatter;
mod storage;
mod transport;

#[cfg(test)]
mod testing;

pub use engine::ShardEngine;
pub use error::{ReplicationError, ReplicationResult};
pub use operation::{Document, Operation, ReplicatedOp, DOC_ID_BYTES_MAX};
pub use primary::{
    PrimaryShard, RecoveryOutcome, ReplicationConfig, SharedEngine, WriteConsistency,
    WriteOutcome, ACK_TIMEOUT_MS_DEFAULT, BATCH_OPS_DEFAULT, QUEUE_DEPTH_DEFAULT,
};
pub use query::{execute, merge, Hit, Query, QueryResult, Scorer, TermScorer, TOP_K_MAX};
pub use scatter::{ReadRequest, ReadResponse, ScatterGather};
pub use storage::{
    ApplyOutcome, Checkpoint, MemoryShardStorage, ShardStats, ShardStorage, StorageConfig,
    SEGMENT_OPS_DEFAULT,
};
pub use transport::ReplicaTransport;
