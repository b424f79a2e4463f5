//! Tessel Routing - where every shard copy lives and how requests find it.
//!
//! The master owns placement: it derives each new [`ClusterState`] from the
//! previous one by applying [`ShardChange`]s produced by the [`Allocator`]
//! and the [`Rebalancer`]. Every node holds the latest state in a
//! [`ClusterStateView`] and routes requests with the [`ShardRouter`].
//!
//! # Design (`TigerStyle`)
//!
//! - **Values, not handles**: a published state is immutable and shared by `Arc`
//! - **Pure planning**: allocation returns a diff; nothing here does I/O
//! - **Explicit limits**: shard counts and relocation concurrency are bounded

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod allocator;
mod cluster_state;
mod rebalance;
mod router;
mod shard_map;

pub use allocator::{
    AllocationError, AllocationPlan, Allocator, AllocatorConfig, LifecycleRequest,
    DISK_HIGH_WATERMARK_DEFAULT, RELOCATIONS_CONCURRENT_MAX,
};
pub use cluster_state::{ClusterState, ClusterStateView, StaleVersion};
pub use rebalance::{RebalanceConfig, Rebalancer, IMBALANCE_THRESHOLD_DEFAULT};
pub use router::{shard_for_key, ReadTarget, RoutingError, ShardRouter, WriteRoute};
pub use shard_map::{
    CopyRole, CopyState, Health, IndexMetadata, IndexRouting, MetaUpdate, ShardChange, ShardCopy,
    ShardGroup, ShardMap, ShardMapError, SnapshotStatus, UnassignedReason, Veto,
    SHARDS_PER_INDEX_MAX,
};
