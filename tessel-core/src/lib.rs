//! Tessel Core - Strongly-typed identifiers and shared data model for Tessel.
//!
//! Everything that travels inside a published cluster state and is needed by
//! more than one subsystem lives here: ids, the node model, the lifecycle
//! policy model and the system limits.
//!
//! # Design Principles (TigerStyle)
//!
//! - **Strongly-typed IDs**: Prevent mixing up `NodeId` with `IndexId`
//! - **Explicit limits**: Every resource has a bounded maximum
//! - **Explicit types**: Use u32/u64, not usize
//! - **No unsafe code**: Safety > Performance

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
mod lifecycle;
mod limits;
mod node;
mod types;

pub use error::{Error, Result};
pub use lifecycle::{
    ColdPhase, DeletePhase, HotPhase, LifecyclePhase, LifecyclePolicy, LifecycleRecord, WarmPhase,
};
pub use limits::Limits;
pub use node::{
    Liveness, NodeAttributes, NodeInfo, NodeRoles, NodeStats, ATTR_DATA_TIER, ATTR_RACK, ATTR_ZONE,
};
pub use types::{IndexId, NodeId, SeqNo, ShardId, ShardOrdinal, StateVersion, TermId};

/// Milliseconds since an arbitrary epoch.
///
/// All time inside Tessel flows through explicit timestamps so that every
/// state machine can be driven by a simulated clock in tests.
pub type Millis = u64;

/// One day in milliseconds.
pub const DAY_MS: Millis = 24 * 60 * 60 * 1000;
