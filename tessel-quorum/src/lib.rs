//! Tessel Quorum - cluster membership and master election.
//!
//! Two pure state machines live here:
//!
//! - [`MembershipDirectory`]: which nodes exist, their roles and attributes,
//!   and their liveness as derived from heartbeats.
//! - [`QuorumNode`]: a tick-driven `{Follower, Candidate, Leader}` machine
//!   that elects a single master among the configured master-eligible nodes.
//!
//! Neither performs I/O. The server feeds them messages and timestamps and
//! acts on their outputs, which keeps every election and liveness decision
//! reproducible under a seeded simulation.
//!
//! # Design Principles (`TigerStyle`)
//!
//! - **Fail closed**: a minority partition never elects or keeps a master
//! - **Deterministic**: all randomness comes from a seeded RNG
//! - **No unsafe code**: Safety > Performance

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod config;
mod membership;
mod message;
mod state;

pub use config::QuorumConfig;
pub use membership::{
    JoinOutcome, MembershipDirectory, MembershipError, MembershipEvent, MembershipTimings,
    RejectReason,
};
pub use message::{Heartbeat, HeartbeatAck, QuorumMessage, RequestVote, VoteResponse};
pub use state::{PersistentVote, QuorumNode, QuorumOutput, QuorumRole};

/// Quorum configuration limits.
pub mod limits {
    /// Maximum number of master-eligible voters.
    pub const VOTERS_MAX: usize = 9;

    /// Minimum base election timeout in ticks.
    pub const ELECTION_TICK_MIN: u32 = 3;

    /// Default base election timeout in ticks.
    pub const ELECTION_TICK_DEFAULT: u32 = 10;

    /// Default heartbeat interval in ticks.
    pub const HEARTBEAT_TICK_DEFAULT: u32 = 2;
}
