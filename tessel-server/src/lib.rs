//! Tessel node runtime.
//!
//! A [`TesselNode`] is one process of a Tessel cluster. Master-eligible
//! nodes elect a master through `tessel-quorum`; the master owns the
//! cluster state, allocates shard copies and runs the lifecycle engine.
//! Every node hosts shard copies, accepts document writes and searches,
//! and routes them to the right shards using its applied cluster state.
//!
//! Nodes talk through a [`ClusterTransport`]. [`LocalNetwork`] connects
//! in-process nodes and can partition them.
//!
//! # Design Principles (`TigerStyle`)
//!
//! - **Versioned state**: nodes apply only newer cluster states
//! - **Majority or nothing**: no quorum, no master, no writes
//! - **Explicit time**: all decisions take millisecond timestamps
//! - **No unsafe code**: Safety > Performance

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod api;
mod clock;
mod config;
mod error;
mod node;
mod state_store;
mod tick;
mod transport;

pub use api::{IndexSpec, WriteAck, WriteRequest};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{NodeConfig, RECOVERY_RETRY_MS_DEFAULT, TICK_INTERVAL_MS_DEFAULT};
pub use error::{ApiError, ApiResult};
pub use node::TesselNode;
pub use state_store::{
    ClusterStateStore, LocalFileStateStorage, PersistedState, SimulatedStateStorage,
    StateStorage, StateStorageFaultConfig, StateStoreError, StateStoreResult,
};
pub use tick::tick_task;
pub use transport::{
    ClusterRequest, ClusterResponse, ClusterTransport, LocalNetwork, LocalTransport,
    NodeHeartbeat, RequestHandler, ShardReport, ShardRpc, TransportError, TransportResult,
};
