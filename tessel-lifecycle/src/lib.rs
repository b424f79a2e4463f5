//! Tessel Lifecycle - index tiering from hot to deleted.
//!
//! Each index carries a lifecycle policy. The [`LifecycleEngine`] runs on the
//! master and turns phase transitions into idempotent allocator requests:
//! warm reduces replicas, marks the index read-only and consolidates
//! segments; cold snapshots every shard into the shared
//! [`SnapshotRepository`] and serves it from a [`ReferenceStorage`] copy;
//! deleted removes every copy.
//!
//! # Design Principles (`TigerStyle`)
//!
//! - **Never skip a phase**: one transition per index per evaluation
//! - **Retry, never drop**: failed steps back off exponentially
//! - **Checksummed snapshots**: CRC32 verified on every download
//! - **No unsafe code**: Safety > Performance

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod backoff;
mod engine;
mod error;
mod filesystem;
mod reference;
mod repository;
mod snapshot;

pub use backoff::{
    BackoffConfig, RetryState, RetryTracker, BACKOFF_INITIAL_MS_DEFAULT, BACKOFF_MAX_MS_DEFAULT,
};
pub use engine::{IndexStats, LifecycleEngine, LifecycleReport, LifecycleStep};
pub use error::{LifecycleError, LifecycleResult};
pub use filesystem::{FilesystemConfig, FilesystemRepository};
pub use reference::ReferenceStorage;
pub use repository::{InMemoryRepository, RepositoryFaultConfig, SnapshotKey, SnapshotRepository};
pub use snapshot::ShardSnapshot;
