//! Errors returned across the node API.
//!
//! Every caller-facing operation ends in a value, a partial result, or one
//! of these errors. Internal failures are folded into the closest variant so
//! that no call leaves the caller unsure whether it took effect.

use tessel_core::{IndexId, NodeId, ShardId, ShardOrdinal};
use tessel_lifecycle::LifecycleError;
use tessel_replication::ReplicationError;
use tessel_routing::{AllocationError, RoutingError};

use crate::state_store::StateStoreError;
use crate::transport::TransportError;

/// Node API error type.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    /// An index with this name already exists.
    #[error("index already exists: {name}")]
    AlreadyExists {
        /// The index name.
        name: String,
    },

    /// No master is known; state changes and writes are refused.
    #[error("no master")]
    NoMaster,

    /// The request did not complete before its deadline.
    #[error("timed out; missing shards {missing:?}")]
    Timeout {
        /// Shard ordinals that did not answer (empty for writes).
        missing: Vec<ShardOrdinal>,
    },

    /// The shard has no reachable active primary.
    #[error("primary unavailable for {shard}")]
    PrimaryUnavailable {
        /// The shard.
        shard: ShardId,
    },

    /// No index with that name or id.
    #[error("index not found: {name}")]
    IndexNotFound {
        /// The index name (or id when the name is unknown).
        name: String,
    },

    /// The request is malformed or exceeds a limit.
    #[error("invalid argument {name}: {reason}")]
    InvalidArgument {
        /// The offending argument.
        name: &'static str,
        /// Why it was refused.
        reason: String,
    },

    /// Internal error.
    #[error("internal error: {message}")]
    Internal {
        /// Error message.
        message: String,
    },
}

impl ApiError {
    /// Returns true if retrying the same request later may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NoMaster | Self::Timeout { .. } | Self::PrimaryUnavailable { .. }
        )
    }

    pub(crate) fn internal(message: impl std::fmt::Display) -> Self {
        Self::Internal {
            message: message.to_string(),
        }
    }

    pub(crate) fn index_id(index: IndexId) -> Self {
        Self::IndexNotFound {
            name: index.to_string(),
        }
    }

    /// Maps a write-path failure on `shard`.
    pub(crate) fn from_write(shard: ShardId, error: ReplicationError) -> Self {
        match error {
            ReplicationError::InsufficientAcks { .. } => Self::Timeout {
                missing: Vec::new(),
            },
            ReplicationError::ReadOnly { .. } => Self::InvalidArgument {
                name: "index",
                reason: format!("{shard} is read-only"),
            },
            ReplicationError::Timeout { missing } => Self::Timeout { missing },
            ReplicationError::ShardNotHosted { .. }
            | ReplicationError::StaleTerm { .. }
            | ReplicationError::Transport(_) => Self::PrimaryUnavailable { shard },
            other => Self::internal(other),
        }
    }

    /// Maps a forwarding failure to `node` for a request on `shard`.
    pub(crate) fn unreachable_primary(shard: ShardId, node: NodeId, error: &TransportError) -> Self {
        tracing::debug!(shard = %shard, node = %node, error = %error, "primary unreachable");
        Self::PrimaryUnavailable { shard }
    }
}

impl From<RoutingError> for ApiError {
    fn from(e: RoutingError) -> Self {
        match e {
            RoutingError::IndexNotFound { name } => Self::IndexNotFound { name },
            RoutingError::PrimaryUnavailable { shard } => Self::PrimaryUnavailable { shard },
        }
    }
}

impl From<AllocationError> for ApiError {
    fn from(e: AllocationError) -> Self {
        match e {
            AllocationError::IndexNotFound { index } => Self::index_id(index),
            other => Self::internal(other),
        }
    }
}

impl From<LifecycleError> for ApiError {
    fn from(e: LifecycleError) -> Self {
        Self::internal(e)
    }
}

impl From<StateStoreError> for ApiError {
    fn from(e: StateStoreError) -> Self {
        Self::internal(e)
    }
}

impl From<tessel_core::Error> for ApiError {
    fn from(e: tessel_core::Error) -> Self {
        match e {
            tessel_core::Error::InvalidArgument { name, reason } => Self::InvalidArgument {
                name,
                reason: reason.to_string(),
            },
            tessel_core::Error::LimitExceeded { limit, .. } => Self::InvalidArgument {
                name: limit,
                reason: e.to_string(),
            },
            other => Self::internal(other),
        }
    }
}

/// Result type for node API operations.
pub type ApiResult<T> = Result<T, ApiError>;
