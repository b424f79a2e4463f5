//! Error types for Tessel core operations.
//!
//! Following `TigerStyle`: all errors must be handled explicitly.
//! Validation of limits, policies and index shapes reports through [`Error`].

use std::fmt;

/// The result type for Tessel core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while validating cluster configuration and index settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A setting is out of range or inconsistent with another setting.
    InvalidArgument {
        /// Setting name.
        name: &'static str,
        /// Constraint it broke.
        reason: &'static str,
    },

    /// A requested size is larger than the configured bound.
    LimitExceeded {
        /// Name of the bound in [`crate::Limits`].
        limit: &'static str,
        /// Configured bound.
        max: u64,
        /// Requested value.
        actual: u64,
    },

    /// An index, node or shard is not known to the cluster.
    NotFound {
        /// Kind of entity (`"index"`, `"node"`, `"shard"`).
        kind: &'static str,
        /// Numeric id of the entity.
        id: u64,
    },

    /// The entity exists but its lifecycle or liveness forbids the operation.
    InvalidState {
        /// Where the entity is.
        current: &'static str,
        /// Where it would have to be.
        required: &'static str,
    },

    /// A bounded wait expired.
    Timeout {
        /// What was waited on.
        operation: &'static str,
        /// Milliseconds waited.
        waited_ms: u64,
    },
}

impl Error {
    /// True if retrying the same request later can succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::InvalidState { .. })
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument { name, reason } => write!(f, "{name}: {reason}"),
            Self::LimitExceeded { limit, max, actual } => {
                write!(f, "{limit} is {actual}, at most {max} allowed")
            }
            Self::NotFound { kind, id } => write!(f, "no such {kind} {id}"),
            Self::InvalidState { current, required } => {
                write!(f, "{current}, must be {required}")
            }
            Self::Timeout {
                operation,
                waited_ms,
            } => write!(f, "{operation} did not finish within {waited_ms}ms"),
        }
    }
}

impl std::error::Error for Error {}
