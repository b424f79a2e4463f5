//! Lifecycle error types.

use tessel_core::IndexId;
use tessel_routing::AllocationError;
use thiserror::Error;

/// Result type for lifecycle operations.
pub type LifecycleResult<T> = Result<T, LifecycleError>;

/// Errors from lifecycle transitions and the snapshot repository.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    /// Snapshot not found in the repository.
    #[error("snapshot not found: {key}")]
    NotFound {
        /// The snapshot key.
        key: String,
    },

    /// Upload failed.
    #[error("upload failed for {key}: {message}")]
    UploadFailed {
        /// The snapshot key.
        key: String,
        /// Error message.
        message: String,
    },

    /// Download failed.
    #[error("download failed for {key}: {message}")]
    DownloadFailed {
        /// The snapshot key.
        key: String,
        /// Error message.
        message: String,
    },

    /// Checksum mismatch on a downloaded snapshot.
    #[error("data corruption for {key}: expected CRC {expected:#010x}, got {actual:#010x}")]
    DataCorruption {
        /// The snapshot key.
        key: String,
        /// Expected CRC32 value.
        expected: u32,
        /// Actual CRC32 value.
        actual: u32,
    },

    /// A snapshot could not be decoded.
    #[error("malformed snapshot {key}: {reason}")]
    Malformed {
        /// The snapshot key.
        key: String,
        /// What was wrong.
        reason: &'static str,
    },

    /// The allocator cannot satisfy a request yet; retried with backoff.
    #[error("index {index} busy: {reason}")]
    Busy {
        /// The index.
        index: IndexId,
        /// Why.
        reason: &'static str,
    },

    /// The allocator rejected a request.
    #[error("allocation failed: {message}")]
    Allocation {
        /// Error message.
        message: String,
    },

    /// I/O error.
    #[error("I/O error: {operation}: {message}")]
    Io {
        /// What operation was being performed.
        operation: &'static str,
        /// Error message.
        message: String,
    },
}

impl LifecycleError {
    /// Returns true if the failure is transient and the step should be retried.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::DataCorruption { .. } | Self::Malformed { .. } | Self::Allocation { .. }
        )
    }
}

impl From<AllocationError> for LifecycleError {
    fn from(e: AllocationError) -> Self {
        match e {
            AllocationError::Busy { index, reason } => Self::Busy { index, reason },
            other => Self::Allocation {
                message: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_allocation_maps_to_retryable_busy() {
        let err: LifecycleError = AllocationError::Busy {
            index: IndexId::new(3),
            reason: "snapshot pending",
        }
        .into();
        assert!(matches!(err, LifecycleError::Busy { reason: "snapshot pending", .. }));
        assert!(err.is_retryable());

        let err: LifecycleError = AllocationError::IndexNotFound {
            index: IndexId::new(3),
        }
        .into();
        assert!(!err.is_retryable());
    }
}
