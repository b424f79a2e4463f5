//! System limits and configuration bounds.
//!
//! Following TigerStyle: put limits on everything.
//! Every index, shard group and timeout has an explicit maximum.

/// System-wide limits for Tessel.
///
/// All limits are explicit and configurable. Timings are in milliseconds
/// and are compared against the node clock, never against wall time directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    // Index and shard limits.
    /// Maximum primary shards per index.
    pub max_primary_shards: u32,
    /// Maximum replica copies per shard ordinal.
    pub max_replicas: u32,
    /// Maximum number of indices in the cluster.
    pub max_indices: u32,
    /// Maximum number of nodes in the membership directory.
    pub max_nodes: u32,
    /// Maximum length of an index name in bytes.
    pub max_index_name_bytes: u32,

    // Document limits.
    /// Maximum size of a single document source in bytes.
    pub max_document_bytes: u32,

    // Request timeouts.
    /// Default write/read timeout.
    pub default_timeout_ms: u64,
    /// Maximum allowed caller-supplied timeout.
    pub max_timeout_ms: u64,

    // Membership timings.
    /// Interval at which nodes heartbeat the master.
    pub heartbeat_interval_ms: u64,
    /// Silence after which an alive node becomes suspected.
    pub suspect_after_ms: u64,
    /// Silence after which a suspected node is considered left.
    pub leave_after_ms: u64,
    /// Time a left node stays in the directory before removal.
    pub removal_grace_ms: u64,
}

impl Limits {
    /// Creates limits with safe defaults.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            // Shards: 1024 primaries, 16 replicas, 4096 indices, 256 nodes.
            max_primary_shards: 1024,
            max_replicas: 16,
            max_indices: 4096,
            max_nodes: 256,
            max_index_name_bytes: 255,

            // Documents: 16MB.
            max_document_bytes: 16 * 1024 * 1024,

            // Timeouts: 2s default, 5min max.
            default_timeout_ms: 2_000,
            max_timeout_ms: 5 * 60 * 1000,

            // Membership: 1s heartbeat, 3s suspect, 10s leave, 60s grace.
            heartbeat_interval_ms: 1_000,
            suspect_after_ms: 3_000,
            leave_after_ms: 10_000,
            removal_grace_ms: 60_000,
        }
    }

    /// Validates that all limits are internally consistent.
    ///
    /// # Errors
    /// Returns an error if any limits are invalid or inconsistent.
    pub const fn validate(&self) -> crate::Result<()> {
        if self.max_primary_shards == 0 {
            return Err(crate::Error::InvalidArgument {
                name: "max_primary_shards",
                reason: "must be positive",
            });
        }

        if self.max_document_bytes == 0 {
            return Err(crate::Error::InvalidArgument {
                name: "max_document_bytes",
                reason: "must be positive",
            });
        }

        // A node must miss at least one heartbeat before it is suspected.
        if self.suspect_after_ms <= self.heartbeat_interval_ms {
            return Err(crate::Error::InvalidArgument {
                name: "suspect_after_ms",
                reason: "must be > heartbeat_interval_ms",
            });
        }

        if self.leave_after_ms < self.suspect_after_ms {
            return Err(crate::Error::InvalidArgument {
                name: "leave_after_ms",
                reason: "must be >= suspect_after_ms",
            });
        }

        if self.default_timeout_ms > self.max_timeout_ms {
            return Err(crate::Error::InvalidArgument {
                name: "default_timeout_ms",
                reason: "must be <= max_timeout_ms",
            });
        }

        Ok(())
    }

    /// Checks the shard counts of a new index.
    ///
    /// # Errors
    /// `InvalidArgument` for zero primaries, `LimitExceeded` when either
    /// count is above its bound.
    pub const fn check_index_shape(&self, primary_shards: u32, replicas: u32) -> crate::Result<()> {
        if primary_shards == 0 {
            return Err(crate::Error::InvalidArgument {
                name: "primary_shards",
                reason: "must be positive",
            });
        }
        if primary_shards > self.max_primary_shards {
            return Err(crate::Error::LimitExceeded {
                limit: "max_primary_shards",
                max: self.max_primary_shards as u64,
                actual: primary_shards as u64,
            });
        }
        if replicas > self.max_replicas {
            return Err(crate::Error::LimitExceeded {
                limit: "max_replicas",
                max: self.max_replicas as u64,
                actual: replicas as u64,
            });
        }
        Ok(())
    }

    /// Clamps a caller-supplied timeout into the allowed range.
    ///
    /// `None` selects the default timeout.
    #[must_use]
    pub fn effective_timeout_ms(&self, requested: Option<u64>) -> u64 {
        requested
            .unwrap_or(self.default_timeout_ms)
            .clamp(1, self.max_timeout_ms)
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits_are_valid() {
        let limits = Limits::new();
        assert!(limits.validate().is_ok());
    }

    #[test]
    fn test_zero_primary_shards_rejected() {
        let mut limits = Limits::new();
        limits.max_primary_shards = 0;
        assert!(limits.validate().is_err());
    }

    #[test]
    fn test_suspect_before_heartbeat_rejected() {
        let mut limits = Limits::new();
        limits.suspect_after_ms = 500;
        limits.heartbeat_interval_ms = 1_000;
        assert!(limits.validate().is_err());
    }

    #[test]
    fn test_leave_before_suspect_rejected() {
        let mut limits = Limits::new();
        limits.leave_after_ms = 1_000;
        assert!(limits.validate().is_err());
    }

    #[test]
    fn test_index_shape_bounds() {
        let limits = Limits::new();
        assert!(limits.check_index_shape(3, 1).is_ok());
        assert!(matches!(
            limits.check_index_shape(0, 1),
            Err(crate::Error::InvalidArgument { name: "primary_shards", .. })
        ));
        assert_eq!(
            limits.check_index_shape(1, 17),
            Err(crate::Error::LimitExceeded {
                limit: "max_replicas",
                max: 16,
                actual: 17,
            })
        );
    }

    #[test]
    fn test_effective_timeout_clamped() {
        let limits = Limits::new();
        assert_eq!(limits.effective_timeout_ms(None), 2_000);
        assert_eq!(limits.effective_timeout_ms(Some(0)), 1);
        assert_eq!(limits.effective_timeout_ms(Some(u64::MAX)), limits.max_timeout_ms);
    }
}
