//! Strongly-typed identifiers for Tessel entities.
//!
//! Following `TigerStyle`: explicit types prevent bugs from mixing up IDs.
//! Cluster-wide counters are 64-bit; shard ordinals are 32-bit because the
//! number of primaries per index is small and fixed at creation.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Macro to generate strongly-typed ID wrappers.
///
/// Each ID type wraps a u64 and provides:
/// - Type safety (can't mix `NodeId` with `IndexId`)
/// - Debug/Display formatting
/// - Transparent serde encoding for the persisted cluster state
macro_rules! define_id {
    ($name:ident, $prefix:expr, $doc:expr) => {
        #[doc = $doc]
        #[derive(
            Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        #[repr(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Creates a new ID from a raw u64 value.
            #[inline]
            #[must_use]
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            /// Returns the raw u64 value.
            #[inline]
            #[must_use]
            pub const fn get(self) -> u64 {
                self.0
            }

            /// Returns the next ID in sequence.
            ///
            /// # Panics
            /// Panics if the ID would overflow.
            #[inline]
            #[must_use]
            pub const fn next(self) -> Self {
                assert!(self.0 < u64::MAX, "ID overflow");
                Self(self.0 + 1)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", $prefix, self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}-{}", $prefix, self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self::new(value)
            }
        }

        impl From<$name> for u64 {
            fn from(id: $name) -> Self {
                id.get()
            }
        }
    };
}

// Cluster membership.
define_id!(NodeId, "node", "Unique identifier for a Tessel node in the cluster.");

// Indices.
define_id!(IndexId, "index", "Unique identifier for an index.");

// Master election and cluster state.
define_id!(TermId, "term", "Election term of the master quorum.");
define_id!(StateVersion, "v", "Version of a published cluster state.");

// Replication.
define_id!(SeqNo, "seq", "Per-shard sequence number assigned by the primary.");

/// Ordinal of a shard within its index.
///
/// Fixed at index creation and never renumbered.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct ShardOrdinal(u32);

impl ShardOrdinal {
    /// Creates a shard ordinal.
    #[inline]
    #[must_use]
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    /// Returns the raw ordinal.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for ShardOrdinal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ord({})", self.0)
    }
}

impl fmt::Display for ShardOrdinal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for ShardOrdinal {
    fn from(value: u32) -> Self {
        Self::new(value)
    }
}

/// A shard: one ordinal of one index.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ShardId {
    /// Owning index.
    pub index: IndexId,
    /// Ordinal within the index.
    pub ordinal: ShardOrdinal,
}

impl ShardId {
    /// Creates a shard id.
    #[must_use]
    pub const fn new(index: IndexId, ordinal: ShardOrdinal) -> Self {
        Self { index, ordinal }
    }
}

impl fmt::Debug for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shard({}, {})", self.index.get(), self.ordinal.get())
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.index, self.ordinal)
    }
}
