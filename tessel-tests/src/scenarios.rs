//! Reusable building blocks for Tessel cluster tests.
//!
//! Cluster shapes, lifecycle policies and seeds shared by the scenario and
//! property tests.

/// Standard cluster shapes as `(nodes, voters)`.
pub mod clusters {
    /// Three master-eligible data nodes.
    pub const THREE_NODE: (u64, u64) = (3, 3);

    /// Five master-eligible data nodes.
    pub const FIVE_NODE: (u64, u64) = (5, 5);

    /// Three voters plus two data-only nodes.
    pub const THREE_PLUS_TWO: (u64, u64) = (5, 3);
}

/// Lifecycle policies.
pub mod policies {
    use tessel_core::{DeletePhase, HotPhase, LifecyclePolicy, WarmPhase, DAY_MS};

    /// Hot from creation, warm after 7 days, deleted after 30.
    #[must_use]
    pub fn hot_warm_delete() -> LifecyclePolicy {
        LifecyclePolicy {
            name: "hot-warm-delete".to_string(),
            hot: HotPhase::default(),
            warm: Some(WarmPhase {
                min_age_ms: 7 * DAY_MS,
                replicas: 0,
                max_segments: 1,
            }),
            cold: None,
            delete: Some(DeletePhase {
                min_age_ms: 30 * DAY_MS,
            }),
        }
    }
}

/// Document helpers.
pub mod docs {
    use bytes::Bytes;
    use tessel_replication::Operation;
    use tessel_routing::shard_for_key;

    /// An index operation for `doc_id` with `body`.
    #[must_use]
    pub fn index(doc_id: &str, body: &str) -> Operation {
        Operation::Index {
            doc_id: doc_id.to_string(),
            source: Bytes::from(body.to_string()),
        }
    }

    /// First key of the form `doc-N` that routes to `ordinal`.
    ///
    /// # Panics
    /// Panics if `ordinal` is not below `primary_shards`.
    #[must_use]
    pub fn key_for_ordinal(ordinal: u32, primary_shards: u32) -> String {
        assert!(ordinal < primary_shards, "ordinal out of range");
        (0..)
            .map(|i| format!("doc-{i}"))
            .find(|key| shard_for_key(key.as_bytes(), primary_shards).get() == ordinal)
            .expect("some key routes to every ordinal")
    }
}

/// Seeds for reproducible testing.
pub mod seeds {
    /// Seeds run by the randomized fault tests.
    pub const REGRESSION_SEEDS: &[u64] = &[42, 12345, 0xDEAD_BEEF, 999, 7777, 0x1337, 1, 0];
}
