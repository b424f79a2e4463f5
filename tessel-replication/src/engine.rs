//! Shard engine - one local shard copy.
//!
//! Wraps a [`ShardStorage`] with the rules every copy enforces regardless of
//! its role: operations are applied in sequence order, and operations from a
//! primary whose term is older than the newest one seen are refused. The
//! fencing means a deposed primary cannot keep writing to copies that have
//! already heard from its successor.

use std::sync::Arc;

use tessel_core::{SeqNo, ShardId};
use tracing::{debug, warn};

use crate::error::{ReplicationError, ReplicationResult};
use crate::operation::{Document, ReplicatedOp};
use crate::query::{self, Query, QueryResult, Scorer};
use crate::storage::{ApplyOutcome, Checkpoint, ShardStats, ShardStorage};

/// One local shard copy.
pub struct ShardEngine {
    shard: ShardId,
    storage: Box<dyn ShardStorage>,
    scorer: Arc<dyn Scorer>,
    primary_term: u64,
    read_only: bool,
}

impl std::fmt::Debug for ShardEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardEngine")
            .field("shard", &self.shard)
            .field("primary_term", &self.primary_term)
            .field("read_only", &self.read_only)
            .field("storage", &self.storage)
            .finish_non_exhaustive()
    }
}

impl ShardEngine {
    /// Creates an engine over `storage`.
    #[must_use]
    pub fn new(shard: ShardId, storage: Box<dyn ShardStorage>, scorer: Arc<dyn Scorer>) -> Self {
        let primary_term = storage.checkpoint().term;
        Self {
            shard,
            storage,
            scorer,
            primary_term,
            read_only: false,
        }
    }

    /// The shard.
    #[must_use]
    pub const fn shard(&self) -> ShardId {
        self.shard
    }

    /// Highest primary term seen.
    #[must_use]
    pub const fn primary_term(&self) -> u64 {
        self.primary_term
    }

    /// Raises the fencing term. Lower values are ignored.
    pub fn observe_primary_term(&mut self, term: u64) {
        if term > self.primary_term {
            debug!(shard = %self.shard, from = self.primary_term, to = term, "primary term advanced");
            self.primary_term = term;
        }
    }

    /// Sets the read-only flag for writes assigned by this copy as primary.
    pub fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }

    /// Returns true if new writes are refused.
    #[must_use]
    pub const fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Next sequence number this copy would assign as primary.
    #[must_use]
    pub fn next_seq_no(&self) -> SeqNo {
        self.storage.max_seq_no().next()
    }

    /// Applies one operation sent by the primary at `primary_term`.
    ///
    /// The fence is the sender's term, not the term stamped on the operation:
    /// a new primary replays history written under older terms.
    ///
    /// # Errors
    /// `StaleTerm` if the sender is an older primary, plus every error of
    /// [`ShardStorage::apply`].
    pub fn apply(&mut self, primary_term: u64, op: &ReplicatedOp) -> ReplicationResult<ApplyOutcome> {
        self.fence(primary_term)?;
        self.storage.apply(op)
    }

    /// Applies a batch in order, stopping at the first error.
    ///
    /// # Errors
    /// Returns the first failing operation's error.
    pub fn apply_all(&mut self, primary_term: u64, ops: &[ReplicatedOp]) -> ReplicationResult<usize> {
        self.fence(primary_term)?;
        let mut applied = 0;
        for op in ops {
            if self.storage.apply(op)? == ApplyOutcome::Applied {
                applied += 1;
            }
        }
        Ok(applied)
    }

    fn fence(&mut self, primary_term: u64) -> ReplicationResult<()> {
        if primary_term < self.primary_term {
            warn!(shard = %self.shard, current = self.primary_term, got = primary_term, "refusing operation from stale primary");
            return Err(ReplicationError::StaleTerm {
                shard: self.shard,
                current: self.primary_term,
                got: primary_term,
            });
        }
        self.observe_primary_term(primary_term);
        Ok(())
    }

    /// Drops local data ahead of a full resync, adopting `primary_term`.
    ///
    /// # Errors
    /// Propagates storage errors.
    pub fn reset(&mut self, primary_term: u64) -> ReplicationResult<()> {
        warn!(shard = %self.shard, primary_term, "resetting copy for full resync");
        self.storage.reset()?;
        self.observe_primary_term(primary_term);
        Ok(())
    }

    /// Checkpoint of the local history.
    #[must_use]
    pub fn checkpoint(&self) -> Checkpoint {
        self.storage.checkpoint()
    }

    /// Primary term of the operation at `seq_no`.
    #[must_use]
    pub fn term_at(&self, seq_no: SeqNo) -> Option<u64> {
        self.storage.term_at(seq_no)
    }

    /// Operations after `seq_no`.
    #[must_use]
    pub fn ops_after(&self, seq_no: SeqNo) -> Vec<ReplicatedOp> {
        self.storage.ops_after(seq_no)
    }

    /// Looks up a document.
    #[must_use]
    pub fn get(&self, doc_id: &str) -> Option<Document> {
        self.storage.get(doc_id)
    }

    /// All live documents.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Document> {
        self.storage.read_snapshot().collect()
    }

    /// Runs a query on this copy.
    #[must_use]
    pub fn execute(&self, query: &Query) -> QueryResult {
        query::execute(
            self.storage.as_ref(),
            self.shard.ordinal,
            query,
            self.scorer.as_ref(),
        )
    }

    /// Merges segments down to `max_segments`.
    ///
    /// # Errors
    /// Propagates storage errors.
    pub fn consolidate(&mut self, max_segments: u32) -> ReplicationResult<()> {
        let before = self.storage.segment_count();
        self.storage.consolidate(max_segments)?;
        let after = self.storage.segment_count();
        if after < before {
            debug!(shard = %self.shard, before, after, "consolidated segments");
        }
        Ok(())
    }

    /// Size and shape.
    #[must_use]
    pub fn stats(&self) -> ShardStats {
        self.storage.stats()
    }

    /// Replaces the storage, e.g. with a reference-only copy.
    pub fn replace_storage(&mut self, storage: Box<dyn ShardStorage>) {
        self.storage = storage;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tessel_core::{IndexId, ShardOrdinal};

    use crate::operation::Operation;
    use crate::query::TermScorer;
    use crate::storage::{MemoryShardStorage, StorageConfig};

    fn engine() -> ShardEngine {
        let shard = ShardId::new(IndexId::new(1), ShardOrdinal::new(0));
        ShardEngine::new(
            shard,
            Box::new(MemoryShardStorage::new(shard, StorageConfig::default())),
            Arc::new(TermScorer),
        )
    }

    fn op(seq: u64, term: u64) -> ReplicatedOp {
        ReplicatedOp {
            seq_no: SeqNo::new(seq),
            primary_term: term,
            op: Operation::Index {
                doc_id: format!("doc-{seq}"),
                source: Bytes::from_static(b"{}"),
            },
        }
    }

    #[test]
    fn test_engine_fences_stale_primary() {
        let mut engine = engine();
        engine.apply(2, &op(1, 2)).unwrap();
        let err = engine.apply(1, &op(2, 1)).unwrap_err();
        assert!(matches!(err, ReplicationError::StaleTerm { current: 2, got: 1, .. }));
        assert_eq!(engine.primary_term(), 2);
    }

    #[test]
    fn test_engine_reapply_batch_is_idempotent() {
        let mut engine = engine();
        let batch = vec![op(1, 1), op(2, 1), op(3, 1)];
        assert_eq!(engine.apply_all(1, &batch).unwrap(), 3);
        assert_eq!(engine.apply_all(1, &batch).unwrap(), 0);
        assert_eq!(engine.stats().doc_count, 3);
        assert_eq!(engine.next_seq_no(), SeqNo::new(4));
    }

    #[test]
    fn test_engine_reset_then_replay_older_history() {
        let mut engine = engine();
        engine.apply(1, &op(1, 1)).unwrap();
        engine.reset(4).unwrap();
        assert_eq!(engine.checkpoint(), Checkpoint::default());
        assert_eq!(engine.primary_term(), 4);

        // A term-3 sender is fenced; the term-4 primary may replay term-3 history.
        assert!(engine.apply(3, &op(1, 3)).is_err());
        engine.apply(4, &op(1, 3)).unwrap();
        assert_eq!(engine.term_at(SeqNo::new(1)), Some(3));
    }
}
