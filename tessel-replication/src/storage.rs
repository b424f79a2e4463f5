//! Shard storage contract and the in-memory engine.
//!
//! A shard copy stores documents and the ordered history of operations that
//! produced them. The history doubles as the resync source: a primary
//! replays `ops_after(checkpoint)` to bring a lagging replica up to date.
//!
//! Writes land in the active segment; the segment is sealed and a new one
//! started every `segment_max_ops` operations. Consolidation merges sealed
//! segments down to a target count.

use std::collections::BTreeMap;

use tessel_core::{SeqNo, ShardId};

use crate::error::{ReplicationError, ReplicationResult};
use crate::operation::{Document, Operation, ReplicatedOp};

/// Default number of operations per segment before rolling.
pub const SEGMENT_OPS_DEFAULT: u32 = 1000;

/// Storage configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageConfig {
    /// Operations per segment before rolling.
    pub segment_max_ops: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            segment_max_ops: SEGMENT_OPS_DEFAULT,
        }
    }
}

/// What `apply` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The operation was new and is now applied.
    Applied,
    /// The operation was already applied; nothing changed.
    Duplicate,
}

/// Position of a copy's history: its highest sequence number and the term
/// that wrote it. Used to detect divergence before a resync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Checkpoint {
    /// Highest applied sequence number (zero when empty).
    pub max_seq_no: SeqNo,
    /// Primary term of that operation (zero when empty).
    pub term: u64,
}

/// Size and shape of a shard copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShardStats {
    /// Live documents.
    pub doc_count: u64,
    /// Bytes of live document bodies.
    pub size_bytes: u64,
    /// Segments on disk.
    pub segment_count: u32,
    /// Highest applied sequence number.
    pub max_seq_no: SeqNo,
}

/// The contract a shard copy exposes to the replication layer.
pub trait ShardStorage: Send + Sync + std::fmt::Debug {
    /// Applies an operation at `op.seq_no`.
    ///
    /// Operations must arrive in sequence order. Re-applying an operation
    /// already in the history with the same term is a no-op.
    ///
    /// # Errors
    /// `SequenceGap` if operations are missing before `op.seq_no`,
    /// `Diverged` if a different operation holds that sequence number,
    /// `ReadOnly` for reference-only copies.
    fn apply(&mut self, op: &ReplicatedOp) -> ReplicationResult<ApplyOutcome>;

    /// Iterates over live documents in id order.
    fn read_snapshot(&self) -> Box<dyn Iterator<Item = Document> + '_>;

    /// Looks up one document.
    fn get(&self, doc_id: &str) -> Option<Document>;

    /// Number of segments.
    fn segment_count(&self) -> u32;

    /// Highest applied sequence number, zero when empty.
    fn max_seq_no(&self) -> SeqNo;

    /// Primary term of the operation at `seq_no`, if present.
    fn term_at(&self, seq_no: SeqNo) -> Option<u64>;

    /// Operations with sequence numbers above `seq_no`, in order.
    fn ops_after(&self, seq_no: SeqNo) -> Vec<ReplicatedOp>;

    /// Merges segments down to at most `max_segments`.
    ///
    /// # Errors
    /// Returns an error if the storage cannot rewrite its segments.
    fn consolidate(&mut self, max_segments: u32) -> ReplicationResult<()>;

    /// Drops every document and the history, ahead of a full resync.
    ///
    /// # Errors
    /// `ReadOnly` for reference-only copies.
    fn reset(&mut self) -> ReplicationResult<()>;

    /// Size and shape.
    fn stats(&self) -> ShardStats;

    /// Checkpoint of the history.
    fn checkpoint(&self) -> Checkpoint {
        let max_seq_no = self.max_seq_no();
        Checkpoint {
            max_seq_no,
            term: self.term_at(max_seq_no).unwrap_or(0),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Segment {
    ops: u32,
    sealed: bool,
}

/// In-memory shard storage.
#[derive(Debug)]
pub struct MemoryShardStorage {
    shard: ShardId,
    config: StorageConfig,
    history: Vec<ReplicatedOp>,
    docs: BTreeMap<String, Document>,
    segments: Vec<Segment>,
    size_bytes: u64,
}

impl MemoryShardStorage {
    /// Creates empty storage for `shard`.
    #[must_use]
    pub fn new(shard: ShardId, config: StorageConfig) -> Self {
        debug_assert!(config.segment_max_ops > 0);
        Self {
            shard,
            config,
            history: Vec::new(),
            docs: BTreeMap::new(),
            segments: vec![Segment::default()],
            size_bytes: 0,
        }
    }

    /// The shard this storage holds.
    #[must_use]
    pub const fn shard(&self) -> ShardId {
        self.shard
    }

    fn write_to_segment(&mut self) {
        let needs_roll = self
            .segments
            .last()
            .map_or(true, |s| s.sealed || s.ops >= self.config.segment_max_ops);
        if needs_roll {
            if let Some(active) = self.segments.last_mut() {
                active.sealed = true;
            }
            self.segments.push(Segment::default());
        }
        if let Some(active) = self.segments.last_mut() {
            active.ops += 1;
        }
    }

    fn apply_to_docs(&mut self, op: &ReplicatedOp) {
        match &op.op {
            Operation::Index { doc_id, source } => {
                let doc = Document {
                    id: doc_id.clone(),
                    source: source.clone(),
                    seq_no: op.seq_no,
                };
                if let Some(previous) = self.docs.insert(doc_id.clone(), doc) {
                    self.size_bytes -= previous.source.len() as u64;
                }
                self.size_bytes += source.len() as u64;
            }
            Operation::Delete { doc_id } => {
                if let Some(previous) = self.docs.remove(doc_id) {
                    self.size_bytes -= previous.source.len() as u64;
                }
            }
        }
    }
}

impl ShardStorage for MemoryShardStorage {
    fn apply(&mut self, op: &ReplicatedOp) -> ReplicationResult<ApplyOutcome> {
        let max = self.max_seq_no();
        if op.seq_no.get() > 0 && op.seq_no <= max {
            return if self.term_at(op.seq_no) == Some(op.primary_term) {
                Ok(ApplyOutcome::Duplicate)
            } else {
                Err(ReplicationError::Diverged {
                    shard: self.shard,
                    seq_no: op.seq_no,
                })
            };
        }
        if op.seq_no != max.next() {
            return Err(ReplicationError::SequenceGap {
                shard: self.shard,
                expected: max.next(),
                got: op.seq_no,
            });
        }

        self.apply_to_docs(op);
        self.write_to_segment();
        self.history.push(op.clone());

        // Postcondition: history index matches sequence number.
        debug_assert_eq!(self.history.len() as u64, op.seq_no.get());
        Ok(ApplyOutcome::Applied)
    }

    fn read_snapshot(&self) -> Box<dyn Iterator<Item = Document> + '_> {
        Box::new(self.docs.values().cloned())
    }

    fn get(&self, doc_id: &str) -> Option<Document> {
        self.docs.get(doc_id).cloned()
    }

    // Safety: segments are bounded by history length / segment_max_ops.
    #[allow(clippy::cast_possible_truncation)]
    fn segment_count(&self) -> u32 {
        self.segments.iter().filter(|s| s.ops > 0).count() as u32
    }

    fn max_seq_no(&self) -> SeqNo {
        SeqNo::new(self.history.len() as u64)
    }

    fn term_at(&self, seq_no: SeqNo) -> Option<u64> {
        let index = usize::try_from(seq_no.get()).ok()?.checked_sub(1)?;
        self.history.get(index).map(|op| op.primary_term)
    }

    fn ops_after(&self, seq_no: SeqNo) -> Vec<ReplicatedOp> {
        let start = usize::try_from(seq_no.get()).unwrap_or(usize::MAX);
        self.history.get(start..).map(<[_]>::to_vec).unwrap_or_default()
    }

    fn consolidate(&mut self, max_segments: u32) -> ReplicationResult<()> {
        let max_segments = max_segments.max(1) as usize;
        self.segments.retain(|s| s.ops > 0);
        if self.segments.len() > max_segments {
            let merge_count = self.segments.len() - max_segments + 1;
            let ops = self.segments.drain(..merge_count).map(|s| s.ops).sum();
            self.segments.insert(0, Segment { ops, sealed: true });
        }
        for segment in &mut self.segments {
            segment.sealed = true;
        }
        if self.segments.is_empty() {
            self.segments.push(Segment::default());
        }

        // Postcondition: within target.
        debug_assert!(self.segment_count() as usize <= max_segments);
        Ok(())
    }

    fn reset(&mut self) -> ReplicationResult<()> {
        self.history.clear();
        self.docs.clear();
        self.segments = vec![Segment::default()];
        self.size_bytes = 0;
        Ok(())
    }

    fn stats(&self) -> ShardStats {
        ShardStats {
            doc_count: self.docs.len() as u64,
            size_bytes: self.size_bytes,
            segment_count: self.segment_count(),
            max_seq_no: self.max_seq_no(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tessel_core::{IndexId, ShardOrdinal};

    fn shard() -> ShardId {
        ShardId::new(IndexId::new(1), ShardOrdinal::new(0))
    }

    fn index_op(seq: u64, term: u64, id: &str, body: &'static str) -> ReplicatedOp {
        ReplicatedOp {
            seq_no: SeqNo::new(seq),
            primary_term: term,
            op: Operation::Index {
                doc_id: id.to_string(),
                source: Bytes::from_static(body.as_bytes()),
            },
        }
    }

    #[test]
    fn test_storage_applies_in_order() {
        let mut storage = MemoryShardStorage::new(shard(), StorageConfig::default());
        assert_eq!(storage.apply(&index_op(1, 1, "a", "one")).unwrap(), ApplyOutcome::Applied);
        assert_eq!(storage.apply(&index_op(2, 1, "a", "two")).unwrap(), ApplyOutcome::Applied);

        let doc = storage.get("a").unwrap();
        assert_eq!(doc.source, Bytes::from_static(b"two"));
        assert_eq!(doc.seq_no, SeqNo::new(2));
        assert_eq!(storage.stats().doc_count, 1);
        assert_eq!(storage.stats().size_bytes, 3);
    }

    #[test]
    fn test_storage_duplicate_is_noop() {
        let mut storage = MemoryShardStorage::new(shard(), StorageConfig::default());
        storage.apply(&index_op(1, 1, "a", "one")).unwrap();
        storage.apply(&index_op(2, 1, "b", "two")).unwrap();

        let outcome = storage.apply(&index_op(1, 1, "a", "one")).unwrap();
        assert_eq!(outcome, ApplyOutcome::Duplicate);
        assert_eq!(storage.max_seq_no(), SeqNo::new(2));
        assert_eq!(storage.stats().doc_count, 2);
    }

    #[test]
    fn test_storage_rejects_gap_and_divergence() {
        let mut storage = MemoryShardStorage::new(shard(), StorageConfig::default());
        storage.apply(&index_op(1, 1, "a", "one")).unwrap();

        let err = storage.apply(&index_op(3, 1, "c", "three")).unwrap_err();
        assert!(matches!(err, ReplicationError::SequenceGap { .. }));

        let err = storage.apply(&index_op(1, 2, "x", "other")).unwrap_err();
        assert!(matches!(err, ReplicationError::Diverged { .. }));
    }

    #[test]
    fn test_storage_delete_and_ops_after() {
        let mut storage = MemoryShardStorage::new(shard(), StorageConfig::default());
        storage.apply(&index_op(1, 1, "a", "one")).unwrap();
        storage
            .apply(&ReplicatedOp {
                seq_no: SeqNo::new(2),
                primary_term: 1,
                op: Operation::Delete {
                    doc_id: "a".to_string(),
                },
            })
            .unwrap();

        assert!(storage.get("a").is_none());
        assert_eq!(storage.stats().size_bytes, 0);
        let tail = storage.ops_after(SeqNo::new(1));
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].seq_no, SeqNo::new(2));
        assert!(storage.ops_after(SeqNo::new(5)).is_empty());
    }

    #[test]
    fn test_storage_rolls_and_consolidates_segments() {
        let config = StorageConfig { segment_max_ops: 2 };
        let mut storage = MemoryShardStorage::new(shard(), config);
        for seq in 1..=7 {
            storage.apply(&index_op(seq, 1, "a", "x")).unwrap();
        }
        assert_eq!(storage.segment_count(), 4);

        storage.consolidate(1).unwrap();
        assert_eq!(storage.segment_count(), 1);

        // New writes start a new segment.
        storage.apply(&index_op(8, 1, "b", "y")).unwrap();
        assert_eq!(storage.segment_count(), 2);
    }

    #[test]
    fn test_checkpoint_reports_last_term() {
        let mut storage = MemoryShardStorage::new(shard(), StorageConfig::default());
        assert_eq!(storage.checkpoint(), Checkpoint::default());
        storage.apply(&index_op(1, 1, "a", "one")).unwrap();
        storage.apply(&index_op(2, 3, "b", "two")).unwrap();
        assert_eq!(
            storage.checkpoint(),
            Checkpoint {
                max_seq_no: SeqNo::new(2),
                term: 3
            }
        );
        storage.reset().unwrap();
        assert_eq!(storage.max_seq_no(), SeqNo::new(0));
    }
}
