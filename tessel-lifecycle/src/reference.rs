//! Reference-only shard copies for the cold tier.
//!
//! A cold shard keeps no replicas and no local history. Its single copy is
//! mounted from the repository snapshot and cached on the node that serves
//! it; a node that loses the cache simply mounts it again.

use std::collections::BTreeMap;

use tessel_core::{SeqNo, ShardId};
use tessel_replication::{
    ApplyOutcome, Checkpoint, Document, ReplicatedOp, ReplicationError, ReplicationResult,
    ShardStats, ShardStorage,
};
use tracing::debug;

use crate::error::LifecycleResult;
use crate::repository::SnapshotRepository;
use crate::snapshot::ShardSnapshot;

/// Read-only shard storage backed by a repository snapshot.
#[derive(Debug)]
pub struct ReferenceStorage {
    shard: ShardId,
    checkpoint: Checkpoint,
    docs: BTreeMap<String, Document>,
    size_bytes: u64,
}

impl ReferenceStorage {
    /// Fetches the snapshot of `shard` and caches it locally.
    ///
    /// # Errors
    /// Propagates repository and decode errors.
    pub async fn mount<R: SnapshotRepository + ?Sized>(
        repository: &R,
        shard: ShardId,
    ) -> LifecycleResult<Self> {
        let snapshot = ShardSnapshot::download(repository, shard).await?;
        let storage = Self::from_snapshot(snapshot);
        debug!(shard = %shard, docs = storage.docs.len(), bytes = storage.size_bytes, "mounted reference copy");
        Ok(storage)
    }

    /// Builds the storage from an already fetched snapshot.
    #[must_use]
    pub fn from_snapshot(snapshot: ShardSnapshot) -> Self {
        let size_bytes = snapshot.documents.iter().map(|d| d.source.len() as u64).sum();
        let docs = snapshot
            .documents
            .into_iter()
            .map(|d| (d.id.clone(), d))
            .collect();
        Self {
            shard: snapshot.shard,
            checkpoint: snapshot.checkpoint,
            docs,
            size_bytes,
        }
    }

    fn read_only(&self) -> ReplicationError {
        ReplicationError::ReadOnly { shard: self.shard }
    }
}

impl ShardStorage for ReferenceStorage {
    fn apply(&mut self, _op: &ReplicatedOp) -> ReplicationResult<ApplyOutcome> {
        Err(self.read_only())
    }

    fn read_snapshot(&self) -> Box<dyn Iterator<Item = Document> + '_> {
        Box::new(self.docs.values().cloned())
    }

    fn get(&self, doc_id: &str) -> Option<Document> {
        self.docs.get(doc_id).cloned()
    }

    fn segment_count(&self) -> u32 {
        1
    }

    fn max_seq_no(&self) -> SeqNo {
        self.checkpoint.max_seq_no
    }

    fn term_at(&self, seq_no: SeqNo) -> Option<u64> {
        (seq_no == self.checkpoint.max_seq_no && seq_no.get() > 0).then_some(self.checkpoint.term)
    }

    fn ops_after(&self, _seq_no: SeqNo) -> Vec<ReplicatedOp> {
        Vec::new()
    }

    fn consolidate(&mut self, _max_segments: u32) -> ReplicationResult<()> {
        Ok(())
    }

    fn reset(&mut self) -> ReplicationResult<()> {
        Err(self.read_only())
    }

    fn stats(&self) -> ShardStats {
        ShardStats {
            doc_count: self.docs.len() as u64,
            size_bytes: self.size_bytes,
            segment_count: 1,
            max_seq_no: self.checkpoint.max_seq_no,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use bytes::Bytes;
    use tessel_core::{IndexId, ShardOrdinal};
    use tessel_replication::{
        MemoryShardStorage, Operation, Query, QueryResult, ShardEngine, StorageConfig, TermScorer,
    };

    use crate::repository::InMemoryRepository;

    fn shard() -> ShardId {
        ShardId::new(IndexId::new(2), ShardOrdinal::new(0))
    }

    async fn mounted() -> ShardEngine {
        let mut hot = ShardEngine::new(
            shard(),
            Box::new(MemoryShardStorage::new(shard(), StorageConfig::default())),
            Arc::new(TermScorer),
        );
        for (i, bytes) in [10, 20, 30].into_iter().enumerate() {
            hot.apply(
                1,
                &ReplicatedOp {
                    seq_no: SeqNo::new(i as u64 + 1),
                    primary_term: 1,
                    op: Operation::Index {
                        doc_id: format!("doc-{i}"),
                        source: Bytes::from(format!(r#"{{"bytes":{bytes}}}"#)),
                    },
                },
            )
            .unwrap();
        }

        let repo = InMemoryRepository::new(0);
        ShardSnapshot::capture(&hot).upload(&repo).await.unwrap();

        let mut cold = ShardEngine::new(
            shard(),
            Box::new(MemoryShardStorage::new(shard(), StorageConfig::default())),
            Arc::new(TermScorer),
        );
        cold.replace_storage(Box::new(ReferenceStorage::mount(&repo, shard()).await.unwrap()));
        cold
    }

    #[tokio::test]
    async fn test_reference_copy_serves_queries() {
        let cold = mounted().await;
        let sum = cold.execute(&Query::Sum {
            field: "bytes".to_string(),
        });
        assert_eq!(sum, QueryResult::Sum(60.0));
        assert_eq!(cold.checkpoint().max_seq_no, SeqNo::new(3));
        assert_eq!(cold.stats().segment_count, 1);
    }

    #[tokio::test]
    async fn test_reference_copy_refuses_writes() {
        let mut cold = mounted().await;
        let err = cold
            .apply(
                1,
                &ReplicatedOp {
                    seq_no: SeqNo::new(4),
                    primary_term: 1,
                    op: Operation::Delete {
                        doc_id: "doc-0".to_string(),
                    },
                },
            )
            .unwrap_err();
        assert_eq!(err, ReplicationError::ReadOnly { shard: shard() });
        assert!(cold.get("doc-0").is_some());
    }

    #[tokio::test]
    async fn test_mount_without_snapshot_fails() {
        let repo = InMemoryRepository::new(0);
        assert!(ReferenceStorage::mount(&repo, shard()).await.is_err());
    }
}
