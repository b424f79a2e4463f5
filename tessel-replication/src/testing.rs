//! In-process replica transport for unit tests.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use tessel_core::{IndexId, NodeId, ShardId, ShardOrdinal};

use crate::engine::ShardEngine;
use crate::error::{ReplicationError, ReplicationResult};
use crate::operation::{Document, ReplicatedOp};
use crate::primary::{PrimaryShard, ReplicationConfig, SharedEngine};
use crate::query::{Query, QueryResult, TermScorer};
use crate::storage::{Checkpoint, MemoryShardStorage, StorageConfig};
use crate::transport::ReplicaTransport;

pub fn shard() -> ShardId {
    ShardId::new(IndexId::new(1), ShardOrdinal::new(0))
}

pub fn engine_for(shard: ShardId) -> SharedEngine {
    Arc::new(RwLock::new(ShardEngine::new(
        shard,
        Box::new(MemoryShardStorage::new(shard, StorageConfig::default())),
        Arc::new(TermScorer),
    )))
}

/// Copies keyed by (node, shard); any node can be marked down.
#[derive(Clone, Default)]
pub struct LocalReplicas {
    copies: Arc<Mutex<BTreeMap<(NodeId, ShardId), SharedEngine>>>,
    down: Arc<Mutex<BTreeSet<NodeId>>>,
}

impl LocalReplicas {
    pub fn new(nodes: &[u64]) -> Self {
        let replicas = Self::default();
        for &node in nodes {
            replicas.host(node, shard());
        }
        replicas
    }

    pub fn host(&self, node: u64, shard: ShardId) -> SharedEngine {
        let engine = engine_for(shard);
        self.copies
            .lock()
            .unwrap()
            .insert((NodeId::new(node), shard), Arc::clone(&engine));
        engine
    }

    pub fn primary(&self, node: u64) -> PrimaryShard<Self> {
        self.primary_at_term(node, 1)
    }

    pub fn primary_at_term(&self, node: u64, term: u64) -> PrimaryShard<Self> {
        let engine = self.host(node, shard());
        PrimaryShard::new(
            engine,
            term,
            Arc::new(self.clone()),
            ReplicationConfig::for_testing(),
        )
    }

    pub fn set_down(&self, node: u64, down: bool) {
        let mut set = self.down.lock().unwrap();
        if down {
            set.insert(NodeId::new(node));
        } else {
            set.remove(&NodeId::new(node));
        }
    }

    pub fn checkpoint(&self, node: u64) -> Checkpoint {
        self.engine(NodeId::new(node), shard())
            .unwrap()
            .read()
            .unwrap()
            .checkpoint()
    }

    pub fn get(&self, node: u64, doc_id: &str) -> Option<Document> {
        self.engine(NodeId::new(node), shard())
            .unwrap()
            .read()
            .unwrap()
            .get(doc_id)
    }

    pub fn apply(&self, node: u64, term: u64, op: &ReplicatedOp) {
        self.engine(NodeId::new(node), shard())
            .unwrap()
            .write()
            .unwrap()
            .apply(term, op)
            .unwrap();
    }

    fn engine(&self, node: NodeId, shard: ShardId) -> ReplicationResult<SharedEngine> {
        if self.down.lock().unwrap().contains(&node) {
            return Err(ReplicationError::Transport(format!("{node} unreachable")));
        }
        self.copies
            .lock()
            .unwrap()
            .get(&(node, shard))
            .cloned()
            .ok_or(ReplicationError::ShardNotHosted { node, shard })
    }
}

#[async_trait]
impl ReplicaTransport for LocalReplicas {
    async fn replicate(
        &self,
        to: NodeId,
        shard: ShardId,
        primary_term: u64,
        ops: Vec<ReplicatedOp>,
    ) -> ReplicationResult<()> {
        let engine = self.engine(to, shard)?;
        let mut engine = engine.write().unwrap();
        engine.apply_all(primary_term, &ops).map(|_| ())
    }

    async fn checkpoint(&self, to: NodeId, shard: ShardId) -> ReplicationResult<Checkpoint> {
        Ok(self.engine(to, shard)?.read().unwrap().checkpoint())
    }

    async fn reset(&self, to: NodeId, shard: ShardId, primary_term: u64) -> ReplicationResult<()> {
        self.engine(to, shard)?.write().unwrap().reset(primary_term)
    }

    async fn query(&self, to: NodeId, shard: ShardId, query: &Query) -> ReplicationResult<QueryResult> {
        Ok(self.engine(to, shard)?.read().unwrap().execute(query))
    }
}
