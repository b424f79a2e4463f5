//! Scatter-gather reads.
//!
//! A read fans out to one copy of every target shard in parallel. If a copy
//! fails, the next candidate copy of the same shard is tried until the
//! deadline. Results from every shard that answered are merged; shards that
//! never answered are reported as missing, or fail the read when partial
//! results are not allowed.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use tessel_core::ShardOrdinal;
use tessel_routing::ReadTarget;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{ReplicationError, ReplicationResult};
use crate::query::{self, Query, QueryResult};
use crate::transport::ReplicaTransport;

/// A read over some shards of one index.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadRequest {
    /// The query.
    pub query: Query,
    /// Overall deadline for the read.
    pub timeout: Duration,
    /// Return what answered instead of failing when shards are missing.
    pub partial_results_allowed: bool,
}

/// A merged read result.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadResponse {
    /// Merged result over the shards that answered.
    pub result: QueryResult,
    /// Shards that did not answer, ascending.
    pub missing: Vec<ShardOrdinal>,
    /// Shards the read targeted.
    pub shards_total: usize,
}

impl ReadResponse {
    /// Returns true if some shards are missing from the result.
    #[must_use]
    pub fn is_partial(&self) -> bool {
        !self.missing.is_empty()
    }
}

/// Runs reads over shard copies through a [`ReplicaTransport`].
#[derive(Debug)]
pub struct ScatterGather<T: ReplicaTransport> {
    transport: Arc<T>,
}

impl<T: ReplicaTransport> ScatterGather<T> {
    /// Creates a coordinator over `transport`.
    #[must_use]
    pub const fn new(transport: Arc<T>) -> Self {
        Self { transport }
    }

    /// Reads every target and merges the results.
    ///
    /// # Errors
    /// `Timeout` listing the missing shards if any shard did not answer and
    /// partial results are not allowed.
    pub async fn execute(
        &self,
        targets: Vec<ReadTarget>,
        request: &ReadRequest,
    ) -> ReplicationResult<ReadResponse> {
        let deadline = Instant::now() + request.timeout;
        let shards_total = targets.len();

        let mut pending: FuturesUnordered<_> = targets
            .into_iter()
            .map(|target| self.read_one(target, &request.query, deadline))
            .collect();

        let mut results = Vec::with_capacity(shards_total);
        let mut missing = Vec::new();
        while let Some((ordinal, result)) = pending.next().await {
            match result {
                Some(result) => results.push(result),
                None => missing.push(ordinal),
            }
        }
        missing.sort_unstable();

        if !missing.is_empty() {
            if !request.partial_results_allowed {
                return Err(ReplicationError::Timeout { missing });
            }
            warn!(missing = missing.len(), shards_total, "returning partial results");
        }

        Ok(ReadResponse {
            result: query::merge(&request.query, results),
            missing,
            shards_total,
        })
    }

    /// Tries the copies of one shard in order until one answers.
    async fn read_one(
        &self,
        target: ReadTarget,
        query: &Query,
        deadline: Instant,
    ) -> (ShardOrdinal, Option<QueryResult>) {
        let ordinal = target.shard.ordinal;
        for node in target.copies {
            match tokio::time::timeout_at(deadline, self.transport.query(node, target.shard, query))
                .await
            {
                Ok(Ok(result)) => return (ordinal, Some(result)),
                Ok(Err(e)) => {
                    debug!(shard = %target.shard, node = %node, error = %e, "copy failed; trying next");
                }
                Err(_) => {
                    debug!(shard = %target.shard, node = %node, "read deadline passed");
                    return (ordinal, None);
                }
            }
        }
        (ordinal, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tessel_core::{IndexId, NodeId, SeqNo, ShardId};

    use crate::operation::{Operation, ReplicatedOp};
    use crate::testing::LocalReplicas;

    fn shard(ordinal: u32) -> ShardId {
        ShardId::new(IndexId::new(1), ShardOrdinal::new(ordinal))
    }

    /// Two shards, each on nodes 1 and 2, one document with `bytes` per shard.
    fn cluster() -> LocalReplicas {
        let replicas = LocalReplicas::default();
        for ordinal in 0..2 {
            for node in [1, 2] {
                let engine = replicas.host(node, shard(ordinal));
                engine
                    .write()
                    .unwrap()
                    .apply(
                        1,
                        &ReplicatedOp {
                            seq_no: SeqNo::new(1),
                            primary_term: 1,
                            op: Operation::Index {
                                doc_id: format!("doc-{ordinal}"),
                                source: Bytes::from(format!(r#"{{"bytes":{}}}"#, 10 * (ordinal + 1))),
                            },
                        },
                    )
                    .unwrap();
            }
        }
        replicas
    }

    fn targets(copies: &[u64]) -> Vec<ReadTarget> {
        (0..2)
            .map(|ordinal| ReadTarget {
                shard: shard(ordinal),
                copies: copies.iter().map(|&n| NodeId::new(n)).collect(),
            })
            .collect()
    }

    fn sum_request(partial: bool) -> ReadRequest {
        ReadRequest {
            query: Query::Sum {
                field: "bytes".to_string(),
            },
            timeout: Duration::from_secs(1),
            partial_results_allowed: partial,
        }
    }

    #[tokio::test]
    async fn test_read_merges_all_shards() {
        let replicas = cluster();
        let reader = ScatterGather::new(Arc::new(replicas));
        let response = reader.execute(targets(&[1, 2]), &sum_request(false)).await.unwrap();
        assert_eq!(response.result, QueryResult::Sum(30.0));
        assert!(!response.is_partial());
        assert_eq!(response.shards_total, 2);
    }

    #[tokio::test]
    async fn test_read_fails_over_to_next_copy() {
        let replicas = cluster();
        replicas.set_down(1, true);
        let reader = ScatterGather::new(Arc::new(replicas));
        let response = reader.execute(targets(&[1, 2]), &sum_request(false)).await.unwrap();
        assert_eq!(response.result, QueryResult::Sum(30.0));
    }

    #[tokio::test]
    async fn test_missing_shard_is_partial_or_error() {
        let replicas = cluster();
        replicas.set_down(1, true);
        let reader = ScatterGather::new(Arc::new(replicas));

        let mut only_node1 = targets(&[2]);
        only_node1[1].copies = vec![NodeId::new(1)];

        let response = reader
            .execute(only_node1.clone(), &sum_request(true))
            .await
            .unwrap();
        assert_eq!(response.missing, vec![ShardOrdinal::new(1)]);
        assert_eq!(response.result, QueryResult::Sum(10.0));

        let err = reader.execute(only_node1, &sum_request(false)).await.unwrap_err();
        assert_eq!(
            err,
            ReplicationError::Timeout {
                missing: vec![ShardOrdinal::new(1)]
            }
        );
    }
}
