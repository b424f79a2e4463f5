//! Queries, per-shard execution and result merging.
//!
//! Relevance scoring and field extraction are collaborator concerns behind
//! the [`Scorer`] trait. This module only runs a query over one shard's
//! documents and merges per-shard results: top-k hits through a bounded
//! heap, sums by addition, histograms bucket by bucket.

use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BinaryHeap};

use bytes::Bytes;
use tessel_core::ShardOrdinal;

use crate::operation::Document;
use crate::storage::ShardStorage;

/// Maximum hits a search may request.
pub const TOP_K_MAX: usize = 10_000;

/// A read request body.
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    /// Best `k` documents for `text`.
    Search {
        /// Query text handed to the scorer.
        text: String,
        /// Hits to return.
        k: usize,
    },
    /// Sum of a numeric field over all documents.
    Sum {
        /// Field name.
        field: String,
    },
    /// Counts of a numeric field per bucket of width `interval`.
    Histogram {
        /// Field name.
        field: String,
        /// Bucket width; must be positive.
        interval: f64,
    },
}

/// One search hit.
#[derive(Debug, Clone, PartialEq)]
pub struct Hit {
    /// Document id.
    pub doc_id: String,
    /// Score from the scorer.
    pub score: f64,
    /// Shard the document came from.
    pub shard: ShardOrdinal,
    /// Document body.
    pub source: Bytes,
}

/// Result of a query on one shard, or merged over several.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryResult {
    /// Hits, best first.
    Hits(Vec<Hit>),
    /// A sum.
    Sum(f64),
    /// Bucket lower bound (as a multiple of the interval) to count.
    Histogram(BTreeMap<i64, u64>),
}

impl QueryResult {
    /// The empty result for `query`.
    #[must_use]
    pub fn empty(query: &Query) -> Self {
        match query {
            Query::Search { .. } => Self::Hits(Vec::new()),
            Query::Sum { .. } => Self::Sum(0.0),
            Query::Histogram { .. } => Self::Histogram(BTreeMap::new()),
        }
    }
}

/// Scores documents and extracts numeric fields.
pub trait Scorer: Send + Sync {
    /// Score of `doc` for `text`, or `None` if it does not match.
    ///
    /// Must be deterministic for the same inputs.
    fn score(&self, doc: &Document, text: &str) -> Option<f64>;

    /// Numeric value of `field` in `doc`, if present.
    fn field_value(&self, doc: &Document, field: &str) -> Option<f64>;
}

/// Scores by counting query-term occurrences in the document body; reads
/// fields from JSON bodies.
#[derive(Debug, Clone, Copy, Default)]
pub struct TermScorer;

impl Scorer for TermScorer {
    fn score(&self, doc: &Document, text: &str) -> Option<f64> {
        let body = String::from_utf8_lossy(&doc.source).to_lowercase();
        let matches: usize = text
            .split_whitespace()
            .map(|term| body.matches(&term.to_lowercase()).count())
            .sum();
        // Safety: match counts are bounded by the document size.
        #[allow(clippy::cast_precision_loss)]
        let score = matches as f64;
        (matches > 0).then_some(score)
    }

    fn field_value(&self, doc: &Document, field: &str) -> Option<f64> {
        let value: serde_json::Value = serde_json::from_slice(&doc.source).ok()?;
        value.get(field)?.as_f64()
    }
}

/// Runs `query` over every document of one shard copy.
#[must_use]
pub fn execute(
    storage: &dyn ShardStorage,
    shard: ShardOrdinal,
    query: &Query,
    scorer: &dyn Scorer,
) -> QueryResult {
    match query {
        Query::Search { text, k } => {
            let k = (*k).min(TOP_K_MAX);
            let hits = storage.read_snapshot().filter_map(|doc| {
                scorer.score(&doc, text).map(|score| Hit {
                    doc_id: doc.id,
                    score,
                    shard,
                    source: doc.source,
                })
            });
            QueryResult::Hits(top_k(hits, k))
        }
        Query::Sum { field } => QueryResult::Sum(
            storage
                .read_snapshot()
                .filter_map(|doc| scorer.field_value(&doc, field))
                .sum(),
        ),
        Query::Histogram { field, interval } => {
            debug_assert!(*interval > 0.0);
            let mut buckets = BTreeMap::new();
            for value in storage
                .read_snapshot()
                .filter_map(|doc| scorer.field_value(&doc, field))
            {
                *buckets.entry(bucket_of(value, *interval)).or_insert(0) += 1;
            }
            QueryResult::Histogram(buckets)
        }
    }
}

/// Merges per-shard results of `query`.
#[must_use]
pub fn merge(query: &Query, results: Vec<QueryResult>) -> QueryResult {
    match query {
        Query::Search { k, .. } => {
            let hits = results.into_iter().flat_map(|r| match r {
                QueryResult::Hits(hits) => hits,
                _ => Vec::new(),
            });
            QueryResult::Hits(top_k(hits, (*k).min(TOP_K_MAX)))
        }
        Query::Sum { .. } => QueryResult::Sum(
            results
                .into_iter()
                .map(|r| match r {
                    QueryResult::Sum(s) => s,
                    _ => 0.0,
                })
                .sum(),
        ),
        Query::Histogram { .. } => {
            let mut merged = BTreeMap::new();
            for result in results {
                if let QueryResult::Histogram(buckets) = result {
                    for (bucket, count) in buckets {
                        *merged.entry(bucket).or_insert(0) += count;
                    }
                }
            }
            QueryResult::Histogram(merged)
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
fn bucket_of(value: f64, interval: f64) -> i64 {
    (value / interval).floor() as i64
}

/// Orders hits best-first: higher score, then lower shard, then lower id.
struct Ranked(Hit);

impl Ord for Ranked {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .score
            .total_cmp(&other.0.score)
            .then_with(|| other.0.shard.cmp(&self.0.shard))
            .then_with(|| other.0.doc_id.cmp(&self.0.doc_id))
    }
}

impl PartialOrd for Ranked {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Ranked {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Ranked {}

/// Keeps the best `k` hits with a min-heap of size `k`.
fn top_k(hits: impl Iterator<Item = Hit>, k: usize) -> Vec<Hit> {
    if k == 0 {
        return Vec::new();
    }
    let mut heap: BinaryHeap<Reverse<Ranked>> = BinaryHeap::with_capacity(k + 1);
    for hit in hits {
        heap.push(Reverse(Ranked(hit)));
        if heap.len() > k {
            heap.pop();
        }
    }
    // into_sorted_vec is ascending over Reverse, i.e. best first.
    heap.into_sorted_vec()
        .into_iter()
        .map(|Reverse(Ranked(hit))| hit)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessel_core::{IndexId, SeqNo, ShardId};

    use crate::operation::{Operation, ReplicatedOp};
    use crate::storage::{MemoryShardStorage, StorageConfig};

    fn storage_with(docs: &[(&str, &'static str)]) -> MemoryShardStorage {
        let mut storage = MemoryShardStorage::new(
            ShardId::new(IndexId::new(1), ShardOrdinal::new(0)),
            StorageConfig::default(),
        );
        for (i, (id, body)) in docs.iter().enumerate() {
            storage
                .apply(&ReplicatedOp {
                    seq_no: SeqNo::new(i as u64 + 1),
                    primary_term: 1,
                    op: Operation::Index {
                        doc_id: (*id).to_string(),
                        source: Bytes::from_static(body.as_bytes()),
                    },
                })
                .unwrap();
        }
        storage
    }

    fn hit(id: &str, score: f64, shard: u32) -> Hit {
        Hit {
            doc_id: id.to_string(),
            score,
            shard: ShardOrdinal::new(shard),
            source: Bytes::new(),
        }
    }

    #[test]
    fn test_search_ranks_by_term_count() {
        let storage = storage_with(&[
            ("a", r#"{"msg":"error"}"#),
            ("b", r#"{"msg":"error error"}"#),
            ("c", r#"{"msg":"ok"}"#),
        ]);
        let query = Query::Search {
            text: "error".to_string(),
            k: 5,
        };
        let QueryResult::Hits(hits) = execute(&storage, ShardOrdinal::new(0), &query, &TermScorer)
        else {
            panic!("expected hits");
        };
        let ids: Vec<_> = hits.iter().map(|h| h.doc_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[test]
    fn test_merge_top_k_breaks_ties_by_shard() {
        let query = Query::Search {
            text: String::new(),
            k: 3,
        };
        let merged = merge(
            &query,
            vec![
                QueryResult::Hits(vec![hit("x", 2.0, 1), hit("y", 1.0, 1)]),
                QueryResult::Hits(vec![hit("z", 2.0, 0), hit("w", 5.0, 0)]),
            ],
        );
        let QueryResult::Hits(hits) = merged else {
            panic!("expected hits");
        };
        let ids: Vec<_> = hits.iter().map(|h| h.doc_id.as_str()).collect();
        assert_eq!(ids, vec!["w", "z", "x"]);
    }

    #[test]
    fn test_sum_and_histogram_combine() {
        let storage = storage_with(&[
            ("a", r#"{"bytes":10}"#),
            ("b", r#"{"bytes":25}"#),
            ("c", r#"{"other":1}"#),
        ]);
        let sum = Query::Sum {
            field: "bytes".to_string(),
        };
        let local = execute(&storage, ShardOrdinal::new(0), &sum, &TermScorer);
        assert_eq!(local, QueryResult::Sum(35.0));
        assert_eq!(
            merge(&sum, vec![local, QueryResult::Sum(5.0)]),
            QueryResult::Sum(40.0)
        );

        let histogram = Query::Histogram {
            field: "bytes".to_string(),
            interval: 10.0,
        };
        let local = execute(&storage, ShardOrdinal::new(0), &histogram, &TermScorer);
        let merged = merge(&histogram, vec![local.clone(), local]);
        let QueryResult::Histogram(buckets) = merged else {
            panic!("expected histogram");
        };
        assert_eq!(buckets.get(&1), Some(&2));
        assert_eq!(buckets.get(&2), Some(&2));
    }
}
