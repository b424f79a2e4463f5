//! Lifecycle engine - moves indices through hot, warm, cold and deleted.
//!
//! The engine runs on the master. Each evaluation looks at every index's
//! lifecycle record and emits at most one step per index: either resuming
//! the actions of a phase that has not completed, or entering the next
//! defined phase once its thresholds are met. Steps are idempotent
//! allocator requests, so a step that fails part way is simply issued again
//! after a backoff. Phases are never skipped: an index that is already old
//! enough to be deleted still passes through every defined phase, one
//! evaluation at a time.

use std::collections::BTreeMap;

use tessel_core::{IndexId, LifecyclePhase, LifecycleRecord, Millis};
use tessel_routing::{Allocator, ClusterState, LifecycleRequest};
use tracing::{debug, info, warn};

use crate::backoff::{BackoffConfig, RetryTracker};
use crate::error::{LifecycleError, LifecycleResult};

/// Size and shape of an index as reported by the nodes holding it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexStats {
    /// Bytes held by the primaries.
    pub size_bytes: u64,
    /// Highest segment count of any copy.
    pub max_segment_count: u32,
}

/// One unit of lifecycle work for an index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleStep {
    /// The index.
    pub index: IndexId,
    /// Phase recorded before the step.
    pub from: LifecyclePhase,
    /// Phase whose actions the step runs. Equal to `from` when resuming.
    pub to: LifecyclePhase,
    /// Allocator requests, in order.
    pub requests: Vec<LifecycleRequest>,
}

impl LifecycleStep {
    /// Returns true if the step enters a new phase.
    #[must_use]
    pub fn is_transition(&self) -> bool {
        self.from != self.to
    }
}

/// Result of one lifecycle pass.
#[derive(Debug, Default)]
pub struct LifecycleReport {
    /// Indices whose step completed, with the phase they are now in.
    pub completed: Vec<(IndexId, LifecyclePhase)>,
    /// Indices whose step failed and will be retried.
    pub failed: Vec<(IndexId, LifecycleError)>,
    /// Shard map changes applied.
    pub changes: usize,
}

/// Drives lifecycle records on the master.
#[derive(Debug, Default)]
pub struct LifecycleEngine {
    backoff: BackoffConfig,
    retries: RetryTracker,
}

impl LifecycleEngine {
    /// Creates an engine with the given retry policy.
    #[must_use]
    pub fn new(backoff: BackoffConfig) -> Self {
        Self {
            backoff,
            retries: RetryTracker::default(),
        }
    }

    /// Retry bookkeeping.
    #[must_use]
    pub const fn retries(&self) -> &RetryTracker {
        &self.retries
    }

    /// Computes the steps due at `now_ms`.
    #[must_use]
    pub fn evaluate(
        &self,
        state: &ClusterState,
        stats: &BTreeMap<IndexId, IndexStats>,
        now_ms: Millis,
    ) -> Vec<LifecycleStep> {
        let mut steps = Vec::new();
        for record in state.lifecycle.values() {
            if !self.retries.is_due(record.index, now_ms) {
                continue;
            }
            if !record.phase_complete {
                steps.push(LifecycleStep {
                    index: record.index,
                    from: record.phase,
                    to: record.phase,
                    requests: phase_actions(record, record.phase),
                });
                continue;
            }
            let Some(next) = record.policy.next_phase(record.phase) else {
                continue;
            };
            if is_ready(record, next, stats.get(&record.index), now_ms) {
                steps.push(LifecycleStep {
                    index: record.index,
                    from: record.phase,
                    to: next,
                    requests: phase_actions(record, next),
                });
            }
        }

        // Postcondition: at most one step per index.
        debug_assert!(steps.windows(2).all(|w| w[0].index < w[1].index));
        steps
    }

    /// Clears the retry state of `index`.
    pub fn record_success(&mut self, index: IndexId) {
        self.retries.record_success(index);
    }

    /// Backs off `index`; returns when it is next due.
    pub fn record_failure(&mut self, index: IndexId, now_ms: Millis) -> Millis {
        self.retries.record_failure(index, now_ms, &self.backoff)
    }

    /// Runs `step` against `state`, a successor the master will publish.
    ///
    /// A transition is recorded, marked incomplete, once its first request
    /// has been applied; if that request fails the index stays in its
    /// previous phase. The phase is marked complete once every request has
    /// been planned and applied. Returns the number of shard map changes
    /// applied.
    ///
    /// # Errors
    /// Returns the first failing request's error; the index is backed off.
    pub fn apply_step(
        &mut self,
        state: &mut ClusterState,
        allocator: &Allocator,
        step: &LifecycleStep,
        now_ms: Millis,
    ) -> LifecycleResult<usize> {
        let mut changes = 0;
        let mut failure = None;
        for (applied, request) in step.requests.iter().enumerate() {
            match run_request(state, allocator, step.index, request) {
                Ok(count) => changes += count,
                Err(e) => {
                    failure = Some((applied, e));
                    break;
                }
            }
        }
        if step.is_transition() && !matches!(failure, Some((0, _))) {
            enter_phase(state, step, now_ms);
        }

        match failure {
            None => {
                if let Some(record) = state.lifecycle.get_mut(&step.index) {
                    record.phase_complete = true;
                }
                self.record_success(step.index);
                debug!(index = %step.index, phase = ?step.to, changes, "lifecycle phase complete");
                Ok(changes)
            }
            Some((applied, e)) => {
                let next_attempt_at_ms = self.record_failure(step.index, now_ms);
                warn!(
                    index = %step.index,
                    from = ?step.from,
                    phase = ?step.to,
                    applied,
                    error = %e,
                    next_attempt_at_ms,
                    "lifecycle step failed; backing off"
                );
                Err(e)
            }
        }
    }

    /// Evaluates and runs every due step against `state`.
    pub fn run(
        &mut self,
        state: &mut ClusterState,
        allocator: &Allocator,
        stats: &BTreeMap<IndexId, IndexStats>,
        now_ms: Millis,
    ) -> LifecycleReport {
        let mut report = LifecycleReport::default();
        for step in self.evaluate(state, stats, now_ms) {
            match self.apply_step(state, allocator, &step, now_ms) {
                Ok(changes) => {
                    report.changes += changes;
                    report.completed.push((step.index, step.to));
                }
                Err(e) => report.failed.push((step.index, e)),
            }
        }
        let lifecycle = &state.lifecycle;
        self.retries.retain(|index| lifecycle.contains_key(&index));
        report
    }
}

/// Plans and applies one request on the evolving state.
fn run_request(
    state: &mut ClusterState,
    allocator: &Allocator,
    index: IndexId,
    request: &LifecycleRequest,
) -> LifecycleResult<usize> {
    let plan = allocator.on_lifecycle_request(state, index, request)?;
    state
        .apply_changes(&plan.changes)
        .map_err(|e| LifecycleError::Allocation {
            message: e.to_string(),
        })?;
    Ok(plan.changes.len())
}

fn enter_phase(state: &mut ClusterState, step: &LifecycleStep, now_ms: Millis) {
    if let Some(record) = state.lifecycle.get_mut(&step.index) {
        debug_assert_eq!(record.phase, step.from);
        record.phase = step.to;
        record.phase_entered_at_ms = now_ms;
        record.phase_complete = false;
    }
    info!(index = %step.index, from = ?step.from, to = ?step.to, "entering lifecycle phase");
}

/// Allocator requests that realise `phase`.
fn phase_actions(record: &LifecycleRecord, phase: LifecyclePhase) -> Vec<LifecycleRequest> {
    match phase {
        LifecyclePhase::Hot => Vec::new(),
        LifecyclePhase::Warm => {
            let mut requests = vec![LifecycleRequest::MarkReadOnly];
            if let Some(warm) = record.policy.warm {
                requests.insert(0, LifecycleRequest::SetReplicas(warm.replicas));
                requests.push(LifecycleRequest::ConsolidateSegments {
                    max_segments: warm.max_segments,
                });
            }
            requests.push(LifecycleRequest::RequireTier(phase.tier_name().to_string()));
            requests
        }
        LifecyclePhase::Cold => vec![
            LifecycleRequest::MarkReadOnly,
            LifecycleRequest::RequireTier(phase.tier_name().to_string()),
            LifecycleRequest::TakeSnapshot,
            LifecycleRequest::ConvertToReferenceOnly,
        ],
        LifecyclePhase::Deleted => vec![LifecycleRequest::RemoveAllCopies],
    }
}

/// Returns true once `record` may enter `next`.
fn is_ready(
    record: &LifecycleRecord,
    next: LifecyclePhase,
    stats: Option<&IndexStats>,
    now_ms: Millis,
) -> bool {
    let policy = &record.policy;
    let old_enough = record.age_ms(now_ms) >= policy.min_age_ms(next).unwrap_or(0);
    match (record.phase, next) {
        (LifecyclePhase::Hot, LifecyclePhase::Warm | LifecyclePhase::Cold) => {
            let rolled_over = matches!(
                (policy.hot.max_size_bytes, stats),
                (Some(max), Some(s)) if s.size_bytes >= max
            );
            old_enough || rolled_over
        }
        (LifecyclePhase::Warm, LifecyclePhase::Cold) => {
            // No reported copy means no segments left to merge.
            let consolidated = match (policy.warm, stats) {
                (Some(warm), Some(s)) => s.max_segment_count <= warm.max_segments,
                _ => true,
            };
            old_enough && consolidated
        }
        _ => old_enough,
    }
}
