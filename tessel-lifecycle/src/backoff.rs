//! Exponential backoff for failed lifecycle steps.

use std::collections::BTreeMap;

use tessel_core::{IndexId, Millis};

/// Default delay before the first retry.
pub const BACKOFF_INITIAL_MS_DEFAULT: Millis = 1_000;

/// Default ceiling on the retry delay.
pub const BACKOFF_MAX_MS_DEFAULT: Millis = 5 * 60 * 1_000;

/// Retry delay policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Delay after the first failure.
    pub initial_ms: Millis,
    /// Delay ceiling.
    pub max_ms: Millis,
    /// Factor applied per consecutive failure.
    pub multiplier: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: BACKOFF_INITIAL_MS_DEFAULT,
            max_ms: BACKOFF_MAX_MS_DEFAULT,
            multiplier: 2,
        }
    }
}

impl BackoffConfig {
    /// Short delays for tests.
    #[must_use]
    pub const fn for_testing() -> Self {
        Self {
            initial_ms: 10,
            max_ms: 100,
            multiplier: 2,
        }
    }

    /// Sets the initial delay.
    #[must_use]
    pub const fn with_initial_ms(mut self, initial_ms: Millis) -> Self {
        self.initial_ms = initial_ms;
        self
    }

    /// Sets the delay ceiling.
    #[must_use]
    pub const fn with_max_ms(mut self, max_ms: Millis) -> Self {
        self.max_ms = max_ms;
        self
    }

    /// Delay after `failures` consecutive failures (at least one).
    #[must_use]
    pub fn delay_ms(&self, failures: u32) -> Millis {
        debug_assert!(failures > 0);
        let exponent = failures.saturating_sub(1);
        let factor = u64::from(self.multiplier.max(1)).saturating_pow(exponent);
        self.initial_ms.saturating_mul(factor).min(self.max_ms)
    }
}

/// Retry bookkeeping for one index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    /// Consecutive failures.
    pub failures: u32,
    /// Earliest time of the next attempt.
    pub next_attempt_at_ms: Millis,
}

/// Per-index retry state.
#[derive(Debug, Clone, Default)]
pub struct RetryTracker {
    retries: BTreeMap<IndexId, RetryState>,
}

impl RetryTracker {
    /// Returns true if `index` may be attempted at `now_ms`.
    #[must_use]
    pub fn is_due(&self, index: IndexId, now_ms: Millis) -> bool {
        self.retries
            .get(&index)
            .map_or(true, |r| now_ms >= r.next_attempt_at_ms)
    }

    /// Retry state of `index`, if it has failed.
    #[must_use]
    pub fn get(&self, index: IndexId) -> Option<RetryState> {
        self.retries.get(&index).copied()
    }

    /// Clears the retry state of `index`.
    pub fn record_success(&mut self, index: IndexId) {
        self.retries.remove(&index);
    }

    /// Records a failure and returns when the next attempt is due.
    pub fn record_failure(&mut self, index: IndexId, now_ms: Millis, config: &BackoffConfig) -> Millis {
        let entry = self.retries.entry(index).or_insert(RetryState {
            failures: 0,
            next_attempt_at_ms: now_ms,
        });
        entry.failures = entry.failures.saturating_add(1);
        entry.next_attempt_at_ms = now_ms.saturating_add(config.delay_ms(entry.failures));
        entry.next_attempt_at_ms
    }

    /// Drops state for indices not in `live`.
    pub fn retain(&mut self, live: impl Fn(IndexId) -> bool) {
        self.retries.retain(|index, _| live(*index));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_until_ceiling() {
        let config = BackoffConfig::for_testing();
        let delays: Vec<_> = (1..=6).map(|n| config.delay_ms(n)).collect();
        assert_eq!(delays, vec![10, 20, 40, 80, 100, 100]);
    }

    #[test]
    fn test_tracker_gates_until_due_and_resets_on_success() {
        let config = BackoffConfig::for_testing();
        let mut tracker = RetryTracker::default();
        let index = IndexId::new(1);

        assert!(tracker.is_due(index, 0));
        assert_eq!(tracker.record_failure(index, 1_000, &config), 1_010);
        assert!(!tracker.is_due(index, 1_005));
        assert_eq!(tracker.record_failure(index, 1_010, &config), 1_030);
        assert_eq!(tracker.get(index).map(|r| r.failures), Some(2));

        tracker.record_success(index);
        assert!(tracker.is_due(index, 0));
    }
}
