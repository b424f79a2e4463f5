//! Index lifecycle policy and per-index lifecycle record.
//!
//! Ages are measured from index creation. Every phase after `hot` is
//! optional; phases that are defined always run in order.

use serde::{Deserialize, Serialize};

use crate::{IndexId, Millis};

/// A lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LifecyclePhase {
    /// Actively written, full replica count, fast storage.
    Hot,
    /// Read-only, reduced replicas, consolidated segments.
    Warm,
    /// Served from the snapshot repository via a local cache.
    Cold,
    /// All copies removed. Terminal.
    Deleted,
}

impl LifecyclePhase {
    /// Tier attribute value that nodes serving this phase advertise.
    #[must_use]
    pub const fn tier_name(self) -> &'static str {
        match self {
            Self::Hot => "hot",
            Self::Warm => "warm",
            Self::Cold => "cold",
            Self::Deleted => "deleted",
        }
    }
}

/// Hot phase settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HotPhase {
    /// Leave hot once the index holds this many bytes, regardless of age.
    pub max_size_bytes: Option<u64>,
}

/// Warm phase settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarmPhase {
    /// Age at which the index enters warm.
    pub min_age_ms: Millis,
    /// Replica count while warm.
    pub replicas: u32,
    /// Segment target for consolidation.
    pub max_segments: u32,
}

/// Cold phase settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColdPhase {
    /// Age at which the index enters cold.
    pub min_age_ms: Millis,
}

/// Delete phase settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletePhase {
    /// Age at which the index is deleted.
    pub min_age_ms: Millis,
}

/// A lifecycle policy attached to an index at creation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecyclePolicy {
    /// Policy name, for logs and health reports.
    pub name: String,
    /// Hot phase.
    pub hot: HotPhase,
    /// Optional warm phase.
    pub warm: Option<WarmPhase>,
    /// Optional cold phase.
    pub cold: Option<ColdPhase>,
    /// Optional delete phase.
    pub delete: Option<DeletePhase>,
}

impl LifecyclePolicy {
    /// A policy that keeps the index hot forever.
    #[must_use]
    pub fn keep_hot(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Returns the first defined phase after `phase`.
    #[must_use]
    pub const fn next_phase(&self, phase: LifecyclePhase) -> Option<LifecyclePhase> {
        match phase {
            LifecyclePhase::Hot if self.warm.is_some() => Some(LifecyclePhase::Warm),
            LifecyclePhase::Hot | LifecyclePhase::Warm if self.cold.is_some() => {
                Some(LifecyclePhase::Cold)
            }
            LifecyclePhase::Hot | LifecyclePhase::Warm | LifecyclePhase::Cold
                if self.delete.is_some() =>
            {
                Some(LifecyclePhase::Deleted)
            }
            _ => None,
        }
    }

    /// Age at which `phase` may be entered. `Hot` is entered at creation.
    #[must_use]
    pub const fn min_age_ms(&self, phase: LifecyclePhase) -> Option<Millis> {
        match phase {
            LifecyclePhase::Hot => Some(0),
            LifecyclePhase::Warm => match self.warm {
                Some(w) => Some(w.min_age_ms),
                None => None,
            },
            LifecyclePhase::Cold => match self.cold {
                Some(c) => Some(c.min_age_ms),
                None => None,
            },
            LifecyclePhase::Deleted => match self.delete {
                Some(d) => Some(d.min_age_ms),
                None => None,
            },
        }
    }

    /// Validates that defined phases have non-decreasing ages.
    ///
    /// # Errors
    /// Returns an error if a later phase has a smaller minimum age or the
    /// warm phase targets zero segments.
    pub fn validate(&self) -> crate::Result<()> {
        let mut last = 0;
        let mut phase = LifecyclePhase::Hot;
        while let Some(next) = self.next_phase(phase) {
            let age = self.min_age_ms(next).unwrap_or(last);
            if age < last {
                return Err(crate::Error::InvalidArgument {
                    name: "min_age_ms",
                    reason: "phase ages must be non-decreasing",
                });
            }
            last = age;
            phase = next;
        }
        if matches!(self.warm, Some(w) if w.max_segments == 0) {
            return Err(crate::Error::InvalidArgument {
                name: "max_segments",
                reason: "must be positive",
            });
        }
        Ok(())
    }
}

/// Lifecycle bookkeeping for one index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleRecord {
    /// Index this record belongs to.
    pub index: IndexId,
    /// Current phase.
    pub phase: LifecyclePhase,
    /// When the index was created.
    pub created_at_ms: Millis,
    /// When the current phase was entered.
    pub phase_entered_at_ms: Millis,
    /// True once every action of the current phase has been applied.
    pub phase_complete: bool,
    /// The index's policy.
    pub policy: LifecyclePolicy,
}

impl LifecycleRecord {
    /// Creates the record for a freshly created index. Hot has no actions.
    #[must_use]
    pub const fn new(index: IndexId, policy: LifecyclePolicy, now_ms: Millis) -> Self {
        Self {
            index,
            phase: LifecyclePhase::Hot,
            created_at_ms: now_ms,
            phase_entered_at_ms: now_ms,
            phase_complete: true,
            policy,
        }
    }

    /// Age of the index at `now_ms`.
    #[must_use]
    pub const fn age_ms(&self, now_ms: Millis) -> Millis {
        now_ms.saturating_sub(self.created_at_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DAY_MS;

    fn hot_warm_delete() -> LifecyclePolicy {
        LifecyclePolicy {
            name: "logs".to_string(),
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

    #[test]
    fn test_next_phase_skips_undefined_only() {
        let policy = hot_warm_delete();
        assert_eq!(policy.next_phase(LifecyclePhase::Hot), Some(LifecyclePhase::Warm));
        assert_eq!(policy.next_phase(LifecyclePhase::Warm), Some(LifecyclePhase::Deleted));
        assert_eq!(policy.next_phase(LifecyclePhase::Deleted), None);
    }

    #[test]
    fn test_keep_hot_has_no_next_phase() {
        let policy = LifecyclePolicy::keep_hot("forever");
        assert_eq!(policy.next_phase(LifecyclePhase::Hot), None);
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_decreasing_ages_rejected() {
        let mut policy = hot_warm_delete();
        policy.delete = Some(DeletePhase { min_age_ms: DAY_MS });
        assert!(policy.validate().is_err());
        assert!(hot_warm_delete().validate().is_ok());
    }

    #[test]
    fn test_record_age() {
        let record = LifecycleRecord::new(IndexId::new(1), hot_warm_delete(), 1_000);
        assert_eq!(record.age_ms(500), 0);
        assert_eq!(record.age_ms(3_000), 2_000);
        assert!(record.phase_complete);
    }
}
