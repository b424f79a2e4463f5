//! Snapshot repository - the shared durable store behind the cold tier.
//!
//! Trait-based so that production can point at any blob store while tests
//! use the in-memory repository with deterministic fault injection.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tessel_core::ShardId;

use crate::error::{LifecycleError, LifecycleResult};

// -----------------------------------------------------------------------------
// SnapshotKey
// -----------------------------------------------------------------------------

/// Key of a snapshot in the repository.
///
/// Shard snapshots live at `index-{index}/shard-{ordinal}.snap`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SnapshotKey(String);

impl SnapshotKey {
    /// Creates a key from a string.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Key of the snapshot of `shard`.
    #[must_use]
    pub fn for_shard(shard: ShardId) -> Self {
        Self(format!(
            "index-{}/shard-{}.snap",
            shard.index.get(),
            shard.ordinal.get()
        ))
    }

    /// Returns the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SnapshotKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// -----------------------------------------------------------------------------
// SnapshotRepository Trait
// -----------------------------------------------------------------------------

/// Shared durable store for shard snapshots.
///
/// Implementations must be `Send + Sync` for use across async tasks.
#[async_trait]
pub trait SnapshotRepository: Send + Sync {
    /// Stores a snapshot, replacing any previous one under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the upload fails.
    async fn put(&self, key: &SnapshotKey, data: Bytes) -> LifecycleResult<()>;

    /// Fetches a snapshot.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if there is no snapshot under `key`.
    async fn get(&self, key: &SnapshotKey) -> LifecycleResult<Bytes>;

    /// Deletes a snapshot. Deleting a missing key succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error if the deletion fails.
    async fn delete(&self, key: &SnapshotKey) -> LifecycleResult<()>;

    /// Lists keys with the given prefix, in order.
    ///
    /// # Errors
    ///
    /// Returns an error if the listing fails.
    async fn list(&self, prefix: &str) -> LifecycleResult<Vec<SnapshotKey>>;
}

// -----------------------------------------------------------------------------
// Fault Configuration
// -----------------------------------------------------------------------------

/// Fault injection for [`InMemoryRepository`].
#[derive(Debug, Clone, Default)]
pub struct RepositoryFaultConfig {
    /// Probability of put failing. Range: 0.0 - 1.0.
    pub put_fail_rate: f64,
    /// Probability of get failing. Range: 0.0 - 1.0.
    pub get_fail_rate: f64,
    /// If true, the next put fails (one-shot).
    pub force_put_fail: bool,
    /// If true, the next get fails (one-shot).
    pub force_get_fail: bool,
}

impl RepositoryFaultConfig {
    /// Sets the put failure rate.
    ///
    /// # Panics
    ///
    /// Panics if rate is not in range 0.0..=1.0.
    #[must_use]
    pub fn with_put_fail_rate(mut self, rate: f64) -> Self {
        assert!((0.0..=1.0).contains(&rate), "rate must be in 0.0..=1.0");
        self.put_fail_rate = rate;
        self
    }

    /// Sets the get failure rate.
    ///
    /// # Panics
    ///
    /// Panics if rate is not in range 0.0..=1.0.
    #[must_use]
    pub fn with_get_fail_rate(mut self, rate: f64) -> Self {
        assert!((0.0..=1.0).contains(&rate), "rate must be in 0.0..=1.0");
        self.get_fail_rate = rate;
        self
    }

    /// Forces the next put to fail.
    #[must_use]
    pub const fn with_force_put_fail(mut self) -> Self {
        self.force_put_fail = true;
        self
    }

    /// Forces the next get to fail.
    #[must_use]
    pub const fn with_force_get_fail(mut self) -> Self {
        self.force_get_fail = true;
        self
    }
}

// -----------------------------------------------------------------------------
// InMemoryRepository
// -----------------------------------------------------------------------------

/// In-memory snapshot repository.
///
/// Clones share the same store, so every node of an in-process cluster can
/// hold a handle to one "shared durable store". Fault injection is
/// deterministic for a given seed.
#[derive(Debug, Clone)]
pub struct InMemoryRepository {
    objects: Arc<Mutex<BTreeMap<SnapshotKey, Bytes>>>,
    faults: Arc<Mutex<RepositoryFaultConfig>>,
    seed: u64,
    counter: Arc<AtomicU64>,
}

impl InMemoryRepository {
    /// Creates an empty repository with the given fault seed.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self::with_faults(seed, RepositoryFaultConfig::default())
    }

    /// Creates an empty repository with fault injection enabled.
    #[must_use]
    pub fn with_faults(seed: u64, faults: RepositoryFaultConfig) -> Self {
        Self {
            objects: Arc::new(Mutex::new(BTreeMap::new())),
            faults: Arc::new(Mutex::new(faults)),
            seed,
            counter: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Returns the fault configuration for modification.
    ///
    /// # Panics
    ///
    /// Panics if the mutex is poisoned.
    pub fn faults(&self) -> std::sync::MutexGuard<'_, RepositoryFaultConfig> {
        self.faults.lock().expect("fault config lock poisoned")
    }

    /// Returns the number of stored snapshots.
    ///
    /// # Panics
    ///
    /// Panics if the mutex is poisoned.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.lock().expect("objects lock poisoned").len()
    }

    /// Returns true if the repository is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flips every bit of the byte at `offset` of a stored snapshot.
    ///
    /// # Panics
    ///
    /// Panics if the mutex is poisoned.
    pub fn corrupt_byte(&self, key: &SnapshotKey, offset: usize) {
        let mut objects = self.objects.lock().expect("objects lock poisoned");
        if let Some(content) = objects.get_mut(key) {
            let mut bytes = content.to_vec();
            if let Some(byte) = bytes.get_mut(offset) {
                *byte ^= 0xFF;
            }
            *content = Bytes::from(bytes);
        }
    }

    fn should_inject_fault(&self, rate: f64) -> bool {
        if rate <= 0.0 {
            return false;
        }
        if rate >= 1.0 {
            return true;
        }
        let counter = self.counter.fetch_add(1, Ordering::Relaxed);
        let hash = self.seed.wrapping_add(counter).wrapping_mul(0x5851_f42d_4c95_7f2d);
        // Safety: precision loss is acceptable for a probability.
        #[allow(clippy::cast_precision_loss)]
        let normalized = (hash as f64) / (u64::MAX as f64);
        normalized < rate
    }
}

#[async_trait]
impl SnapshotRepository for InMemoryRepository {
    async fn put(&self, key: &SnapshotKey, data: Bytes) -> LifecycleResult<()> {
        debug_assert!(!key.as_str().is_empty());

        let rate = {
            let mut faults = self.faults();
            if faults.force_put_fail {
                faults.force_put_fail = false;
                1.0
            } else {
                faults.put_fail_rate
            }
        };
        if self.should_inject_fault(rate) {
            return Err(LifecycleError::UploadFailed {
                key: key.to_string(),
                message: "simulated upload failure".to_string(),
            });
        }

        self.objects
            .lock()
            .expect("objects lock poisoned")
            .insert(key.clone(), data);
        Ok(())
    }

    async fn get(&self, key: &SnapshotKey) -> LifecycleResult<Bytes> {
        let rate = {
            let mut faults = self.faults();
            if faults.force_get_fail {
                faults.force_get_fail = false;
                1.0
            } else {
                faults.get_fail_rate
            }
        };
        if self.should_inject_fault(rate) {
            return Err(LifecycleError::DownloadFailed {
                key: key.to_string(),
                message: "simulated download failure".to_string(),
            });
        }

        self.objects
            .lock()
            .expect("objects lock poisoned")
            .get(key)
            .cloned()
            .ok_or_else(|| LifecycleError::NotFound {
                key: key.to_string(),
            })
    }

    async fn delete(&self, key: &SnapshotKey) -> LifecycleResult<()> {
        self.objects
            .lock()
            .expect("objects lock poisoned")
            .remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> LifecycleResult<Vec<SnapshotKey>> {
        Ok(self
            .objects
            .lock()
            .expect("objects lock poisoned")
            .keys()
            .filter(|k| k.as_str().starts_with(prefix))
            .cloned()
            .collect())
    }
}
