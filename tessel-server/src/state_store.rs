//! Durable copy of the latest applied cluster state.
//!
//! Every node records the cluster state it applied, together with its
//! election term and vote, so that a restarted process resumes from the
//! same view instead of an empty one. The master writes a new version here
//! before it broadcasts it.
//!
//! # Format
//!
//! ```text
//! [magic: 4][format: 4][length: 4][payload: length][crc32: 4]
//! ```
//!
//! Integers are big-endian. The payload is the JSON encoding of
//! [`PersistedState`]; the checksum covers everything before it and is
//! verified first.

use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tessel_core::StateVersion;
use tessel_quorum::PersistentVote;
use tessel_routing::ClusterState;
use thiserror::Error;
use tracing::{debug, info};

/// Magic bytes of the state file ("TSCS").
const STATE_MAGIC: u32 = 0x5453_4353;

/// Current format version.
const STATE_FORMAT: u32 = 1;

/// Header: magic + format + length.
const HEADER_SIZE: usize = 4 + 4 + 4;

/// Trailing checksum.
const CHECKSUM_SIZE: usize = 4;

/// Largest payload accepted.
pub const STATE_BYTES_MAX: usize = 64 * 1024 * 1024;

/// Errors from state store operations.
#[derive(Debug, Error)]
pub enum StateStoreError {
    /// I/O error during local file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid file layout.
    #[error("invalid state format: {0}")]
    InvalidFormat(String),

    /// Checksum mismatch.
    #[error("checksum mismatch: expected {expected:#x}, got {actual:#x}")]
    ChecksumMismatch {
        /// Checksum computed over the data.
        expected: u32,
        /// Checksum stored in the file.
        actual: u32,
    },

    /// The payload could not be encoded or decoded.
    #[error("payload: {0}")]
    Payload(#[from] serde_json::Error),

    /// The encoded state exceeds [`STATE_BYTES_MAX`].
    #[error("state too large: {size} bytes exceeds maximum {max}")]
    TooLarge {
        /// Encoded size.
        size: usize,
        /// Maximum allowed.
        max: usize,
    },
}

/// Result type for state store operations.
pub type StateStoreResult<T> = Result<T, StateStoreError>;

/// What a node persists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    /// Election term and vote.
    pub vote: PersistentVote,
    /// Latest applied cluster state.
    pub state: ClusterState,
}

impl PersistedState {
    /// Encodes into a checksummed frame.
    ///
    /// # Errors
    /// Returns an error if the state cannot be encoded or is too large.
    pub fn encode(&self) -> StateStoreResult<Bytes> {
        let payload = serde_json::to_vec(self)?;
        if payload.len() > STATE_BYTES_MAX {
            return Err(StateStoreError::TooLarge {
                size: payload.len(),
                max: STATE_BYTES_MAX,
            });
        }

        let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len() + CHECKSUM_SIZE);
        buf.put_u32(STATE_MAGIC);
        buf.put_u32(STATE_FORMAT);
        // Safe: payload is bounded by STATE_BYTES_MAX which fits in u32.
        #[allow(clippy::cast_possible_truncation)]
        buf.put_u32(payload.len() as u32);
        buf.put_slice(&payload);

        let checksum = crc32fast::hash(&buf);
        buf.put_u32(checksum);
        Ok(buf.freeze())
    }

    /// Decodes and verifies a frame.
    ///
    /// # Errors
    /// Returns an error if the checksum, magic, format or length is wrong,
    /// or the payload does not decode.
    pub fn decode(data: &[u8]) -> StateStoreResult<Self> {
        if data.len() < HEADER_SIZE + CHECKSUM_SIZE {
            return Err(StateStoreError::InvalidFormat(format!(
                "data too short: {} bytes, minimum {}",
                data.len(),
                HEADER_SIZE + CHECKSUM_SIZE
            )));
        }

        // Verify checksum first.
        let (framed, mut trailer) = data.split_at(data.len() - CHECKSUM_SIZE);
        let expected = crc32fast::hash(framed);
        let actual = trailer.get_u32();
        if expected != actual {
            return Err(StateStoreError::ChecksumMismatch { expected, actual });
        }

        let mut buf = framed;
        let magic = buf.get_u32();
        if magic != STATE_MAGIC {
            return Err(StateStoreError::InvalidFormat(format!(
                "invalid magic: {magic:#x}, expected {STATE_MAGIC:#x}"
            )));
        }
        let format = buf.get_u32();
        if format != STATE_FORMAT {
            return Err(StateStoreError::InvalidFormat(format!(
                "unsupported format: {format}, expected {STATE_FORMAT}"
            )));
        }
        let length = buf.get_u32() as usize;
        if length != buf.remaining() {
            return Err(StateStoreError::InvalidFormat(format!(
                "length mismatch: header says {length}, found {}",
                buf.remaining()
            )));
        }

        Ok(serde_json::from_slice(buf)?)
    }
}

/// Local state storage abstraction.
///
/// Lets in-process clusters swap the file for an in-memory slot with fault
/// injection.
pub trait StateStorage: Send + Sync {
    /// Reads the stored frame. Returns `Ok(None)` if nothing was stored.
    ///
    /// # Errors
    /// Returns an error if the storage cannot be read.
    fn read(&self) -> StateStoreResult<Option<Bytes>>;

    /// Replaces the stored frame durably.
    ///
    /// # Errors
    /// Returns an error if the write or sync fails.
    fn write(&self, data: &[u8]) -> StateStoreResult<()>;

    /// Removes the stored frame.
    ///
    /// # Errors
    /// Returns an error if removal fails for a reason other than absence.
    fn delete(&self) -> StateStoreResult<()>;
}

/// Production storage: one file, replaced atomically.
#[derive(Debug, Clone)]
pub struct LocalFileStateStorage {
    path: PathBuf,
}

impl LocalFileStateStorage {
    /// Stores the state at `path`.
    #[must_use]
    pub const fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl StateStorage for LocalFileStateStorage {
    fn read(&self) -> StateStoreResult<Option<Bytes>> {
        match std::fs::read(&self.path) {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StateStoreError::Io(e)),
        }
    }

    fn write(&self, data: &[u8]) -> StateStoreResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let temp_path = self.path.with_extension("tmp");

        let mut file = std::fs::File::create(&temp_path)?;
        file.write_all(data)?;
        file.sync_all()?;

        std::fs::rename(&temp_path, &self.path)?;
        Ok(())
    }

    fn delete(&self) -> StateStoreResult<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StateStoreError::Io(e)),
        }
    }
}

/// Fault injection for [`SimulatedStateStorage`].
#[derive(Debug, Clone, Default)]
pub struct StateStorageFaultConfig {
    /// Probability of a write failing.
    pub write_fail_rate: f64,
    /// Force the next read to fail (one-shot).
    pub force_read_fail: bool,
    /// Force the next write to fail (one-shot).
    pub force_write_fail: bool,
}

/// In-memory storage with deterministic fault injection. Clones share the
/// stored frame, so a "restarted" node can be handed the same slot.
#[derive(Debug, Clone)]
pub struct SimulatedStateStorage {
    data: Arc<Mutex<Option<Vec<u8>>>>,
    faults: Arc<Mutex<StateStorageFaultConfig>>,
    seed: u64,
    counter: Arc<AtomicU64>,
}

impl SimulatedStateStorage {
    /// Creates empty storage.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            data: Arc::new(Mutex::new(None)),
            faults: Arc::new(Mutex::new(StateStorageFaultConfig::default())),
            seed,
            counter: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Fault configuration.
    pub fn faults(&self) -> std::sync::MutexGuard<'_, StateStorageFaultConfig> {
        self.faults.lock().expect("fault config lock poisoned")
    }

    /// Flips one byte of the stored frame.
    pub fn corrupt_byte(&self, offset: usize) {
        let mut data = self.data.lock().expect("data lock poisoned");
        if let Some(byte) = data.as_mut().and_then(|d| d.get_mut(offset)) {
            *byte ^= 0xFF;
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
        #[allow(clippy::cast_precision_loss)]
        let normalized = (hash as f64) / (u64::MAX as f64);
        normalized < rate
    }

    fn simulated_failure(what: &str) -> StateStoreError {
        StateStoreError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("simulated {what} failure"),
        ))
    }
}

impl StateStorage for SimulatedStateStorage {
    fn read(&self) -> StateStoreResult<Option<Bytes>> {
        {
            let mut faults = self.faults();
            if faults.force_read_fail {
                faults.force_read_fail = false;
                return Err(Self::simulated_failure("read"));
            }
        }
        let data = self.data.lock().expect("data lock poisoned");
        Ok(data.as_ref().map(|d| Bytes::from(d.clone())))
    }

    fn write(&self, data: &[u8]) -> StateStoreResult<()> {
        let rate = {
            let mut faults = self.faults();
            if faults.force_write_fail {
                faults.force_write_fail = false;
                return Err(Self::simulated_failure("write"));
            }
            faults.write_fail_rate
        };
        if self.should_inject_fault(rate) {
            return Err(Self::simulated_failure("write"));
        }
        *self.data.lock().expect("data lock poisoned") = Some(data.to_vec());
        Ok(())
    }

    fn delete(&self) -> StateStoreResult<()> {
        *self.data.lock().expect("data lock poisoned") = None;
        Ok(())
    }
}

/// Persists [`PersistedState`] through a [`StateStorage`].
pub struct ClusterStateStore {
    storage: Box<dyn StateStorage>,
    saved_version: StateVersion,
}

impl std::fmt::Debug for ClusterStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterStateStore")
            .field("saved_version", &self.saved_version)
            .finish_non_exhaustive()
    }
}

impl ClusterStateStore {
    /// Creates a store over `storage`.
    #[must_use]
    pub fn new(storage: Box<dyn StateStorage>) -> Self {
        Self {
            storage,
            saved_version: StateVersion::new(0),
        }
    }

    /// Store backed by `<data_dir>/cluster_state`.
    #[must_use]
    pub fn open_dir(data_dir: &std::path::Path) -> Self {
        Self::new(Box::new(LocalFileStateStorage::new(
            data_dir.join("cluster_state"),
        )))
    }

    /// Version of the last state saved or loaded.
    #[must_use]
    pub const fn saved_version(&self) -> StateVersion {
        self.saved_version
    }

    /// Loads the stored state, if any.
    ///
    /// # Errors
    /// Returns an error if the stored frame is unreadable or corrupt.
    pub fn load(&mut self) -> StateStoreResult<Option<PersistedState>> {
        let Some(data) = self.storage.read()? else {
            return Ok(None);
        };
        let persisted = PersistedState::decode(&data)?;
        self.saved_version = persisted.state.version;
        info!(
            version = persisted.state.version.get(),
            term = persisted.vote.term.get(),
            "loaded persisted cluster state"
        );
        Ok(Some(persisted))
    }

    /// Saves `persisted`, replacing what was stored.
    ///
    /// # Errors
    /// Returns an error if encoding or the durable write fails; the
    /// previously stored state is left in place.
    pub fn save(&mut self, persisted: &PersistedState) -> StateStoreResult<()> {
        debug_assert!(persisted.state.version >= self.saved_version);
        let frame = persisted.encode()?;
        self.storage.write(&frame)?;
        self.saved_version = persisted.state.version;
        debug!(version = persisted.state.version.get(), bytes = frame.len(), "persisted cluster state");
        Ok(())
    }

    /// Removes the stored state.
    ///
    /// # Errors
    /// Propagates storage errors.
    pub fn clear(&mut self) -> StateStoreResult<()> {
        self.storage.delete()?;
        self.saved_version = StateVersion::new(0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tessel_core::{
        IndexId, LifecyclePolicy, LifecycleRecord, NodeAttributes, NodeId, NodeInfo, NodeRoles,
        TermId,
    };
    use tessel_routing::{IndexMetadata, ShardChange};

    fn sample() -> PersistedState {
        let mut state = ClusterState::empty().successor(NodeId::new(1), TermId::new(3), StateVersion::new(0));
        state.nodes.insert(
            NodeId::new(1),
            NodeInfo::new(NodeId::new(1), NodeRoles::ALL, NodeAttributes::new().with("zone", "a")),
        );
        state
            .apply_changes(&[ShardChange::AddIndex(IndexMetadata::new(
                IndexId::new(1),
                "logs",
                2,
                1,
                0,
            ))])
            .unwrap();
        state.lifecycle.insert(
            IndexId::new(1),
            LifecycleRecord::new(IndexId::new(1), LifecyclePolicy::keep_hot("default"), 0),
        );
        PersistedState {
            vote: PersistentVote {
                term: TermId::new(3),
                voted_for: Some(NodeId::new(1)),
            },
            state,
        }
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = TempDir::new().expect("create temp dir");
        let persisted = sample();

        let mut store = ClusterStateStore::open_dir(dir.path());
        store.save(&persisted).unwrap();
        assert!(!dir.path().join("cluster_state.tmp").exists());

        let mut reopened = ClusterStateStore::open_dir(dir.path());
        assert_eq!(reopened.load().unwrap(), Some(persisted.clone()));
        assert_eq!(reopened.saved_version(), persisted.state.version);
    }

    #[test]
    fn test_empty_store_loads_nothing() {
        let mut store = ClusterStateStore::new(Box::new(SimulatedStateStorage::new(1)));
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_corruption_is_detected_before_decoding() {
        let storage = SimulatedStateStorage::new(1);
        let mut store = ClusterStateStore::new(Box::new(storage.clone()));
        store.save(&sample()).unwrap();

        storage.corrupt_byte(HEADER_SIZE + 5);
        assert!(matches!(
            store.load(),
            Err(StateStoreError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_failed_write_keeps_previous_state() {
        let storage = SimulatedStateStorage::new(1);
        let mut store = ClusterStateStore::new(Box::new(storage.clone()));
        let first = sample();
        store.save(&first).unwrap();

        let mut second = first.clone();
        second.state.version = second.state.version.next();
        storage.faults().force_write_fail = true;
        assert!(store.save(&second).is_err());
        assert_eq!(store.saved_version(), first.state.version);
        assert_eq!(store.load().unwrap(), Some(first));
    }

    #[test]
    fn test_bad_magic_is_rejected() {
        let mut frame = sample().encode().unwrap().to_vec();
        frame[0] ^= 0x01;
        let body = frame.len() - CHECKSUM_SIZE;
        let crc = crc32fast::hash(&frame[..body]);
        frame[body..].copy_from_slice(&crc.to_be_bytes());
        assert!(matches!(
            PersistedState::decode(&frame),
            Err(StateStoreError::InvalidFormat(_))
        ));
    }
}
