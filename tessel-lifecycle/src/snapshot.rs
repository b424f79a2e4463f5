//! Shard snapshots stored in the repository.
//!
//! A snapshot holds the live documents of one shard copy and the checkpoint
//! they reflect. Layout (little-endian), followed by a CRC32 of everything
//! before it:
//!
//! ```text
//! magic: u32 | format: u16 | index: u64 | ordinal: u32 | max_seq_no: u64 | term: u64 | count: u32
//! count x (seq_no: u64 | id_len: u16 | id | src_len: u32 | src)
//! crc: u32
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tessel_core::{IndexId, SeqNo, ShardId, ShardOrdinal};
use tessel_replication::{Checkpoint, Document, ShardEngine, DOC_ID_BYTES_MAX};
use tracing::info;

use crate::error::{LifecycleError, LifecycleResult};
use crate::repository::{SnapshotKey, SnapshotRepository};

const SNAPSHOT_MAGIC: u32 = 0x5453_4E50; // "TSNP"
const SNAPSHOT_FORMAT: u16 = 1;
const HEADER_SIZE: usize = 4 + 2 + 8 + 4 + 8 + 8 + 4;
const CRC_SIZE: usize = 4;

/// Point-in-time copy of one shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardSnapshot {
    /// The shard.
    pub shard: ShardId,
    /// History position the documents reflect.
    pub checkpoint: Checkpoint,
    /// Live documents in id order.
    pub documents: Vec<Document>,
}

impl ShardSnapshot {
    /// Captures the current contents of `engine`.
    #[must_use]
    pub fn capture(engine: &ShardEngine) -> Self {
        Self {
            shard: engine.shard(),
            checkpoint: engine.checkpoint(),
            documents: engine.snapshot(),
        }
    }

    /// Repository key of this snapshot.
    #[must_use]
    pub fn key(&self) -> SnapshotKey {
        SnapshotKey::for_shard(self.shard)
    }

    /// Encodes the snapshot with a trailing checksum.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let body: usize = self
            .documents
            .iter()
            .map(|d| 8 + 2 + d.id.len() + 4 + d.source.len())
            .sum();
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + body + CRC_SIZE);
        buf.put_u32_le(SNAPSHOT_MAGIC);
        buf.put_u16_le(SNAPSHOT_FORMAT);
        buf.put_u64_le(self.shard.index.get());
        buf.put_u32_le(self.shard.ordinal.get());
        buf.put_u64_le(self.checkpoint.max_seq_no.get());
        buf.put_u64_le(self.checkpoint.term);
        // Safety: a shard holds far fewer than u32::MAX documents.
        #[allow(clippy::cast_possible_truncation)]
        buf.put_u32_le(self.documents.len() as u32);
        for doc in &self.documents {
            debug_assert!(doc.id.len() <= DOC_ID_BYTES_MAX);
            buf.put_u64_le(doc.seq_no.get());
            // Safety: ids are bounded by DOC_ID_BYTES_MAX and bodies by the document limit.
            #[allow(clippy::cast_possible_truncation)]
            {
                buf.put_u16_le(doc.id.len() as u16);
                buf.put_slice(doc.id.as_bytes());
                buf.put_u32_le(doc.source.len() as u32);
            }
            buf.put_slice(&doc.source);
        }
        let crc = crc32fast::hash(&buf);
        buf.put_u32_le(crc);
        buf.freeze()
    }

    /// Decodes and verifies a snapshot fetched under `key`.
    ///
    /// # Errors
    /// `DataCorruption` on checksum mismatch, `Malformed` if the layout is
    /// invalid.
    pub fn decode(key: &SnapshotKey, data: &[u8]) -> LifecycleResult<Self> {
        let malformed = |reason| LifecycleError::Malformed {
            key: key.to_string(),
            reason,
        };
        if data.len() < HEADER_SIZE + CRC_SIZE {
            return Err(malformed("truncated header"));
        }
        let (payload, mut trailer) = data.split_at(data.len() - CRC_SIZE);
        let expected = trailer.get_u32_le();
        let actual = crc32fast::hash(payload);
        if expected != actual {
            return Err(LifecycleError::DataCorruption {
                key: key.to_string(),
                expected,
                actual,
            });
        }

        let mut buf = payload;
        if buf.get_u32_le() != SNAPSHOT_MAGIC {
            return Err(malformed("bad magic"));
        }
        if buf.get_u16_le() != SNAPSHOT_FORMAT {
            return Err(malformed("unsupported format"));
        }
        let shard = ShardId::new(
            IndexId::new(buf.get_u64_le()),
            ShardOrdinal::new(buf.get_u32_le()),
        );
        let checkpoint = Checkpoint {
            max_seq_no: SeqNo::new(buf.get_u64_le()),
            term: buf.get_u64_le(),
        };
        let count = buf.get_u32_le() as usize;

        let mut documents = Vec::with_capacity(count.min(buf.remaining() / 14));
        for _ in 0..count {
            if buf.remaining() < 10 {
                return Err(malformed("truncated document"));
            }
            let seq_no = SeqNo::new(buf.get_u64_le());
            let id_len = buf.get_u16_le() as usize;
            if id_len > DOC_ID_BYTES_MAX || buf.remaining() < id_len + 4 {
                return Err(malformed("truncated document id"));
            }
            let id = std::str::from_utf8(&buf[..id_len])
                .map_err(|_| malformed("document id is not utf-8"))?
                .to_string();
            buf.advance(id_len);
            let src_len = buf.get_u32_le() as usize;
            if buf.remaining() < src_len {
                return Err(malformed("truncated document body"));
            }
            let source = Bytes::copy_from_slice(&buf[..src_len]);
            buf.advance(src_len);
            documents.push(Document { id, source, seq_no });
        }
        if buf.has_remaining() {
            return Err(malformed("trailing bytes"));
        }

        Ok(Self {
            shard,
            checkpoint,
            documents,
        })
    }

    /// Stores the snapshot in `repository`.
    ///
    /// # Errors
    /// Propagates repository errors.
    pub async fn upload<R: SnapshotRepository + ?Sized>(&self, repository: &R) -> LifecycleResult<()> {
        let key = self.key();
        let data = self.encode();
        let bytes = data.len();
        repository.put(&key, data).await?;
        info!(
            shard = %self.shard,
            docs = self.documents.len(),
            bytes,
            max_seq_no = self.checkpoint.max_seq_no.get(),
            "shard snapshot uploaded"
        );
        Ok(())
    }

    /// Fetches and verifies the snapshot of `shard`.
    ///
    /// # Errors
    /// `NotFound` if no snapshot exists, plus every error of [`Self::decode`].
    pub async fn download<R: SnapshotRepository + ?Sized>(
        repository: &R,
        shard: ShardId,
    ) -> LifecycleResult<Self> {
        let key = SnapshotKey::for_shard(shard);
        let data = repository.get(&key).await?;
        let snapshot = Self::decode(&key, &data)?;
        if snapshot.shard != shard {
            return Err(LifecycleError::Malformed {
                key: key.to_string(),
                reason: "snapshot belongs to another shard",
            });
        }
        Ok(snapshot)
    }
}
