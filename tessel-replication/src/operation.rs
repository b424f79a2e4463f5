//! Document operations and their wire encoding.
//!
//! Layout of an encoded [`ReplicatedOp`] (little-endian):
//!
//! ```text
//! seq_no: u64 | primary_term: u64 | kind: u8 | id_len: u16 | id | [src_len: u32 | src]
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tessel_core::SeqNo;

use crate::error::{ReplicationError, ReplicationResult};

/// Maximum document id length in bytes.
pub const DOC_ID_BYTES_MAX: usize = 512;

const KIND_INDEX: u8 = 0;
const KIND_DELETE: u8 = 1;

/// A write against one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Insert or replace a document.
    Index {
        /// Document id; also the default routing key.
        doc_id: String,
        /// Opaque document body.
        source: Bytes,
    },
    /// Delete a document. Deleting a missing document is not an error.
    Delete {
        /// Document id.
        doc_id: String,
    },
}

impl Operation {
    /// The document this operation touches.
    #[must_use]
    pub fn doc_id(&self) -> &str {
        match self {
            Self::Index { doc_id, .. } | Self::Delete { doc_id } => doc_id,
        }
    }

    /// Size of the document body, zero for deletes.
    #[must_use]
    pub fn source_len(&self) -> usize {
        match self {
            Self::Index { source, .. } => source.len(),
            Self::Delete { .. } => 0,
        }
    }
}

/// An operation stamped by the primary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicatedOp {
    /// Position in the shard's history.
    pub seq_no: SeqNo,
    /// Term of the primary that assigned `seq_no`.
    pub primary_term: u64,
    /// The operation.
    pub op: Operation,
}

impl ReplicatedOp {
    /// Encodes the operation.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(32 + self.op.doc_id().len() + self.op.source_len());
        buf.put_u64_le(self.seq_no.get());
        buf.put_u64_le(self.primary_term);
        let doc_id = self.op.doc_id().as_bytes();
        debug_assert!(doc_id.len() <= DOC_ID_BYTES_MAX);
        match &self.op {
            Operation::Index { .. } => buf.put_u8(KIND_INDEX),
            Operation::Delete { .. } => buf.put_u8(KIND_DELETE),
        }
        // Safety: doc ids are bounded by DOC_ID_BYTES_MAX.
        #[allow(clippy::cast_possible_truncation)]
        buf.put_u16_le(doc_id.len() as u16);
        buf.put_slice(doc_id);
        if let Operation::Index { source, .. } = &self.op {
            // Safety: documents are bounded by the max document size, far below u32::MAX.
            #[allow(clippy::cast_possible_truncation)]
            buf.put_u32_le(source.len() as u32);
            buf.put_slice(source);
        }
        buf.freeze()
    }

    /// Decodes an operation.
    ///
    /// # Errors
    /// Returns `Codec` if the buffer is truncated or malformed.
    pub fn decode(data: &[u8]) -> ReplicationResult<Self> {
        let mut buf = data;
        if buf.remaining() < 19 {
            return Err(ReplicationError::Codec("operation header truncated"));
        }
        let seq_no = SeqNo::new(buf.get_u64_le());
        let primary_term = buf.get_u64_le();
        let kind = buf.get_u8();
        let id_len = buf.get_u16_le() as usize;
        if id_len > DOC_ID_BYTES_MAX || buf.remaining() < id_len {
            return Err(ReplicationError::Codec("document id truncated"));
        }
        let doc_id = std::str::from_utf8(&buf[..id_len])
            .map_err(|_| ReplicationError::Codec("document id is not utf-8"))?
            .to_string();
        buf.advance(id_len);

        let op = match kind {
            KIND_INDEX => {
                if buf.remaining() < 4 {
                    return Err(ReplicationError::Codec("source length truncated"));
                }
                let len = buf.get_u32_le() as usize;
                if buf.remaining() < len {
                    return Err(ReplicationError::Codec("source truncated"));
                }
                let source = Bytes::copy_from_slice(&buf[..len]);
                Operation::Index { doc_id, source }
            }
            KIND_DELETE => Operation::Delete { doc_id },
            _ => return Err(ReplicationError::Codec("unknown operation kind")),
        };
        Ok(Self {
            seq_no,
            primary_term,
            op,
        })
    }
}

/// A stored document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    /// Document id.
    pub id: String,
    /// Opaque body.
    pub source: Bytes,
    /// Sequence number of the write that produced this version.
    pub seq_no: SeqNo,
}
