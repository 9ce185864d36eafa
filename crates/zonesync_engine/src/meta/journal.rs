//! Journal frame format.
//!
//! Each frame is laid out as:
//!
//! ```text
//! magic "ZSMJ" (4) | version u16 LE (2) | kind u8 (1) | length u32 LE (4)
//! | CBOR payload (length) | CRC32 u32 LE over everything before it (4)
//! ```
//!
//! A `Batch` frame holds the operations of one commit. A `Snapshot` frame
//! holds a complete state and supersedes everything before it.

use crate::error::{MetaError, MetaResult};
use crate::meta::state::{MetaOp, Snapshot};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Magic bytes at the start of every frame.
pub const JOURNAL_MAGIC: [u8; 4] = *b"ZSMJ";

/// Current frame format version.
pub const JOURNAL_VERSION: u16 = 1;

/// magic (4) + version (2) + kind (1) + length (4)
const HEADER_SIZE: usize = 11;

const CRC_SIZE: usize = 4;

const KIND_BATCH: u8 = 1;
const KIND_SNAPSHOT: u8 = 2;

/// One decoded journal frame.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Frame {
    Batch(Vec<MetaOp>),
    Snapshot(Snapshot),
}

/// Result of scanning a journal.
#[derive(Debug)]
pub(crate) struct Replay {
    pub frames: Vec<Frame>,
    /// Length of the prefix made of complete, valid frames.
    pub valid_len: usize,
    /// True if bytes after `valid_len` were dropped.
    pub torn_tail: bool,
}

fn to_cbor<T: Serialize>(value: &T) -> MetaResult<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(value, &mut buf).map_err(|e| MetaError::Codec(e.to_string()))?;
    Ok(buf)
}

fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> MetaResult<T> {
    ciborium::de::from_reader(bytes).map_err(|e| MetaError::Codec(e.to_string()))
}

/// Encodes a frame with its envelope and checksum.
pub(crate) fn encode_frame(frame: &Frame) -> MetaResult<Vec<u8>> {
    let (kind, payload) = match frame {
        Frame::Batch(ops) => (KIND_BATCH, to_cbor(ops)?),
        Frame::Snapshot(snapshot) => (KIND_SNAPSHOT, to_cbor(snapshot)?),
    };
    let len = u32::try_from(payload.len())
        .map_err(|_| MetaError::Codec("journal frame payload too large".into()))?;

    let mut data = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
    data.extend_from_slice(&JOURNAL_MAGIC);
    data.extend_from_slice(&JOURNAL_VERSION.to_le_bytes());
    data.push(kind);
    data.extend_from_slice(&len.to_le_bytes());
    data.extend_from_slice(&payload);
    let crc = crc32fast::hash(&data);
    data.extend_from_slice(&crc.to_le_bytes());
    Ok(data)
}

/// Decodes every complete frame in `data`.
///
/// An incomplete frame at the end, or a last frame whose checksum does not
/// match, is treated as a torn write and dropped. Damage anywhere else is an
/// error.
pub(crate) fn decode_frames(data: &[u8]) -> MetaResult<Replay> {
    let mut frames = Vec::new();
    let mut offset = 0usize;
    let mut torn_tail = false;

    while offset < data.len() {
        let rest = &data[offset..];
        if rest.len() < HEADER_SIZE {
            torn_tail = true;
            break;
        }
        if rest[..4] != JOURNAL_MAGIC {
            return Err(MetaError::corrupted(offset as u64, "bad magic"));
        }
        let version = u16::from_le_bytes([rest[4], rest[5]]);
        if version != JOURNAL_VERSION {
            return Err(MetaError::UnsupportedVersion(version));
        }
        let kind = rest[6];
        let len = u32::from_le_bytes([rest[7], rest[8], rest[9], rest[10]]) as usize;
        let body_end = HEADER_SIZE + len;
        let total = body_end + CRC_SIZE;
        if rest.len() < total {
            torn_tail = true;
            break;
        }

        let stored = u32::from_le_bytes([
            rest[body_end],
            rest[body_end + 1],
            rest[body_end + 2],
            rest[body_end + 3],
        ]);
        if crc32fast::hash(&rest[..body_end]) != stored {
            if offset + total == data.len() {
                torn_tail = true;
                break;
            }
            return Err(MetaError::corrupted(offset as u64, "checksum mismatch"));
        }

        let payload = &rest[HEADER_SIZE..body_end];
        let frame = match kind {
            KIND_BATCH => Frame::Batch(from_cbor(payload)?),
            KIND_SNAPSHOT => Frame::Snapshot(from_cbor(payload)?),
            other => {
                return Err(MetaError::corrupted(
                    offset as u64,
                    format!("unknown frame kind {other}"),
                ))
            }
        };
        frames.push(frame);
        offset += total;
    }

    Ok(Replay {
        frames,
        valid_len: offset,
        torn_tail,
    })
}
