//! Sealed snapshot records for the recovery log.
//!
//! A record is the bincode encoding of `{file_id, state, checksum}`, LZ4
//! compressed with the original size prepended. `state` is
//! [`Document::encode_state`] output. The checksum is FNV-1a over the file id
//! and state; records that fail to decompress, decode or verify are skipped
//! during recovery.

use serde::{Deserialize, Serialize};
use tandem_core::{ClientId, DocError, Document};
use thiserror::Error;

use super::StoredSnapshot;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SnapshotError {
    #[error("snapshot encoding failed: {0}")]
    Encode(String),
    #[error("snapshot decoding failed: {0}")]
    Decode(String),
    #[error("snapshot decompression failed: {0}")]
    Compression(String),
    #[error("snapshot checksum mismatch (expected {expected:#010x}, got {actual:#010x})")]
    ChecksumMismatch { expected: u32, actual: u32 },
    #[error("snapshot belongs to file {found}, not {expected}")]
    WrongFile { expected: String, found: String },
    #[error(transparent)]
    Document(#[from] DocError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub file_id: String,
    pub state: Vec<u8>,
    pub checksum: u32,
}

impl SnapshotRecord {
    pub fn new(file_id: impl Into<String>, state: Vec<u8>) -> Self {
        let file_id = file_id.into();
        let checksum = checksum(&file_id, &state);
        Self {
            file_id,
            state,
            checksum,
        }
    }

    /// Capture `doc` as a record for `file_id`.
    pub fn capture(file_id: &str, doc: &Document) -> Result<Self, SnapshotError> {
        Ok(Self::new(file_id, doc.encode_state()?))
    }

    pub fn verify(&self) -> bool {
        self.checksum == checksum(&self.file_id, &self.state)
    }

    /// Encode and compress for storage.
    pub fn seal(&self) -> Result<Vec<u8>, SnapshotError> {
        let encoded = bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| SnapshotError::Encode(e.to_string()))?;
        Ok(lz4_flex::compress_prepend_size(&encoded))
    }

    /// Inverse of [`seal`](Self::seal); verifies the checksum.
    pub fn open(bytes: &[u8]) -> Result<Self, SnapshotError> {
        let encoded = lz4_flex::decompress_size_prepended(bytes)
            .map_err(|e| SnapshotError::Compression(e.to_string()))?;
        let (record, _): (Self, usize) =
            bincode::serde::decode_from_slice(&encoded, bincode::config::standard())
                .map_err(|e| SnapshotError::Decode(e.to_string()))?;
        let actual = checksum(&record.file_id, &record.state);
        if actual != record.checksum {
            return Err(SnapshotError::ChecksumMismatch {
                expected: record.checksum,
                actual,
            });
        }
        Ok(record)
    }

    /// Rebuild the document. `client` becomes the restored replica's id.
    pub fn restore(&self, client: ClientId) -> Result<Document, SnapshotError> {
        Ok(Document::decode_state(client, &self.state)?)
    }
}

/// Newest record in `log` that opens cleanly, belongs to `file_id` and
/// restores into a document. Returns the document and the number of records
/// skipped along the way.
pub fn recover_latest(
    file_id: &str,
    log: &[StoredSnapshot],
    client: ClientId,
) -> (Option<(u64, Document)>, usize) {
    let mut skipped = 0;
    for stored in log.iter().rev() {
        let restored = SnapshotRecord::open(&stored.data).and_then(|record| {
            if record.file_id != file_id {
                return Err(SnapshotError::WrongFile {
                    expected: file_id.to_string(),
                    found: record.file_id,
                });
            }
            record.restore(client)
        });
        match restored {
            Ok(doc) => return (Some((stored.sequence, doc)), skipped),
            Err(e) => {
                log::warn!("skipping snapshot {} of file {file_id}: {e}", stored.sequence);
                skipped += 1;
            }
        }
    }
    (None, skipped)
}

/// FNV-1a, 32 bit.
fn checksum(file_id: &str, state: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in file_id.as_bytes().iter().chain([0u8].iter()).chain(state) {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}
