//! Record encoding for persisted rows.
//!
//! Plain rows are bincode-encoded. Operation records are additionally
//! LZ4-compressed and sealed in a checksummed envelope so that a torn or
//! corrupted write is detected on read instead of replayed.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::StoreError;
use crate::model::Operation;

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::SerializationError(e.to_string()))
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
    Ok(value)
}

/// Sealed, compressed operation record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordEnvelope {
    pub sequence: u64,
    pub checksum: u32,
    /// LZ4 block with prepended size
    pub compressed: Vec<u8>,
}

impl RecordEnvelope {
    pub fn seal(sequence: u64, body: &[u8]) -> Self {
        let compressed = lz4_flex::compress_prepend_size(body);
        let checksum = checksum(sequence, &compressed);
        Self {
            sequence,
            checksum,
            compressed,
        }
    }

    pub fn verify(&self) -> bool {
        self.checksum == checksum(self.sequence, &self.compressed)
    }

    /// Verify and decompress the body.
    pub fn open(&self) -> Result<Vec<u8>, StoreError> {
        if !self.verify() {
            return Err(StoreError::ChecksumMismatch {
                sequence: self.sequence,
            });
        }
        lz4_flex::decompress_size_prepended(&self.compressed)
            .map_err(|e| StoreError::CompressionError(e.to_string()))
    }
}

/// FNV-1a style fold over the sequence and payload words.
fn checksum(sequence: u64, payload: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    hash ^= sequence as u32;
    hash = hash.wrapping_mul(0x0100_0193);
    hash ^= (sequence >> 32) as u32;
    hash = hash.wrapping_mul(0x0100_0193);
    for chunk in payload.chunks(4) {
        let mut word = [0u8; 4];
        word[..chunk.len()].copy_from_slice(chunk);
        hash ^= u32::from_le_bytes(word);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash ^= payload.len() as u32;
    hash.wrapping_mul(0x0100_0193)
}

pub fn seal_operation(op: &Operation) -> Result<Vec<u8>, StoreError> {
    let body = encode(op)?;
    encode(&RecordEnvelope::seal(op.sequence, &body))
}

pub fn open_operation(bytes: &[u8]) -> Result<Operation, StoreError> {
    let envelope: RecordEnvelope = decode(bytes)?;
    let body = envelope.open()?;
    let op: Operation = decode(&body)?;
    if op.sequence != envelope.sequence {
        return Err(StoreError::ChecksumMismatch {
            sequence: envelope.sequence,
        });
    }
    Ok(op)
}
