//! Artifact serialization.
//!
//! Current on-disk format:
//! ```text
//! [4 bytes: magic "KLNZ"]
//! [4 bytes: CRC32 of the compressed payload (little-endian u32)]
//! [N bytes: zstd-compressed bincode encoding of the Value]
//! ```
//!
//! Legacy artifacts are a bare bincode encoding with no header; they are
//! still accepted on read.

use kiln_types::Value;

use crate::error::{StoreError, StoreResult};

const MAGIC: &[u8; 4] = b"KLNZ";
const HEADER_SIZE: usize = 8;
/// Favour speed over ratio.
const COMPRESSION_LEVEL: i32 = 1;

/// Encode a value in the current compressed format.
pub fn encode(value: &Value) -> StoreResult<Vec<u8>> {
    let raw = bincode::serialize(value).map_err(|e| StoreError::Serialization(e.to_string()))?;
    let compressed = zstd::encode_all(raw.as_slice(), COMPRESSION_LEVEL)
        .map_err(|e| StoreError::Compression(e.to_string()))?;

    let mut out = Vec::with_capacity(HEADER_SIZE + compressed.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&crc32fast::hash(&compressed).to_le_bytes());
    out.extend_from_slice(&compressed);
    Ok(out)
}

/// Encode a value in the legacy uncompressed format.
pub fn encode_legacy(value: &Value) -> StoreResult<Vec<u8>> {
    bincode::serialize(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

/// Decode either format.
pub fn decode(data: &[u8]) -> StoreResult<Value> {
    if data.len() >= HEADER_SIZE && &data[..4] == MAGIC {
        let expected = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        let payload = &data[HEADER_SIZE..];
        let actual = crc32fast::hash(payload);
        if actual != expected {
            return Err(StoreError::Serialization(format!(
                "checksum mismatch: expected {expected:08x}, computed {actual:08x}"
            )));
        }
        let raw = zstd::decode_all(payload).map_err(|e| StoreError::Compression(e.to_string()))?;
        return bincode::deserialize(&raw).map_err(|e| StoreError::Serialization(e.to_string()));
    }
    bincode::deserialize(data).map_err(|e| StoreError::Serialization(e.to_string()))
}
