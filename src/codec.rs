// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Encode/decode contract for the durable tiers.
//!
//! A [`CachedValue`] is serialized as tagged JSON. Blobs larger than the
//! configured threshold are zstd-compressed; decoding detects compression by
//! the zstd magic bytes, so both forms can coexist in the same table.
//!
//! # Example
//!
//! ```
//! use fund_data_layer::codec::{encode, decode, is_compressed};
//! use fund_data_layer::CachedValue;
//!
//! let value = CachedValue::Ranking(vec![]);
//! let bytes = encode(&value, 4096).unwrap();
//! assert!(!is_compressed(&bytes));
//! assert_eq!(decode(&bytes).unwrap(), value);
//! ```

use crate::payload::CachedValue;

/// Zstd magic bytes (little-endian): 0xFD2FB528
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// Default compression level (3 is a good balance of speed/ratio)
const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

/// Blobs at or below this many bytes are stored as plain JSON
pub const DEFAULT_COMPRESS_THRESHOLD: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("compression failed: {0}")]
    CompressFailed(String),

    #[error("decompression failed: {0}")]
    DecompressFailed(String),

    #[error("JSON (de)serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Check if data is zstd-compressed by checking magic bytes.
#[inline]
#[must_use]
pub fn is_compressed(data: &[u8]) -> bool {
    data.len() >= 4 && data[..4] == ZSTD_MAGIC
}

/// Serialize a value, compressing when the JSON exceeds `compress_threshold` bytes.
pub fn encode(value: &CachedValue, compress_threshold: usize) -> Result<Vec<u8>, CodecError> {
    let json = serde_json::to_vec(value)?;
    if json.len() <= compress_threshold {
        return Ok(json);
    }
    zstd::encode_all(json.as_slice(), DEFAULT_COMPRESSION_LEVEL)
        .map_err(|e| CodecError::CompressFailed(e.to_string()))
}

/// Inverse of [`encode`].
pub fn decode(data: &[u8]) -> Result<CachedValue, CodecError> {
    if is_compressed(data) {
        let json = zstd::decode_all(data)
            .map_err(|e| CodecError::DecompressFailed(e.to_string()))?;
        Ok(serde_json::from_slice(&json)?)
    } else {
        Ok(serde_json::from_slice(data)?)
    }
}
