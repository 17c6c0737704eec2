//! On-disk encoding of the mutation log.
//!
//! Layout:
//!
//! ```text
//! magic "KVL\0" | version u8 | payload_len u32 LE | payload | crc32(payload) u32 LE
//! ```
//!
//! The payload is the MessagePack encoding of the full record list. The whole
//! file is rewritten on every mutation, so a file that decodes at all is a
//! complete log.

use crate::error::{Result, StoreError};
use crate::types::LogRecord;

/// Magic bytes for the log file.
const LOG_MAGIC: &[u8; 4] = b"KVL\0";

/// Current log format version.
const LOG_VERSION: u8 = 1;

/// Magic + version + payload length.
const HEADER_SIZE: usize = 4 + 1 + 4;

/// Checksum trailer size.
const TRAILER_SIZE: usize = 4;

/// Encode a record list into a complete log file image.
pub fn encode(records: &[LogRecord]) -> Result<Vec<u8>> {
    let payload = rmp_serde::to_vec(records)?;

    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len() + TRAILER_SIZE);
    out.extend_from_slice(LOG_MAGIC);
    out.push(LOG_VERSION);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&payload);
    out.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());

    Ok(out)
}

/// Decode a log file image. An empty image is an empty log.
pub fn decode(bytes: &[u8]) -> Result<Vec<LogRecord>> {
    if bytes.is_empty() {
        return Ok(Vec::new());
    }

    if bytes.len() < HEADER_SIZE + TRAILER_SIZE {
        return Err(StoreError::Corruption(format!(
            "log file truncated: {} bytes",
            bytes.len()
        )));
    }

    if &bytes[0..4] != LOG_MAGIC {
        return Err(StoreError::InvalidFormat("Invalid log magic".into()));
    }

    if bytes[4] != LOG_VERSION {
        return Err(StoreError::InvalidFormat(format!(
            "Unsupported log version: {}",
            bytes[4]
        )));
    }

    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&bytes[5..9]);
    let payload_len = u32::from_le_bytes(len_bytes) as usize;

    let expected_len = HEADER_SIZE + payload_len + TRAILER_SIZE;
    if bytes.len() != expected_len {
        return Err(StoreError::Corruption(format!(
            "log length mismatch: header says {} bytes, file has {}",
            expected_len,
            bytes.len()
        )));
    }

    let payload = &bytes[HEADER_SIZE..HEADER_SIZE + payload_len];

    let mut checksum_bytes = [0u8; 4];
    checksum_bytes.copy_from_slice(&bytes[HEADER_SIZE + payload_len..]);
    let stored_checksum = u32::from_le_bytes(checksum_bytes);
    let computed_checksum = crc32fast::hash(payload);

    if stored_checksum != computed_checksum {
        return Err(StoreError::ChecksumMismatch {
            expected: stored_checksum,
            got: computed_checksum,
        });
    }

    Ok(rmp_serde::from_slice(payload)?)
}
