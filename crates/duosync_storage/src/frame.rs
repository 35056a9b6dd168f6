//! Journal frame format.
//!
//! ```text
//! | magic (4) | length (4, LE) | CBOR payload (N) | crc32 (4, LE) |
//! ```
//!
//! The CRC covers magic, length and payload. Appends are sequential, so a
//! crash can only leave an incomplete or mismatching frame at the very end;
//! such a tail is reported as torn and dropped by the caller.

use crate::error::{StoreError, StoreResult};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Magic bytes identifying a journal frame.
pub const FRAME_MAGIC: [u8; 4] = *b"DSJ1";

const HEADER_SIZE: usize = 8;
const CRC_SIZE: usize = 4;

/// Encodes one entry as a complete frame.
pub fn encode_frame<T: Serialize>(entry: &T) -> StoreResult<Vec<u8>> {
    let mut payload = Vec::new();
    ciborium::into_writer(entry, &mut payload).map_err(StoreError::codec)?;
    let len = u32::try_from(payload.len())
        .map_err(|_| StoreError::codec(format!("frame too large: {} bytes", payload.len())))?;

    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
    frame.extend_from_slice(&FRAME_MAGIC);
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&payload);
    let crc = compute_crc32(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    Ok(frame)
}

/// Result of scanning a journal.
#[derive(Debug)]
pub struct FrameScan<T> {
    /// Decoded entries in journal order.
    pub entries: Vec<T>,
    /// Length of the valid prefix.
    pub valid_len: u64,
    /// Whether bytes after `valid_len` were dropped.
    pub torn: bool,
}

/// Decodes every frame in `data`.
///
/// # Errors
///
/// Returns `StoreError::Corrupted` if a damaged frame is followed by more
/// data, and `StoreError::Codec` if a checksummed payload does not decode.
pub fn decode_frames<T: DeserializeOwned>(data: &[u8]) -> StoreResult<FrameScan<T>> {
    let mut entries = Vec::new();
    let mut pos = 0usize;

    while pos < data.len() {
        let rest = &data[pos..];
        if rest.len() < HEADER_SIZE {
            return Ok(torn(entries, pos));
        }
        if rest[..4] != FRAME_MAGIC {
            return Err(StoreError::corrupted(format!("invalid magic at offset {pos}")));
        }

        let payload_len = u32::from_le_bytes([rest[4], rest[5], rest[6], rest[7]]) as usize;
        let total_len = HEADER_SIZE + payload_len + CRC_SIZE;
        if rest.len() < total_len {
            return Ok(torn(entries, pos));
        }

        let body_end = HEADER_SIZE + payload_len;
        let stored_crc = u32::from_le_bytes([
            rest[body_end],
            rest[body_end + 1],
            rest[body_end + 2],
            rest[body_end + 3],
        ]);
        let computed_crc = compute_crc32(&rest[..body_end]);
        if stored_crc != computed_crc {
            if rest.len() == total_len {
                return Ok(torn(entries, pos));
            }
            return Err(StoreError::corrupted(format!(
                "checksum mismatch at offset {pos}: expected {stored_crc:#010x}, got {computed_crc:#010x}"
            )));
        }

        let entry: T = ciborium::from_reader(&rest[HEADER_SIZE..body_end])
            .map_err(|e| StoreError::codec(format!("frame at offset {pos}: {e}")))?;
        entries.push(entry);
        pos += total_len;
    }

    Ok(FrameScan {
        entries,
        valid_len: pos as u64,
        torn: false,
    })
}

fn torn<T>(entries: Vec<T>, valid_len: usize) -> FrameScan<T> {
    FrameScan {
        entries,
        valid_len: valid_len as u64,
        torn: true,
    }
}

/// Computes the CRC32 (IEEE) checksum of `data`.
#[must_use]
pub fn compute_crc32(data: &[u8]) -> u32 {
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}
