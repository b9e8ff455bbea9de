//! Text frame carrying one chunk.
//!
//! ```text
//! SLK1|<file>|<seq>|<total>|<chunk crc, 8 hex>|<file crc, 8 hex>|<base64 payload>
//! ```
//!
//! Frames are plain printable ASCII so they survive both `AT+SBDWT` and a
//! line-oriented data call.

use crate::transfer::chunk::Chunk;
use crate::transfer::error::{TransferError, TransferResult};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};

pub const FRAME_MAGIC: &str = "SLK1";
const SEPARATOR: char = '|';

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkFrame {
    pub file: String,
    /// CRC-32 of the whole file, repeated in every frame.
    pub file_crc: u32,
    pub chunk: Chunk,
}

impl ChunkFrame {
    pub fn new(file: impl Into<String>, file_crc: u32, chunk: Chunk) -> Self {
        Self {
            file: file.into(),
            file_crc,
            chunk,
        }
    }

    pub fn encode(&self) -> TransferResult<String> {
        if self.file.is_empty()
            || self
                .file
                .chars()
                .any(|c| c == SEPARATOR || c.is_control())
        {
            return Err(TransferError::invalid_frame(format!(
                "file name '{}' cannot be framed",
                self.file
            )));
        }
        Ok(format!(
            "{magic}|{file}|{seq}|{total}|{chunk_crc:08x}|{file_crc:08x}|{payload}",
            magic = FRAME_MAGIC,
            file = self.file,
            seq = self.chunk.sequence,
            total = self.chunk.total,
            chunk_crc = self.chunk.crc32,
            file_crc = self.file_crc,
            payload = BASE64.encode(&self.chunk.payload),
        ))
    }

    /// Parse a frame.  CRCs are carried over as received, not checked.
    pub fn decode(text: &str) -> TransferResult<Self> {
        let fields: Vec<&str> = text.trim().splitn(7, SEPARATOR).collect();
        if fields.len() != 7 {
            return Err(TransferError::invalid_frame(format!(
                "expected 7 fields, got {}",
                fields.len()
            )));
        }
        if fields[0] != FRAME_MAGIC {
            return Err(TransferError::invalid_frame(format!(
                "unknown frame tag '{}'",
                fields[0]
            )));
        }
        let file = fields[1];
        if file.is_empty() {
            return Err(TransferError::invalid_frame("empty file name"));
        }
        let sequence = parse_field::<u32>(fields[2], "sequence", 10)?;
        let total = parse_field::<u32>(fields[3], "total", 10)?;
        if sequence >= total {
            return Err(TransferError::invalid_frame(format!(
                "sequence {} outside {} chunks",
                sequence, total
            )));
        }
        let crc32 = parse_field::<u32>(fields[4], "chunk crc", 16)?;
        let file_crc = parse_field::<u32>(fields[5], "file crc", 16)?;
        let payload = BASE64
            .decode(fields[6])
            .map_err(|e| TransferError::invalid_frame(format!("payload: {}", e)))?;

        Ok(Self {
            file: file.to_string(),
            file_crc,
            chunk: Chunk {
                sequence,
                total,
                payload,
                crc32,
            },
        })
    }
}

/// Largest payload whose frame for `file` fits in `limit` bytes when part
/// numbers are at most `digits` wide (and the part count one wider).
pub fn max_payload(limit: usize, file: &str, digits: usize) -> usize {
    let header = FRAME_MAGIC.len() + file.len() + digits + (digits + 1) + 2 * 8 + 6;
    // base64 turns every started 3 bytes into 4
    limit.saturating_sub(header) / 4 * 3
}

fn parse_field<T: TryFrom<u64>>(raw: &str, name: &str, radix: u32) -> TransferResult<T> {
    u64::from_str_radix(raw, radix)
        .ok()
        .and_then(|v| T::try_from(v).ok())
        .ok_or_else(|| TransferError::invalid_frame(format!("bad {} '{}'", name, raw)))
}
