//! File chunking and reassembly.
//!
//! A file is cut into MTU-sized parts written to a staging directory as
//! `{file}_{NNN}` (zero-based, `digits` wide).  Parts already staged for a
//! file are reused when together they still carry the queued CRC, so an
//! interrupted transfer resumes with the same cut.  An empty file is one
//! empty part.

use crate::transfer::checksum::{crc32, crc32_concat};
use crate::transfer::error::{TransferError, TransferErrorKind, TransferResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    /// Zero-based position in the file.
    pub sequence: u32,
    pub total: u32,
    pub payload: Vec<u8>,
    /// CRC-32 of `payload` alone.
    pub crc32: u32,
}

impl Chunk {
    pub fn new(sequence: u32, total: u32, payload: Vec<u8>) -> Self {
        let crc32 = crc32(&payload);
        Self {
            sequence,
            total,
            payload,
            crc32,
        }
    }

    pub fn verify(&self) -> bool {
        crc32(&self.payload) == self.crc32
    }
}

/// Cut `data` into `ceil(len / mtu)` chunks.
pub fn chunk_bytes(data: &[u8], mtu: usize) -> TransferResult<Vec<Chunk>> {
    if mtu == 0 {
        return Err(TransferError::invalid_entry("MTU must be positive"));
    }
    let total = data.len().div_ceil(mtu);
    let total = u32::try_from(total)
        .map_err(|_| TransferError::new(TransferErrorKind::TooManyParts, "too many chunks"))?;
    Ok(data
        .chunks(mtu)
        .enumerate()
        .map(|(i, part)| Chunk::new(i as u32, total, part.to_vec()))
        .collect())
}

/// Staged name of part `index` of `file`.
pub fn part_name(file: &str, index: u32, digits: usize) -> String {
    format!("{}_{:0width$}", file, index, width = digits)
}

/// Whether `name` is a staged part of `file`.
pub fn is_part_of(name: &str, file: &str) -> bool {
    match name.rsplit_once('_') {
        Some((prefix, suffix)) => {
            prefix == file && !suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_digit())
        }
        None => false,
    }
}

/// Staged parts of `file`, in part order.
pub fn staged_parts(staging: &Path, file: &str) -> TransferResult<Vec<PathBuf>> {
    if !staging.exists() {
        return Ok(Vec::new());
    }
    let mut parts: Vec<PathBuf> = std::fs::read_dir(staging)?
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.file_name()
                .to_str()
                .map_or(false, |name| is_part_of(name, file))
        })
        .map(|e| e.path())
        .collect();
    parts.sort();
    Ok(parts)
}

/// Split the file at `path` into staged parts of at most `mtu` bytes.
///
/// Parts already staged for this file are loaded instead of cutting the
/// file again, provided their concatenation matches `expected_crc`.  A
/// set that does not (a crash mid-split, an older version) is removed and
/// the file is cut afresh.  Each part is written to a temp name and
/// renamed into place.
pub fn split_file(
    path: &Path,
    staging: &Path,
    mtu: usize,
    digits: usize,
    expected_crc: u32,
) -> TransferResult<Vec<Chunk>> {
    let file = file_name(path)?;
    let existing = staged_parts(staging, &file)?;
    if !existing.is_empty() {
        let total = existing.len() as u32;
        let chunks = existing
            .iter()
            .enumerate()
            .map(|(i, p)| -> TransferResult<Chunk> {
                Ok(Chunk::new(i as u32, total, std::fs::read(p)?))
            })
            .collect::<TransferResult<Vec<Chunk>>>()?;
        if chunks_crc32(&chunks) == expected_crc {
            log::debug!("reusing {} staged parts of {}", chunks.len(), file);
            return Ok(chunks);
        }
        log::warn!("staged parts of {} do not match the queued file, cutting it again", file);
        remove_parts(staging, &file)?;
    }

    let data = std::fs::read(path).map_err(|e| TransferError::from(e).with_file(&file))?;
    let mut chunks = chunk_bytes(&data, mtu)?;
    if chunks.is_empty() {
        chunks.push(Chunk::new(0, 1, Vec::new()));
    }
    let limit = 10u64.saturating_pow(digits as u32);
    if chunks.len() as u64 > limit {
        return Err(TransferError::new(
            TransferErrorKind::TooManyParts,
            format!("{} parts do not fit in {} digits", chunks.len(), digits),
        )
        .with_file(&file));
    }

    std::fs::create_dir_all(staging)?;
    for chunk in &chunks {
        let name = part_name(&file, chunk.sequence, digits);
        let tmp = staging.join(format!(".{}.tmp", name));
        std::fs::write(&tmp, &chunk.payload)?;
        std::fs::rename(&tmp, staging.join(&name))?;
    }
    log::info!("split {} ({} bytes) into {} parts", file, data.len(), chunks.len());
    Ok(chunks)
}

/// CRC-32 of the chunk payloads taken in order.
pub fn chunks_crc32(chunks: &[Chunk]) -> u32 {
    crc32_concat(chunks.iter().map(|c| c.payload.as_slice()))
}

/// Delete the staged parts of `file`.  Returns how many were removed.
pub fn remove_parts(staging: &Path, file: &str) -> TransferResult<usize> {
    let parts = staged_parts(staging, file)?;
    for part in &parts {
        std::fs::remove_file(part)?;
    }
    Ok(parts.len())
}

/// Put chunks back together in sequence order and check every CRC.
pub fn reassemble(chunks: &[Chunk], expected_crc: u32) -> TransferResult<Vec<u8>> {
    let mut ordered: Vec<&Chunk> = chunks.iter().collect();
    ordered.sort_by_key(|c| c.sequence);

    if let Some(first) = ordered.first() {
        let total = first.total as usize;
        if ordered.len() != total || ordered.iter().any(|c| c.total as usize != total) {
            return Err(TransferError::invalid_frame(format!(
                "have {} of {} chunks",
                ordered.len(),
                total
            )));
        }
    }

    let mut data = Vec::with_capacity(ordered.iter().map(|c| c.payload.len()).sum());
    for (i, chunk) in ordered.iter().enumerate() {
        if chunk.sequence as usize != i {
            return Err(TransferError::invalid_frame(format!("chunk {} missing", i)));
        }
        if !chunk.verify() {
            return Err(TransferError::checksum_mismatch(chunk.crc32, crc32(&chunk.payload)));
        }
        data.extend_from_slice(&chunk.payload);
    }

    let actual = crc32(&data);
    if actual != expected_crc {
        return Err(TransferError::checksum_mismatch(expected_crc, actual));
    }
    Ok(data)
}

pub(crate) fn file_name(path: &Path) -> TransferResult<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| TransferError::invalid_entry(format!("{} has no file name", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 256) as u8).collect()
    }

    #[test]
    fn test_chunk_sizes() {
        let chunks = chunk_bytes(&sample(3000), 1000).unwrap();
        let sizes: Vec<usize> = chunks.iter().map(|c| c.payload.len()).collect();
        assert_eq!(sizes, vec![1000, 1000, 1000]);
        assert!(chunks.iter().all(|c| c.total == 3));

        let chunks = chunk_bytes(&sample(2001), 1000).unwrap();
        let sizes: Vec<usize> = chunks.iter().map(|c| c.payload.len()).collect();
        assert_eq!(sizes, vec![1000, 1000, 1]);

        assert!(chunk_bytes(&[], 1000).unwrap().is_empty());
        assert!(chunk_bytes(&sample(10), 0).is_err());
    }

    #[test]
    fn test_reassemble_exact_across_sizes() {
        let mtu = 64;
        for len in (0..=50 * mtu).step_by(37).chain([mtu, 50 * mtu]) {
            let data = sample(len);
            let chunks = chunk_bytes(&data, mtu).unwrap();
            assert_eq!(chunks.len(), len.div_ceil(mtu));
            assert_eq!(reassemble(&chunks, crc32(&data)).unwrap(), data);
        }
    }

    #[test]
    fn test_reassemble_out_of_order() {
        let data = sample(250);
        let mut chunks = chunk_bytes(&data, 100).unwrap();
        chunks.reverse();
        assert_eq!(reassemble(&chunks, crc32(&data)).unwrap(), data);
    }

    #[test]
    fn test_reassemble_detects_corruption() {
        let data = sample(250);
        let mut chunks = chunk_bytes(&data, 100).unwrap();
        chunks[1].payload[0] ^= 0xff;
        let err = reassemble(&chunks, crc32(&data)).unwrap_err();
        assert_eq!(err.kind, TransferErrorKind::ChecksumMismatch);

        let chunks = chunk_bytes(&data, 100).unwrap();
        let err = reassemble(&chunks, crc32(&data) ^ 1).unwrap_err();
        assert_eq!(err.kind, TransferErrorKind::ChecksumMismatch);
    }

    #[test]
    fn test_reassemble_missing_chunk() {
        let data = sample(250);
        let mut chunks = chunk_bytes(&data, 100).unwrap();
        chunks.remove(1);
        let err = reassemble(&chunks, crc32(&data)).unwrap_err();
        assert_eq!(err.kind, TransferErrorKind::InvalidFrame);
    }

    #[test]
    fn test_part_names() {
        assert_eq!(part_name("SI941200.16f.bz2", 7, 3), "SI941200.16f.bz2_007");
        assert!(is_part_of("log_a.txt_002", "log_a.txt"));
        assert!(!is_part_of("log_a.txt", "log"));
        assert!(!is_part_of("other.txt_000", "log.txt"));
    }

    #[test]
    fn test_split_file_writes_parts() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("data.bin");
        let staging = dir.path().join("temp");
        std::fs::write(&src, sample(2500)).unwrap();

        let chunks = split_file(&src, &staging, 1000, 3, crc32(&sample(2500))).unwrap();
        assert_eq!(chunks.len(), 3);
        let parts = staged_parts(&staging, "data.bin").unwrap();
        let names: Vec<String> = parts
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["data.bin_000", "data.bin_001", "data.bin_002"]);
        assert_eq!(std::fs::read(&parts[2]).unwrap().len(), 500);
    }

    #[test]
    fn test_split_file_reuses_staged_parts() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("data.bin");
        let staging = dir.path().join("temp");
        std::fs::write(&src, sample(2500)).unwrap();
        let crc = crc32(&sample(2500));
        split_file(&src, &staging, 1000, 3, crc).unwrap();

        // a different MTU on the second call must not re-cut the file
        let again = split_file(&src, &staging, 100, 3, crc).unwrap();
        assert_eq!(again.len(), 3);
        assert_eq!(reassemble(&again, crc32(&sample(2500))).unwrap(), sample(2500));

        assert_eq!(remove_parts(&staging, "data.bin").unwrap(), 3);
        assert!(staged_parts(&staging, "data.bin").unwrap().is_empty());
    }

    #[test]
    fn test_split_file_recuts_incomplete_staging() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("data.bin");
        let staging = dir.path().join("temp");
        std::fs::write(&src, sample(2500)).unwrap();
        let crc = crc32(&sample(2500));
        split_file(&src, &staging, 1000, 3, crc).unwrap();

        // power cut after the first two parts were written
        std::fs::remove_file(staging.join("data.bin_002")).unwrap();
        let chunks = split_file(&src, &staging, 1000, 3, crc).unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(staged_parts(&staging, "data.bin").unwrap().len(), 3);
        assert_eq!(reassemble(&chunks, crc).unwrap(), sample(2500));
    }

    #[test]
    fn test_split_file_recuts_older_version() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("data.bin");
        let staging = dir.path().join("temp");
        std::fs::write(&src, sample(2500)).unwrap();
        split_file(&src, &staging, 1000, 3, crc32(&sample(2500))).unwrap();

        std::fs::write(&src, sample(1200)).unwrap();
        let chunks = split_file(&src, &staging, 1000, 3, crc32(&sample(1200))).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(staged_parts(&staging, "data.bin").unwrap().len(), 2);
        assert_eq!(chunks_crc32(&chunks), crc32(&sample(1200)));
    }

    #[test]
    fn test_split_empty_file_is_one_empty_part() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("empty.dat");
        let staging = dir.path().join("temp");
        std::fs::write(&src, b"").unwrap();

        let chunks = split_file(&src, &staging, 1000, 3, 0).unwrap();
        assert_eq!(chunks, vec![Chunk::new(0, 1, Vec::new())]);
        assert_eq!(staged_parts(&staging, "empty.dat").unwrap().len(), 1);
        assert!(reassemble(&chunks, 0).unwrap().is_empty());
        // reused on the next call
        assert_eq!(split_file(&src, &staging, 1000, 3, 0).unwrap().len(), 1);
    }

    #[test]
    fn test_split_file_too_many_parts() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("big.bin");
        std::fs::write(&src, sample(1100)).unwrap();
        let err = split_file(&src, &dir.path().join("temp"), 100, 1, 0).unwrap_err();
        assert_eq!(err.kind, TransferErrorKind::TooManyParts);
    }

    #[test]
    fn test_split_file_missing_source() {
        let dir = tempfile::tempdir().unwrap();
        let err = split_file(&dir.path().join("nope"), dir.path(), 100, 3, 0).unwrap_err();
        assert_eq!(err.kind, TransferErrorKind::NotFound);
        assert_eq!(err.file.as_deref(), Some("nope"));
    }
}
