//! Gateway-side reassembly.
//!
//! Every decoded frame gets a one-word verdict: `ok` when its chunk is
//! intact and stored, `nok` otherwise.  Once all chunks of a file are in
//! hand the file is reassembled, checked against the whole-file CRC and
//! written to the output directory.
//!
//! The station sends chunks in order, so the last chunk is only
//! acknowledged when it completes the file.  After a failed whole-file
//! check that version of the file is refused until part 0 comes again.

use crate::transfer::channel::{ACK_TOKEN, NACK_TOKEN};
use crate::transfer::chunk::{reassemble, Chunk};
use crate::transfer::error::{TransferError, TransferErrorKind, TransferResult};
use crate::transfer::frame::ChunkFrame;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acceptance {
    /// Chunk stored; more are expected.
    Stored { file: String, have: u32, total: u32 },
    /// Last chunk arrived and the file was written.
    Completed { file: String, path: PathBuf },
    /// Frame or chunk unusable.  Nothing was stored.
    Rejected { reason: String },
}

impl Acceptance {
    /// Line to send back to the station.
    pub fn reply(&self) -> &'static str {
        match self {
            Acceptance::Stored { .. } | Acceptance::Completed { .. } => ACK_TOKEN,
            Acceptance::Rejected { .. } => NACK_TOKEN,
        }
    }
}

#[derive(Debug)]
struct Partial {
    file_crc: u32,
    total: u32,
    chunks: BTreeMap<u32, Chunk>,
}

pub struct Receiver {
    output: PathBuf,
    pending: HashMap<String, Partial>,
    /// File CRC of versions whose reassembly failed.
    refused: HashMap<String, u32>,
}

impl Receiver {
    pub fn new(output: impl Into<PathBuf>) -> Self {
        Self {
            output: output.into(),
            pending: HashMap::new(),
            refused: HashMap::new(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output
    }

    /// Files with chunks held but not yet complete.
    pub fn in_progress(&self) -> Vec<(String, u32, u32)> {
        let mut list: Vec<_> = self
            .pending
            .iter()
            .map(|(name, p)| (name.clone(), p.chunks.len() as u32, p.total))
            .collect();
        list.sort();
        list
    }

    /// Handle one frame line.  Only local write failures are errors;
    /// everything wrong with the frame itself becomes `Rejected`.
    pub fn accept(&mut self, text: &str) -> TransferResult<Acceptance> {
        let frame = match ChunkFrame::decode(text) {
            Ok(frame) => frame,
            Err(e) => return Ok(reject(e)),
        };
        if frame.file.contains('/') || frame.file.contains('\\') || frame.file.starts_with('.') {
            return Ok(reject(TransferError::invalid_frame(format!(
                "refusing file name '{}'",
                frame.file
            ))));
        }
        if !frame.chunk.verify() {
            return Ok(reject(
                TransferError::checksum_mismatch(
                    frame.chunk.crc32,
                    crate::transfer::checksum::crc32(&frame.chunk.payload),
                )
                .with_file(&frame.file),
            ));
        }

        let ChunkFrame {
            file,
            file_crc,
            chunk,
        } = frame;
        match self.refused.get(&file) {
            Some(crc) if *crc == file_crc && chunk.sequence != 0 => {
                return Ok(reject(
                    TransferError::invalid_frame(format!(
                        "failed its file check, waiting for part 0 (got {})",
                        chunk.sequence
                    ))
                    .with_file(&file),
                ));
            }
            Some(_) => {
                self.refused.remove(&file);
            }
            None => {}
        }

        let partial = self.pending.entry(file.clone()).or_insert_with(|| Partial {
            file_crc,
            total: chunk.total,
            chunks: BTreeMap::new(),
        });
        if partial.file_crc != file_crc || partial.total != chunk.total {
            log::info!("{} changed on the station side, dropping {} held chunks", file, partial.chunks.len());
            *partial = Partial {
                file_crc,
                total: chunk.total,
                chunks: BTreeMap::new(),
            };
        }
        let is_last = chunk.sequence + 1 == partial.total;
        let fresh = !partial.chunks.contains_key(&chunk.sequence);
        let have = partial.chunks.len() as u32 + u32::from(fresh);
        let total = partial.total;
        if is_last && have < total {
            let missing = total - have;
            if partial.chunks.is_empty() {
                self.pending.remove(&file);
            }
            return Ok(reject(
                TransferError::invalid_frame(format!(
                    "last chunk arrived with {} earlier chunk(s) missing",
                    missing
                ))
                .with_file(&file),
            ));
        }
        partial.chunks.insert(chunk.sequence, chunk);
        if have < total {
            log::debug!("{}: {}/{} chunks", file, have, total);
            return Ok(Acceptance::Stored { file, have, total });
        }

        let Some(partial) = self.pending.remove(&file) else {
            return Err(TransferError::not_found(format!("{} vanished from the receive table", file)));
        };
        let chunks: Vec<Chunk> = partial.chunks.into_values().collect();
        match reassemble(&chunks, partial.file_crc) {
            Ok(data) => {
                let path = self.write(&file, &data)?;
                log::info!("received {} ({} bytes)", file, data.len());
                Ok(Acceptance::Completed { file, path })
            }
            Err(e) => {
                log::warn!("{}: reassembly failed, chunks discarded: {}", file, e);
                self.refused.insert(file.clone(), partial.file_crc);
                Ok(reject(e.with_file(file)))
            }
        }
    }

    fn write(&self, file: &str, data: &[u8]) -> TransferResult<PathBuf> {
        std::fs::create_dir_all(&self.output)?;
        let path = self.output.join(file);
        let tmp = self.output.join(format!(".{}.{}", file, uuid::Uuid::new_v4()));
        std::fs::write(&tmp, data).map_err(|e| TransferError::from(e).with_file(file))?;
        std::fs::rename(&tmp, &path)?;
        Ok(path)
    }
}

fn reject(err: TransferError) -> Acceptance {
    if err.kind == TransferErrorKind::ChecksumMismatch {
        log::warn!("rejecting chunk: {}", err);
    } else {
        log::debug!("rejecting frame: {}", err);
    }
    Acceptance::Rejected {
        reason: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::checksum::crc32;
    use crate::transfer::chunk::chunk_bytes;

    fn frames(name: &str, data: &[u8], mtu: usize) -> Vec<String> {
        chunk_bytes(data, mtu)
            .unwrap()
            .into_iter()
            .map(|c| ChunkFrame::new(name, crc32(data), c).encode().unwrap())
            .collect()
    }

    #[test]
    fn test_accept_out_of_order_completes() {
        let dir = tempfile::tempdir().unwrap();
        let mut rx = Receiver::new(dir.path());
        let data: Vec<u8> = (0..2500u32).map(|i| (i % 251) as u8).collect();
        let mut lines = frames("obs.dat", &data, 1000);
        lines.swap(0, 1);

        let first = rx.accept(&lines[0]).unwrap();
        assert_eq!(
            first,
            Acceptance::Stored {
                file: "obs.dat".to_string(),
                have: 1,
                total: 3
            }
        );
        assert_eq!(first.reply(), "ok");
        // duplicate chunk is acknowledged again
        assert_eq!(rx.accept(&lines[0]).unwrap().reply(), "ok");
        rx.accept(&lines[1]).unwrap();
        assert_eq!(rx.in_progress(), vec![("obs.dat".to_string(), 2, 3)]);

        match rx.accept(&lines[2]).unwrap() {
            Acceptance::Completed { path, .. } => {
                assert_eq!(std::fs::read(path).unwrap(), data);
            }
            other => panic!("expected completion, got {:?}", other),
        }
        assert!(rx.in_progress().is_empty());
    }

    #[test]
    fn test_corrupt_chunk_is_nacked() {
        let dir = tempfile::tempdir().unwrap();
        let mut rx = Receiver::new(dir.path());
        let mut frame = ChunkFrame::new("a.dat", 0, Chunk::new(0, 2, b"abc".to_vec()));
        frame.chunk.payload[0] = b'x';
        let verdict = rx.accept(&frame.encode().unwrap()).unwrap();
        assert_eq!(verdict.reply(), "nok");
        assert!(rx.in_progress().is_empty());
    }

    #[test]
    fn test_whole_file_mismatch_discards() {
        let dir = tempfile::tempdir().unwrap();
        let mut rx = Receiver::new(dir.path());
        let data = b"0123456789".to_vec();
        let lines: Vec<String> = chunk_bytes(&data, 4)
            .unwrap()
            .into_iter()
            .map(|c| ChunkFrame::new("a.dat", crc32(&data) ^ 1, c).encode().unwrap())
            .collect();
        assert_eq!(rx.accept(&lines[0]).unwrap().reply(), "ok");
        assert_eq!(rx.accept(&lines[1]).unwrap().reply(), "ok");
        assert_eq!(rx.accept(&lines[2]).unwrap().reply(), "nok");
        assert!(rx.in_progress().is_empty());
        assert!(!dir.path().join("a.dat").exists());

        // the same version stays refused until it starts over
        assert_eq!(rx.accept(&lines[2]).unwrap().reply(), "nok");
        assert_eq!(rx.accept(&lines[1]).unwrap().reply(), "nok");
        assert!(rx.in_progress().is_empty());
        assert_eq!(rx.accept(&lines[0]).unwrap().reply(), "ok");
        assert_eq!(rx.in_progress(), vec![("a.dat".to_string(), 1, 3)]);
    }

    #[test]
    fn test_last_chunk_needs_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let mut rx = Receiver::new(dir.path());
        let data: Vec<u8> = (0..2500u32).map(|i| (i % 251) as u8).collect();
        let lines = frames("obs.dat", &data, 1000);

        assert_eq!(rx.accept(&lines[2]).unwrap().reply(), "nok");
        assert!(rx.in_progress().is_empty());
        rx.accept(&lines[0]).unwrap();
        assert_eq!(rx.accept(&lines[2]).unwrap().reply(), "nok");
        assert_eq!(rx.in_progress(), vec![("obs.dat".to_string(), 1, 3)]);
        rx.accept(&lines[1]).unwrap();
        assert!(matches!(
            rx.accept(&lines[2]).unwrap(),
            Acceptance::Completed { .. }
        ));
    }

    #[test]
    fn test_empty_file_completes() {
        let dir = tempfile::tempdir().unwrap();
        let mut rx = Receiver::new(dir.path());
        match rx.accept("SLK1|empty.dat|0|1|00000000|00000000|").unwrap() {
            Acceptance::Completed { path, .. } => {
                assert!(std::fs::read(path).unwrap().is_empty());
            }
            other => panic!("expected completion, got {:?}", other),
        }
    }

    #[test]
    fn test_garbage_and_unsafe_names_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut rx = Receiver::new(dir.path());
        assert_eq!(rx.accept("OK").unwrap().reply(), "nok");
        let frame = ChunkFrame::new("../etc/passwd", 0, Chunk::new(0, 1, b"x".to_vec()));
        assert_eq!(rx.accept(&frame.encode().unwrap()).unwrap().reply(), "nok");
    }

    #[test]
    fn test_new_version_restarts_collection() {
        let dir = tempfile::tempdir().unwrap();
        let mut rx = Receiver::new(dir.path());
        let old = frames("a.dat", b"old contents!", 5);
        rx.accept(&old[0]).unwrap();
        rx.accept(&old[1]).unwrap();

        let new = frames("a.dat", b"new", 5);
        match rx.accept(&new[0]).unwrap() {
            Acceptance::Completed { path, .. } => {
                assert_eq!(std::fs::read(path).unwrap(), b"new");
            }
            other => panic!("expected completion, got {:?}", other),
        }
    }
}
