//! CRC-32 (ISO-HDLC, the zlib/PNG polynomial) over chunks and files.

use crate::transfer::error::TransferResult;
use crc::{Crc, CRC_32_ISO_HDLC};
use std::io::Read;
use std::path::Path;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

pub fn crc32(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

/// CRC-32 of several buffers taken end to end.
pub fn crc32_concat<'a>(parts: impl IntoIterator<Item = &'a [u8]>) -> u32 {
    let mut digest = CRC32.digest();
    for part in parts {
        digest.update(part);
    }
    digest.finalize()
}

/// CRC-32 of a file, read in blocks.
pub fn file_crc32(path: &Path) -> TransferResult<u32> {
    let mut file = std::fs::File::open(path)?;
    let mut digest = CRC32.digest();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        digest.update(&buf[..n]);
    }
    Ok(digest.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_value() {
        assert_eq!(crc32(b"123456789"), 0xcbf4_3926);
        assert_eq!(crc32(b""), 0);
    }

    #[test]
    fn test_concat_matches_whole() {
        assert_eq!(crc32_concat([&b"1234"[..], b"", b"56789"]), 0xcbf4_3926);
        assert_eq!(crc32_concat(std::iter::empty()), 0);
    }

    #[test]
    fn test_file_matches_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let data: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &data).unwrap();
        assert_eq!(file_crc32(&path).unwrap(), crc32(&data));
    }
}
