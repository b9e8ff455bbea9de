//! Modem traffic capture.
//!
//! Appends every byte exchanged with the modem, plus session events such
//! as power transitions, to a timestamped capture file.  Text traffic is
//! written with control characters escaped; anything else is written as
//! hex.  Files rotate once they reach a configured size.

use crate::modem::transport::{escape_control, is_text};
use crate::modem::types::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Direction marker
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataDirection {
    Tx,
    Rx,
    /// Not traffic: a session event noted by the driver.
    Event,
}

impl DataDirection {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Tx => "TX",
            Self::Rx => "RX",
            Self::Event => "--",
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Capture entry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureEntry {
    pub timestamp: DateTime<Utc>,
    pub direction: DataDirection,
    pub data: Vec<u8>,
}

impl CaptureEntry {
    pub fn new(direction: DataDirection, data: impl Into<Vec<u8>>) -> Self {
        Self {
            timestamp: Utc::now(),
            direction,
            data: data.into(),
        }
    }

    pub fn event(text: &str) -> Self {
        Self::new(DataDirection::Event, text.as_bytes().to_vec())
    }
}

/// One capture line: `[2024-01-01 12:00:00.000] TX AT+CSQ\r`.
pub fn format_entry(entry: &CaptureEntry) -> String {
    let ts = entry.timestamp.format("%Y-%m-%d %H:%M:%S%.3f");
    let body = if is_text(&entry.data) {
        escape_control(&entry.data)
    } else {
        format!("hex:{}", hex::encode(&entry.data))
    };
    format!("[{}] {} {}", ts, entry.direction.label(), body)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Capture writer
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureConfig {
    pub file_path: PathBuf,
    /// Maximum file size in bytes (0 = unlimited).
    #[serde(default)]
    pub max_file_size: u64,
}

impl CaptureConfig {
    pub fn new(file_path: impl Into<PathBuf>) -> Self {
        Self {
            file_path: file_path.into(),
            max_file_size: 0,
        }
    }
}

/// Capture handle shared between the link and the session.
pub type SharedCapture = Arc<Mutex<TrafficCapture>>;

pub struct TrafficCapture {
    config: CaptureConfig,
    file: Option<std::fs::File>,
    bytes_written: u64,
    rotation_count: u32,
}

impl TrafficCapture {
    /// Open (append) the capture file.
    pub fn open(config: CaptureConfig) -> SerialResult<Self> {
        let file = Self::open_file(&config.file_path)?;
        let bytes_written = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(Self {
            config,
            file: Some(file),
            bytes_written,
            rotation_count: 0,
        })
    }

    pub fn shared(config: CaptureConfig) -> SerialResult<SharedCapture> {
        Ok(Arc::new(Mutex::new(Self::open(config)?)))
    }

    fn open_file(path: &Path) -> SerialResult<std::fs::File> {
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| SerialError::io_error(format!("Failed to open capture file: {}", e)))
    }

    pub fn record(&mut self, entry: &CaptureEntry) -> SerialResult<()> {
        if self.config.max_file_size > 0 && self.bytes_written >= self.config.max_file_size {
            self.rotate()?;
        }
        if let Some(ref mut file) = self.file {
            let line = format_entry(entry);
            writeln!(file, "{}", line)?;
            self.bytes_written += line.len() as u64 + 1;
        }
        Ok(())
    }

    pub fn record_tx(&mut self, data: &[u8]) -> SerialResult<()> {
        self.record(&CaptureEntry::new(DataDirection::Tx, data))
    }

    pub fn record_rx(&mut self, data: &[u8]) -> SerialResult<()> {
        self.record(&CaptureEntry::new(DataDirection::Rx, data))
    }

    pub fn note(&mut self, text: &str) -> SerialResult<()> {
        self.record(&CaptureEntry::event(text))
    }

    fn rotate(&mut self) -> SerialResult<()> {
        self.rotation_count += 1;
        self.file.take();
        let target = rotated_path(&self.config.file_path, self.rotation_count);
        std::fs::rename(&self.config.file_path, &target)
            .map_err(|e| SerialError::io_error(format!("Failed to rotate capture: {}", e)))?;
        self.file = Some(Self::open_file(&self.config.file_path)?);
        self.bytes_written = 0;
        Ok(())
    }

    pub fn flush(&mut self) -> SerialResult<()> {
        if let Some(ref mut file) = self.file {
            file.flush()?;
        }
        Ok(())
    }

    pub fn rotation_count(&self) -> u32 {
        self.rotation_count
    }

    pub fn path(&self) -> &Path {
        &self.config.file_path
    }
}

/// Record into an optional shared capture, logging failures instead of
/// surfacing them: losing a capture line never stops the modem exchange.
pub fn record_to(capture: Option<&SharedCapture>, entry: CaptureEntry) {
    let Some(capture) = capture else { return };
    match capture.lock() {
        Ok(mut c) => {
            if let Err(e) = c.record(&entry) {
                log::warn!("traffic capture write failed: {}", e);
            }
        }
        Err(_) => log::warn!("traffic capture lock poisoned"),
    }
}

/// `coms.log` → `coms_1.log`.
pub fn rotated_path(base: &Path, index: u32) -> PathBuf {
    let stem = base.file_stem().and_then(|s| s.to_str()).unwrap_or("capture");
    let ext = base.extension().and_then(|s| s.to_str()).unwrap_or("log");
    let parent = base.parent().unwrap_or(Path::new("."));
    parent.join(format!("{}_{}.{}", stem, index, ext))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_text_entry() {
        let entry = CaptureEntry::new(DataDirection::Tx, b"AT+CSQ\r\n".to_vec());
        let line = format_entry(&entry);
        assert!(line.ends_with("TX AT+CSQ\\r\\n"), "{}", line);
        assert!(line.starts_with('['));
    }

    #[test]
    fn test_format_binary_entry() {
        let entry = CaptureEntry::new(DataDirection::Rx, vec![0x00, 0xFF, 0x10]);
        assert!(format_entry(&entry).ends_with("RX hex:00ff10"));
    }

    #[test]
    fn test_event_label() {
        let line = format_entry(&CaptureEntry::event("power on"));
        assert!(line.ends_with("-- power on"));
    }

    #[test]
    fn test_record_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("coms.log");
        let mut cap = TrafficCapture::open(CaptureConfig::new(&path)).unwrap();
        cap.record_tx(b"AT\r\n").unwrap();
        cap.record_rx(b"OK\r\n").unwrap();
        cap.flush().unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("TX AT"));
        assert!(lines[1].contains("RX OK"));
    }

    #[test]
    fn test_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("coms.log");
        let mut config = CaptureConfig::new(&path);
        config.max_file_size = 10;
        let mut cap = TrafficCapture::open(config).unwrap();
        cap.record_tx(b"AT+SBDIX\r\n").unwrap();
        cap.record_tx(b"AT+SBDIX\r\n").unwrap();
        assert_eq!(cap.rotation_count(), 1);
        assert!(dir.path().join("coms_1.log").exists());
        assert!(path.exists());
    }

    #[test]
    fn test_record_to_none_is_noop() {
        record_to(None, CaptureEntry::event("nothing"));
    }

    #[test]
    fn test_rotated_path() {
        let p = rotated_path(Path::new("/var/log/coms.log"), 3);
        assert_eq!(p, PathBuf::from("/var/log/coms_3.log"));
    }
}
