use serde::{Deserialize, Serialize};
use std::fmt;

/// Transfer layer error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferError {
    pub kind: TransferErrorKind,
    pub message: String,
    /// File the failing operation was working on, if any.
    pub file: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TransferErrorKind {
    /// Local filesystem failure.
    Io,
    /// A chunk or a reassembled file does not match its CRC-32.
    ChecksumMismatch,
    /// A frame could not be decoded.
    InvalidFrame,
    /// A fetch-list row is unusable.
    InvalidEntry,
    /// Reading or writing the fetch-list CSV failed.
    Csv,
    /// The modem channel failed underneath a transmission.
    Channel,
    /// The file needs more parts than the part-number width allows.
    TooManyParts,
    /// File or fetch-list entry not found.
    NotFound,
}

pub type TransferResult<T> = Result<T, TransferError>;

impl TransferError {
    pub fn new(kind: TransferErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            message: msg.into(),
            file: None,
        }
    }

    pub fn with_file(mut self, file: impl Into<String>) -> Self {
        self.file = Some(file.into());
        self
    }

    // ── Convenience constructors ─────────────────────────────────

    pub fn io(msg: impl Into<String>) -> Self {
        Self::new(TransferErrorKind::Io, msg)
    }

    pub fn checksum_mismatch(expected: u32, actual: u32) -> Self {
        Self::new(
            TransferErrorKind::ChecksumMismatch,
            format!("expected CRC {:08x}, got {:08x}", expected, actual),
        )
    }

    pub fn invalid_frame(msg: impl Into<String>) -> Self {
        Self::new(TransferErrorKind::InvalidFrame, msg)
    }

    pub fn invalid_entry(msg: impl Into<String>) -> Self {
        Self::new(TransferErrorKind::InvalidEntry, msg)
    }

    pub fn channel(msg: impl Into<String>) -> Self {
        Self::new(TransferErrorKind::Channel, msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(TransferErrorKind::NotFound, msg)
    }
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.file {
            Some(file) => write!(f, "[{:?}] {}: {}", self.kind, file, self.message),
            None => write!(f, "[{:?}] {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for TransferError {}

impl From<std::io::Error> for TransferError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::NotFound {
            Self::not_found(e.to_string())
        } else {
            Self::io(e.to_string())
        }
    }
}

impl From<csv::Error> for TransferError {
    fn from(e: csv::Error) -> Self {
        Self::new(TransferErrorKind::Csv, e.to_string())
    }
}

impl From<satlink_modem::modem::SerialError> for TransferError {
    fn from(e: satlink_modem::modem::SerialError) -> Self {
        Self::channel(e.to_string())
    }
}
