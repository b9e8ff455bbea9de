use satlink_modem::modem::SerialError;
use satlink_transfer::transfer::TransferError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Station-level error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationError {
    pub kind: StationErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum StationErrorKind {
    /// Config CSV or settings JSON unusable.
    Config,
    /// Modem link failure.
    Modem,
    /// Transfer layer failure.
    Transfer,
    Io,
}

pub type StationResult<T> = Result<T, StationError>;

impl StationError {
    pub fn new(kind: StationErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            message: msg.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::new(StationErrorKind::Config, msg)
    }
}

impl fmt::Display for StationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}", self.kind, self.message)
    }
}

impl std::error::Error for StationError {}

impl From<std::io::Error> for StationError {
    fn from(e: std::io::Error) -> Self {
        Self::new(StationErrorKind::Io, e.to_string())
    }
}

impl From<csv::Error> for StationError {
    fn from(e: csv::Error) -> Self {
        Self::config(e.to_string())
    }
}

impl From<serde_json::Error> for StationError {
    fn from(e: serde_json::Error) -> Self {
        Self::config(e.to_string())
    }
}

impl From<SerialError> for StationError {
    fn from(e: SerialError) -> Self {
        Self::new(StationErrorKind::Modem, e.to_string())
    }
}

impl From<TransferError> for StationError {
    fn from(e: TransferError) -> Self {
        Self::new(StationErrorKind::Transfer, e.to_string())
    }
}
