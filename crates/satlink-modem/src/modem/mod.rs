//! Modem crate: sub-modules.

pub mod types;
pub mod transport;
pub mod port_scanner;
pub mod power;
pub mod capture;
pub mod at;
pub mod commands;
pub mod session;
pub mod coverage;
pub mod sbd;

// Re-export top-level items for convenience.
pub use types::*;
pub use at::{AtCommands, AtTiming, Link, SplitField};
pub use session::{ModemSession, SessionOptions, SessionTiming, SetupReport, SetupStep};
pub use coverage::{
    decode_registration, registration_status, signal_quality, wait_for_coverage, CoverageResult,
};
pub use sbd::{
    decode_mo_status, decode_mo_status_basic, decode_mt_status, mailbox_exchange, SbdExchange,
};
pub use power::{DigitalOutput, PinLevel, PowerTiming, RecordingOutput, SysfsGpio};
pub use transport::{SerialTransport, SimulatedPortFactory, SimulatedTransport, TransportFactory};
pub use capture::{CaptureConfig, SharedCapture, TrafficCapture};
