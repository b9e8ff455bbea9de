//! # Satlink station
//!
//! Field-station side of the Iridium file link:
//!
//! - **config** – the hand-edited config CSV and the settings JSON
//! - **cycle** – one power-on-to-power-off transfer cycle
//! - **simulate** – a bench transceiver and gateway for runs without hardware

pub mod config;
pub mod cycle;
pub mod error;
pub mod simulate;

pub use config::{StationConfig, StationSettings};
pub use cycle::{run_cycle, CycleReport, StationHardware};
pub use error::{StationError, StationErrorKind, StationResult};
pub use simulate::BenchGateway;
