//! Modem power sequencing.
//!
//! The transceiver hangs off a single digital output.  Power is always
//! cycled the same way, whatever the previous state: drive the pin low and
//! let the supply discharge for 30 s, then drive it high and give the
//! modem 5 s to boot.

use crate::modem::types::*;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PinLevel {
    Low,
    High,
}

impl PinLevel {
    fn sysfs_value(&self) -> &'static str {
        match self {
            Self::Low => "0",
            Self::High => "1",
        }
    }
}

/// A board output the driver can switch.  The driver never knows the bus.
#[async_trait::async_trait]
pub trait DigitalOutput: Send + Sync {
    async fn set_digital_output(&self, pin: &str, level: PinLevel) -> SerialResult<()>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Sysfs GPIO
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// GPIO through `/sys/class/gpio`.
///
/// Numeric pins map to `gpio<N>`; anything else (board connector names
/// such as `J7.35` exported by the board support package) is used as the
/// directory name unchanged.
#[derive(Debug, Clone)]
pub struct SysfsGpio {
    root: PathBuf,
}

impl Default for SysfsGpio {
    fn default() -> Self {
        Self::new("/sys/class/gpio")
    }
}

impl SysfsGpio {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn value_path(&self, pin: &str) -> PathBuf {
        let dir = match pin.parse::<u32>() {
            Ok(n) => format!("gpio{}", n),
            Err(_) => pin.to_string(),
        };
        self.root.join(dir).join("value")
    }
}

#[async_trait::async_trait]
impl DigitalOutput for SysfsGpio {
    async fn set_digital_output(&self, pin: &str, level: PinLevel) -> SerialResult<()> {
        let path = self.value_path(pin);
        tokio::fs::write(&path, level.sysfs_value())
            .await
            .map_err(|e| SerialError::io_error(format!("{}: {}", path.display(), e)))
    }
}

/// Output that only remembers what it was told.  Bench runs and tests.
#[derive(Debug, Default)]
pub struct RecordingOutput {
    calls: Mutex<Vec<(String, PinLevel)>>,
}

impl RecordingOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<(String, PinLevel)> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl DigitalOutput for RecordingOutput {
    async fn set_digital_output(&self, pin: &str, level: PinLevel) -> SerialResult<()> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((pin.to_string(), level));
        }
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Sequencing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowerTiming {
    /// Discharge time after switching off.
    pub off_settle: Duration,
    /// Boot time after switching on.
    pub on_settle: Duration,
}

impl Default for PowerTiming {
    fn default() -> Self {
        Self {
            off_settle: Duration::from_secs(30),
            on_settle: Duration::from_secs(5),
        }
    }
}

/// Full power cycle ending with the modem on.
pub async fn power_cycle_on(
    output: &dyn DigitalOutput,
    pin: &str,
    timing: &PowerTiming,
) -> SerialResult<()> {
    log::info!("modem power off on {} ({}s discharge)", pin, timing.off_settle.as_secs());
    output.set_digital_output(pin, PinLevel::Low).await?;
    tokio::time::sleep(timing.off_settle).await;

    log::info!("modem power on on {}", pin);
    output.set_digital_output(pin, PinLevel::High).await?;
    tokio::time::sleep(timing.on_settle).await;
    Ok(())
}

/// Switch the modem off and wait out the discharge.
pub async fn power_down(
    output: &dyn DigitalOutput,
    pin: &str,
    timing: &PowerTiming,
) -> SerialResult<()> {
    log::info!("modem power off on {}", pin);
    output.set_digital_output(pin, PinLevel::Low).await?;
    tokio::time::sleep(timing.off_settle).await;
    Ok(())
}
