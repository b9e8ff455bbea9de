//! Coverage and registration monitor.
//!
//! Signal and registration are separate questions: a transceiver can see
//! five bars and still be unregistered (SIM locked, roaming negotiation).
//! `wait_for_coverage` asks both and only reports success when the signal
//! is usable *and* the unit is registered on its home network.

use crate::modem::at::{AtCommands, Link, SplitField};
use crate::modem::commands::expect_ok;
use crate::modem::types::*;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Signal bars above which a registration poll is worth making.
pub const USABLE_SIGNAL: u8 = 3;

const CSQ_PATTERN: &str = r"^\+CSQF?:\s*([0-5])\b";

/// Current signal strength, 0..=5 bars (`AT+CSQ`).
pub async fn signal_quality(link: &Link) -> SerialResult<u8> {
    let answer = link.ask(AtCommands::SIGNAL_QUALITY).await?;
    let pattern = Regex::new(CSQ_PATTERN)
        .map_err(|e| SerialError::new(SerialErrorKind::Malformed, e.to_string()))?;
    let caps = pattern.captures(answer.trim()).ok_or_else(|| {
        SerialError::malformed(
            AtCommands::SIGNAL_QUALITY,
            format!("unexpected signal answer '{}'", answer),
        )
    })?;
    caps[1].parse::<u8>().map_err(|e| {
        SerialError::malformed(AtCommands::SIGNAL_QUALITY, e.to_string())
    })
}

/// Poll the registration code for `mode`.
///
/// Data mode switches result reporting to solicited-only (`AT&CREG=0`)
/// and reads `+CREG:<n>,<stat>`; SBD mode reads `+SBDREG:<stat>`.
pub async fn registration_status(link: &Link, mode: RegistrationMode) -> SerialResult<i32> {
    let (command, raw) = match mode {
        RegistrationMode::Data => {
            if !expect_ok(link, &AtCommands::registration_mode(0)).await? {
                log::debug!("modem refused AT&CREG=0, reading status anyway");
            }
            let value = link
                .query(AtCommands::REGISTRATION, Some(SplitField::after_colon()), None)
                .await?;
            let stat = SplitField::new(',', 1).apply(AtCommands::REGISTRATION, &value)?;
            (AtCommands::REGISTRATION, stat)
        }
        RegistrationMode::Sbd => {
            let value = link
                .query(AtCommands::SBD_REGISTRATION, Some(SplitField::after_colon()), None)
                .await?;
            let stat = SplitField::new(',', 0).apply(AtCommands::SBD_REGISTRATION, &value)?;
            (AtCommands::SBD_REGISTRATION, stat)
        }
        RegistrationMode::SessionError => {
            return Err(SerialError::unsupported(
                "session error codes are reported by the gateway, not polled",
            ))
        }
    };
    raw.parse::<i32>()
        .map_err(|_| SerialError::malformed(command, format!("registration code '{}'", raw)))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Coverage wait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoverageResult {
    /// Usable signal and home-network registration were both seen.
    pub ok: bool,
    pub mode: RegistrationMode,
    pub last_sample: Option<CoverageSample>,
    pub samples: u32,
}

impl CoverageResult {
    /// Decoded meaning of the last registration code, if one was polled.
    pub fn registration_text(&self) -> Option<String> {
        self.last_sample
            .as_ref()
            .and_then(|s| s.registration_code)
            .map(|code| decode_registration(code, self.mode))
    }

    /// `NotRegistered` or `RegistrationDenied` unless coverage was reached.
    pub fn into_result(self) -> SerialResult<Self> {
        if self.ok {
            return Ok(self);
        }
        let code = self.last_sample.as_ref().and_then(|s| s.registration_code);
        match code {
            Some(c) if Some(c) == self.mode.denied_code() => Err(SerialError::new(
                SerialErrorKind::RegistrationDenied,
                decode_registration(c, self.mode),
            )),
            Some(c) => Err(SerialError::new(
                SerialErrorKind::NotRegistered,
                decode_registration(c, self.mode),
            )),
            None => {
                let level = self.last_sample.as_ref().map_or(0, |s| s.signal_level);
                Err(SerialError::new(
                    SerialErrorKind::NotRegistered,
                    format!("signal never above {} (last {} of 5)", USABLE_SIGNAL, level),
                ))
            }
        }
    }
}

/// Poll signal quality every `poll_interval` until the unit is usable or
/// `timeout` runs out.
///
/// Above `USABLE_SIGNAL` bars the registration status is polled once per
/// sample; a home-network code ends the wait early with `ok = true`.
pub async fn wait_for_coverage(
    link: &Link,
    timeout: Duration,
    mode: RegistrationMode,
    poll_interval: Duration,
) -> CoverageResult {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut result = CoverageResult {
        ok: false,
        mode,
        last_sample: None,
        samples: 0,
    };

    while tokio::time::Instant::now() < deadline {
        let level = match signal_quality(link).await {
            Ok(level) => level,
            Err(e) => {
                log::debug!("signal query failed: {}", e);
                0
            }
        };
        log::info!("coverage is {} out of 5", level);

        let mut sample = CoverageSample {
            signal_level: level,
            registration_code: None,
            sampled_at: chrono::Utc::now(),
        };
        result.samples += 1;

        if level > USABLE_SIGNAL {
            match registration_status(link, mode).await {
                Ok(code) => {
                    log::info!("registration: {}", decode_registration(code, mode));
                    sample.registration_code = Some(code);
                    if Some(code) == mode.home_code() {
                        result.ok = true;
                        result.last_sample = Some(sample);
                        return result;
                    }
                }
                Err(e) => log::warn!("registration query failed: {}", e),
            }
        }
        result.last_sample = Some(sample);

        let now = tokio::time::Instant::now();
        if now >= deadline {
            break;
        }
        tokio::time::sleep(poll_interval.min(deadline - now)).await;
    }

    log::warn!("no usable coverage within {}s", timeout.as_secs());
    result
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Decode tables
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Human-readable meaning of a registration or gateway session code.
pub fn decode_registration(code: i32, mode: RegistrationMode) -> String {
    let text = match mode {
        RegistrationMode::Data => data_registration(code),
        RegistrationMode::Sbd => sbd_registration(code),
        RegistrationMode::SessionError => session_error(code),
    };
    text.map(str::to_string)
        .unwrap_or_else(|| format!("Unrecognized code {}.", code))
}

fn data_registration(code: i32) -> Option<&'static str> {
    Some(match code {
        0 => "Not registered, ME is not currently searching a new operator to register to.",
        1 => "Registered, home network",
        2 => "Not registered, but ME is currently searching a new operator to register to.",
        3 => "Registration denied.",
        4 => "Unknown.",
        5 => "Registered, roaming.",
        _ => return None,
    })
}

fn sbd_registration(code: i32) -> Option<&'static str> {
    Some(match code {
        0 => "ISU Detached.",
        1 => "ISU attached but not registered, bad location.",
        2 => "Registered, home network.",
        3 => "Registration denied.",
        _ => return None,
    })
}

fn session_error(code: i32) -> Option<&'static str> {
    Some(match code {
        // gateway reported
        0 => "No error.",
        2 => "Session completed, Location Update not accepted",
        3..=14 => "Reserved, Location Update failure.",
        15 => "Access is denied",
        // transceiver reported
        16 => "ISU has been locked and may not make SBD calls (see +CULK command).",
        17 => "Gateway not responding (local session timeout).",
        18 => "Connection lost (RF drop).",
        19 => "Link failure (A protocol error caused termination of the call).",
        20..=31 | 39..=63 => "Reserved, but indicate failure if used.",
        32 => "No network service, unable to initiate call.",
        33 => "Antenna fault, unable to initiate call.",
        34 => "Radio is disabled, unable to initiate call (see *Rn command).",
        35 => "ISU is busy, unable to initiate call.",
        36 => "Try later, must wait 3 minutes since last registration.",
        37 => "SBD service is temporarily disabled.",
        38 => "Try later, traffic management period (see +SBDLOE command)",
        64 => "Band violation (attempt to transmit outside permitted frequency band).",
        65 => "PLL lock failure; hardware error during attempted transmit.",
        _ => return None,
    })
}
