//! Short Burst Data mailbox protocol.
//!
//! One exchange clears both buffers, optionally loads an outgoing text
//! message, then runs mailbox sessions until the message is delivered (or
//! there was nothing to deliver) with a hard bound on the attempts.  A
//! message waiting in the incoming buffer is read back and split into
//! `!`-separated commands.

use crate::modem::at::{reply_lines, AtCommands, Link, SplitField};
use crate::modem::commands::expect_ok;
use crate::modem::types::*;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Mailbox sessions per exchange.
pub const MAX_SESSION_ATTEMPTS: u32 = 10;
/// Pause between failed mailbox sessions.
pub const RETRY_DELAY: Duration = Duration::from_secs(10);
/// Separator between commands in an incoming message.
pub const COMMAND_SEPARATOR: char = '!';

/// Outcome of one `mailbox_exchange`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SbdExchange {
    /// Status of the last mailbox session.
    pub result: SbdExchangeResult,
    /// Commands carried by the incoming message, if one arrived.
    pub commands: Vec<String>,
    pub attempts: u32,
}

impl SbdExchange {
    pub fn delivered(&self) -> bool {
        self.result.mo_succeeded()
    }

    pub fn mo_status_text(&self, extended: bool) -> String {
        if extended {
            decode_mo_status(self.result.mo_status)
        } else {
            decode_mo_status_basic(self.result.mo_status)
        }
    }
}

/// Decode a `<MO status>,<MOMSN>,<MT status>,<MTMSN>,<MT length>,<MT queued>`
/// line.  Anything short of six integer fields becomes the no-traffic
/// sentinel.
pub fn parse_status(answer: &str) -> SbdExchangeResult {
    let answer = answer.trim();
    if answer.len() < 8 {
        log::debug!("short mailbox status '{}'", answer);
        return SbdExchangeResult::no_traffic();
    }
    let fields: Result<Vec<i32>, _> = answer
        .splitn(6, ',')
        .map(|f| f.trim().parse::<i32>())
        .collect();
    match fields {
        Ok(f) if f.len() == 6 => SbdExchangeResult {
            mo_status: f[0],
            momsn: f[1],
            mt_status: f[2],
            mtmsn: f[3],
            mt_length: f[4],
            mt_queued: f[5],
        },
        _ => {
            log::debug!("malformed mailbox status '{}'", answer);
            SbdExchangeResult::no_traffic()
        }
    }
}

/// Split an incoming text message into its commands.
pub fn split_commands(payload: &str) -> Vec<String> {
    payload
        .split(COMMAND_SEPARATOR)
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect()
}

/// Read the incoming buffer as text (`AT+SBDRT`).
///
/// The modem answers `+SBDRT:` followed by the message on its own line.
pub async fn read_incoming(link: &Link) -> SerialResult<Vec<String>> {
    let command = AtCommands::SBD_READ_TEXT;
    let raw = link.send(command, link.timing().wait_for(command)).await?;
    let lines = reply_lines(command, &raw);
    if lines
        .iter()
        .any(|l| ModemResponseCode::parse(l) == ModemResponseCode::Error)
    {
        return Err(SerialError::modem_error(command).with_port(link.port_name()));
    }
    let payload: String = lines
        .iter()
        .filter(|l| !ModemResponseCode::is_terminator_line(l))
        .map(|l| l.strip_prefix("+SBDRT:").unwrap_or(l.as_str()))
        .collect::<Vec<_>>()
        .join(&COMMAND_SEPARATOR.to_string());
    Ok(split_commands(&payload))
}

/// Clear both SBD buffers.  The ISU answers `AT+SBDD2` with a numeric
/// status (`0` cleared, `1` error) ahead of `OK`.
pub async fn clear_buffers(link: &Link) -> SerialResult<bool> {
    match link.ask(AtCommands::SBD_CLEAR_BUFFERS).await {
        Ok(answer) => Ok(answer == "0" || answer.eq_ignore_ascii_case("OK")),
        Err(e) if e.kind == SerialErrorKind::ModemError => Ok(false),
        Err(e) => Err(e),
    }
}

/// Run one mailbox check-and-send.
///
/// `location` selects the extended session (`AT+SBDIX=<lat>,<lon>`).
/// Without an outgoing message a single session is a receive-only check.
/// With one, sessions are repeated every 10 s until MO status 0 or 1, at
/// most 10 times; the last status is returned either way.
pub async fn mailbox_exchange(
    link: &Link,
    outgoing: Option<&str>,
    location: Option<&str>,
) -> SerialResult<SbdExchange> {
    if !clear_buffers(link).await? {
        log::warn!("clearing SBD buffers failed");
    }
    if let Some(message) = outgoing {
        let command = AtCommands::sbd_write_text(message);
        if !expect_ok(link, &command).await? {
            return Err(SerialError::modem_error(&command)
                .with_port(link.port_name()));
        }
        log::debug!("loaded {} byte SBD message", message.len());
    }

    let session = AtCommands::sbd_session(location);
    let mut exchange = SbdExchange {
        result: SbdExchangeResult::no_traffic(),
        commands: Vec::new(),
        attempts: 0,
    };

    while exchange.attempts < MAX_SESSION_ATTEMPTS {
        if exchange.attempts > 0 {
            tokio::time::sleep(RETRY_DELAY).await;
        }
        exchange.attempts += 1;

        let result = match link
            .query(&session, Some(SplitField::after_colon()), None)
            .await
        {
            Ok(answer) => parse_status(&answer),
            Err(e) => {
                log::debug!("mailbox session failed: {}", e);
                SbdExchangeResult::no_traffic()
            }
        };
        exchange.result = result;
        log::info!(
            "mailbox attempt {}: {} / {}",
            exchange.attempts,
            exchange.mo_status_text(location.is_some()),
            decode_mt_status(result.mt_status)
        );

        if result.mt_received() {
            match read_incoming(link).await {
                Ok(commands) => {
                    log::info!("received {} command(s)", commands.len());
                    exchange.commands.extend(commands);
                }
                Err(e) => log::warn!("reading incoming message failed: {}", e),
            }
        }

        if result.mo_succeeded() || outgoing.is_none() {
            break;
        }
    }

    if !exchange.delivered() && outgoing.is_some() {
        log::warn!(
            "message not delivered after {} attempts: {}",
            exchange.attempts,
            exchange.mo_status_text(location.is_some())
        );
    }
    Ok(exchange)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Decode tables
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// MO status of an extended session (`+SBDIX`).
pub fn decode_mo_status(code: i32) -> String {
    let text = match code {
        0 => "MO message, if any, transferred successfully.",
        1 => "MO message, if any, transferred successfully, but the MT message in the queue was too big to be transferred.",
        2 => "MO message, if any, transferred successfully, but the requested Location Update was not accepted.",
        3 | 4 => "Reserved, but indicate MO session success if used.",
        5..=8 => "Reserved, but indicate MO session failure if used.",
        10 => "GSS reported that the call did not complete in the allowed time.",
        11 => "MO message queue at the GSS is full.",
        12 => "MO message has too many segments.",
        13 => "GSS reported that the session did not complete.",
        14 => "Invalid segment size.",
        15 => "Access is denied.",
        16 => "ISU has been locked and may not make SBD calls (see +CULK command).",
        17 => "Gateway not responding (local session timeout).",
        18 => "Connection lost (RF drop).",
        19 => "Link failure (A protocol error caused termination of the call).",
        32 => "No network service, unable to initiate call.",
        33 => "Antenna fault, unable to initiate call.",
        34 => "Radio is disabled, unable to initiate call (see *Rn command).",
        35 => "ISU is busy, unable to initiate call.",
        36 => "Try later, must wait 3 minutes since last registration.",
        37 => "SBD service is temporarily disabled.",
        38 => "Try later, traffic management period (see +SBDLOE command).",
        64 => "Band violation (attempt to transmit outside permitted frequency band).",
        65 => "PLL lock failure; hardware error during attempted transmit.",
        _ => "Reserved, but indicate failure if used.",
    };
    text.to_string()
}

/// MO status of a basic session (`+SBDI`).
pub fn decode_mo_status_basic(code: i32) -> String {
    match code {
        0 => "No SBD message to send from the ISU.".to_string(),
        1 => "SBD message successfully sent from the ISU to the GSS.".to_string(),
        2 => "An error occurred while attempting to send SBD message from ISU to GSS.".to_string(),
        _ => format!("Unrecognized code {}.", code),
    }
}

/// MT status, common to both session forms.
pub fn decode_mt_status(code: i32) -> String {
    match code {
        0 => "No new SBD message to be received from Iridium Network.".to_string(),
        1 => "SBD message successfully received from Iridium Network.".to_string(),
        2 => "An error occurred while attempting to perform a mailbox check or receive a message from the Iridium Network.".to_string(),
        _ => format!("Unrecognized code {}.", code),
    }
}
