//! AT command transport.
//!
//! A `Link` owns one open serial transport and turns request phrases into
//! decoded answer tokens.  The modem is driven the way the transceivers
//! expect: write the command, give it a fixed response window, then take
//! whatever is waiting.  Replies are normalised (any of CR, LF or CR-LF
//! ends a line), the echoed command is masked, and the answer line is
//! picked out ahead of the final `OK`/`ERROR`.

use crate::modem::capture::{record_to, CaptureEntry, DataDirection, SharedCapture};
use crate::modem::transport::SerialTransport;
use crate::modem::types::*;
use bytes::BytesMut;
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Command set
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The AT commands the station uses.
pub struct AtCommands;

impl AtCommands {
    /// Attention / ping.
    pub const AT: &'static str = "AT";
    /// Restore factory settings.
    pub const FACTORY_RESET: &'static str = "AT&F0";
    /// Model identification.
    pub const MODEL: &'static str = "AT+CGMM";
    /// Bearer service for data calls: 9600 bps V.110, transparent.
    pub const BEARER_SERVICE: &'static str = "AT&CBST=71,0,1";
    /// Store the active configuration as profile 0.
    pub const SAVE_PROFILE: &'static str = "AT&W0";
    /// Make profile 0 the power-up default.
    pub const DEFAULT_PROFILE: &'static str = "AT&Y0";
    /// Circuit-switched registration status.
    pub const REGISTRATION: &'static str = "AT+CREG?";
    /// Signal quality, 0..=5 bars.
    pub const SIGNAL_QUALITY: &'static str = "AT+CSQ";
    /// SIM card ICCID.
    pub const ICCID: &'static str = "AT+CICCID";
    /// Clear both SBD message buffers.
    pub const SBD_CLEAR_BUFFERS: &'static str = "AT+SBDD2";
    /// Read the incoming SBD buffer as text.
    pub const SBD_READ_TEXT: &'static str = "AT+SBDRT";
    /// SBD network registration status.
    pub const SBD_REGISTRATION: &'static str = "AT+SBDREG?";
    /// Hang up.
    pub const HANGUP: &'static str = "ATH0";
    /// Escape sequence (return to command mode).
    pub const ESCAPE: &'static str = "+++";

    /// DTR handling: `AT&D1` when DTR is honoured, `AT&D0` when ignored.
    pub fn dtr(enabled: bool) -> String {
        format!("AT&D{}", u8::from(enabled))
    }

    pub fn flow_control(mode: FlowControl) -> String {
        format!("AT&K{}", mode.at_code())
    }

    /// Rings before auto-answer (0 disables).
    pub fn rings_before_answer(rings: u8) -> String {
        format!("ATS0={}", rings)
    }

    /// Registration result reporting mode.
    pub fn registration_mode(mode: u8) -> String {
        format!("AT&CREG={}", mode)
    }

    pub fn sim_pin(pin: &str) -> String {
        format!("AT+CPIN=\"{}\"", pin)
    }

    /// Enable or disable the SIM PIN lock.
    pub fn sim_lock(enable: bool, pin: &str) -> String {
        format!("AT+CLCK=\"SC\",{},\"{}\"", u8::from(enable), pin)
    }

    /// Load a text message into the outgoing SBD buffer.
    pub fn sbd_write_text(message: &str) -> String {
        format!("AT+SBDWT={}", message)
    }

    /// Mailbox check-and-send: plain form without location, extended
    /// form when a location is supplied.
    pub fn sbd_session(location: Option<&str>) -> String {
        match location {
            Some(loc) => format!("AT+SBDIX={}", loc),
            None => "AT+SBDI".to_string(),
        }
    }

    /// Tone dial a number.
    pub fn dial(number: &str) -> String {
        format!("ATDT{}", number)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Timing and field selection
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Response windows for AT exchanges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtTiming {
    /// Window for a bare `AT`.
    pub short_wait: Duration,
    /// Window for every other command.
    pub long_wait: Duration,
    /// Poll cadence while waiting for a line on a data call.
    pub poll_interval: Duration,
}

impl Default for AtTiming {
    fn default() -> Self {
        Self {
            short_wait: Duration::from_secs(1),
            long_wait: Duration::from_secs(9),
            poll_interval: Duration::from_millis(200),
        }
    }
}

impl AtTiming {
    pub fn wait_for(&self, phrase: &str) -> Duration {
        if phrase.trim().eq_ignore_ascii_case(AtCommands::AT) {
            self.short_wait
        } else {
            self.long_wait
        }
    }
}

/// Select the `index`-th field of the answer split on `delimiter`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitField {
    pub delimiter: char,
    pub index: usize,
}

impl SplitField {
    pub const fn new(delimiter: char, index: usize) -> Self {
        Self { delimiter, index }
    }

    /// Value part of a `+NAME:value` answer.
    pub const fn after_colon() -> Self {
        Self::new(':', 1)
    }

    pub fn apply(&self, command: &str, answer: &str) -> SerialResult<String> {
        answer
            .split(self.delimiter)
            .nth(self.index)
            .map(|f| f.trim().to_string())
            .ok_or_else(|| {
                SerialError::malformed(
                    command,
                    format!(
                        "answer '{}' has no field {} after splitting on '{}'",
                        answer, self.index, self.delimiter
                    ),
                )
            })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Reply parsing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Split raw modem output into trimmed, non-empty lines with the echo of
/// `command` removed.
pub fn reply_lines(command: &str, raw: &str) -> Vec<String> {
    let echo = command.trim();
    raw.split(|c| c == '\r' || c == '\n')
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .filter(|l| echo.is_empty() || !l.eq_ignore_ascii_case(echo))
        .map(str::to_string)
        .collect()
}

/// Pick the answer token out of a raw reply.
///
/// The first line that is not a terminator is the answer; a reply made of
/// the terminator alone answers with it (`"OK"`).  An `ERROR` terminator
/// is a typed `ModemError`.
pub fn parse_reply(command: &str, raw: &str) -> SerialResult<String> {
    let lines = reply_lines(command, raw);
    let terminator = lines
        .iter()
        .find(|l| ModemResponseCode::is_terminator_line(l))
        .map(|l| ModemResponseCode::parse(l));
    if matches!(terminator, Some(ModemResponseCode::Error)) {
        return Err(SerialError::modem_error(command));
    }
    let answer = lines
        .iter()
        .find(|l| !ModemResponseCode::is_terminator_line(l));
    match (answer, terminator) {
        (Some(a), _) => Ok(a.clone()),
        (None, Some(_)) => Ok("OK".to_string()),
        (None, None) => Err(SerialError::malformed(
            command,
            format!("reply to {} carried no lines", command),
        )),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Link
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// An open, exclusively owned serial channel to the modem.
pub struct Link {
    transport: Arc<dyn SerialTransport>,
    config: SerialConfig,
    timing: AtTiming,
    capture: Option<SharedCapture>,
    /// Bytes read on a data call past the last returned line.
    pending: Mutex<BytesMut>,
}

impl Link {
    /// Open `transport` with `config` and wrap it.
    pub async fn open(
        transport: Arc<dyn SerialTransport>,
        config: SerialConfig,
        timing: AtTiming,
    ) -> SerialResult<Self> {
        transport
            .open(&config)
            .await
            .map_err(|e| e.with_port(transport.port_name()))?;
        log::debug!("opened {} at {}", transport.port_name(), config.shorthand());
        Ok(Self {
            transport,
            config,
            timing,
            capture: None,
            pending: Mutex::new(BytesMut::new()),
        })
    }

    pub fn with_capture(mut self, capture: Option<SharedCapture>) -> Self {
        self.capture = capture;
        self
    }

    pub fn port_name(&self) -> &str {
        self.transport.port_name()
    }

    pub fn config(&self) -> &SerialConfig {
        &self.config
    }

    pub fn timing(&self) -> &AtTiming {
        &self.timing
    }

    pub fn capture(&self) -> Option<&SharedCapture> {
        self.capture.as_ref()
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    pub async fn set_dtr(&self, state: bool) -> SerialResult<()> {
        self.transport.set_dtr(state).await
    }

    /// Read everything currently waiting, without blocking for more.
    pub async fn drain_input(&self) -> SerialResult<Vec<u8>> {
        let mut out = BytesMut::new();
        let mut buf = [0u8; 512];
        loop {
            let waiting = self.transport.bytes_available().await?;
            if waiting == 0 {
                break;
            }
            let want = waiting.min(buf.len());
            let n = self.transport.read(&mut buf[..want]).await?;
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        if !out.is_empty() {
            record_to(self.capture.as_ref(), CaptureEntry::new(DataDirection::Rx, out.to_vec()));
        }
        Ok(out.to_vec())
    }

    /// Write raw bytes (data-call payloads, escape sequence).
    pub async fn write_raw(&self, data: &[u8]) -> SerialResult<()> {
        record_to(self.capture.as_ref(), CaptureEntry::new(DataDirection::Tx, data.to_vec()));
        self.transport.write(data).await?;
        self.transport.flush().await
    }

    /// Write `phrase` + CR-LF, wait `wait`, return what arrived.
    pub async fn send(&self, phrase: &str, wait: Duration) -> SerialResult<String> {
        if let Ok(mut pending) = self.pending.lock() {
            pending.clear();
        }
        let stale = self.drain_input().await?;
        if !stale.is_empty() {
            log::debug!(
                "discarded {} stale bytes before {} on {}",
                stale.len(),
                phrase,
                self.port_name()
            );
        }

        let mut frame = Vec::with_capacity(phrase.len() + 2);
        frame.extend_from_slice(phrase.as_bytes());
        frame.extend_from_slice(b"\r\n");
        self.write_raw(&frame).await?;

        tokio::time::sleep(wait).await;

        let raw = self.drain_input().await?;
        if raw.is_empty() {
            log::debug!("{}: no answer to {}", self.port_name(), phrase);
            return Err(SerialError::no_answer(phrase).with_port(self.port_name()));
        }
        Ok(String::from_utf8_lossy(&raw).to_string())
    }

    /// Issue `phrase` and return its decoded answer token.
    ///
    /// `wait` defaults to the short window for a bare `AT` and the long
    /// window for everything else.
    pub async fn query(
        &self,
        phrase: &str,
        split: Option<SplitField>,
        wait: Option<Duration>,
    ) -> SerialResult<String> {
        let wait = wait.unwrap_or_else(|| self.timing.wait_for(phrase));
        let raw = self.send(phrase, wait).await?;
        let answer = parse_reply(phrase, &raw).map_err(|e| e.with_port(self.port_name()))?;
        let token = match split {
            Some(field) => field.apply(phrase, &answer)?,
            None => answer,
        };
        log::trace!("{} -> {}", phrase, token);
        Ok(token)
    }

    /// `query` with the default window and no field split.
    pub async fn ask(&self, phrase: &str) -> SerialResult<String> {
        self.query(phrase, None, None).await
    }

    /// Whether `phrase` is answered with a plain `OK`.
    pub async fn command_ok(&self, phrase: &str) -> bool {
        matches!(self.ask(phrase).await, Ok(ref t) if t.eq_ignore_ascii_case("OK"))
    }

    /// Poll for the first complete, non-empty line until `timeout` runs
    /// out.  Used on an established data call where there is no AT framing.
    pub async fn wait_for_line(&self, timeout: Duration) -> SerialResult<Option<String>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let fresh = self.drain_input().await?;
            if let Some(line) = self.next_line(&fresh) {
                return Ok(Some(line));
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.timing.poll_interval.min(deadline - now)).await;
        }
    }

    /// Append `fresh` to the carry-over buffer and cut the first
    /// non-empty line from it.
    fn next_line(&self, fresh: &[u8]) -> Option<String> {
        let mut pending = self.pending.lock().ok()?;
        pending.extend_from_slice(fresh);
        while let Some(pos) = pending.iter().position(|&b| b == b'\n' || b == b'\r') {
            let raw = pending.split_to(pos + 1);
            let line = String::from_utf8_lossy(&raw[..pos]).trim().to_string();
            if !line.is_empty() {
                return Some(line);
            }
        }
        None
    }

    /// Close the port.  The link is consumed either way.
    pub async fn close(self) -> SerialResult<()> {
        let name = self.port_name().to_string();
        self.transport
            .close()
            .await
            .map_err(|e| e.with_port(name.clone()))?;
        log::debug!("closed {}", name);
        Ok(())
    }
}
