//! Shared types for the modem crate.
//!
//! Covers port configuration, the session state machine states, the
//! operating modes of the station, coverage and SBD records, modem result
//! codes, and the structured error type.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Port Configuration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Baud rates the Iridium transceivers accept on their DTE port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BaudRate {
    #[serde(rename = "2400")]
    Baud2400,
    #[serde(rename = "4800")]
    Baud4800,
    #[serde(rename = "9600")]
    Baud9600,
    #[serde(rename = "19200")]
    Baud19200,
    #[serde(rename = "38400")]
    Baud38400,
    #[serde(rename = "57600")]
    Baud57600,
    #[serde(rename = "115200")]
    Baud115200,
    /// Custom / non-standard baud rate.
    Custom(u32),
}

impl Default for BaudRate {
    fn default() -> Self {
        Self::Baud19200
    }
}

impl BaudRate {
    /// Numeric value of the baud rate.
    pub fn value(&self) -> u32 {
        match self {
            Self::Baud2400 => 2400,
            Self::Baud4800 => 4800,
            Self::Baud9600 => 9600,
            Self::Baud19200 => 19200,
            Self::Baud38400 => 38400,
            Self::Baud57600 => 57600,
            Self::Baud115200 => 115200,
            Self::Custom(v) => *v,
        }
    }

    pub fn from_value(v: u32) -> Self {
        match v {
            2400 => Self::Baud2400,
            4800 => Self::Baud4800,
            9600 => Self::Baud9600,
            19200 => Self::Baud19200,
            38400 => Self::Baud38400,
            57600 => Self::Baud57600,
            115200 => Self::Baud115200,
            other => Self::Custom(other),
        }
    }
}

/// Flow control mode, mirrored on the modem with `AT&K`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FlowControl {
    None,
    /// Hardware flow control (RTS/CTS).
    RtsCts,
}

impl Default for FlowControl {
    fn default() -> Self {
        Self::None
    }
}

impl FlowControl {
    /// Parameter of the `AT&K` command for this mode.
    pub fn at_code(&self) -> u8 {
        match self {
            Self::None => 0,
            Self::RtsCts => 3,
        }
    }
}

/// Serial link configuration (8N1 is fixed by the transceivers).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerialConfig {
    /// Port name (e.g. `/dev/ttyS1`, `/dev/ttyUSB0`).
    pub port_name: String,

    #[serde(default)]
    pub baud_rate: BaudRate,

    #[serde(default)]
    pub flow_control: FlowControl,

    /// Read timeout in milliseconds.
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,

    /// Write timeout in milliseconds. SBD writes can stall for minutes.
    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,

    /// Assert DTR on open.
    #[serde(default = "default_true")]
    pub dtr_on_open: bool,
}

fn default_read_timeout() -> u64 {
    2_000
}
fn default_write_timeout() -> u64 {
    220_000
}
fn default_true() -> bool {
    true
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: BaudRate::default(),
            flow_control: FlowControl::default(),
            read_timeout_ms: default_read_timeout(),
            write_timeout_ms: default_write_timeout(),
            dtr_on_open: true,
        }
    }
}

impl SerialConfig {
    pub fn for_port(port_name: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            ..Default::default()
        }
    }

    /// Shorthand notation (e.g. "19200-8N1").
    pub fn shorthand(&self) -> String {
        format!("{}-8N1", self.baud_rate.value())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Session state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Modem session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ModemState {
    PoweredOff,
    PoweringOn,
    PortDiscovery,
    Connected,
    Configuring,
    Ready,
    InCall,
    Disconnecting,
}

impl Default for ModemState {
    fn default() -> Self {
        Self::PoweredOff
    }
}

impl ModemState {
    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// Every live state may fall back to `Disconnecting`, and the
    /// pre-connection states may drop straight to `PoweredOff` when the
    /// modem never answered.
    pub fn can_transition_to(&self, next: ModemState) -> bool {
        use ModemState::*;
        match (self, next) {
            (PoweredOff, PoweringOn) => true,
            (PoweringOn, PortDiscovery) | (PoweringOn, PoweredOff) => true,
            (PortDiscovery, Connected) | (PortDiscovery, PoweredOff) => true,
            (Connected, Configuring) => true,
            (Configuring, Ready) | (Ready, Configuring) => true,
            (Ready, InCall) | (InCall, Ready) => true,
            (Disconnecting, PoweredOff) => true,
            (PoweredOff, _) | (Disconnecting, _) => false,
            (_, Disconnecting) => true,
            _ => false,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::PoweredOff => "powered off",
            Self::PoweringOn => "powering on",
            Self::PortDiscovery => "port discovery",
            Self::Connected => "connected",
            Self::Configuring => "configuring",
            Self::Ready => "ready",
            Self::InCall => "in call",
            Self::Disconnecting => "disconnecting",
        }
    }
}

/// How the station moves data to the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationMode {
    /// Raw data call, frames written straight onto the circuit.
    Raw,
    /// Short Burst Data mailbox.
    Sbd,
    /// PPP with FTP on top. Not supported by this driver.
    PppFtp,
    /// Rudics circuit-switched data call.
    Rudics,
}

impl Default for OperationMode {
    fn default() -> Self {
        Self::Sbd
    }
}

impl OperationMode {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Raw),
            1 => Some(Self::Sbd),
            2 => Some(Self::PppFtp),
            3 => Some(Self::Rudics),
            _ => None,
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            Self::Raw => 0,
            Self::Sbd => 1,
            Self::PppFtp => 2,
            Self::Rudics => 3,
        }
    }

    /// Largest payload a single transmission may carry in this mode.
    pub fn max_mtu(&self) -> usize {
        match self {
            Self::Sbd => 340,
            _ => 7000,
        }
    }

    /// Registration table that applies to this mode.
    pub fn registration_mode(&self) -> RegistrationMode {
        match self {
            Self::Sbd => RegistrationMode::Sbd,
            _ => RegistrationMode::Data,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Coverage / SBD records
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Which registration code table a numeric code belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RegistrationMode {
    /// `+CREG` circuit-switched registration.
    Data,
    /// `+SBDREG` SBD registration.
    Sbd,
    /// Gateway-reported SBD session / registration error.
    SessionError,
}

impl RegistrationMode {
    /// Code that means "registered on the home network".
    pub fn home_code(&self) -> Option<i32> {
        match self {
            Self::Data => Some(1),
            Self::Sbd => Some(2),
            Self::SessionError => None,
        }
    }

    /// Code that means "registration denied".
    pub fn denied_code(&self) -> Option<i32> {
        match self {
            Self::Data | Self::Sbd => Some(3),
            Self::SessionError => None,
        }
    }
}

/// One signal/registration observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoverageSample {
    /// Signal bars, 0..=5.
    pub signal_level: u8,
    /// Registration code, when it was polled for this sample.
    pub registration_code: Option<i32>,
    pub sampled_at: DateTime<Utc>,
}

/// Decoded `+SBDI` / `+SBDIX` status line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SbdExchangeResult {
    pub mo_status: i32,
    pub momsn: i32,
    pub mt_status: i32,
    pub mtmsn: i32,
    pub mt_length: i32,
    pub mt_queued: i32,
}

impl SbdExchangeResult {
    /// Stand-in for a reply that did not carry six fields.
    ///
    /// MO status 3 is outside the success range so the mailbox loop keeps
    /// retrying instead of treating garbage as a delivered message.
    pub fn no_traffic() -> Self {
        Self {
            mo_status: 3,
            momsn: 0,
            mt_status: 0,
            mtmsn: 0,
            mt_length: 0,
            mt_queued: 0,
        }
    }

    /// MO status 0 or 1: the outgoing buffer, if any, reached the gateway.
    pub fn mo_succeeded(&self) -> bool {
        self.mo_status <= 1
    }

    /// MT status 1: a message was received into the incoming buffer.
    pub fn mt_received(&self) -> bool {
        self.mt_status == 1
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Modem result codes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Final result code of an AT exchange (verbose or numeric form).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ModemResponseCode {
    Ok,
    Connect,
    Ring,
    NoCarrier,
    Error,
    NoDialtone,
    Busy,
    NoAnswer,
    ConnectWithSpeed(u32),
    Unknown(String),
}

impl ModemResponseCode {
    /// Parse a modem response line into a code.
    pub fn parse(line: &str) -> Self {
        let trimmed = line.trim().to_uppercase();
        match trimmed.as_str() {
            "OK" | "0" => Self::Ok,
            "CONNECT" | "1" => Self::Connect,
            "RING" | "2" => Self::Ring,
            "NO CARRIER" | "3" => Self::NoCarrier,
            "ERROR" | "4" => Self::Error,
            "NO DIALTONE" | "6" => Self::NoDialtone,
            "BUSY" | "7" => Self::Busy,
            "NO ANSWER" | "8" => Self::NoAnswer,
            _ => match trimmed
                .strip_prefix("CONNECT ")
                .and_then(|s| s.trim().split(|c: char| !c.is_ascii_digit()).next())
                .map(str::parse::<u32>)
            {
                // "CONNECT 9600/RLP" carries a protocol suffix
                Some(Ok(speed)) => Self::ConnectWithSpeed(speed),
                _ => Self::Unknown(line.trim().to_string()),
            },
        }
    }

    /// Whether the line ends an exchange (`OK` or `ERROR` only).
    ///
    /// Numeric forms are not treated as terminators here: SBD status
    /// answers are bare digits too.
    pub fn is_terminator_line(line: &str) -> bool {
        matches!(line.trim().to_uppercase().as_str(), "OK" | "ERROR")
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }

    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Self::Error | Self::NoCarrier | Self::NoDialtone | Self::Busy | Self::NoAnswer
        )
    }

    pub fn is_connect(&self) -> bool {
        matches!(self, Self::Connect | Self::ConnectWithSpeed(_))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Errors
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Error kinds specific to modem operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SerialErrorKind {
    /// Nothing came back within the response wait.
    NoAnswer,
    /// A reply arrived but did not have the expected shape.
    Malformed,
    /// The modem answered `ERROR`.
    ModemError,
    /// An initial-setup command did not return `OK`.
    ConfigurationStepFailed,
    RegistrationDenied,
    NotRegistered,
    /// A freshly opened port did not answer the attention command.
    NoAtResponse,
    /// The link could not be (re)established for this cycle.
    SessionFailure,
    /// Operation not allowed in the current session state.
    InvalidState,
    PortNotFound,
    IoError,
    Timeout,
    NotConnected,
    /// Operation mode or setting this driver does not handle.
    Unsupported,
}

/// Structured modem error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerialError {
    pub kind: SerialErrorKind,
    pub message: String,
    pub port_name: Option<String>,
    /// AT command that was in flight, if any.
    pub command: Option<String>,
}

pub type SerialResult<T> = Result<T, SerialError>;

impl std::fmt::Display for SerialError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:?}] {}", self.kind, self.message)
    }
}

impl std::error::Error for SerialError {}

impl SerialError {
    pub fn new(kind: SerialErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            port_name: None,
            command: None,
        }
    }

    pub fn with_port(mut self, port: impl Into<String>) -> Self {
        self.port_name = Some(port.into());
        self
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    // ── Convenience constructors ─────────────────────────────────

    pub fn no_answer(command: &str) -> Self {
        Self::new(SerialErrorKind::NoAnswer, format!("no answer to {}", command))
            .with_command(command)
    }

    pub fn malformed(command: &str, detail: impl Into<String>) -> Self {
        Self::new(SerialErrorKind::Malformed, detail).with_command(command)
    }

    pub fn modem_error(command: &str) -> Self {
        Self::new(SerialErrorKind::ModemError, format!("modem rejected {}", command))
            .with_command(command)
    }

    pub fn invalid_state(from: ModemState, to: ModemState) -> Self {
        Self::new(
            SerialErrorKind::InvalidState,
            format!("cannot go from {} to {}", from.label(), to.label()),
        )
    }

    pub fn session_failure(msg: impl Into<String>) -> Self {
        Self::new(SerialErrorKind::SessionFailure, msg)
    }

    pub fn io_error(msg: impl Into<String>) -> Self {
        Self::new(SerialErrorKind::IoError, msg)
    }

    pub fn not_connected(msg: impl Into<String>) -> Self {
        Self::new(SerialErrorKind::NotConnected, msg)
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::new(SerialErrorKind::Unsupported, msg)
    }

    /// Whether retrying the same command later could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            SerialErrorKind::NoAnswer
                | SerialErrorKind::Malformed
                | SerialErrorKind::NoAtResponse
                | SerialErrorKind::Timeout
                | SerialErrorKind::NotRegistered
        )
    }
}

impl From<std::io::Error> for SerialError {
    fn from(e: std::io::Error) -> Self {
        Self::io_error(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_baud_rate_value_roundtrip() {
        for rate in [2400, 4800, 9600, 19200, 38400, 57600, 115200] {
            assert_eq!(BaudRate::from_value(rate).value(), rate);
        }
        assert_eq!(BaudRate::from_value(250000), BaudRate::Custom(250000));
    }

    #[test]
    fn test_default_config_matches_transceiver() {
        let cfg = SerialConfig::for_port("/dev/ttyS1");
        assert_eq!(cfg.baud_rate, BaudRate::Baud19200);
        assert_eq!(cfg.read_timeout_ms, 2_000);
        assert_eq!(cfg.write_timeout_ms, 220_000);
        assert_eq!(cfg.shorthand(), "19200-8N1");
    }

    #[test]
    fn test_flow_control_codes() {
        assert_eq!(FlowControl::None.at_code(), 0);
        assert_eq!(FlowControl::RtsCts.at_code(), 3);
    }

    #[test]
    fn test_state_transitions() {
        use ModemState::*;
        let happy = [
            PoweredOff,
            PoweringOn,
            PortDiscovery,
            Connected,
            Configuring,
            Ready,
            InCall,
            Disconnecting,
            PoweredOff,
        ];
        for pair in happy.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{:?} -> {:?}", pair[0], pair[1]);
        }
        assert!(InCall.can_transition_to(Ready));
        assert!(PortDiscovery.can_transition_to(PoweredOff));
        assert!(!PoweredOff.can_transition_to(Ready));
        assert!(!PoweredOff.can_transition_to(Disconnecting));
        assert!(Ready.can_transition_to(Configuring));
        assert!(!Ready.can_transition_to(PortDiscovery));
        assert!(!Disconnecting.can_transition_to(Ready));
    }

    #[test]
    fn test_operation_mode_codes() {
        for code in 0..=3 {
            assert_eq!(OperationMode::from_code(code).unwrap().code(), code);
        }
        assert!(OperationMode::from_code(4).is_none());
        assert_eq!(OperationMode::Sbd.max_mtu(), 340);
        assert_eq!(OperationMode::Rudics.max_mtu(), 7000);
        assert_eq!(OperationMode::Sbd.registration_mode(), RegistrationMode::Sbd);
    }

    #[test]
    fn test_no_traffic_sentinel_is_not_success() {
        let s = SbdExchangeResult::no_traffic();
        assert!(!s.mo_succeeded());
        assert!(!s.mt_received());
    }

    #[test]
    fn test_modem_response_parse() {
        assert_eq!(ModemResponseCode::parse("OK"), ModemResponseCode::Ok);
        assert_eq!(ModemResponseCode::parse("0"), ModemResponseCode::Ok);
        assert_eq!(
            ModemResponseCode::parse("CONNECT 19200"),
            ModemResponseCode::ConnectWithSpeed(19200)
        );
        assert!(ModemResponseCode::parse("CONNECT 9600/RLP").is_connect());
        assert!(ModemResponseCode::parse("connect").is_connect());
        assert!(!ModemResponseCode::parse("CONNECTED?").is_connect());
        assert!(ModemResponseCode::parse("NO CARRIER").is_error());
        assert!(ModemResponseCode::is_terminator_line(" ok "));
        assert!(!ModemResponseCode::is_terminator_line("0"));
    }

    #[test]
    fn test_serial_error_builder() {
        let err = SerialError::no_answer("AT+CSQ").with_port("/dev/ttyS1");
        assert_eq!(err.kind, SerialErrorKind::NoAnswer);
        assert_eq!(err.command.as_deref(), Some("AT+CSQ"));
        assert_eq!(err.port_name.as_deref(), Some("/dev/ttyS1"));
        assert!(err.to_string().starts_with("[NoAnswer]"));
        assert!(err.is_transient());
        assert!(!SerialError::session_failure("x").is_transient());
    }

    #[test]
    fn test_serde_config_roundtrip() {
        let cfg = SerialConfig {
            port_name: "/dev/ttyUSB0".to_string(),
            flow_control: FlowControl::RtsCts,
            ..Default::default()
        };
        let json = serde_json::to_string(&cfg).unwrap();
        assert!(json.contains("\"portName\""));
        let back: SerialConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.flow_control, FlowControl::RtsCts);
        assert_eq!(back.baud_rate, BaudRate::Baud19200);
    }
}
