//! Modem session state machine.
//!
//! One `ModemSession` carries a modem from power-up to power-down:
//!
//! ```text
//! PoweredOff → PoweringOn → PortDiscovery → Connected → Configuring
//!            → Ready ⇄ InCall → Disconnecting → PoweredOff
//! ```
//!
//! The session owns the configuration it pushes to the modem and is the
//! only thing that mutates its state.  The open `Link` is handed to the
//! caller by `connect` and handed back by `disconnect`.

use crate::modem::at::{reply_lines, AtCommands, AtTiming, Link};
use crate::modem::capture::{record_to, CaptureEntry, SharedCapture};
use crate::modem::commands::{expect_ok, is_data_capable, read_model};
use crate::modem::power::{power_cycle_on, power_down, DigitalOutput, PowerTiming};
use crate::modem::transport::TransportFactory;
use crate::modem::types::*;
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Options
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTiming {
    /// Wait between opening a port and the first `AT`.
    pub connect_settle: Duration,
    /// Wait after each initial-setup command (NVRAM writes are slow).
    pub step_settle: Duration,
    /// Response window for `ATDT`.
    pub dial_wait: Duration,
    /// Silence before and after the `+++` escape.
    pub escape_guard: Duration,
}

impl Default for SessionTiming {
    fn default() -> Self {
        Self {
            connect_settle: Duration::from_secs(1),
            step_settle: Duration::from_millis(500),
            dial_wait: Duration::from_secs(60),
            escape_guard: Duration::from_secs(1),
        }
    }
}

/// Everything the session pushes to the modem or needs to reach it.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Digital output that powers the transceiver.
    pub power_pin: String,
    /// Port settings; `port_name` is filled in per candidate.
    pub serial: SerialConfig,
    pub flow_control: FlowControl,
    pub dtr_enabled: bool,
    pub rings_before_answer: u8,
    pub at_timing: AtTiming,
    pub power_timing: PowerTiming,
    pub timing: SessionTiming,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            power_pin: "J7.35".to_string(),
            serial: SerialConfig::default(),
            flow_control: FlowControl::None,
            dtr_enabled: false,
            rings_before_answer: 1,
            at_timing: AtTiming::default(),
            power_timing: PowerTiming::default(),
            timing: SessionTiming::default(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Initial setup report
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Steps of the initial setup, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SetupStep {
    FactoryReset,
    SetDtr,
    SetFlowControl,
    QueryModel,
    SetBearerService,
    SetRings,
    SaveProfile,
}

impl SetupStep {
    pub fn label(&self) -> &'static str {
        match self {
            Self::FactoryReset => "restore factory defaults",
            Self::SetDtr => "set DTR",
            Self::SetFlowControl => "set flow control",
            Self::QueryModel => "query model",
            Self::SetBearerService => "set bearer service",
            Self::SetRings => "set rings before answer",
            Self::SaveProfile => "save profile",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupReport {
    pub model: Option<String>,
    pub attempted: Vec<SetupStep>,
    pub failed: Vec<SetupStep>,
}

impl SetupReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn succeeded(&self) -> Vec<SetupStep> {
        self.attempted
            .iter()
            .filter(|s| !self.failed.contains(s))
            .copied()
            .collect()
    }

    /// `ConfigurationStepFailed` naming every failed step, if any.
    pub fn into_result(self) -> SerialResult<Self> {
        if self.failed.is_empty() {
            return Ok(self);
        }
        let names: Vec<&str> = self.failed.iter().map(|s| s.label()).collect();
        Err(SerialError::new(
            SerialErrorKind::ConfigurationStepFailed,
            format!("setup steps failed: {}", names.join(", ")),
        ))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Session
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ModemSession {
    id: String,
    state: ModemState,
    port_name: Option<String>,
    flow_control: FlowControl,
    dtr_enabled: bool,
    rings_before_answer: u8,
    saved_profile: bool,
    model: Option<String>,
    options: SessionOptions,
    capture: Option<SharedCapture>,
}

impl ModemSession {
    pub fn new(options: SessionOptions) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            state: ModemState::PoweredOff,
            port_name: None,
            flow_control: options.flow_control,
            dtr_enabled: options.dtr_enabled,
            rings_before_answer: options.rings_before_answer,
            saved_profile: false,
            model: None,
            options,
            capture: None,
        }
    }

    pub fn with_capture(mut self, capture: Option<SharedCapture>) -> Self {
        self.capture = capture;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> ModemState {
        self.state
    }

    pub fn port_name(&self) -> Option<&str> {
        self.port_name.as_deref()
    }

    pub fn flow_control(&self) -> FlowControl {
        self.flow_control
    }

    pub fn dtr_enabled(&self) -> bool {
        self.dtr_enabled
    }

    pub fn rings_before_answer(&self) -> u8 {
        self.rings_before_answer
    }

    pub fn saved_profile(&self) -> bool {
        self.saved_profile
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    fn transition(&mut self, next: ModemState) -> SerialResult<()> {
        if self.state == next {
            return Ok(());
        }
        if !self.state.can_transition_to(next) {
            return Err(SerialError::invalid_state(self.state, next));
        }
        log::debug!("session {}: {} -> {}", self.id, self.state.label(), next.label());
        self.note(&format!("state {} -> {}", self.state.label(), next.label()));
        self.state = next;
        Ok(())
    }

    fn note(&self, text: &str) {
        record_to(self.capture.as_ref(), CaptureEntry::event(text));
    }

    fn port_config(&self, port: &str) -> SerialConfig {
        SerialConfig {
            port_name: port.to_string(),
            flow_control: self.flow_control,
            ..self.options.serial.clone()
        }
    }

    // ── Power ────────────────────────────────────────────────────

    /// Clean power cycle ending with the modem on.
    pub async fn power_on(&mut self, output: &dyn DigitalOutput) -> SerialResult<()> {
        self.transition(ModemState::PoweringOn)?;
        let pin = self.options.power_pin.clone();
        if let Err(e) = power_cycle_on(output, &pin, &self.options.power_timing).await {
            log::error!("power on failed: {}", e);
            self.state = ModemState::PoweredOff;
            return Err(e);
        }
        Ok(())
    }

    /// Switch the modem off.  Allowed from any state.
    pub async fn power_off(&mut self, output: &dyn DigitalOutput) -> SerialResult<()> {
        let pin = self.options.power_pin.clone();
        let result = power_down(output, &pin, &self.options.power_timing).await;
        if self.state != ModemState::PoweredOff {
            self.note("powered off");
        }
        self.state = ModemState::PoweredOff;
        self.port_name = None;
        result
    }

    // ── Link bring-up ────────────────────────────────────────────

    /// Walk `candidates` left to right and return the first port that
    /// answers a bare `AT` with `OK`.  Every probed port is closed again.
    pub async fn discover_port(
        &mut self,
        factory: &dyn TransportFactory,
        candidates: &[String],
    ) -> SerialResult<Option<String>> {
        self.transition(ModemState::PortDiscovery)?;
        for name in candidates {
            let transport = factory.create(name);
            let link = match Link::open(transport, self.port_config(name), self.options.at_timing).await {
                Ok(link) => link,
                Err(e) => {
                    log::debug!("skipping {}: {}", name, e);
                    continue;
                }
            };
            let answered = link.command_ok(AtCommands::AT).await;
            if let Err(e) = link.close().await {
                log::warn!("closing probed port {} failed: {}", name, e);
            }
            if answered {
                log::info!("modem answers on {}", name);
                return Ok(Some(name.clone()));
            }
        }
        log::warn!("no port in {:?} answered AT", candidates);
        Ok(None)
    }

    /// Open `port`, let it settle, and confirm the modem answers.
    pub async fn connect(
        &mut self,
        factory: &dyn TransportFactory,
        port: &str,
    ) -> SerialResult<Link> {
        if self.state != ModemState::PortDiscovery {
            return Err(SerialError::invalid_state(self.state, ModemState::Connected));
        }
        let link = Link::open(factory.create(port), self.port_config(port), self.options.at_timing)
            .await?
            .with_capture(self.capture.clone());
        tokio::time::sleep(self.options.timing.connect_settle).await;

        if !link.command_ok(AtCommands::AT).await {
            if let Err(e) = link.close().await {
                log::warn!("closing {} after failed connect: {}", port, e);
            }
            return Err(SerialError::new(
                SerialErrorKind::NoAtResponse,
                format!("{} did not answer AT", port),
            )
            .with_port(port));
        }
        self.port_name = Some(port.to_string());
        self.transition(ModemState::Connected)?;
        Ok(link)
    }

    /// Push the station configuration to the modem.
    ///
    /// Every step runs even when an earlier one failed; the report says
    /// which ones did.  Re-running on a configured modem is harmless.
    pub async fn initial_setup(&mut self, link: &Link) -> SerialResult<SetupReport> {
        self.transition(ModemState::Configuring)?;
        let mut report = SetupReport::default();

        let ok = self.setup_command(link, AtCommands::FACTORY_RESET).await;
        self.record_step(&mut report, SetupStep::FactoryReset, ok);

        let ok = self.setup_command(link, &AtCommands::dtr(self.dtr_enabled)).await;
        self.record_step(&mut report, SetupStep::SetDtr, ok);

        let ok = self
            .setup_command(link, &AtCommands::flow_control(self.flow_control))
            .await;
        self.record_step(&mut report, SetupStep::SetFlowControl, ok);

        let model = match read_model(link).await {
            Ok(m) if !m.eq_ignore_ascii_case("OK") => Some(m),
            Ok(_) => None,
            Err(e) => {
                log::warn!("model query failed: {}", e);
                None
            }
        };
        tokio::time::sleep(self.options.timing.step_settle).await;
        self.record_step(&mut report, SetupStep::QueryModel, model.is_some());

        if model.as_deref().map_or(false, is_data_capable) {
            let ok = self.setup_command(link, AtCommands::BEARER_SERVICE).await;
            self.record_step(&mut report, SetupStep::SetBearerService, ok);

            let ok = self
                .setup_command(link, &AtCommands::rings_before_answer(self.rings_before_answer))
                .await;
            self.record_step(&mut report, SetupStep::SetRings, ok);
        }

        let saved = self.setup_command(link, AtCommands::SAVE_PROFILE).await;
        let defaulted = self.setup_command(link, AtCommands::DEFAULT_PROFILE).await;
        self.record_step(&mut report, SetupStep::SaveProfile, saved && defaulted);
        self.saved_profile = saved && defaulted;

        self.model = model.clone();
        report.model = model;
        self.transition(ModemState::Ready)?;
        if report.is_complete() {
            log::info!("modem configured ({})", report.model.as_deref().unwrap_or("unknown model"));
        } else {
            log::warn!("modem setup incomplete, failed: {:?}", report.failed);
        }
        Ok(report)
    }

    async fn setup_command(&self, link: &Link, phrase: &str) -> bool {
        let ok = match expect_ok(link, phrase).await {
            Ok(ok) => ok,
            Err(e) => {
                log::warn!("{} failed: {}", phrase, e);
                false
            }
        };
        tokio::time::sleep(self.options.timing.step_settle).await;
        ok
    }

    fn record_step(&self, report: &mut SetupReport, step: SetupStep, ok: bool) {
        report.attempted.push(step);
        if !ok {
            log::debug!("setup step '{}' failed", step.label());
            report.failed.push(step);
        }
    }

    /// Power on, find the modem, connect and configure it.
    ///
    /// Discovery and connect are each retried once.  When the link still
    /// cannot be brought up the modem is powered off again and the error
    /// is `SessionFailure`.  A partial setup is returned to the caller.
    pub async fn establish(
        &mut self,
        output: &dyn DigitalOutput,
        factory: &dyn TransportFactory,
        candidates: &[String],
    ) -> SerialResult<(Link, SetupReport)> {
        match self.bring_up(output, factory, candidates).await {
            Ok(up) => Ok(up),
            Err(e) => {
                log::error!("link bring-up failed: {}", e);
                if let Err(off) = self.power_off(output).await {
                    log::error!("power off after failed bring-up: {}", off);
                }
                Err(SerialError::session_failure(e.message.clone()))
            }
        }
    }

    async fn bring_up(
        &mut self,
        output: &dyn DigitalOutput,
        factory: &dyn TransportFactory,
        candidates: &[String],
    ) -> SerialResult<(Link, SetupReport)> {
        self.power_on(output).await?;

        let mut port = self.discover_port(factory, candidates).await?;
        if port.is_none() {
            log::info!("retrying port discovery");
            port = self.discover_port(factory, candidates).await?;
        }
        let port = port.ok_or_else(|| {
            SerialError::new(SerialErrorKind::PortNotFound, "no port answered AT")
        })?;

        let link = match self.connect(factory, &port).await {
            Ok(link) => link,
            Err(e) if e.is_transient() => {
                log::info!("retrying connect to {}: {}", port, e);
                self.connect(factory, &port).await?
            }
            Err(e) => return Err(e),
        };

        let report = self.initial_setup(&link).await?;
        Ok((link, report))
    }

    // ── Data calls ───────────────────────────────────────────────

    /// Dial `number`.  `Ok(true)` when the call connected.
    pub async fn dial(&mut self, link: &Link, number: &str) -> SerialResult<bool> {
        if self.state != ModemState::Ready {
            return Err(SerialError::invalid_state(self.state, ModemState::InCall));
        }
        log::info!("dialling {}", number);
        let raw = link
            .send(&AtCommands::dial(number), self.options.timing.dial_wait)
            .await?;
        let connected = dial_connected(&raw);
        if connected {
            self.transition(ModemState::InCall)?;
            log::info!("connected to {}", number);
        } else {
            log::warn!("call to {} failed: {}", number, raw.trim());
        }
        Ok(connected)
    }

    /// Escape to command mode and hang up.
    pub async fn hangup(&mut self, link: &Link) -> SerialResult<()> {
        if self.state != ModemState::InCall {
            return Err(SerialError::invalid_state(self.state, ModemState::Ready));
        }
        let guard = self.options.timing.escape_guard;
        tokio::time::sleep(guard).await;
        link.write_raw(AtCommands::ESCAPE.as_bytes()).await?;
        tokio::time::sleep(guard).await;
        if let Err(e) = link.ask(AtCommands::HANGUP).await {
            log::warn!("hang up not acknowledged: {}", e);
        }
        self.transition(ModemState::Ready)
    }

    // ── Teardown ─────────────────────────────────────────────────

    /// Close the link.  A failed close is reported but the session still
    /// moves on towards power-off.
    pub async fn disconnect(&mut self, link: Link) -> SerialResult<()> {
        if self.state != ModemState::PoweredOff {
            self.transition(ModemState::Disconnecting)?;
        }
        let port = link.port_name().to_string();
        match link.close().await {
            Ok(()) => {
                log::info!("disconnected from {}", port);
                Ok(())
            }
            Err(e) => {
                log::error!("closing {} failed: {}", port, e);
                Err(e)
            }
        }
    }
}

/// A dial reply connects on a `CONNECT` result code unless the call
/// also reports `NO CARRIER`.
fn dial_connected(raw: &str) -> bool {
    let codes: Vec<ModemResponseCode> = reply_lines("", raw)
        .iter()
        .map(|l| ModemResponseCode::parse(l))
        .collect();
    codes.iter().any(ModemResponseCode::is_connect)
        && !codes.contains(&ModemResponseCode::NoCarrier)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modem::power::{PinLevel, RecordingOutput};
    use crate::modem::transport::{SerialTransport, SimulatedPortFactory, SimulatedTransport};
    use std::sync::Arc;

    fn modem(port: &str, model: &'static str) -> Arc<SimulatedTransport> {
        let t = SimulatedTransport::new(port);
        t.set_responder(move |cmd| match cmd {
            "AT+CGMM" => Some(format!("\r\n{}\r\n\r\nOK\r\n", model)),
            _ => Some("\r\nOK\r\n".to_string()),
        });
        t
    }

    fn candidates(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    async fn ready_session(
        t: Arc<SimulatedTransport>,
    ) -> (ModemSession, Link, SimulatedPortFactory) {
        let factory = SimulatedPortFactory::new().with_port(t);
        let mut session = ModemSession::new(SessionOptions::default());
        let out = RecordingOutput::new();
        session.power_on(&out).await.unwrap();
        let port = session
            .discover_port(&factory, &candidates(&["/dev/ttyS1"]))
            .await
            .unwrap()
            .unwrap();
        let link = session.connect(&factory, &port).await.unwrap();
        (session, link, factory)
    }

    #[tokio::test(start_paused = true)]
    async fn test_discover_port_first_answering() {
        let dead = SimulatedTransport::silent("/dev/ttyS0");
        let missing = SimulatedTransport::new("/dev/ttyS1");
        missing.set_fail_open(true);
        let live = modem("/dev/ttyS2", "9602");
        let later = modem("/dev/ttyS3", "9602");
        let factory = SimulatedPortFactory::new()
            .with_port(dead.clone())
            .with_port(missing)
            .with_port(live.clone())
            .with_port(later.clone());

        let mut session = ModemSession::new(SessionOptions::default());
        session.power_on(&RecordingOutput::new()).await.unwrap();
        let found = session
            .discover_port(
                &factory,
                &candidates(&["/dev/ttyS0", "/dev/ttyS1", "/dev/ttyS2", "/dev/ttyS3"]),
            )
            .await
            .unwrap();
        assert_eq!(found.as_deref(), Some("/dev/ttyS2"));
        assert!(!dead.is_open());
        assert!(!live.is_open());
        assert_eq!(later.count_sent("AT").await, 0);
        assert_eq!(session.state(), ModemState::PortDiscovery);
    }

    #[tokio::test(start_paused = true)]
    async fn test_discover_port_none() {
        let factory = SimulatedPortFactory::new();
        let mut session = ModemSession::new(SessionOptions::default());
        session.power_on(&RecordingOutput::new()).await.unwrap();
        let found = session
            .discover_port(&factory, &candidates(&["/dev/ttyS0"]))
            .await
            .unwrap();
        assert!(found.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_no_at_response() {
        let dead = SimulatedTransport::silent("/dev/ttyS0");
        let factory = SimulatedPortFactory::new().with_port(dead.clone());
        let mut session = ModemSession::new(SessionOptions::default());
        session.power_on(&RecordingOutput::new()).await.unwrap();
        session.discover_port(&factory, &[]).await.unwrap();
        let err = session.connect(&factory, "/dev/ttyS0").await.err().unwrap();
        assert_eq!(err.kind, SerialErrorKind::NoAtResponse);
        assert!(!dead.is_open());
        assert_eq!(session.state(), ModemState::PortDiscovery);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_requires_discovery() {
        let factory = SimulatedPortFactory::new();
        let mut session = ModemSession::new(SessionOptions::default());
        let err = session.connect(&factory, "/dev/ttyS1").await.err().unwrap();
        assert_eq!(err.kind, SerialErrorKind::InvalidState);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_setup_data_modem_order() {
        let t = modem("/dev/ttyS1", "9522B");
        let (mut session, link, _f) = ready_session(t.clone()).await;
        let report = session.initial_setup(&link).await.unwrap();
        assert!(report.is_complete());
        assert_eq!(report.model.as_deref(), Some("9522B"));
        assert_eq!(session.state(), ModemState::Ready);
        assert!(session.saved_profile());

        let lines = t.sent_lines().await;
        // discovery AT, connect AT, then the setup sequence
        assert_eq!(
            lines[2..].to_vec(),
            vec![
                "AT&F0", "AT&D0", "AT&K0", "AT+CGMM", "AT&CBST=71,0,1", "ATS0=1", "AT&W0",
                "AT&Y0"
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_setup_sbd_modem_skips_bearer() {
        let t = modem("/dev/ttyS1", "9602");
        let (mut session, link, _f) = ready_session(t.clone()).await;
        let report = session.initial_setup(&link).await.unwrap();
        assert!(report.is_complete());
        assert!(!report.attempted.contains(&SetupStep::SetBearerService));
        assert_eq!(t.count_sent("AT&CBST").await, 0);
        assert_eq!(t.count_sent("ATS0=").await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_setup_collects_failures() {
        let t = SimulatedTransport::new("/dev/ttyS1");
        t.set_responder(|cmd| match cmd {
            "AT&K0" => Some("\r\nERROR\r\n".into()),
            "AT&Y0" => None,
            "AT+CGMM" => Some("\r\n9523\r\n\r\nOK\r\n".into()),
            _ => Some("\r\nOK\r\n".into()),
        });
        let (mut session, link, _f) = ready_session(t.clone()).await;
        let report = session.initial_setup(&link).await.unwrap();
        assert_eq!(
            report.failed,
            vec![SetupStep::SetFlowControl, SetupStep::SaveProfile]
        );
        assert_eq!(report.attempted.len(), 7);
        assert!(!session.saved_profile());
        assert_eq!(session.state(), ModemState::Ready);
        let err = report.into_result().unwrap_err();
        assert_eq!(err.kind, SerialErrorKind::ConfigurationStepFailed);
        assert!(err.message.contains("set flow control"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_setup_idempotent() {
        let t = modem("/dev/ttyS1", "9522B");
        let (mut session, link, _f) = ready_session(t).await;
        let first = session.initial_setup(&link).await.unwrap();
        let second = session.initial_setup(&link).await.unwrap();
        assert_eq!(first.succeeded(), second.succeeded());
        assert_eq!(first, second);
    }

    #[tokio::test(start_paused = true)]
    async fn test_establish_and_teardown() {
        let t = modem("/dev/ttyS1", "9602");
        let factory = SimulatedPortFactory::new().with_port(t.clone());
        let out = RecordingOutput::new();
        let mut session = ModemSession::new(SessionOptions::default());
        let (link, report) = session
            .establish(&out, &factory, &candidates(&["/dev/ttyS0", "/dev/ttyS1"]))
            .await
            .unwrap();
        assert!(report.is_complete());
        assert_eq!(session.port_name(), Some("/dev/ttyS1"));
        assert_eq!(session.state(), ModemState::Ready);

        session.disconnect(link).await.unwrap();
        assert_eq!(session.state(), ModemState::Disconnecting);
        session.power_off(&out).await.unwrap();
        assert_eq!(session.state(), ModemState::PoweredOff);
        assert!(!t.is_open());

        let levels: Vec<PinLevel> = out.calls().into_iter().map(|(_, l)| l).collect();
        assert_eq!(levels, vec![PinLevel::Low, PinLevel::High, PinLevel::Low]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_establish_failure_powers_off() {
        let factory = SimulatedPortFactory::new();
        let out = RecordingOutput::new();
        let mut session = ModemSession::new(SessionOptions::default());
        let err = session
            .establish(&out, &factory, &candidates(&["/dev/ttyS0"]))
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind, SerialErrorKind::SessionFailure);
        assert_eq!(session.state(), ModemState::PoweredOff);
        assert_eq!(out.calls().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dial_and_hangup() {
        let t = SimulatedTransport::new("/dev/ttyS1");
        t.set_responder(|cmd| {
            if cmd.starts_with("ATDT") {
                Some("\r\nCONNECT 9600\r\n".into())
            } else if cmd == "AT+CGMM" {
                Some("\r\n9522B\r\n\r\nOK\r\n".into())
            } else {
                Some("\r\nOK\r\n".into())
            }
        });
        let (mut session, link, _f) = ready_session(t.clone()).await;
        session.initial_setup(&link).await.unwrap();
        assert!(session.dial(&link, "0088160000500").await.unwrap());
        assert_eq!(session.state(), ModemState::InCall);
        session.hangup(&link).await.unwrap();
        assert_eq!(session.state(), ModemState::Ready);
        assert_eq!(t.count_sent("ATH0").await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dial_no_carrier() {
        let t = SimulatedTransport::new("/dev/ttyS1");
        t.set_responder(|cmd| {
            if cmd.starts_with("ATDT") {
                Some("\r\nNO CARRIER\r\n".into())
            } else {
                Some("\r\nOK\r\n".into())
            }
        });
        let (mut session, link, _f) = ready_session(t).await;
        session.initial_setup(&link).await.unwrap();
        assert!(!session.dial(&link, "0088160000500").await.unwrap());
        assert_eq!(session.state(), ModemState::Ready);
    }

    #[test]
    fn test_dial_connected_result_codes() {
        assert!(dial_connected("\r\nCONNECT 19200\r\n"));
        assert!(dial_connected("ATDT123\r\r\nCONNECT\r\n"));
        assert!(!dial_connected("\r\nCONNECT 9600\r\n\r\nNO CARRIER\r\n"));
        assert!(!dial_connected("\r\nNO CARRIER\r\n"));
        assert!(!dial_connected("\r\nBUSY\r\n"));
        assert!(!dial_connected(""));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dial_requires_ready() {
        let t = modem("/dev/ttyS1", "9522B");
        let (mut session, link, _f) = ready_session(t).await;
        let err = session.dial(&link, "123").await.unwrap_err();
        assert_eq!(err.kind, SerialErrorKind::InvalidState);
    }
}
