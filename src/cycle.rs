//! One transfer cycle of a field station.
//!
//! ```text
//! discover → power on → establish → coverage → SIM / ICCID
//!          → channel by mode → scheduler run → disconnect → power off
//! ```
//!
//! Whatever fails along the way is written into the report; the modem is
//! always disconnected and powered off before the cycle returns.

use crate::config::{StationConfig, StationSettings};
use crate::error::{StationError, StationErrorKind, StationResult};
use chrono::{DateTime, Utc};
use satlink_modem::modem::commands::{read_iccid, unlock_sim};
use satlink_modem::modem::port_scanner::candidate_ports;
use satlink_modem::modem::{
    mailbox_exchange, wait_for_coverage, CoverageResult, DigitalOutput, Link, ModemSession,
    OperationMode, SetupStep, SharedCapture, TransportFactory,
};
use satlink_transfer::transfer::{
    ChunkChannel, DataCallChannel, FetchList, RunReport, SbdChannel, TransferScheduler,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    pub cycle_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub mode: OperationMode,
    pub discovered: Vec<String>,
    pub port: Option<String>,
    pub model: Option<String>,
    pub setup_failed: Vec<SetupStep>,
    pub coverage: Option<CoverageResult>,
    pub iccid: Option<String>,
    pub transfer: Option<RunReport>,
    /// Commands the gateway sent down with SBD traffic.
    pub commands: Vec<String>,
    pub errors: Vec<String>,
    pub powered_off: bool,
}

impl CycleReport {
    fn new(mode: OperationMode) -> Self {
        Self {
            cycle_id: uuid::Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            finished_at: None,
            mode,
            discovered: Vec::new(),
            port: None,
            model: None,
            setup_failed: Vec::new(),
            coverage: None,
            iccid: None,
            transfer: None,
            commands: Vec::new(),
            errors: Vec::new(),
            powered_off: false,
        }
    }

    /// Delivered at least what was pending and nothing went wrong.
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
            && self
                .transfer
                .as_ref()
                .map_or(false, |t| t.incomplete.is_empty() && t.failed.is_empty())
    }

    fn fail(&mut self, err: impl std::fmt::Display) {
        log::error!("{}", err);
        self.errors.push(err.to_string());
    }
}

/// Hardware the cycle drives.
pub struct StationHardware<'a> {
    pub output: &'a dyn DigitalOutput,
    pub factory: &'a dyn TransportFactory,
    pub capture: Option<SharedCapture>,
}

/// Where the last report is kept for `status`.
pub fn report_path(config: &StationConfig) -> PathBuf {
    config.home_dir().join("log").join("last_cycle.json")
}

pub fn save_report(config: &StationConfig, report: &CycleReport) -> StationResult<PathBuf> {
    let path = report_path(config);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, serde_json::to_string_pretty(report)?)?;
    Ok(path)
}

pub fn load_report(config: &StationConfig) -> StationResult<Option<CycleReport>> {
    let path = report_path(config);
    if !path.exists() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(&path)?;
    Ok(Some(serde_json::from_str(&text)?))
}

pub async fn run_cycle(
    config: &StationConfig,
    settings: &StationSettings,
    hw: StationHardware<'_>,
) -> CycleReport {
    let mut report = CycleReport::new(settings.mode);
    log::info!("cycle {} starting ({:?} mode)", report.cycle_id, settings.mode);

    let mut scheduler = match prepare_queue(config, settings, &mut report) {
        Ok(s) => s,
        Err(e) => {
            report.fail(e);
            report.finished_at = Some(Utc::now());
            return report;
        }
    };

    let mut session =
        ModemSession::new(settings.session_options()).with_capture(hw.capture.clone());
    let candidates = candidate_ports(&settings.ports);
    let (link, setup) = match session.establish(hw.output, hw.factory, &candidates).await {
        Ok(up) => up,
        Err(e) => {
            // establish already switched the modem off
            report.fail(e);
            report.powered_off = true;
            report.finished_at = Some(Utc::now());
            return report;
        }
    };
    report.port = session.port_name().map(str::to_string);
    report.model = setup.model.clone();
    report.setup_failed = setup.failed.clone();

    if let Err(e) = transfer(config, settings, &mut session, &link, &mut scheduler, &mut report).await {
        report.fail(e);
    }

    if let Err(e) = session.disconnect(link).await {
        report.fail(e);
    }
    match session.power_off(hw.output).await {
        Ok(()) => report.powered_off = true,
        Err(e) => report.fail(e),
    }
    report.finished_at = Some(Utc::now());
    log::info!(
        "cycle {} done: {} delivered, {} error(s)",
        report.cycle_id,
        report.transfer.as_ref().map_or(0, |t| t.delivered.len()),
        report.errors.len()
    );
    report
}

fn prepare_queue(
    config: &StationConfig,
    settings: &StationSettings,
    report: &mut CycleReport,
) -> StationResult<TransferScheduler> {
    let list = FetchList::load_or_create(settings.resolve(config, &settings.fetch_list))?;
    let mut scheduler = TransferScheduler::new(list, settings.scheduler_options(config));
    let origin = settings.resolve(config, &settings.origin_dir);
    if origin.is_dir() {
        report.discovered = scheduler.discover(&origin)?;
    } else {
        log::warn!("origin directory {} does not exist", origin.display());
    }
    Ok(scheduler)
}

async fn transfer(
    config: &StationConfig,
    settings: &StationSettings,
    session: &mut ModemSession,
    link: &Link,
    scheduler: &mut TransferScheduler,
    report: &mut CycleReport,
) -> StationResult<()> {
    let coverage = wait_for_coverage(
        link,
        Duration::from_secs(settings.coverage_timeout_secs),
        settings.mode.registration_mode(),
        Duration::from_secs(settings.coverage_poll_secs),
    )
    .await;
    report.coverage = Some(coverage.clone());
    coverage.into_result()?;

    if let Some(pin) = settings.sim_pin.as_deref() {
        if !unlock_sim(link, pin).await? {
            log::warn!("SIM did not accept the PIN");
        }
    }
    match read_iccid(link).await {
        Ok(iccid) => {
            log::info!("SIM {}", iccid);
            report.iccid = Some(iccid);
        }
        Err(e) => log::warn!("ICCID not available: {}", e),
    }

    match settings.mode {
        OperationMode::Sbd => {
            let mut channel = SbdChannel::new(link, config.mtu)
                .with_location(settings.location.clone());
            run_transfer(scheduler, &mut channel, report).await?;
            if report.transfer.as_ref().map_or(true, |t| t.frames_sent == 0) {
                // nothing went out, still pick up what the gateway queued
                let exchange = mailbox_exchange(link, None, settings.location.as_deref()).await?;
                report.commands.extend(exchange.commands);
            } else {
                report.commands.extend(channel.take_commands());
            }
            Ok(())
        }
        OperationMode::Raw | OperationMode::Rudics => {
            if !session.dial(link, &config.phone).await? {
                return Err(StationError::new(
                    StationErrorKind::Modem,
                    format!("call to {} did not connect", config.phone),
                ));
            }
            let mut channel = DataCallChannel::new(link, config.mtu);
            let result = run_transfer(scheduler, &mut channel, report).await;
            if let Err(e) = session.hangup(link).await {
                report.fail(e);
            }
            result
        }
        OperationMode::PppFtp => Err(StationError::config("PPP/FTP mode is not supported")),
    }
}

async fn run_transfer(
    scheduler: &mut TransferScheduler,
    channel: &mut dyn ChunkChannel,
    report: &mut CycleReport,
) -> StationResult<()> {
    log::info!("sending over {} (MTU {})", channel.name(), channel.mtu());
    let run = scheduler.run(channel).await?;
    report.transfer = Some(run);
    Ok(())
}
