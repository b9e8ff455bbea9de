//! Satlink station driver.
//!
//! - `run`      one transfer cycle (power on, send, power off)
//! - `status`   last cycle report and the fetch list
//! - `enqueue`  queue files by hand
//! - `decode`   look up modem status and registration codes

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use satlink::config::DEFAULT_CONFIG_PATH;
use satlink::cycle::{load_report, save_report};
use satlink::{run_cycle, BenchGateway, StationConfig, StationHardware, StationSettings};
use satlink_modem::modem::transport::SystemPortFactory;
use satlink_modem::modem::{
    decode_mo_status, decode_mo_status_basic, decode_mt_status, decode_registration,
    CaptureConfig, OperationMode, RecordingOutput, RegistrationMode, SimulatedPortFactory,
    SysfsGpio, TrafficCapture,
};
use satlink_transfer::transfer::{file_crc32, FetchList, FetchListEntry};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

const BENCH_PORT: &str = "/dev/ttySIM0";

#[derive(Parser, Debug)]
#[command(name = "satlink", about = "Iridium field-station file link")]
struct Cli {
    /// Config CSV (MTU,PATH,PHONE,DEBUG); created with defaults if missing.
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Settings JSON.  Defaults to `conf/satlink.json` under the station home.
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Operation mode override.
    #[arg(long, value_enum)]
    mode: Option<ModeArg>,

    /// Candidate port override (repeatable).
    #[arg(long = "port")]
    ports: Vec<String>,

    /// Run against a bench transceiver and gateway instead of hardware.
    #[arg(long, default_value_t = false)]
    simulate: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one transfer cycle.
    Run,
    /// Print the last cycle report and the fetch list as JSON.
    Status,
    /// Add files to the fetch list.
    Enqueue {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Decode a numeric status code.
    Decode {
        #[arg(value_enum)]
        table: DecodeTable,
        code: i32,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ModeArg {
    Raw,
    Sbd,
    Rudics,
}

impl From<ModeArg> for OperationMode {
    fn from(m: ModeArg) -> Self {
        match m {
            ModeArg::Raw => OperationMode::Raw,
            ModeArg::Sbd => OperationMode::Sbd,
            ModeArg::Rudics => OperationMode::Rudics,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum DecodeTable {
    /// SBDIX MO status.
    Mo,
    /// SBDI MO status.
    MoBasic,
    Mt,
    /// +CREG registration.
    RegData,
    /// +SBDREG registration.
    RegSbd,
    /// Gateway session error.
    SessionError,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Command::Decode { table, code } = cli.command {
        println!("{}", decode(table, code));
        return Ok(());
    }

    let config = StationConfig::load_or_create(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    init_tracing(config.debug);

    let settings_path = cli
        .settings
        .clone()
        .unwrap_or_else(|| config.home_dir().join("conf").join("satlink.json"));
    let mut settings = StationSettings::load(&settings_path)
        .with_context(|| format!("loading {}", settings_path.display()))?;
    if let Some(mode) = cli.mode {
        settings.mode = mode.into();
    }
    if !cli.ports.is_empty() {
        settings.ports = cli.ports.clone();
    }
    tracing::info!(
        mode = ?settings.mode,
        mtu = settings.effective_mtu(&config),
        home = %config.home,
        simulate = cli.simulate,
        "satlink starting"
    );

    match cli.command {
        Command::Run => run(&config, settings, cli.simulate).await,
        Command::Status => status(&config, &settings),
        Command::Enqueue { files } => enqueue(&config, &settings, &files),
        Command::Decode { .. } => Ok(()),
    }
}

fn init_tracing(debug: bool) {
    let fallback = if debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)),
        )
        .init();
}

async fn run(
    config: &StationConfig,
    mut settings: StationSettings,
    simulate: bool,
) -> anyhow::Result<()> {
    let capture_path = settings.resolve(config, &settings.capture_file);
    if let Some(parent) = capture_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let capture = TrafficCapture::shared(CaptureConfig {
        file_path: capture_path,
        max_file_size: settings.capture_max_bytes,
    })?;

    let report = if simulate {
        let gateway_dir = config.home_dir().join("sim").join("gateway");
        let gateway = BenchGateway::new(&gateway_dir);
        let factory = SimulatedPortFactory::new().with_port(gateway.modem(BENCH_PORT));
        let output = RecordingOutput::new();
        settings.ports = vec![BENCH_PORT.to_string()];
        settings.power_off_settle_secs = 0;
        settings.power_on_settle_secs = 0;
        let hw = StationHardware {
            output: &output,
            factory: &factory,
            capture: Some(capture),
        };
        let report = run_cycle(config, &settings, hw).await;
        tracing::info!(
            files = ?gateway.completed(),
            dir = %gateway_dir.display(),
            "bench gateway received"
        );
        report
    } else {
        let output = SysfsGpio::new(settings.gpio_root.clone());
        let factory = SystemPortFactory;
        let hw = StationHardware {
            output: &output,
            factory: &factory,
            capture: Some(capture),
        };
        run_cycle(config, &settings, hw).await
    };

    let path = save_report(config, &report)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    tracing::info!(report = %path.display(), clean = report.is_clean(), "cycle finished");
    Ok(())
}

fn status(config: &StationConfig, settings: &StationSettings) -> anyhow::Result<()> {
    let list = FetchList::load_or_create(settings.resolve(config, &settings.fetch_list))?;
    let report = load_report(config)?;
    let out = serde_json::json!({
        "lastCycle": report,
        "fetchList": list.entries(),
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

fn enqueue(
    config: &StationConfig,
    settings: &StationSettings,
    files: &[PathBuf],
) -> anyhow::Result<()> {
    let mut list = FetchList::load_or_create(settings.resolve(config, &settings.fetch_list))?;
    for file in files {
        let path = file
            .canonicalize()
            .with_context(|| format!("cannot read {}", file.display()))?;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .with_context(|| format!("{} has no usable file name", path.display()))?
            .to_string();
        let size = std::fs::metadata(&path)?.len();
        let crc = file_crc32(&path)?;
        let entry = FetchListEntry::new(name.clone(), path.to_string_lossy(), crc, size);
        if list.append(entry)? {
            println!("queued {} ({} bytes, crc {:08x})", name, size, crc);
        } else {
            println!("{} is already queued", name);
        }
    }
    Ok(())
}

fn decode(table: DecodeTable, code: i32) -> String {
    match table {
        DecodeTable::Mo => decode_mo_status(code),
        DecodeTable::MoBasic => decode_mo_status_basic(code),
        DecodeTable::Mt => decode_mt_status(code),
        DecodeTable::RegData => decode_registration(code, RegistrationMode::Data),
        DecodeTable::RegSbd => decode_registration(code, RegistrationMode::Sbd),
        DecodeTable::SessionError => decode_registration(code, RegistrationMode::SessionError),
    }
}
