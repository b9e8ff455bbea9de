//! Station configuration.
//!
//! Two files drive a station:
//!
//! - the config CSV (`MTU,PATH,PHONE,DEBUG`, one data row) that field
//!   crews edit by hand, created with defaults when missing
//! - an optional settings JSON for everything else; every field has a
//!   default so an absent file or a partial one is fine

use crate::error::{StationError, StationResult};
use satlink_modem::modem::{
    BaudRate, FlowControl, OperationMode, PowerTiming, SerialConfig, SessionOptions,
};
use satlink_transfer::transfer::{SchedulerOptions, DEFAULT_RETRY_TIMEOUT_SECS};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_HEADER: [&str; 4] = ["MTU", "PATH", "PHONE", "DEBUG"];
pub const DEFAULT_CONFIG_PATH: &str = "/home/satice/conf/coms.conf";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Config CSV
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StationConfig {
    /// Largest chunk payload, before the channel's own ceiling applies.
    #[serde(rename = "MTU")]
    pub mtu: usize,
    /// Station home directory, with trailing slash.
    #[serde(rename = "PATH")]
    pub home: String,
    /// Gateway number for data calls.
    #[serde(rename = "PHONE")]
    pub phone: String,
    #[serde(rename = "DEBUG", with = "title_bool")]
    pub debug: bool,
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            mtu: 7000,
            home: "/home/satice/".to_string(),
            phone: "0000000000".to_string(),
            debug: false,
        }
    }
}

/// `True` / `False` as written in the config file.
mod title_bool {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &bool, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(if *value { "True" } else { "False" })
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
        let raw = String::deserialize(d)?;
        match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" | "" => Ok(false),
            _ => Err(de::Error::custom(format!("DEBUG must be True or False, got '{}'", raw))),
        }
    }
}

impl StationConfig {
    /// Read the config at `path`, writing the defaults first if it is absent.
    pub fn load_or_create(path: &Path) -> StationResult<Self> {
        if !path.exists() {
            log::info!("writing default config to {}", path.display());
            let config = Self::default();
            config.save(path)?;
            return Ok(config);
        }
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_path(path)?;
        let headers = reader.headers()?.clone();
        if headers.iter().ne(CONFIG_HEADER.iter().copied()) {
            return Err(StationError::config(format!(
                "{} has header {:?}",
                path.display(),
                headers
            )));
        }
        let config: Self = reader
            .deserialize::<Self>()
            .next()
            .ok_or_else(|| StationError::config(format!("{} has no settings row", path.display())))??;
        if config.mtu == 0 {
            return Err(StationError::config("MTU must be positive"));
        }
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> StationResult<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_path(path)?;
        writer.write_record(CONFIG_HEADER)?;
        writer.serialize(self)?;
        writer.flush()?;
        Ok(())
    }

    pub fn home_dir(&self) -> PathBuf {
        PathBuf::from(&self.home)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Settings JSON
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StationSettings {
    pub mode: OperationMode,
    /// Ports to probe, in order.  Empty = every system port.
    pub ports: Vec<String>,
    pub baud: u32,
    pub flow_control: FlowControl,
    pub dtr_enabled: bool,
    pub rings_before_answer: u8,
    pub power_pin: String,
    pub gpio_root: PathBuf,
    pub power_off_settle_secs: u64,
    pub power_on_settle_secs: u64,
    pub coverage_timeout_secs: u64,
    pub coverage_poll_secs: u64,
    pub chunk_timeout_secs: u64,
    pub max_chunk_attempts: u32,
    pub retention_timeout_secs: f64,
    /// Width of the staged part suffix.
    pub digits: usize,
    /// Unlocks the SIM before the first transfer when set.
    pub sim_pin: Option<String>,
    /// Sent along with SBD sessions (`AT+SBDIX=<location>`).
    pub location: Option<String>,
    /// Relative paths are taken from the config `PATH`.
    pub origin_dir: PathBuf,
    pub staging_dir: PathBuf,
    pub fetch_list: PathBuf,
    pub capture_file: PathBuf,
    /// Capture rotation size in bytes; 0 keeps one file.
    pub capture_max_bytes: u64,
}

impl Default for StationSettings {
    fn default() -> Self {
        Self {
            mode: OperationMode::Sbd,
            ports: Vec::new(),
            baud: 19200,
            flow_control: FlowControl::None,
            dtr_enabled: false,
            rings_before_answer: 1,
            power_pin: "J7.35".to_string(),
            gpio_root: PathBuf::from("/sys/class/gpio"),
            power_off_settle_secs: 30,
            power_on_settle_secs: 5,
            coverage_timeout_secs: 300,
            coverage_poll_secs: 10,
            chunk_timeout_secs: 300,
            max_chunk_attempts: 3,
            retention_timeout_secs: DEFAULT_RETRY_TIMEOUT_SECS,
            digits: 3,
            sim_pin: None,
            location: None,
            origin_dir: PathBuf::from("new/shortlist"),
            staging_dir: PathBuf::from("temp"),
            fetch_list: PathBuf::from("conf/flist.csv"),
            capture_file: PathBuf::from("log/coms.log"),
            capture_max_bytes: 0,
        }
    }
}

impl StationSettings {
    /// Read the settings JSON.  A missing file gives the defaults.
    pub fn load(path: &Path) -> StationResult<Self> {
        if !path.exists() {
            log::debug!("no settings at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        let settings: Self = serde_json::from_str(&text)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> StationResult<()> {
        if self.mode == OperationMode::PppFtp {
            return Err(StationError::config("PPP/FTP mode is not supported"));
        }
        if self.max_chunk_attempts == 0 {
            return Err(StationError::config("maxChunkAttempts must be at least 1"));
        }
        if self.digits == 0 {
            return Err(StationError::config("digits must be at least 1"));
        }
        Ok(())
    }

    pub fn resolve(&self, config: &StationConfig, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            config.home_dir().join(path)
        }
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            power_pin: self.power_pin.clone(),
            serial: SerialConfig {
                baud_rate: BaudRate::from_value(self.baud),
                ..SerialConfig::default()
            },
            flow_control: self.flow_control,
            dtr_enabled: self.dtr_enabled,
            rings_before_answer: self.rings_before_answer,
            power_timing: PowerTiming {
                off_settle: Duration::from_secs(self.power_off_settle_secs),
                on_settle: Duration::from_secs(self.power_on_settle_secs),
            },
            ..SessionOptions::default()
        }
    }

    pub fn scheduler_options(&self, config: &StationConfig) -> SchedulerOptions {
        SchedulerOptions {
            staging: self.resolve(config, &self.staging_dir),
            digits: self.digits,
            chunk_timeout: Duration::from_secs(self.chunk_timeout_secs),
            max_attempts: self.max_chunk_attempts,
            retry_timeout_secs: self.retention_timeout_secs,
        }
    }

    /// Chunk size for this run: the config MTU, capped by the mode.
    pub fn effective_mtu(&self, config: &StationConfig) -> usize {
        config.mtu.min(self.mode.max_mtu())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_created_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf").join("coms.conf");
        let config = StationConfig::load_or_create(&path).unwrap();
        assert_eq!(config, StationConfig::default());
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "MTU,PATH,PHONE,DEBUG\n7000,/home/satice/,0000000000,False\n"
        );
    }

    #[test]
    fn test_config_reads_debug_flag() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("coms.conf");
        std::fs::write(&path, "MTU,PATH,PHONE,DEBUG\n340, /data/ ,881600000000,True\n").unwrap();
        let config = StationConfig::load_or_create(&path).unwrap();
        assert_eq!(config.mtu, 340);
        assert_eq!(config.home, "/data/");
        assert_eq!(config.phone, "881600000000");
        assert!(config.debug);
    }

    #[test]
    fn test_config_rejects_bad_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("coms.conf");
        for bad in [
            "MTU,PATH,PHONE,DEBUG\n",
            "MTU,HOME,PHONE,DEBUG\n7000,/,0,False\n",
            "MTU,PATH,PHONE,DEBUG\nbig,/,0,False\n",
            "MTU,PATH,PHONE,DEBUG\n7000,/,0,maybe\n",
            "MTU,PATH,PHONE,DEBUG\n0,/,0,False\n",
        ] {
            std::fs::write(&path, bad).unwrap();
            assert!(StationConfig::load_or_create(&path).is_err(), "{}", bad);
        }
    }

    #[test]
    fn test_settings_defaults_and_partial_json() {
        let dir = tempfile::tempdir().unwrap();
        let missing = StationSettings::load(&dir.path().join("none.json")).unwrap();
        assert_eq!(missing, StationSettings::default());

        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"mode":"rudics","ports":["/dev/ttyUSB0"],"simPin":"1234"}"#)
            .unwrap();
        let s = StationSettings::load(&path).unwrap();
        assert_eq!(s.mode, OperationMode::Rudics);
        assert_eq!(s.ports, vec!["/dev/ttyUSB0"]);
        assert_eq!(s.sim_pin.as_deref(), Some("1234"));
        assert_eq!(s.power_pin, "J7.35");
        assert_eq!(s.baud, 19200);
    }

    #[test]
    fn test_settings_rejects_ppp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"mode":"pppFtp"}"#).unwrap();
        assert!(StationSettings::load(&path).is_err());
    }

    #[test]
    fn test_paths_resolve_against_home() {
        let config = StationConfig {
            home: "/home/satice/".to_string(),
            ..StationConfig::default()
        };
        let s = StationSettings::default();
        assert_eq!(
            s.resolve(&config, &s.fetch_list),
            PathBuf::from("/home/satice/conf/flist.csv")
        );
        assert_eq!(s.resolve(&config, Path::new("/abs")), PathBuf::from("/abs"));
        assert_eq!(s.effective_mtu(&config), 340);
        assert_eq!(s.scheduler_options(&config).staging, PathBuf::from("/home/satice/temp"));
    }
}
