//! Serial port enumeration for modem discovery.
//!
//! Produces the ordered candidate list that `ModemSession::discover_port`
//! walks.  Configured ports always win; otherwise the system's tty devices
//! are listed in a stable order so discovery is deterministic across boots.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Rough port category, used to order candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PortType {
    /// On-board UART (`ttyS*`, `COM*`).
    Native,
    /// USB-serial adapter (`ttyUSB*`, `ttyACM*`).
    UsbSerial,
    /// Pseudo terminal or anything unrecognised.
    Other,
}

impl PortType {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Native => "Native",
            Self::UsbSerial => "USB-Serial",
            Self::Other => "Other",
        }
    }
}

/// Classify a port name into a `PortType`.
pub fn classify_port(port_name: &str) -> PortType {
    let name = Path::new(port_name)
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    if name.contains("usb") || name.contains("acm") {
        PortType::UsbSerial
    } else if name.starts_with("com") || name.starts_with("ttys") {
        PortType::Native
    } else {
        PortType::Other
    }
}

/// Whether a `/dev` entry name is a real tty rather than the controlling
/// terminal (`tty`) or a virtual console (`tty0`..`tty63`).
pub fn is_tty_device(name: &str) -> bool {
    match name.strip_prefix("tty") {
        Some(rest) => rest.chars().next().map_or(false, |c| c.is_ascii_alphabetic()),
        None => false,
    }
}

/// List tty devices under `dev_dir`, sorted native-first then by name.
pub fn enumerate_tty_ports(dev_dir: &Path) -> Vec<String> {
    let mut ports: Vec<String> = match std::fs::read_dir(dev_dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|name| is_tty_device(name))
            .map(|name| dev_dir.join(name).to_string_lossy().to_string())
            .collect(),
        Err(e) => {
            log::warn!("cannot list {}: {}", dev_dir.display(), e);
            Vec::new()
        }
    };
    sort_candidates(&mut ports);
    ports
}

/// Ports present on this host.
pub fn enumerate_system_ports() -> Vec<String> {
    if cfg!(target_os = "windows") {
        (1..=256).map(|i| format!("COM{}", i)).collect()
    } else {
        enumerate_tty_ports(Path::new("/dev"))
    }
}

/// Stable order: native UARTs, then USB adapters, then the rest; each
/// group by name with numeric suffixes compared as numbers.
pub fn sort_candidates(ports: &mut [String]) {
    ports.sort_by(|a, b| {
        classify_port(a)
            .cmp(&classify_port(b))
            .then_with(|| split_numeric(a).cmp(&split_numeric(b)))
    });
}

fn split_numeric(name: &str) -> (String, u64) {
    let digits = name.chars().rev().take_while(|c| c.is_ascii_digit()).count();
    let (stem, num) = name.split_at(name.len() - digits);
    (stem.to_string(), num.parse().unwrap_or(0))
}

/// The list discovery walks: configured ports in their given order, or
/// every system port when none are configured.
pub fn candidate_ports(configured: &[String]) -> Vec<String> {
    if configured.is_empty() {
        enumerate_system_ports()
    } else {
        configured.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_port() {
        assert_eq!(classify_port("/dev/ttyUSB0"), PortType::UsbSerial);
        assert_eq!(classify_port("/dev/ttyACM1"), PortType::UsbSerial);
        assert_eq!(classify_port("/dev/ttyS2"), PortType::Native);
        assert_eq!(classify_port("COM3"), PortType::Native);
        assert_eq!(classify_port("/dev/pts/4"), PortType::Other);
        assert_eq!(PortType::UsbSerial.label(), "USB-Serial");
    }

    #[test]
    fn test_is_tty_device() {
        assert!(is_tty_device("ttyS1"));
        assert!(is_tty_device("ttyUSB0"));
        assert!(!is_tty_device("tty"));
        assert!(!is_tty_device("tty12"));
        assert!(!is_tty_device("null"));
    }

    #[test]
    fn test_sort_candidates_numeric() {
        let mut ports = vec![
            "/dev/ttyUSB0".to_string(),
            "/dev/ttyS10".to_string(),
            "/dev/ttyS2".to_string(),
        ];
        sort_candidates(&mut ports);
        assert_eq!(ports, vec!["/dev/ttyS2", "/dev/ttyS10", "/dev/ttyUSB0"]);
    }

    #[test]
    fn test_enumerate_tty_ports() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["ttyS1", "ttyUSB0", "tty", "tty3", "random"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        let ports = enumerate_tty_ports(dir.path());
        let names: Vec<String> = ports
            .iter()
            .map(|p| Path::new(p).file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["ttyS1", "ttyUSB0"]);
    }

    #[test]
    fn test_candidate_ports_prefers_configuration() {
        let configured = vec!["/dev/ttyS1".to_string(), "/dev/ttyS0".to_string()];
        assert_eq!(candidate_ports(&configured), configured);
    }
}
