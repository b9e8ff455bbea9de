//! Bench station: a scripted Iridium transceiver wired to an in-process
//! gateway receiver, so a whole cycle can run without hardware.
//!
//! SBD frames loaded with `AT+SBDWT` go straight to the receiver and its
//! verdict comes back as the next incoming message.  On a data call every
//! frame line is answered on the line.

use satlink_modem::modem::{OperationMode, SimulatedTransport};
use satlink_transfer::transfer::{Acceptance, Receiver};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};

const OK: &str = "\r\nOK\r\n";
const ERROR: &str = "\r\nERROR\r\n";

struct GatewayState {
    receiver: Receiver,
    outbox: VecDeque<String>,
    completed: Vec<String>,
    momsn: u32,
}

/// Gateway end of the bench link.
#[derive(Clone)]
pub struct BenchGateway {
    state: Arc<Mutex<GatewayState>>,
}

impl BenchGateway {
    pub fn new(output: &Path) -> Self {
        Self {
            state: Arc::new(Mutex::new(GatewayState {
                receiver: Receiver::new(output),
                outbox: VecDeque::new(),
                completed: Vec::new(),
                momsn: 0,
            })),
        }
    }

    /// Files the gateway has fully received so far.
    pub fn completed(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|s| s.completed.clone())
            .unwrap_or_default()
    }

    fn accept(state: &mut GatewayState, frame: &str) -> String {
        match state.receiver.accept(frame) {
            Ok(verdict) => {
                if let Acceptance::Completed { file, .. } = &verdict {
                    state.completed.push(file.clone());
                }
                verdict.reply().to_string()
            }
            Err(e) => {
                log::error!("bench gateway could not store frame: {}", e);
                satlink_transfer::transfer::NACK_TOKEN.to_string()
            }
        }
    }

    /// Answer one line written to the modem.
    pub fn respond(&self, line: &str) -> Option<String> {
        let Ok(mut state) = self.state.lock() else {
            return Some(ERROR.to_string());
        };
        let line = line.trim();

        if line.starts_with("SLK1|") {
            let verdict = Self::accept(&mut state, line);
            return Some(format!("\r\n{}\r\n", verdict));
        }
        if line == "AT+SBDD2" {
            return Some("\r\n0\r\n\r\nOK\r\n".to_string());
        }
        if let Some(frame) = line.strip_prefix("AT+SBDWT=") {
            if frame.len() > OperationMode::Sbd.max_mtu() {
                log::warn!("bench transceiver refused a {} byte SBD message", frame.len());
                return Some(ERROR.to_string());
            }
            let verdict = Self::accept(&mut state, frame);
            state.outbox.push_back(verdict);
            return Some(OK.to_string());
        }
        if line.starts_with("AT+SBDI") {
            state.momsn += 1;
            let (mt, len) = match state.outbox.front() {
                Some(msg) => (1, msg.len()),
                None => (0, 0),
            };
            let tag = if line.starts_with("AT+SBDIX") { "+SBDIX" } else { "+SBDI" };
            return Some(format!(
                "\r\n{}: 1, {}, {}, {}, {}, {}\r\n{}",
                tag,
                state.momsn,
                mt,
                state.momsn,
                len,
                state.outbox.len().saturating_sub(1),
                OK
            ));
        }
        if line == "AT+SBDRT" {
            let msg = state.outbox.pop_front().unwrap_or_default();
            return Some(format!("\r\n+SBDRT:\r\n{}\r\n{}", msg, OK));
        }

        let reply = match line {
            "AT+CSQ" => "\r\n+CSQ:5\r\n\r\nOK\r\n".to_string(),
            "AT+SBDREG?" => "\r\n+SBDREG:2\r\n\r\nOK\r\n".to_string(),
            "AT+CREG?" => "\r\n+CREG:000,001\r\n\r\nOK\r\n".to_string(),
            "AT+CGMM" => "\r\n9522B\r\n\r\nOK\r\n".to_string(),
            "AT+CICCID" => "\r\n8988169312002285599\r\n\r\nOK\r\n".to_string(),
            l if l.starts_with("ATDT") => "\r\nCONNECT 9600\r\n".to_string(),
            _ => OK.to_string(),
        };
        Some(reply)
    }

    /// A simulated transceiver on `port` answered by this gateway.
    pub fn modem(&self, port: &str) -> Arc<SimulatedTransport> {
        let transport = SimulatedTransport::new(port);
        let gateway = self.clone();
        transport.set_responder(move |line| gateway.respond(line));
        transport
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sbd_verdict_is_queued_as_incoming() {
        let dir = tempfile::tempdir().unwrap();
        let gw = BenchGateway::new(dir.path());
        assert_eq!(gw.respond(&format!("AT+SBDWT={}", "x".repeat(341))).unwrap(), ERROR);
        assert_eq!(gw.respond("AT+SBDWT=garbage").unwrap(), OK);
        let status = gw.respond("AT+SBDI").unwrap();
        assert!(status.contains("+SBDI: 1, 1, 1, 1, 3, 0"), "{}", status);
        assert!(gw.respond("AT+SBDRT").unwrap().contains("\r\nnok\r\n"));
        let status = gw.respond("AT+SBDIX=7000.00,N,00100.00,E").unwrap();
        assert!(status.contains("+SBDIX: 1, 2, 0, 2, 0, 0"), "{}", status);
    }
}
