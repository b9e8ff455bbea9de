//! Serial port transport abstraction.
//!
//! The link layer only ever needs byte-level read/write, a non-blocking
//! "how much is waiting" probe, and DTR control, so that is all the
//! `SerialTransport` trait exposes.  Two back-ends ship with the crate:
//! `SystemTransport` over the `serialport` crate (feature `system-port`)
//! and `SimulatedTransport`, an in-memory modem driven by a scripted
//! responder for tests and bench runs.

use crate::modem::types::*;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Transport trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Platform-agnostic serial port transport.
///
/// Implementations must be `Send + Sync` so they can be held behind an
/// `Arc` by the link and the port factory at the same time.
#[async_trait::async_trait]
pub trait SerialTransport: Send + Sync {
    /// Open the port with the given configuration.
    async fn open(&self, config: &SerialConfig) -> SerialResult<()>;

    /// Close the port.
    async fn close(&self) -> SerialResult<()>;

    /// Read up to `buf.len()` bytes into `buf`.  Returns number of bytes read.
    async fn read(&self, buf: &mut [u8]) -> SerialResult<usize>;

    /// Write all bytes in `buf`.
    async fn write(&self, buf: &[u8]) -> SerialResult<usize>;

    /// Flush all pending output.
    async fn flush(&self) -> SerialResult<()>;

    /// Number of bytes waiting in the receive buffer.
    async fn bytes_available(&self) -> SerialResult<usize>;

    /// Set DTR (Data Terminal Ready).
    async fn set_dtr(&self, state: bool) -> SerialResult<()>;

    fn is_open(&self) -> bool;

    fn port_name(&self) -> &str;
}

/// Creates transports for named ports (used by port discovery).
pub trait TransportFactory: Send + Sync {
    fn create(&self, port_name: &str) -> Arc<dyn SerialTransport>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Simulated transport (for testing & bench runs)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Produces the modem's reply to one line written by the host.
pub type Responder = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// A fully in-memory modem.
///
/// Every CR/LF-terminated line the host writes is recorded and handed to
/// the responder; whatever it returns lands in the receive buffer, after
/// the echoed command when echo is on.
pub struct SimulatedTransport {
    name: String,
    open: AtomicBool,
    fail_open: AtomicBool,
    echo: AtomicBool,
    dtr: AtomicBool,
    config: Mutex<SerialConfig>,
    rx_buf: Mutex<VecDeque<u8>>,
    line_buf: Mutex<Vec<u8>>,
    sent_lines: Mutex<Vec<String>>,
    responder: std::sync::Mutex<Option<Responder>>,
    rx_notify: Notify,
}

impl SimulatedTransport {
    /// Create a new simulated transport for the given port name.
    pub fn new(port_name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: port_name.into(),
            open: AtomicBool::new(false),
            fail_open: AtomicBool::new(false),
            echo: AtomicBool::new(true),
            dtr: AtomicBool::new(false),
            config: Mutex::new(SerialConfig::default()),
            rx_buf: Mutex::new(VecDeque::with_capacity(4096)),
            line_buf: Mutex::new(Vec::with_capacity(256)),
            sent_lines: Mutex::new(Vec::new()),
            responder: std::sync::Mutex::new(None),
            rx_notify: Notify::new(),
        })
    }

    /// Simulated modem that answers `OK` to everything.
    pub fn always_ok(port_name: impl Into<String>) -> Arc<Self> {
        let t = Self::new(port_name);
        t.set_responder(|_| Some("\r\nOK\r\n".to_string()));
        t
    }

    /// Simulated dead port: opens fine, never answers.
    pub fn silent(port_name: impl Into<String>) -> Arc<Self> {
        Self::new(port_name)
    }

    pub fn set_responder<F>(&self, f: F)
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        if let Ok(mut slot) = self.responder.lock() {
            *slot = Some(Box::new(f));
        }
    }

    /// Toggle command echo (Iridium units ship with `E1`).
    pub fn set_echo(&self, enabled: bool) {
        self.echo.store(enabled, Ordering::SeqCst);
    }

    /// Make the next `open` calls fail (port missing or busy).
    pub fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Inject bytes into the receive buffer (unsolicited data).
    pub async fn inject_rx(&self, data: &[u8]) {
        let mut buf = self.rx_buf.lock().await;
        buf.extend(data);
        self.rx_notify.notify_waiters();
    }

    /// Every line the host has written so far.
    pub async fn sent_lines(&self) -> Vec<String> {
        self.sent_lines.lock().await.clone()
    }

    /// Number of written lines starting with `prefix`.
    pub async fn count_sent(&self, prefix: &str) -> usize {
        self.sent_lines
            .lock()
            .await
            .iter()
            .filter(|l| l.starts_with(prefix))
            .count()
    }

    pub fn dtr(&self) -> bool {
        self.dtr.load(Ordering::SeqCst)
    }

    async fn complete_line(&self, line: String) {
        let reply = match self.responder.lock() {
            Ok(slot) => slot.as_ref().and_then(|f| f(&line)),
            Err(_) => None,
        };
        let echo = self.echo.load(Ordering::SeqCst);
        self.sent_lines.lock().await.push(line.clone());
        let mut out = Vec::new();
        if let Some(reply) = reply {
            if echo {
                out.extend_from_slice(line.as_bytes());
                out.extend_from_slice(b"\r");
            }
            out.extend_from_slice(reply.as_bytes());
        }
        if !out.is_empty() {
            self.inject_rx(&out).await;
        }
    }
}

#[async_trait::async_trait]
impl SerialTransport for SimulatedTransport {
    async fn open(&self, config: &SerialConfig) -> SerialResult<()> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(SerialError::new(
                SerialErrorKind::PortNotFound,
                format!("Port {} cannot be opened", self.name),
            )
            .with_port(&self.name));
        }
        if self.open.load(Ordering::SeqCst) {
            return Err(SerialError::io_error(format!("Port {} already open", self.name))
                .with_port(&self.name));
        }
        *self.config.lock().await = config.clone();
        self.dtr.store(config.dtr_on_open, Ordering::SeqCst);
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> SerialResult<()> {
        self.open.store(false, Ordering::SeqCst);
        self.dtr.store(false, Ordering::SeqCst);
        self.rx_buf.lock().await.clear();
        self.line_buf.lock().await.clear();
        Ok(())
    }

    async fn read(&self, buf: &mut [u8]) -> SerialResult<usize> {
        if !self.is_open() {
            return Err(SerialError::not_connected("Port not open").with_port(&self.name));
        }
        let mut rx = self.rx_buf.lock().await;
        if rx.is_empty() {
            drop(rx);
            tokio::select! {
                _ = self.rx_notify.notified() => {},
                _ = tokio::time::sleep(tokio::time::Duration::from_millis(50)) => {},
            }
            rx = self.rx_buf.lock().await;
        }
        let count = buf.len().min(rx.len());
        for (slot, byte) in buf.iter_mut().zip(rx.drain(..count)) {
            *slot = byte;
        }
        Ok(count)
    }

    async fn write(&self, buf: &[u8]) -> SerialResult<usize> {
        if !self.is_open() {
            return Err(SerialError::not_connected("Port not open").with_port(&self.name));
        }
        let mut finished = Vec::new();
        {
            let mut pending = self.line_buf.lock().await;
            for &b in buf {
                match b {
                    b'\r' | b'\n' => {
                        if !pending.is_empty() {
                            finished.push(String::from_utf8_lossy(&pending).to_string());
                            pending.clear();
                        }
                    }
                    _ => pending.push(b),
                }
            }
            // The escape sequence is sent bare, between guard times.
            if pending.as_slice() == b"+++" {
                finished.push("+++".to_string());
                pending.clear();
            }
        }
        for line in finished {
            self.complete_line(line).await;
        }
        Ok(buf.len())
    }

    async fn flush(&self) -> SerialResult<()> {
        Ok(())
    }

    async fn bytes_available(&self) -> SerialResult<usize> {
        Ok(self.rx_buf.lock().await.len())
    }

    async fn set_dtr(&self, state: bool) -> SerialResult<()> {
        self.dtr.store(state, Ordering::SeqCst);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn port_name(&self) -> &str {
        &self.name
    }
}

/// Factory handing out pre-registered simulated ports.
///
/// Unknown names get a silent transport, which behaves like a tty with
/// nothing attached.
#[derive(Default)]
pub struct SimulatedPortFactory {
    ports: HashMap<String, Arc<SimulatedTransport>>,
}

impl SimulatedPortFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_port(mut self, transport: Arc<SimulatedTransport>) -> Self {
        self.ports.insert(transport.port_name().to_string(), transport);
        self
    }

    pub fn port(&self, name: &str) -> Option<Arc<SimulatedTransport>> {
        self.ports.get(name).cloned()
    }
}

impl TransportFactory for SimulatedPortFactory {
    fn create(&self, port_name: &str) -> Arc<dyn SerialTransport> {
        match self.ports.get(port_name) {
            Some(t) => t.clone(),
            None => SimulatedTransport::silent(port_name),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  System transport (serialport crate)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(feature = "system-port")]
mod system {
    use super::*;
    use std::io::{Read, Write};
    use std::time::Duration;

    type PortSlot = Arc<std::sync::Mutex<Option<Box<dyn serialport::SerialPort>>>>;

    /// Real serial device.  Blocking port calls run on the blocking pool.
    pub struct SystemTransport {
        name: String,
        port: PortSlot,
        open: AtomicBool,
    }

    impl SystemTransport {
        pub fn new(port_name: impl Into<String>) -> Arc<Self> {
            Arc::new(Self {
                name: port_name.into(),
                port: Arc::new(std::sync::Mutex::new(None)),
                open: AtomicBool::new(false),
            })
        }

        async fn with_port<T, F>(&self, f: F) -> SerialResult<T>
        where
            T: Send + 'static,
            F: FnOnce(&mut Box<dyn serialport::SerialPort>) -> SerialResult<T> + Send + 'static,
        {
            let slot = self.port.clone();
            let name = self.name.clone();
            tokio::task::spawn_blocking(move || {
                let mut guard = slot
                    .lock()
                    .map_err(|_| SerialError::io_error("port lock poisoned"))?;
                match guard.as_mut() {
                    Some(port) => f(port),
                    None => Err(SerialError::not_connected("Port not open").with_port(name)),
                }
            })
            .await
            .map_err(|e| SerialError::io_error(e.to_string()))?
        }
    }

    fn map_serial(e: serialport::Error, port: &str) -> SerialError {
        let kind = match e.kind() {
            serialport::ErrorKind::NoDevice => SerialErrorKind::PortNotFound,
            serialport::ErrorKind::InvalidInput => SerialErrorKind::Unsupported,
            _ => SerialErrorKind::IoError,
        };
        SerialError::new(kind, e.to_string()).with_port(port)
    }

    #[async_trait::async_trait]
    impl SerialTransport for SystemTransport {
        async fn open(&self, config: &SerialConfig) -> SerialResult<()> {
            let flow = match config.flow_control {
                FlowControl::None => serialport::FlowControl::None,
                FlowControl::RtsCts => serialport::FlowControl::Hardware,
            };
            let builder = serialport::new(self.name.clone(), config.baud_rate.value())
                .data_bits(serialport::DataBits::Eight)
                .parity(serialport::Parity::None)
                .stop_bits(serialport::StopBits::One)
                .flow_control(flow)
                .timeout(Duration::from_millis(config.read_timeout_ms));
            let name = self.name.clone();
            let dtr = config.dtr_on_open;
            let port = tokio::task::spawn_blocking(move || {
                let mut port = builder.open().map_err(|e| map_serial(e, &name))?;
                port.write_data_terminal_ready(dtr)
                    .map_err(|e| map_serial(e, &name))?;
                Ok::<_, SerialError>(port)
            })
            .await
            .map_err(|e| SerialError::io_error(e.to_string()))??;

            let mut guard = self
                .port
                .lock()
                .map_err(|_| SerialError::io_error("port lock poisoned"))?;
            *guard = Some(port);
            self.open.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn close(&self) -> SerialResult<()> {
            let mut guard = self
                .port
                .lock()
                .map_err(|_| SerialError::io_error("port lock poisoned"))?;
            // Dropping the handle closes the descriptor.
            guard.take();
            self.open.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn read(&self, buf: &mut [u8]) -> SerialResult<usize> {
            let want = buf.len();
            let name = self.name.clone();
            let data = self
                .with_port(move |port| {
                    let mut tmp = vec![0u8; want];
                    match port.read(&mut tmp) {
                        Ok(n) => {
                            tmp.truncate(n);
                            Ok(tmp)
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(Vec::new()),
                        Err(e) => Err(SerialError::from(e).with_port(name)),
                    }
                })
                .await?;
            buf[..data.len()].copy_from_slice(&data);
            Ok(data.len())
        }

        async fn write(&self, buf: &[u8]) -> SerialResult<usize> {
            let data = buf.to_vec();
            let name = self.name.clone();
            self.with_port(move |port| {
                port.write_all(&data)
                    .map_err(|e| SerialError::from(e).with_port(name.clone()))?;
                port.flush().map_err(|e| SerialError::from(e).with_port(name))?;
                Ok(data.len())
            })
            .await
        }

        async fn flush(&self) -> SerialResult<()> {
            self.with_port(|port| port.flush().map_err(SerialError::from)).await
        }

        async fn bytes_available(&self) -> SerialResult<usize> {
            let name = self.name.clone();
            self.with_port(move |port| {
                port.bytes_to_read()
                    .map(|n| n as usize)
                    .map_err(|e| map_serial(e, &name))
            })
            .await
        }

        async fn set_dtr(&self, state: bool) -> SerialResult<()> {
            let name = self.name.clone();
            self.with_port(move |port| {
                port.write_data_terminal_ready(state)
                    .map_err(|e| map_serial(e, &name))
            })
            .await
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }

        fn port_name(&self) -> &str {
            &self.name
        }
    }

    /// Factory for real devices.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct SystemPortFactory;

    impl TransportFactory for SystemPortFactory {
        fn create(&self, port_name: &str) -> Arc<dyn SerialTransport> {
            SystemTransport::new(port_name)
        }
    }
}

#[cfg(feature = "system-port")]
pub use system::{SystemPortFactory, SystemTransport};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Byte formatting helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Format a single byte as a printable character or dot.
pub fn printable_char(byte: u8) -> char {
    if byte.is_ascii_graphic() || byte == b' ' {
        byte as char
    } else {
        '.'
    }
}

/// Printable rendering of modem traffic, control characters escaped.
pub fn escape_control(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len());
    for &b in data {
        match b {
            b'\r' => out.push_str("\\r"),
            b'\n' => out.push_str("\\n"),
            _ => out.push(printable_char(b)),
        }
    }
    out
}

/// Whether the bytes are plain text a human can read in a log.
pub fn is_text(data: &[u8]) -> bool {
    data.iter()
        .all(|&b| b.is_ascii_graphic() || matches!(b, b' ' | b'\r' | b'\n' | b'\t'))
}
