//! # Satlink – Iridium modem link
//!
//! Everything needed to drive an Iridium-class satellite modem over a
//! serial line from a field station:
//!
//! - **Transport** – byte-level serial I/O behind the `SerialTransport`
//!   trait, with an in-memory scripted transport for tests
//! - **AT Commands** – request/response framing with echo masking and
//!   line-ending normalisation
//! - **Session** – power sequencing, port discovery, connect, initial
//!   setup, data calls, and teardown as one state machine
//! - **Coverage** – signal and registration polling with decode tables
//! - **SBD** – Short Burst Data mailbox exchange with bounded retry
//! - **Capture** – timestamped TX/RX traffic log

pub mod modem;
