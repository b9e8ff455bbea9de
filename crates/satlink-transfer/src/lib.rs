//! # Satlink – chunked transfer
//!
//! Moves whole files across a link that only carries small, unreliable
//! messages:
//!
//! - **Chunks** – files split to the channel MTU, each with its own CRC-32
//! - **Frames** – self-describing text frames carrying one chunk
//! - **Fetch list** – durable CSV queue of files waiting to go out
//! - **Channels** – SBD mailbox or an established data call
//! - **Sender / Receiver** – the two ends of the acknowledgement loop

pub mod transfer;
