//! Channels a chunk frame can travel over, and the single-chunk
//! transmit-and-wait step.
//!
//! The gateway answers every frame with a line holding the token `ok`
//! (chunk accepted) or `nok` (chunk rejected).  Tokens are matched
//! case-sensitively so a modem `OK` result code is never mistaken for an
//! acknowledgement.

use crate::transfer::error::{TransferError, TransferResult};
use crate::transfer::frame::{max_payload, ChunkFrame, FRAME_MAGIC};
use async_trait::async_trait;
use satlink_modem::modem::{mailbox_exchange, Link, OperationMode};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

/// Default wait for the gateway's answer to one frame.
pub const DEFAULT_CHUNK_TIMEOUT: Duration = Duration::from_secs(300);

pub const ACK_TOKEN: &str = "ok";
pub const NACK_TOKEN: &str = "nok";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransmitOutcome {
    Acknowledged,
    Nacked,
    Timeout,
}

/// `Some(true)` for an `ok` reply, `Some(false)` for `nok`, `None` when
/// the line is neither.  An echoed frame is never a reply.
pub fn classify_reply(line: &str) -> Option<bool> {
    if line.trim_start().starts_with(FRAME_MAGIC) {
        return None;
    }
    let mut acked = false;
    for token in line.split(|c: char| !c.is_ascii_alphanumeric()) {
        if token == NACK_TOKEN {
            return Some(false);
        }
        if token == ACK_TOKEN {
            acked = true;
        }
    }
    acked.then_some(true)
}

#[async_trait]
pub trait ChunkChannel: Send {
    fn name(&self) -> &'static str;

    /// Largest chunk payload this channel takes, before framing.
    fn mtu(&self) -> usize;

    /// Hard ceiling on one encoded frame, if the channel has one.
    fn frame_limit(&self) -> Option<usize> {
        None
    }

    /// Payload size to cut `file` into, with part numbers `digits` wide,
    /// so that every frame stays inside `frame_limit`.
    fn payload_limit(&self, file: &str, digits: usize) -> usize {
        match self.frame_limit() {
            Some(limit) => max_payload(limit, file, digits).min(self.mtu()),
            None => self.mtu(),
        }
    }

    async fn send_frame(&mut self, frame: &str) -> TransferResult<()>;

    /// Next reply line, waiting at most `wait`.
    async fn poll_reply(&mut self, wait: Duration) -> TransferResult<Option<String>>;
}

/// Send one frame and wait up to `timeout` for its verdict.
///
/// Lines that carry neither token are skipped.  There is no retry here;
/// the caller decides how often a chunk is offered.
pub async fn transmit_chunk(
    channel: &mut dyn ChunkChannel,
    frame: &ChunkFrame,
    timeout: Duration,
) -> TransferResult<TransmitOutcome> {
    let text = frame.encode()?;
    let deadline = tokio::time::Instant::now() + timeout;
    log::debug!(
        "{}: sending {} chunk {}/{} ({} bytes)",
        channel.name(),
        frame.file,
        frame.chunk.sequence + 1,
        frame.chunk.total,
        frame.chunk.payload.len()
    );
    channel.send_frame(&text).await?;

    loop {
        let now = tokio::time::Instant::now();
        if now >= deadline {
            log::warn!("{}: no answer for {} chunk {}", channel.name(), frame.file, frame.chunk.sequence);
            return Ok(TransmitOutcome::Timeout);
        }
        match channel.poll_reply(deadline - now).await? {
            Some(line) => match classify_reply(&line) {
                Some(true) => return Ok(TransmitOutcome::Acknowledged),
                Some(false) => {
                    log::warn!("{}: chunk {} of {} rejected", channel.name(), frame.chunk.sequence, frame.file);
                    return Ok(TransmitOutcome::Nacked);
                }
                None => log::debug!("{}: ignoring '{}'", channel.name(), line),
            },
            None => continue,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  SBD mailbox channel
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Frames go out as SBD text messages; replies arrive as incoming
/// messages picked up by receive-only mailbox checks.  A whole frame,
/// header and base64 included, must fit one 340-byte message.
pub struct SbdChannel<'a> {
    link: &'a Link,
    location: Option<String>,
    mtu: usize,
    check_interval: Duration,
    inbox: VecDeque<String>,
    commands: Vec<String>,
}

impl<'a> SbdChannel<'a> {
    pub fn new(link: &'a Link, mtu: usize) -> Self {
        Self {
            link,
            location: None,
            mtu: mtu.min(OperationMode::Sbd.max_mtu()),
            check_interval: Duration::from_secs(30),
            inbox: VecDeque::new(),
            commands: Vec::new(),
        }
    }

    pub fn with_location(mut self, location: Option<String>) -> Self {
        self.location = location;
        self
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    /// Incoming lines that were not chunk verdicts (gateway commands).
    pub fn take_commands(&mut self) -> Vec<String> {
        let mut commands = std::mem::take(&mut self.commands);
        commands.extend(self.inbox.drain(..).filter(|l| classify_reply(l).is_none()));
        commands
    }

    fn next_incoming(&mut self) -> Option<String> {
        let line = self.inbox.pop_front()?;
        if classify_reply(&line).is_none() {
            self.commands.push(line.clone());
        }
        Some(line)
    }
}

#[async_trait]
impl<'a> ChunkChannel for SbdChannel<'a> {
    fn name(&self) -> &'static str {
        "sbd"
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    fn frame_limit(&self) -> Option<usize> {
        Some(OperationMode::Sbd.max_mtu())
    }

    async fn send_frame(&mut self, frame: &str) -> TransferResult<()> {
        let exchange = mailbox_exchange(self.link, Some(frame), self.location.as_deref()).await?;
        self.inbox.extend(exchange.commands.iter().cloned());
        if !exchange.delivered() {
            return Err(TransferError::channel(format!(
                "message not delivered: {}",
                exchange.mo_status_text(self.location.is_some())
            )));
        }
        Ok(())
    }

    async fn poll_reply(&mut self, wait: Duration) -> TransferResult<Option<String>> {
        if let Some(line) = self.next_incoming() {
            return Ok(Some(line));
        }
        tokio::time::sleep(self.check_interval.min(wait)).await;
        let exchange = mailbox_exchange(self.link, None, self.location.as_deref()).await?;
        self.inbox.extend(exchange.commands);
        Ok(self.next_incoming())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Data call channel
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Frames are written as lines onto an established call (raw or Rudics).
pub struct DataCallChannel<'a> {
    link: &'a Link,
    mtu: usize,
}

impl<'a> DataCallChannel<'a> {
    pub fn new(link: &'a Link, mtu: usize) -> Self {
        Self {
            link,
            mtu: mtu.min(OperationMode::Rudics.max_mtu()),
        }
    }
}

#[async_trait]
impl<'a> ChunkChannel for DataCallChannel<'a> {
    fn name(&self) -> &'static str {
        "data-call"
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    async fn send_frame(&mut self, frame: &str) -> TransferResult<()> {
        let mut line = String::with_capacity(frame.len() + 2);
        line.push_str(frame);
        line.push_str("\r\n");
        self.link.write_raw(line.as_bytes()).await?;
        Ok(())
    }

    async fn poll_reply(&mut self, wait: Duration) -> TransferResult<Option<String>> {
        Ok(self.link.wait_for_line(wait).await?)
    }
}
