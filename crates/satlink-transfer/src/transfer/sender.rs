//! Station-side transfer scheduler.
//!
//! Finds new files, queues them on the fetch list, and pushes queued files
//! chunk by chunk through a `ChunkChannel`.  Progress is written back to
//! the fetch list after every acknowledged chunk so a later run resumes
//! where this one stopped.

use crate::transfer::channel::{transmit_chunk, ChunkChannel, TransmitOutcome, DEFAULT_CHUNK_TIMEOUT};
use crate::transfer::checksum::file_crc32;
use crate::transfer::chunk::{chunks_crc32, remove_parts, split_file, Chunk};
use crate::transfer::error::{TransferError, TransferErrorKind, TransferResult};
use crate::transfer::fetch_list::{
    unix_now, FetchList, FetchListEntry, Housekeeping, DEFAULT_RETRY_TIMEOUT_SECS,
};
use crate::transfer::frame::ChunkFrame;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Where split parts are staged.
    pub staging: PathBuf,
    /// Width of the part-number suffix.
    pub digits: usize,
    /// Wait for the verdict on one frame.
    pub chunk_timeout: Duration,
    /// Offers per chunk before the file is left for a later run.
    pub max_attempts: u32,
    /// Age after which an unfinished file is tried again.
    pub retry_timeout_secs: f64,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            staging: PathBuf::from("/home/satice/temp"),
            digits: 3,
            chunk_timeout: DEFAULT_CHUNK_TIMEOUT,
            max_attempts: 3,
            retry_timeout_secs: DEFAULT_RETRY_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileProgress {
    pub filename: String,
    pub acknowledged_parts: u32,
    pub total_parts: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub housekeeping: Housekeeping,
    pub delivered: Vec<String>,
    pub incomplete: Vec<FileProgress>,
    /// Files that could not be read or cut, with the reason.
    pub failed: Vec<(String, String)>,
    pub frames_sent: u32,
}

pub struct TransferScheduler {
    list: FetchList,
    options: SchedulerOptions,
}

impl TransferScheduler {
    pub fn new(list: FetchList, options: SchedulerOptions) -> Self {
        Self { list, options }
    }

    pub fn list(&self) -> &FetchList {
        &self.list
    }

    pub fn options(&self) -> &SchedulerOptions {
        &self.options
    }

    pub fn into_list(self) -> FetchList {
        self.list
    }

    /// Queue every regular file in `origin` that is not listed yet.
    /// Returns the names queued.
    pub fn discover(&mut self, origin: &Path) -> TransferResult<Vec<String>> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(origin)?
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
            .map(|e| e.path())
            .collect();
        files.sort();

        let mut queued = Vec::new();
        for path in files {
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
                log::warn!("skipping {}: name is not UTF-8", path.display());
                continue;
            };
            if self.list.get(&name).is_some() {
                continue;
            }
            let size = std::fs::metadata(&path)?.len();
            let crc = file_crc32(&path)?;
            let entry = FetchListEntry::new(name.clone(), path.to_string_lossy(), crc, size);
            if self.list.append(entry)? {
                queued.push(name);
            }
        }
        if !queued.is_empty() {
            log::info!("discovered {} new file(s) in {}", queued.len(), origin.display());
        }
        Ok(queued)
    }

    /// Housekeeping, then send every pending file once.
    ///
    /// The run stops at the first file that cannot be completed: when a
    /// chunk goes unanswered `max_attempts` times the link is unlikely to
    /// carry the next file either.
    pub async fn run(&mut self, channel: &mut dyn ChunkChannel) -> TransferResult<RunReport> {
        let mut report = RunReport {
            housekeeping: self
                .list
                .housekeeping(unix_now(), self.options.retry_timeout_secs)?,
            ..RunReport::default()
        };

        while let Some(entry) = self.list.next_pending().cloned() {
            self.list.mark_sent(&entry.filename, unix_now(), entry.part)?;
            match self.deliver(channel, &entry.filename, &mut report).await? {
                Delivery::Delivered { total } => {
                    self.list.mark_acknowledged(&entry.filename)?;
                    let removed = remove_parts(&self.options.staging, &entry.filename)?;
                    log::info!(
                        "{} delivered ({} parts, {} staged parts removed)",
                        entry.filename,
                        total,
                        removed
                    );
                    report.delivered.push(entry.filename);
                }
                Delivery::Stalled(progress) => {
                    log::warn!(
                        "{} stalled at part {}/{}",
                        progress.filename,
                        progress.acknowledged_parts,
                        progress.total_parts
                    );
                    report.incomplete.push(progress);
                    break;
                }
                Delivery::Unreadable(reason) => {
                    log::error!("cannot prepare {}: {}", entry.filename, reason);
                    report.failed.push((entry.filename, reason));
                }
            }
        }
        Ok(report)
    }

    /// Push one file from its cursor to the end.
    ///
    /// The gateway only acknowledges the last chunk once the whole file
    /// checked out.  When it refuses that chunk every time, the staged
    /// parts are dropped and the file is sent again from part 0, once.
    async fn deliver(
        &mut self,
        channel: &mut dyn ChunkChannel,
        filename: &str,
        report: &mut RunReport,
    ) -> TransferResult<Delivery> {
        let mtu = channel.payload_limit(filename, self.options.digits);
        let mut restarted = false;
        loop {
            let prepared = match self.prepare(filename, mtu) {
                Ok(prepared) => prepared,
                Err(e) if e.kind == TransferErrorKind::Io => return Err(e),
                Err(e) => return Ok(Delivery::Unreadable(e.to_string())),
            };
            let total = prepared.chunks.len() as u32;
            let mut acked = prepared.cursor.min(total);
            if acked > 0 {
                log::info!("resuming {} at part {}/{}", filename, acked, total);
            }

            let mut refused_last = false;
            let mut stalled = false;
            for chunk in prepared.chunks.into_iter().skip(acked as usize) {
                let last = chunk.sequence + 1 == total;
                let frame = ChunkFrame::new(filename, prepared.file_crc, chunk);
                match self.offer(channel, &frame, report).await? {
                    Offer::Acknowledged => {
                        acked += 1;
                        self.list.mark_sent(filename, unix_now(), acked)?;
                    }
                    Offer::Refused if last && !restarted => {
                        refused_last = true;
                        break;
                    }
                    Offer::Refused | Offer::Unanswered => {
                        stalled = true;
                        break;
                    }
                }
            }

            if refused_last {
                log::warn!("gateway refused {} as a whole, sending it again from part 0", filename);
                restarted = true;
                remove_parts(&self.options.staging, filename)?;
                self.list.mark_sent(filename, unix_now(), 0)?;
                continue;
            }
            if stalled {
                return Ok(Delivery::Stalled(FileProgress {
                    filename: filename.to_string(),
                    acknowledged_parts: acked,
                    total_parts: total,
                }));
            }
            return Ok(Delivery::Delivered { total });
        }
    }

    /// Cut or reload the staged parts of `filename`.  A source that no
    /// longer matches its queued CRC is re-queued from part 0 with the
    /// CRC and size it has now.
    fn prepare(&mut self, filename: &str, mtu: usize) -> TransferResult<Prepared> {
        let entry = self
            .list
            .get(filename)
            .cloned()
            .ok_or_else(|| TransferError::not_found(format!("{} left the fetch list", filename)))?;
        let chunks = split_file(
            &entry.source_path(),
            &self.options.staging,
            mtu,
            self.options.digits,
            entry.crc,
        )?;
        let file_crc = chunks_crc32(&chunks);
        let mut cursor = entry.part;
        if file_crc != entry.crc {
            let size = chunks.iter().map(|c| c.payload.len() as u64).sum();
            log::warn!(
                "{} changed since it was queued (crc {:08x}, now {:08x}), starting over",
                filename,
                entry.crc,
                file_crc
            );
            self.list.requeue(filename, file_crc, size)?;
            cursor = 0;
        }
        Ok(Prepared {
            chunks,
            file_crc,
            cursor,
        })
    }

    /// Offer one frame up to `max_attempts` times.
    async fn offer(
        &self,
        channel: &mut dyn ChunkChannel,
        frame: &ChunkFrame,
        report: &mut RunReport,
    ) -> TransferResult<Offer> {
        let mut last = Offer::Unanswered;
        for attempt in 1..=self.options.max_attempts {
            report.frames_sent += 1;
            match transmit_chunk(channel, frame, self.options.chunk_timeout).await {
                Ok(TransmitOutcome::Acknowledged) => return Ok(Offer::Acknowledged),
                Ok(outcome) => {
                    log::info!(
                        "{} part {} attempt {}: {:?}",
                        frame.file,
                        frame.chunk.sequence,
                        attempt,
                        outcome
                    );
                    last = match outcome {
                        TransmitOutcome::Nacked => Offer::Refused,
                        _ => Offer::Unanswered,
                    };
                }
                Err(e) if e.kind == TransferErrorKind::Channel => {
                    log::warn!(
                        "{} part {} attempt {}: {}",
                        frame.file,
                        frame.chunk.sequence,
                        attempt,
                        e
                    );
                    last = Offer::Unanswered;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(last)
    }
}

struct Prepared {
    chunks: Vec<Chunk>,
    file_crc: u32,
    cursor: u32,
}

/// How the last offer of a chunk ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Offer {
    Acknowledged,
    /// The final attempt drew a `nok`.
    Refused,
    Unanswered,
}

enum Delivery {
    Delivered { total: u32 },
    Stalled(FileProgress),
    /// The source could not be read or cut.
    Unreadable(String),
}
