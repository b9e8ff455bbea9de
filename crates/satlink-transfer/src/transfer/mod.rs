pub mod channel;
pub mod checksum;
pub mod chunk;
pub mod error;
pub mod fetch_list;
pub mod frame;
pub mod receiver;
pub mod sender;

pub use channel::{
    classify_reply, transmit_chunk, ChunkChannel, DataCallChannel, SbdChannel, TransmitOutcome,
    ACK_TOKEN, DEFAULT_CHUNK_TIMEOUT, NACK_TOKEN,
};
pub use checksum::{crc32, file_crc32};
pub use chunk::{chunk_bytes, reassemble, split_file, Chunk};
pub use error::{TransferError, TransferErrorKind, TransferResult};
pub use fetch_list::{unix_now, FetchList, FetchListEntry, Housekeeping, DEFAULT_RETRY_TIMEOUT_SECS};
pub use frame::{ChunkFrame, FRAME_MAGIC};
pub use receiver::{Acceptance, Receiver};
pub use sender::{FileProgress, RunReport, SchedulerOptions, TransferScheduler};
