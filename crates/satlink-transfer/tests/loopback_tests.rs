use async_trait::async_trait;
use satlink_transfer::transfer::{
    ChunkChannel, FetchList, Receiver, SchedulerOptions, TransferResult, TransferScheduler,
};
use std::collections::VecDeque;
use std::path::Path;
use std::time::Duration;

/// Station and gateway in one process.  `corrupt` flips a payload byte
/// in the n-th frame on the way out; frames numbered below
/// `wrong_file_crc_below` carry a bad whole-file CRC.
struct Loopback {
    receiver: Receiver,
    replies: VecDeque<String>,
    mtu: usize,
    frames: u32,
    corrupt: Option<u32>,
    wrong_file_crc_below: u32,
}

impl Loopback {
    fn new(gateway: &Path, mtu: usize) -> Self {
        Self {
            receiver: Receiver::new(gateway),
            replies: VecDeque::new(),
            mtu,
            frames: 0,
            corrupt: None,
            wrong_file_crc_below: 0,
        }
    }
}

#[async_trait]
impl ChunkChannel for Loopback {
    fn name(&self) -> &'static str {
        "loopback"
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    async fn send_frame(&mut self, frame: &str) -> TransferResult<()> {
        let n = self.frames;
        self.frames += 1;
        let text = if n < self.wrong_file_crc_below {
            let fields: Vec<&str> = frame.splitn(7, '|').collect();
            format!(
                "{}|{}|{}|{}|{}|{}|{}",
                fields[0], fields[1], fields[2], fields[3], fields[4], "00c0ffee", fields[6]
            )
        } else if self.corrupt == Some(n) {
            let (head, payload) = frame.rsplit_once('|').unwrap();
            let flipped: String = payload
                .chars()
                .enumerate()
                .map(|(i, c)| if i == 0 { if c == 'A' { 'B' } else { 'A' } } else { c })
                .collect();
            format!("{}|{}", head, flipped)
        } else {
            frame.to_string()
        };
        let verdict = self.receiver.accept(&text)?;
        self.replies.push_back(verdict.reply().to_string());
        Ok(())
    }

    async fn poll_reply(&mut self, _wait: Duration) -> TransferResult<Option<String>> {
        Ok(self.replies.pop_front())
    }
}

fn setup(len: usize) -> (tempfile::TempDir, Vec<u8>, TransferScheduler) {
    let dir = tempfile::tempdir().unwrap();
    let origin = dir.path().join("new");
    std::fs::create_dir_all(&origin).unwrap();
    let data: Vec<u8> = (0..len).map(|i| (i * 13 % 256) as u8).collect();
    std::fs::write(origin.join("obs.dat"), &data).unwrap();

    let list = FetchList::load_or_create(dir.path().join("flist.csv")).unwrap();
    let mut scheduler = TransferScheduler::new(
        list,
        SchedulerOptions {
            staging: dir.path().join("temp"),
            ..SchedulerOptions::default()
        },
    );
    scheduler.discover(&origin).unwrap();
    (dir, data, scheduler)
}

#[tokio::test(start_paused = true)]
async fn test_file_crosses_in_mtu_chunks() {
    let (dir, data, mut scheduler) = setup(3000);
    let mut channel = Loopback::new(&dir.path().join("gateway"), 1000);

    let report = scheduler.run(&mut channel).await.unwrap();
    assert_eq!(report.delivered, vec!["obs.dat"]);
    assert_eq!(channel.frames, 3);
    assert_eq!(
        std::fs::read(dir.path().join("gateway").join("obs.dat")).unwrap(),
        data
    );
    assert!(scheduler.list().get("obs.dat").unwrap().acknowledged);

    // acknowledged rows go at the next pass, and stay gone on disk
    let report = scheduler.run(&mut channel).await.unwrap();
    assert_eq!(report.housekeeping.purged, 1);
    let reloaded = FetchList::load_or_create(dir.path().join("flist.csv")).unwrap();
    assert!(reloaded.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_corrupted_chunk_is_resent() {
    let (dir, data, mut scheduler) = setup(2500);
    let mut channel = Loopback::new(&dir.path().join("gateway"), 1000);
    channel.corrupt = Some(1);

    let report = scheduler.run(&mut channel).await.unwrap();
    assert_eq!(report.delivered, vec!["obs.dat"]);
    // chunk 1 went twice
    assert_eq!(channel.frames, 4);
    assert_eq!(report.frames_sent, 4);
    assert_eq!(
        std::fs::read(dir.path().join("gateway").join("obs.dat")).unwrap(),
        data
    );
}

#[tokio::test(start_paused = true)]
async fn test_failed_file_check_resends_from_start() {
    let (dir, data, mut scheduler) = setup(2500);
    let gateway = dir.path().join("gateway");
    let mut channel = Loopback::new(&gateway, 1000);
    channel.wrong_file_crc_below = 3;

    let report = scheduler.run(&mut channel).await.unwrap();
    // 3 frames, the last one twice more, then 3 again from part 0
    assert_eq!(report.frames_sent, 8);
    assert_eq!(report.delivered, vec!["obs.dat"]);
    assert_eq!(std::fs::read(gateway.join("obs.dat")).unwrap(), data);
}

#[tokio::test(start_paused = true)]
async fn test_delivered_means_written() {
    let (dir, _, mut scheduler) = setup(2500);
    let gateway = dir.path().join("gateway");
    // same size, different bytes, after the file was queued
    let changed: Vec<u8> = (0..2500u32).map(|i| (i % 7) as u8).collect();
    std::fs::write(dir.path().join("new").join("obs.dat"), &changed).unwrap();
    let mut channel = Loopback::new(&gateway, 1000);

    let report = scheduler.run(&mut channel).await.unwrap();
    assert_eq!(report.delivered, vec!["obs.dat"]);
    assert_eq!(std::fs::read(gateway.join("obs.dat")).unwrap(), changed);
    assert!(scheduler.list().get("obs.dat").unwrap().acknowledged);
}

#[tokio::test(start_paused = true)]
async fn test_empty_file_arrives_empty() {
    let (dir, _, mut scheduler) = setup(10);
    let origin = dir.path().join("new");
    std::fs::write(origin.join("empty.dat"), b"").unwrap();
    scheduler.discover(&origin).unwrap();
    let gateway = dir.path().join("gateway");
    let mut channel = Loopback::new(&gateway, 1000);

    let report = scheduler.run(&mut channel).await.unwrap();
    assert_eq!(report.delivered, vec!["obs.dat", "empty.dat"]);
    assert_eq!(channel.frames, 2);
    assert!(std::fs::read(gateway.join("empty.dat")).unwrap().is_empty());
}
