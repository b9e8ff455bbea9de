//! Durable queue of files waiting to go out.
//!
//! Stored as CSV with the header `FILENAME,TSENT,PART,CRC,SIZE,PATH,ACK`:
//!
//! - `TSENT` is the Unix time of the last send attempt, `0.0` = never tried
//! - `PART` counts the leading chunks already acknowledged (resume cursor)
//! - `ACK` is `1` once the whole file was acknowledged; such rows are
//!   dropped by the next housekeeping pass
//!
//! Every change is written to a sibling temp file and renamed over the
//! list, so a power cut leaves either the old or the new list.

use crate::transfer::error::{TransferError, TransferResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const HEADER: [&str; 7] = ["FILENAME", "TSENT", "PART", "CRC", "SIZE", "PATH", "ACK"];

/// Default age after which an unanswered send attempt is retried.
pub const DEFAULT_RETRY_TIMEOUT_SECS: f64 = 600.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchListEntry {
    #[serde(rename = "FILENAME")]
    pub filename: String,
    #[serde(rename = "TSENT")]
    pub last_sent: f64,
    #[serde(rename = "PART")]
    pub part: u32,
    #[serde(rename = "CRC")]
    pub crc: u32,
    #[serde(rename = "SIZE")]
    pub size: u64,
    #[serde(rename = "PATH")]
    pub path: String,
    #[serde(rename = "ACK", with = "ack_flag")]
    pub acknowledged: bool,
}

impl FetchListEntry {
    pub fn new(filename: impl Into<String>, path: impl Into<String>, crc: u32, size: u64) -> Self {
        Self {
            filename: filename.into(),
            last_sent: 0.0,
            part: 0,
            crc,
            size,
            path: path.into(),
            acknowledged: false,
        }
    }

    pub fn never_sent(&self) -> bool {
        self.last_sent == 0.0
    }

    pub fn source_path(&self) -> PathBuf {
        PathBuf::from(&self.path)
    }
}

mod ack_flag {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &bool, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u8(u8::from(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
        let raw = String::deserialize(d)?;
        match raw.trim() {
            "0" => Ok(false),
            "1" => Ok(true),
            other => Err(de::Error::custom(format!("ACK must be 0 or 1, got '{}'", other))),
        }
    }
}

/// What one housekeeping pass changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Housekeeping {
    pub purged: usize,
    pub reset: usize,
}

#[derive(Debug, Clone)]
pub struct FetchList {
    path: PathBuf,
    entries: Vec<FetchListEntry>,
}

impl FetchList {
    /// Open the list at `path`, creating it with only the header if absent.
    pub fn load_or_create(path: impl Into<PathBuf>) -> TransferResult<Self> {
        let path = path.into();
        if !path.exists() {
            log::info!("creating fetch list {}", path.display());
            let list = Self {
                path,
                entries: Vec::new(),
            };
            list.save()?;
            return Ok(list);
        }

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_path(&path)?;
        let headers = reader.headers()?.clone();
        if headers.iter().ne(HEADER.iter().copied()) {
            return Err(TransferError::invalid_entry(format!(
                "{} has header {:?}",
                path.display(),
                headers
            )));
        }
        let mut entries = Vec::new();
        for row in reader.deserialize::<FetchListEntry>() {
            entries.push(row.map_err(|e| {
                TransferError::invalid_entry(format!("{}: {}", path.display(), e))
            })?);
        }
        log::debug!("fetch list {} holds {} entries", path.display(), entries.len());
        Ok(Self { path, entries })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries(&self) -> &[FetchListEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, filename: &str) -> Option<&FetchListEntry> {
        self.entries.iter().find(|e| e.filename == filename)
    }

    fn get_mut(&mut self, filename: &str) -> TransferResult<&mut FetchListEntry> {
        self.entries
            .iter_mut()
            .find(|e| e.filename == filename)
            .ok_or_else(|| {
                TransferError::not_found(format!("{} is not in the fetch list", filename))
            })
    }

    /// Write the list (temp file, then rename).
    pub fn save(&self) -> TransferResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tmp = temp_path(&self.path);
        {
            let mut writer = csv::WriterBuilder::new()
                .has_headers(false)
                .from_path(&tmp)?;
            writer.write_record(HEADER)?;
            for entry in &self.entries {
                writer.serialize(entry)?;
            }
            writer.flush()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Queue a file.  `false` when the name is already listed.
    pub fn append(&mut self, entry: FetchListEntry) -> TransferResult<bool> {
        if self.get(&entry.filename).is_some() {
            log::debug!("{} already queued", entry.filename);
            return Ok(false);
        }
        log::info!("queued {} ({} bytes)", entry.filename, entry.size);
        self.entries.push(entry);
        self.save()?;
        Ok(true)
    }

    /// Drop acknowledged entries and re-arm attempts older than `timeout`
    /// seconds.  Nothing else is ever removed.
    pub fn housekeeping(&mut self, now: f64, timeout: f64) -> TransferResult<Housekeeping> {
        let before = self.entries.len();
        self.entries.retain(|e| !e.acknowledged);
        let mut report = Housekeeping {
            purged: before - self.entries.len(),
            reset: 0,
        };
        for entry in self.entries.iter_mut() {
            if !entry.never_sent() && now - entry.last_sent > timeout {
                log::debug!("re-arming {} (last try {:.0}s ago)", entry.filename, now - entry.last_sent);
                entry.last_sent = 0.0;
                report.reset += 1;
            }
        }
        self.save()?;
        if report.purged > 0 || report.reset > 0 {
            log::info!(
                "fetch list housekeeping: {} purged, {} re-armed",
                report.purged,
                report.reset
            );
        }
        Ok(report)
    }

    /// First entry never tried (or re-armed) and not yet acknowledged.
    pub fn next_pending(&self) -> Option<&FetchListEntry> {
        self.entries
            .iter()
            .find(|e| e.never_sent() && !e.acknowledged)
    }

    /// Record a send attempt at `now` with `part` chunks acknowledged.
    pub fn mark_sent(&mut self, filename: &str, now: f64, part: u32) -> TransferResult<()> {
        let entry = self.get_mut(filename)?;
        entry.last_sent = now;
        entry.part = part;
        self.save()
    }

    /// Record a new CRC and size for a source that changed after it was
    /// queued.  The cursor goes back to part 0.
    pub fn requeue(&mut self, filename: &str, crc: u32, size: u64) -> TransferResult<()> {
        let entry = self.get_mut(filename)?;
        entry.crc = crc;
        entry.size = size;
        entry.part = 0;
        self.save()
    }

    pub fn mark_acknowledged(&mut self, filename: &str) -> TransferResult<()> {
        let entry = self.get_mut(filename)?;
        entry.acknowledged = true;
        self.save()
    }
}

/// Seconds since the Unix epoch, as stored in `TSENT`.
pub fn unix_now() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::error::TransferErrorKind;

    fn list_in(dir: &tempfile::TempDir) -> FetchList {
        FetchList::load_or_create(dir.path().join("conf").join("flist.csv")).unwrap()
    }

    #[test]
    fn test_create_writes_header_only() {
        let dir = tempfile::tempdir().unwrap();
        let list = list_in(&dir);
        assert!(list.is_empty());
        let text = std::fs::read_to_string(list.path()).unwrap();
        assert_eq!(text, "FILENAME,TSENT,PART,CRC,SIZE,PATH,ACK\n");
    }

    #[test]
    fn test_append_is_unique_and_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let mut list = list_in(&dir);
        assert!(list
            .append(FetchListEntry::new("a.dat", "/data/a.dat", 42, 3000))
            .unwrap());
        assert!(!list
            .append(FetchListEntry::new("a.dat", "/data/a.dat", 42, 3000))
            .unwrap());

        let text = std::fs::read_to_string(list.path()).unwrap();
        assert_eq!(
            text,
            "FILENAME,TSENT,PART,CRC,SIZE,PATH,ACK\na.dat,0.0,0,42,3000,/data/a.dat,0\n"
        );
        let reloaded = FetchList::load_or_create(list.path()).unwrap();
        assert_eq!(reloaded.entries(), list.entries());
        assert!(!dir.path().join("conf/flist.csv.tmp").exists());
    }

    #[test]
    fn test_next_pending_skips_in_flight() {
        let dir = tempfile::tempdir().unwrap();
        let mut list = list_in(&dir);
        list.append(FetchListEntry::new("a", "/d/a", 1, 1)).unwrap();
        list.append(FetchListEntry::new("b", "/d/b", 2, 2)).unwrap();
        assert_eq!(list.next_pending().unwrap().filename, "a");
        list.mark_sent("a", 1000.0, 0).unwrap();
        assert_eq!(list.next_pending().unwrap().filename, "b");
        list.mark_sent("b", 1000.0, 2).unwrap();
        assert!(list.next_pending().is_none());
        assert_eq!(list.get("b").unwrap().part, 2);
    }

    #[test]
    fn test_housekeeping_purges_and_rearms() {
        let dir = tempfile::tempdir().unwrap();
        let mut list = list_in(&dir);
        for name in ["done", "stale", "fresh", "new"] {
            list.append(FetchListEntry::new(name, format!("/d/{}", name), 0, 10))
                .unwrap();
        }
        list.mark_sent("done", 100.0, 1).unwrap();
        list.mark_acknowledged("done").unwrap();
        list.mark_sent("stale", 100.0, 1).unwrap();
        list.mark_sent("fresh", 900.0, 1).unwrap();

        let report = list
            .housekeeping(1000.0, DEFAULT_RETRY_TIMEOUT_SECS)
            .unwrap();
        assert_eq!(report, Housekeeping { purged: 1, reset: 1 });
        let names: Vec<&str> = list.entries().iter().map(|e| e.filename.as_str()).collect();
        assert_eq!(names, vec!["stale", "fresh", "new"]);
        assert!(list.get("stale").unwrap().never_sent());
        assert_eq!(list.get("stale").unwrap().part, 1);
        assert_eq!(list.get("fresh").unwrap().last_sent, 900.0);
        assert_eq!(list.next_pending().unwrap().filename, "stale");
    }

    #[test]
    fn test_requeue_resets_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let mut list = list_in(&dir);
        list.append(FetchListEntry::new("a", "/d/a", 1, 10)).unwrap();
        list.mark_sent("a", 500.0, 2).unwrap();
        list.requeue("a", 7, 12).unwrap();

        let reloaded = FetchList::load_or_create(list.path()).unwrap();
        let a = reloaded.get("a").unwrap();
        assert_eq!((a.crc, a.size, a.part), (7, 12, 0));
        assert_eq!(a.last_sent, 500.0);
    }

    #[test]
    fn test_mark_unknown_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut list = list_in(&dir);
        let err = list.mark_acknowledged("ghost").unwrap_err();
        assert_eq!(err.kind, TransferErrorKind::NotFound);
    }

    #[test]
    fn test_bad_rows_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flist.csv");
        std::fs::write(
            &path,
            "FILENAME,TSENT,PART,CRC,SIZE,PATH,ACK\na,0.0,0,1,1,/d/a,yes\n",
        )
        .unwrap();
        let err = FetchList::load_or_create(&path).unwrap_err();
        assert_eq!(err.kind, TransferErrorKind::InvalidEntry);

        std::fs::write(&path, "NAME,WHEN\n").unwrap();
        let err = FetchList::load_or_create(&path).unwrap_err();
        assert_eq!(err.kind, TransferErrorKind::InvalidEntry);
    }
}
