//! Durable log abstraction.
//!
//! The on-disk segment format is an external collaborator: the replica
//! only relies on the [`LogStore`] contract. Entries occupy the index
//! range `(prev_index, last_index]` and are contiguous; truncation from
//! the left happens only once a snapshot covers the removed prefix,
//! truncation from the right only on uncommitted suffixes.

use std::collections::VecDeque;
use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use raftforge_core::{LogIndex, RaftError, Result};

use crate::entry::Entry;

/// Contract of the append-only entry store.
pub trait LogStore: Send + Sync {
    /// Index before the first stored entry. Entries start at
    /// `prev_index() + 1`.
    fn prev_index(&self) -> LogIndex;

    /// Index of the last stored entry, or `prev_index()` when empty.
    fn last_index(&self) -> LogIndex;

    /// Fetch the entry at `index`.
    fn get(&self, index: LogIndex) -> Result<Entry>;

    /// Append one entry; its index must be `last_index() + 1`.
    fn append(&mut self, entry: Entry) -> Result<()>;

    /// Drop all entries with index `<= index`.
    fn remove_lte(&mut self, index: LogIndex) -> Result<()>;

    /// Drop all entries with index `>= index`.
    fn remove_gte(&mut self, index: LogIndex) -> Result<()>;

    /// Drop everything and restart the log after `index`.
    fn reset(&mut self, index: LogIndex) -> Result<()>;

    /// Flush buffered appends to durable media.
    fn sync(&mut self) -> Result<()>;
}

/// In-memory [`LogStore`], used by tests and available for volatile
/// deployments.
#[derive(Debug, Default)]
pub struct MemLog {
    prev: LogIndex,
    entries: VecDeque<Entry>,
}

impl MemLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no entries are stored.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl LogStore for MemLog {
    fn prev_index(&self) -> LogIndex {
        self.prev
    }

    fn last_index(&self) -> LogIndex {
        self.prev + self.entries.len() as u64
    }

    fn get(&self, index: LogIndex) -> Result<Entry> {
        if index <= self.prev || index > self.last_index() {
            return Err(RaftError::Storage(format!(
                "no entry at index {index} (have ({}, {}])",
                self.prev,
                self.last_index()
            )));
        }
        Ok(self.entries[(index - self.prev - 1) as usize].clone())
    }

    fn append(&mut self, entry: Entry) -> Result<()> {
        if entry.index != self.last_index() + 1 {
            return Err(RaftError::Storage(format!(
                "append at index {}, want {}",
                entry.index,
                self.last_index() + 1
            )));
        }
        self.entries.push_back(entry);
        Ok(())
    }

    fn remove_lte(&mut self, index: LogIndex) -> Result<()> {
        while let Some(front) = self.entries.front() {
            if front.index > index {
                break;
            }
            self.entries.pop_front();
        }
        if index > self.prev {
            self.prev = index;
        }
        Ok(())
    }

    fn remove_gte(&mut self, index: LogIndex) -> Result<()> {
        while let Some(back) = self.entries.back() {
            if back.index < index {
                break;
            }
            self.entries.pop_back();
        }
        Ok(())
    }

    fn reset(&mut self, index: LogIndex) -> Result<()> {
        self.entries.clear();
        self.prev = index;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Single-file [`LogStore`]: an 8-byte `prev_index` header followed by
/// length-prefixed entry records. The record offsets are rebuilt by
/// scanning at open. Segmented engines can replace this behind the
/// trait; the replica does not care.
#[derive(Debug)]
pub struct FileLog {
    path: PathBuf,
    file: fs::File,
    /// Reads share the file cursor; they serialize on this gate.
    read_gate: std::sync::Mutex<()>,
    prev: LogIndex,
    /// Byte offset of each record, in index order.
    offsets: Vec<u64>,
    end: u64,
}

const LOG_HEADER: u64 = 8;

impl FileLog {
    /// Open or create the log file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let len = file.metadata()?.len();
        if len == 0 {
            file.write_all(&0u64.to_be_bytes())?;
            file.sync_all()?;
            return Ok(Self {
                path,
                file,
                read_gate: std::sync::Mutex::new(()),
                prev: 0,
                offsets: Vec::new(),
                end: LOG_HEADER,
            });
        }

        let mut header = [0u8; 8];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut header)?;
        let prev = u64::from_be_bytes(header);

        let mut offsets = Vec::new();
        let mut at = LOG_HEADER;
        while at < len {
            let mut record_len = [0u8; 4];
            file.seek(SeekFrom::Start(at))?;
            if file.read_exact(&mut record_len).is_err() {
                break; // torn tail from a crash; drop it
            }
            let record_len = u32::from_be_bytes(record_len) as u64;
            if at + 4 + record_len > len {
                break;
            }
            offsets.push(at);
            at += 4 + record_len;
        }
        let end = at.min(len);
        file.set_len(end)?;

        Ok(Self {
            path,
            file,
            read_gate: std::sync::Mutex::new(()),
            prev,
            offsets,
            end,
        })
    }

    fn read_record(&self, offset: u64) -> Result<Entry> {
        let _gate = self.read_gate.lock().expect("log read gate");
        let mut file = &self.file;
        file.seek(SeekFrom::Start(offset))?;
        let mut record_len = [0u8; 4];
        file.read_exact(&mut record_len)?;
        let mut buf = vec![0u8; u32::from_be_bytes(record_len) as usize];
        file.read_exact(&mut buf)?;
        Entry::from_bytes(&buf).map_err(|e| RaftError::Storage(format!("corrupt log record: {e}")))
    }

    fn write_header(&mut self) -> Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&self.prev.to_be_bytes())?;
        Ok(())
    }
}

impl LogStore for FileLog {
    fn prev_index(&self) -> LogIndex {
        self.prev
    }

    fn last_index(&self) -> LogIndex {
        self.prev + self.offsets.len() as u64
    }

    fn get(&self, index: LogIndex) -> Result<Entry> {
        if index <= self.prev || index > self.last_index() {
            return Err(RaftError::Storage(format!(
                "no entry at index {index} (have ({}, {}])",
                self.prev,
                self.last_index()
            )));
        }
        self.read_record(self.offsets[(index - self.prev - 1) as usize])
    }

    fn append(&mut self, entry: Entry) -> Result<()> {
        if entry.index != self.last_index() + 1 {
            return Err(RaftError::Storage(format!(
                "append at index {}, want {}",
                entry.index,
                self.last_index() + 1
            )));
        }
        let bytes = entry.to_bytes();
        self.file.seek(SeekFrom::Start(self.end))?;
        self.file.write_all(&(bytes.len() as u32).to_be_bytes())?;
        self.file.write_all(&bytes)?;
        self.offsets.push(self.end);
        self.end += 4 + bytes.len() as u64;
        Ok(())
    }

    fn remove_lte(&mut self, index: LogIndex) -> Result<()> {
        if index <= self.prev {
            return Ok(());
        }
        let keep_from = (index - self.prev).min(self.offsets.len() as u64) as usize;
        let kept: Vec<Entry> = self.offsets[keep_from..]
            .iter()
            .map(|&offset| self.read_record(offset))
            .collect::<Result<_>>()?;

        let tmp_path = self.path.with_extension("compact");
        let mut tmp = fs::File::create(&tmp_path)?;
        tmp.write_all(&index.to_be_bytes())?;
        let mut offsets = Vec::with_capacity(kept.len());
        let mut end = LOG_HEADER;
        for entry in &kept {
            let bytes = entry.to_bytes();
            tmp.write_all(&(bytes.len() as u32).to_be_bytes())?;
            tmp.write_all(&bytes)?;
            offsets.push(end);
            end += 4 + bytes.len() as u64;
        }
        tmp.sync_all()?;
        fs::rename(&tmp_path, &self.path)?;

        self.file = fs::OpenOptions::new().read(true).write(true).open(&self.path)?;
        self.prev = index;
        self.offsets = offsets;
        self.end = end;
        Ok(())
    }

    fn remove_gte(&mut self, index: LogIndex) -> Result<()> {
        if index > self.last_index() {
            return Ok(());
        }
        let keep = index.saturating_sub(self.prev + 1) as usize;
        self.end = self.offsets.get(keep).copied().unwrap_or(self.end);
        self.offsets.truncate(keep);
        self.file.set_len(self.end)?;
        Ok(())
    }

    fn reset(&mut self, index: LogIndex) -> Result<()> {
        self.offsets.clear();
        self.end = LOG_HEADER;
        self.file.set_len(LOG_HEADER)?;
        self.prev = index;
        self.write_header()?;
        self.file.sync_all()?;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(n: u64) -> MemLog {
        let mut log = MemLog::new();
        for i in 1..=n {
            log.append(Entry::user(i, 1, format!("cmd{i}").into_bytes())).unwrap();
        }
        log
    }

    #[test]
    fn test_empty() {
        let log = MemLog::new();
        assert_eq!(log.prev_index(), 0);
        assert_eq!(log.last_index(), 0);
        assert!(log.get(1).is_err());
    }

    #[test]
    fn test_append_and_get() {
        let log = filled(3);
        assert_eq!(log.last_index(), 3);
        assert_eq!(log.get(2).unwrap().data, b"cmd2");
        assert!(log.get(0).is_err());
        assert!(log.get(4).is_err());
    }

    #[test]
    fn test_append_requires_contiguity() {
        let mut log = filled(2);
        assert!(log.append(Entry::user(5, 1, Vec::new())).is_err());
        assert!(log.append(Entry::user(3, 1, Vec::new())).is_ok());
    }

    #[test]
    fn test_remove_gte() {
        let mut log = filled(5);
        log.remove_gte(3).unwrap();
        assert_eq!(log.last_index(), 2);
        assert!(log.get(3).is_err());
        // removing past the end is a no-op
        log.remove_gte(10).unwrap();
        assert_eq!(log.last_index(), 2);
    }

    #[test]
    fn test_remove_lte() {
        let mut log = filled(5);
        log.remove_lte(2).unwrap();
        assert_eq!(log.prev_index(), 2);
        assert_eq!(log.last_index(), 5);
        assert!(log.get(2).is_err());
        assert_eq!(log.get(3).unwrap().index, 3);
    }

    #[test]
    fn test_reset() {
        let mut log = filled(5);
        log.reset(9).unwrap();
        assert_eq!(log.prev_index(), 9);
        assert_eq!(log.last_index(), 9);
        assert!(log.is_empty());
        log.append(Entry::user(10, 2, Vec::new())).unwrap();
        assert_eq!(log.last_index(), 10);
    }

    #[test]
    fn test_file_log_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");

        let mut log = FileLog::open(&path).unwrap();
        for i in 1..=4 {
            log.append(Entry::user(i, 1, format!("cmd{i}").into_bytes())).unwrap();
        }
        log.sync().unwrap();
        drop(log);

        let log = FileLog::open(&path).unwrap();
        assert_eq!(log.prev_index(), 0);
        assert_eq!(log.last_index(), 4);
        assert_eq!(log.get(3).unwrap().data, b"cmd3");
    }

    #[test]
    fn test_file_log_remove_gte() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");

        let mut log = FileLog::open(&path).unwrap();
        for i in 1..=5 {
            log.append(Entry::user(i, 1, vec![i as u8])).unwrap();
        }
        log.remove_gte(3).unwrap();
        assert_eq!(log.last_index(), 2);
        log.append(Entry::user(3, 2, b"new".to_vec())).unwrap();
        log.sync().unwrap();
        drop(log);

        let log = FileLog::open(&path).unwrap();
        assert_eq!(log.last_index(), 3);
        assert_eq!(log.get(3).unwrap().term, 2);
    }

    #[test]
    fn test_file_log_compaction_and_reset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");

        let mut log = FileLog::open(&path).unwrap();
        for i in 1..=6 {
            log.append(Entry::user(i, 1, vec![i as u8])).unwrap();
        }
        log.remove_lte(4).unwrap();
        assert_eq!(log.prev_index(), 4);
        assert_eq!(log.last_index(), 6);
        assert!(log.get(4).is_err());
        assert_eq!(log.get(5).unwrap().data, vec![5]);
        drop(log);

        let mut log = FileLog::open(&path).unwrap();
        assert_eq!(log.prev_index(), 4);
        assert_eq!(log.last_index(), 6);

        log.reset(10).unwrap();
        assert_eq!(log.prev_index(), 10);
        assert_eq!(log.last_index(), 10);
        drop(log);

        let log = FileLog::open(&path).unwrap();
        assert_eq!(log.prev_index(), 10);
        assert_eq!(log.last_index(), 10);
    }
}
