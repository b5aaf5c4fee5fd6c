//! Snapshot storage.
//!
//! Snapshots live in a directory as `<index>-<term>.meta` /
//! `<index>-<term>.snap` pairs: bincode-encoded metadata next to the
//! opaque state machine payload. The most recent snapshot is the one
//! with the highest index; older pairs are pruned after a successful
//! write.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use raftforge_core::{LogIndex, RaftError, Result, Term};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::membership::ClusterConfig;

/// Metadata of a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    /// Snapshot covers the log up to and including this index.
    pub index: LogIndex,
    /// Term of the entry at `index`.
    pub term: Term,
    /// Latest configuration whose index is `<= index`.
    pub config: ClusterConfig,
    /// Payload size in bytes.
    pub size: u64,
}

/// Directory-backed snapshot store.
#[derive(Debug)]
pub struct SnapshotStore {
    dir: PathBuf,
    meta: Option<SnapshotMeta>,
}

impl SnapshotStore {
    /// Open the store, scanning for the most recent snapshot.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut latest: Option<SnapshotMeta> = None;
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) != Some("meta") {
                continue;
            }
            let raw = fs::read(&path)?;
            let meta: SnapshotMeta = bincode::deserialize(&raw)
                .map_err(|e| RaftError::Storage(format!("corrupt snapshot meta {path:?}: {e}")))?;
            if latest.as_ref().map(|m| meta.index > m.index).unwrap_or(true) {
                latest = Some(meta);
            }
        }
        Ok(Self { dir, meta: latest })
    }

    /// Most recent snapshot metadata, if any.
    pub fn meta(&self) -> Option<&SnapshotMeta> {
        self.meta.as_ref()
    }

    /// Index of the most recent snapshot; zero when none.
    pub fn index(&self) -> LogIndex {
        self.meta.as_ref().map(|m| m.index).unwrap_or(0)
    }

    /// Term of the most recent snapshot; zero when none.
    pub fn term(&self) -> Term {
        self.meta.as_ref().map(|m| m.term).unwrap_or(0)
    }

    /// Open a sink for a new snapshot at the given position.
    pub fn new_sink(
        &mut self,
        index: LogIndex,
        term: Term,
        config: ClusterConfig,
    ) -> Result<SnapshotSink> {
        if index < self.index() {
            return Err(RaftError::Storage(format!(
                "snapshot index {index} below current {}",
                self.index()
            )));
        }
        let payload_path = self.dir.join(format!("{index}-{term}.snap"));
        let file = fs::File::create(&payload_path)?;
        Ok(SnapshotSink { payload_path, file, index, term, config, written: 0 })
    }

    /// Record a finished sink, making its snapshot the most recent.
    pub(crate) fn commit(&mut self, meta: SnapshotMeta) -> Result<()> {
        let raw = bincode::serialize(&meta)
            .map_err(|e| RaftError::Storage(format!("encode snapshot meta: {e}")))?;
        let meta_path = self.dir.join(format!("{}-{}.meta", meta.index, meta.term));
        let tmp = meta_path.with_extension("tmp");
        fs::write(&tmp, raw)?;
        fs::rename(&tmp, &meta_path)?;
        debug!(index = meta.index, term = meta.term, size = meta.size, "snapshot recorded");
        self.meta = Some(meta);
        self.prune();
        Ok(())
    }

    /// Store a snapshot received from a leader.
    pub fn install(&mut self, meta: SnapshotMeta, payload: &[u8]) -> Result<()> {
        if payload.len() as u64 != meta.size {
            return Err(RaftError::Storage(format!(
                "snapshot payload is {} bytes, meta says {}",
                payload.len(),
                meta.size
            )));
        }
        let payload_path = self.dir.join(format!("{}-{}.snap", meta.index, meta.term));
        fs::write(&payload_path, payload)?;
        self.commit(meta)
    }

    /// Read the payload of the most recent snapshot.
    pub fn read_payload(&self) -> Result<Vec<u8>> {
        let meta = self.meta.as_ref().ok_or_else(|| {
            RaftError::Storage("no snapshot present".into())
        })?;
        let path = self.dir.join(format!("{}-{}.snap", meta.index, meta.term));
        Ok(fs::read(path)?)
    }

    fn prune(&mut self) {
        let keep = match &self.meta {
            Some(meta) => format!("{}-{}", meta.index, meta.term),
            None => return,
        };
        let Ok(entries) = fs::read_dir(&self.dir) else { return };
        for entry in entries.flatten() {
            let path = entry.path();
            let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
            if stem != keep {
                let _ = fs::remove_file(path);
            }
        }
    }
}

/// In-progress snapshot being written by the state machine.
#[derive(Debug)]
pub struct SnapshotSink {
    payload_path: PathBuf,
    file: fs::File,
    index: LogIndex,
    term: Term,
    config: ClusterConfig,
    written: u64,
}

impl SnapshotSink {
    /// Finish the snapshot and return its metadata. The caller records
    /// it with the store to make it visible.
    pub(crate) fn finish(mut self) -> Result<SnapshotMeta> {
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(SnapshotMeta {
            index: self.index,
            term: self.term,
            config: self.config,
            size: self.written,
        })
    }

    /// Abandon the snapshot, removing the partial payload.
    pub(crate) fn abandon(self) {
        let _ = fs::remove_file(&self.payload_path);
    }
}

impl Write for SnapshotSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::Node;

    fn test_config() -> ClusterConfig {
        let mut config = ClusterConfig::new([Node::voter(1, "a:7000")]);
        config.index = 1;
        config.term = 1;
        config
    }

    #[test]
    fn test_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();
        assert!(store.meta().is_none());
        assert_eq!(store.index(), 0);
        assert_eq!(store.term(), 0);
    }

    #[test]
    fn test_sink_then_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SnapshotStore::open(dir.path()).unwrap();

        let mut sink = store.new_sink(10, 2, test_config()).unwrap();
        sink.write_all(b"state bytes").unwrap();
        let meta = sink.finish().unwrap();
        assert_eq!(meta.size, 11);
        store.commit(meta.clone()).unwrap();

        assert_eq!(store.index(), 10);
        assert_eq!(store.read_payload().unwrap(), b"state bytes");

        let reopened = SnapshotStore::open(dir.path()).unwrap();
        assert_eq!(reopened.meta(), Some(&meta));
    }

    #[test]
    fn test_install_checks_size() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SnapshotStore::open(dir.path()).unwrap();
        let meta = SnapshotMeta { index: 4, term: 1, config: test_config(), size: 3 };
        assert!(store.install(meta.clone(), b"toolong").is_err());
        store.install(meta, b"abc").unwrap();
        assert_eq!(store.read_payload().unwrap(), b"abc");
    }

    #[test]
    fn test_newer_snapshot_prunes_older(){
        let dir = tempfile::tempdir().unwrap();
        let mut store = SnapshotStore::open(dir.path()).unwrap();
        store
            .install(SnapshotMeta { index: 3, term: 1, config: test_config(), size: 1 }, b"a")
            .unwrap();
        store
            .install(SnapshotMeta { index: 8, term: 2, config: test_config(), size: 1 }, b"b")
            .unwrap();

        let reopened = SnapshotStore::open(dir.path()).unwrap();
        assert_eq!(reopened.index(), 8);
        let files: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(files.len(), 2);
    }
}
