//! Storage façade: stable vars, log, snapshots and configuration
//! recovery.
//!
//! The main task is the only writer of the log; replicator tasks read it
//! through the shared lock while building AppendEntries batches, which
//! keeps compaction from invalidating an in-progress read. Violations of
//! the log contract (non-contiguous append, term regression) are fatal
//! and panic the main task.

use std::sync::{Arc, Mutex};

use raftforge_core::{ClusterId, LogIndex, NodeId, RaftError, Result, Term};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::entry::{Entry, EntryType};
use crate::log::LogStore;
use crate::membership::{ClusterConfig, Configs};
use crate::snapshot::{SnapshotMeta, SnapshotStore};
use crate::stable::Stable;

/// Hook invoked right before a vote is persisted. Tests inject guards
/// to exercise crash points around the vote write.
pub trait VoteGuard: Send + Sync {
    /// Called with the term and candidate about to be recorded. An error
    /// aborts the grant.
    fn granting_vote(&mut self, term: Term, candidate: NodeId) -> Result<()>;
}

/// Shared handle to the log store.
pub(crate) type SharedLog = Arc<RwLock<Box<dyn LogStore>>>;

/// Shared handle to the snapshot store.
pub(crate) type SharedSnapshots = Arc<Mutex<SnapshotStore>>;

/// All persistent state of a replica.
pub struct Storage {
    stable: Box<dyn Stable>,
    vote_guard: Option<Box<dyn VoteGuard>>,

    pub(crate) cluster_id: ClusterId,
    pub(crate) node_id: NodeId,
    pub(crate) term: Term,
    pub(crate) voted_for: NodeId,

    pub(crate) log: SharedLog,
    pub(crate) last_log_index: LogIndex,
    pub(crate) last_log_term: Term,

    pub(crate) snaps: SharedSnapshots,
    pub(crate) configs: Configs,
}

impl Storage {
    /// Open storage: load vars and snapshot metadata, then rehydrate the
    /// configuration pair by scanning the log backwards for the two most
    /// recent config entries, falling back to the snapshot's config.
    pub fn open(
        stable: Box<dyn Stable>,
        log: Box<dyn LogStore>,
        snaps: SnapshotStore,
    ) -> Result<Self> {
        let vars = stable.get();

        let (mut last_log_index, mut last_log_term) = (snaps.index(), snaps.term());
        if log.last_index() > log.prev_index() {
            let last = log.get(log.last_index())?;
            if last.index != log.last_index() {
                panic!("log.get({}) returned index {}", log.last_index(), last.index);
            }
            last_log_index = last.index;
            last_log_term = last.term;
        }

        // two most recent config entries, newest first
        let mut configs = Configs::default();
        let mut need = 2;
        let mut at = last_log_index;
        while need > 0 && at > snaps.index() && at > log.prev_index() {
            let entry = log.get(at)?;
            if entry.typ == EntryType::Config {
                let config = ClusterConfig::from_entry(&entry)
                    .map_err(|e| RaftError::Storage(format!("config entry {at}: {e}")))?;
                if need == 2 {
                    configs.latest = config;
                } else {
                    configs.committed = config;
                }
                need -= 1;
            }
            at -= 1;
        }
        let snap_config = snaps.meta().map(|m| m.config.clone()).unwrap_or_default();
        if need == 2 {
            configs.latest = snap_config.clone();
            need -= 1;
        }
        if need == 1 {
            configs.committed = snap_config;
        }

        debug!(
            term = vars.term,
            last_log_index,
            latest_config = configs.latest.index,
            committed_config = configs.committed.index,
            "storage opened"
        );

        Ok(Self {
            stable,
            vote_guard: None,
            cluster_id: vars.cluster_id,
            node_id: vars.node_id,
            term: vars.term,
            voted_for: vars.voted_for,
            log: Arc::new(RwLock::new(log)),
            last_log_index,
            last_log_term,
            snaps: Arc::new(Mutex::new(snaps)),
            configs,
        })
    }

    /// Inject a vote guard. Test-facing.
    pub fn set_vote_guard(&mut self, guard: Box<dyn VoteGuard>) {
        self.vote_guard = Some(guard);
    }

    /// Cluster and node identity; zeroes mean unset.
    pub fn identity(&self) -> (ClusterId, NodeId) {
        (self.cluster_id, self.node_id)
    }

    /// Committed and latest configurations.
    pub fn configs(&self) -> &Configs {
        &self.configs
    }

    /// Current term.
    pub fn term(&self) -> Term {
        self.term
    }

    /// Index and term of the last log entry.
    pub fn last_log(&self) -> (LogIndex, Term) {
        (self.last_log_index, self.last_log_term)
    }

    /// Set the identity. Rejected when a different identity exists.
    pub fn set_identity(&mut self, cluster_id: ClusterId, node_id: NodeId) -> Result<()> {
        if cluster_id == 0 {
            return Err(RaftError::InvalidConfig("cluster id must be nonzero".into()));
        }
        if node_id == 0 {
            return Err(RaftError::InvalidConfig("node id must be nonzero".into()));
        }
        if cluster_id == self.cluster_id && node_id == self.node_id {
            return Ok(());
        }
        if self.cluster_id != 0 || self.node_id != 0 {
            return Err(RaftError::IdentityAlreadySet);
        }
        self.stable.set_identity(cluster_id, node_id)?;
        self.cluster_id = cluster_id;
        self.node_id = node_id;
        Ok(())
    }

    /// Index covered by the most recent snapshot.
    pub(crate) fn snap_index(&self) -> LogIndex {
        self.snaps.lock().expect("snapshot store lock").index()
    }

    /// Term of the most recent snapshot.
    pub(crate) fn snap_term(&self) -> Term {
        self.snaps.lock().expect("snapshot store lock").term()
    }

    /// Advance the term, clearing the vote. Term regression is fatal.
    pub(crate) fn set_term(&mut self, term: Term) {
        if term == self.term {
            return;
        }
        if term < self.term {
            panic!("term cannot move from {} to {}", self.term, term);
        }
        if let Err(e) = self.stable.set_vote(term, 0) {
            panic!("stable.set_vote({term}, 0) failed: {e}");
        }
        self.term = term;
        self.voted_for = 0;
    }

    /// Record a granted vote (and any term advance) atomically.
    pub(crate) fn set_voted_for(&mut self, term: Term, candidate: NodeId) {
        if term < self.term {
            panic!("term cannot move from {} to {}", self.term, term);
        }
        if let Some(guard) = self.vote_guard.as_mut() {
            if let Err(e) = guard.granting_vote(term, candidate) {
                panic!("vote guard rejected ({term}, {candidate}): {e}");
            }
        }
        if let Err(e) = self.stable.set_vote(term, candidate) {
            panic!("stable.set_vote({term}, {candidate}) failed: {e}");
        }
        self.term = term;
        self.voted_for = candidate;
    }

    /// Term of the entry at `index`, consulting the snapshot boundary.
    pub(crate) async fn entry_term(&self, index: LogIndex) -> Result<Term> {
        if index == 0 {
            return Ok(0);
        }
        if index == self.last_log_index {
            return Ok(self.last_log_term);
        }
        if index == self.snap_index() {
            return Ok(self.snap_term());
        }
        Ok(self.log.read().await.get(index)?.term)
    }

    /// Fetch the entry at `index` from the log.
    pub(crate) async fn get_entry(&self, index: LogIndex) -> Result<Entry> {
        self.log.read().await.get(index)
    }

    /// Append one entry; contiguity violations are fatal.
    pub(crate) async fn append_entry(&mut self, entry: Entry) {
        if entry.index != self.last_log_index + 1 {
            panic!(
                "append at index {}, expected {}",
                entry.index,
                self.last_log_index + 1
            );
        }
        let (index, term) = (entry.index, entry.term);
        if let Err(e) = self.log.write().await.append(entry) {
            panic!("log append({index}) failed: {e}");
        }
        self.last_log_index = index;
        self.last_log_term = term;
    }

    /// Flush the log to durable media.
    pub(crate) async fn sync_log(&self) {
        if let Err(e) = self.log.write().await.sync() {
            panic!("log sync failed: {e}");
        }
    }

    /// Drop the uncommitted suffix starting at `index`. `prev_term` is
    /// the term of the entry at `index - 1`.
    pub(crate) async fn remove_gte(&mut self, index: LogIndex, prev_term: Term) {
        if let Err(e) = self.log.write().await.remove_gte(index) {
            panic!("log remove_gte({index}) failed: {e}");
        }
        self.last_log_index = index - 1;
        self.last_log_term = prev_term;
    }

    /// Compact the snapshot-covered prefix up to `index`.
    pub(crate) async fn remove_lte(&mut self, index: LogIndex) -> Result<()> {
        let snap_index = self.snap_index();
        if index > snap_index {
            return Err(RaftError::Storage(format!(
                "cannot compact to {index}: snapshot covers only {snap_index}"
            )));
        }
        self.log.write().await.remove_lte(index)?;
        info!(index, "log compacted");
        Ok(())
    }

    /// Reset the log to start after the snapshot.
    pub(crate) async fn clear_log(&mut self) {
        let (index, term) = (self.snap_index(), self.snap_term());
        if let Err(e) = self.log.write().await.reset(index) {
            panic!("log reset({index}) failed: {e}");
        }
        self.last_log_index = index;
        self.last_log_term = term;
    }

    /// Record an installed snapshot and drop the log it covers.
    pub(crate) async fn install_snapshot(&mut self, meta: SnapshotMeta, payload: &[u8]) -> Result<()> {
        self.snaps
            .lock()
            .expect("snapshot store lock")
            .install(meta.clone(), payload)?;
        self.clear_log().await;
        self.configs.latest = meta.config.clone();
        self.configs.committed = meta.config;
        Ok(())
    }

    /// Seed a fresh replica with its first configuration at index 1,
    /// term 1.
    pub async fn bootstrap(&mut self, mut config: ClusterConfig) -> Result<()> {
        if self.cluster_id == 0 || self.node_id == 0 {
            return Err(RaftError::IdentityNotSet);
        }
        if !self.configs.is_bootstrap() || self.last_log_index != 0 {
            return Err(RaftError::Bootstrap("storage is already bootstrapped".into()));
        }
        config.index = 1;
        config.term = 1;
        self.append_entry(config.to_entry()).await;
        self.sync_log().await;
        self.set_term(1);
        self.configs.committed = config.clone();
        self.configs.latest = config;
        info!(config = self.configs.latest.index, "storage bootstrapped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::MemLog;
    use crate::membership::Node;
    use crate::stable::MemStable;

    fn open_empty(dir: &std::path::Path) -> Storage {
        Storage::open(
            Box::new(MemStable::new()),
            Box::new(MemLog::new()),
            SnapshotStore::open(dir).unwrap(),
        )
        .unwrap()
    }

    fn three_node_config() -> ClusterConfig {
        ClusterConfig::new([
            Node::voter(1, "a:7000"),
            Node::voter(2, "b:7000"),
            Node::voter(3, "c:7000"),
        ])
    }

    #[tokio::test]
    async fn test_bootstrap() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = open_empty(dir.path());

        assert!(matches!(
            storage.bootstrap(three_node_config()).await,
            Err(RaftError::IdentityNotSet)
        ));

        storage.set_identity(1, 1).unwrap();
        storage.bootstrap(three_node_config()).await.unwrap();
        assert_eq!(storage.term, 1);
        assert_eq!(storage.last_log_index, 1);
        assert_eq!(storage.configs.latest.index, 1);
        assert!(storage.configs.is_committed());

        assert!(storage.bootstrap(three_node_config()).await.is_err());
    }

    #[tokio::test]
    async fn test_identity_is_immutable() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = open_empty(dir.path());
        storage.set_identity(1, 2).unwrap();
        // same identity is idempotent
        storage.set_identity(1, 2).unwrap();
        assert!(matches!(storage.set_identity(1, 3), Err(RaftError::IdentityAlreadySet)));
        assert!(storage.set_identity(0, 3).is_err());
    }

    #[tokio::test]
    async fn test_config_recovery_from_log() {
        let dir = tempfile::tempdir().unwrap();

        let mut log = MemLog::new();
        let mut first = three_node_config();
        first.index = 1;
        first.term = 1;
        log.append(first.to_entry()).unwrap();
        log.append(Entry::user(2, 1, b"x".to_vec())).unwrap();
        let mut second = three_node_config();
        second.nodes.insert(4, Node::nonvoter(4, "d:7000"));
        second.index = 3;
        second.term = 1;
        log.append(second.to_entry()).unwrap();

        let storage = Storage::open(
            Box::new(MemStable::new()),
            Box::new(log),
            SnapshotStore::open(dir.path()).unwrap(),
        )
        .unwrap();

        assert_eq!(storage.configs.latest, second);
        assert_eq!(storage.configs.committed, first);
        assert_eq!(storage.last_log_index, 3);
    }

    #[tokio::test]
    async fn test_single_config_falls_back_to_snapshot_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = MemLog::new();
        let mut only = three_node_config();
        only.index = 1;
        only.term = 1;
        log.append(only.to_entry()).unwrap();

        let storage = Storage::open(
            Box::new(MemStable::new()),
            Box::new(log),
            SnapshotStore::open(dir.path()).unwrap(),
        )
        .unwrap();

        assert_eq!(storage.configs.latest, only);
        // no second config entry and no snapshot: committed stays bootstrap
        assert!(storage.configs.committed.is_bootstrap());
    }

    #[tokio::test]
    async fn test_entry_term_at_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = open_empty(dir.path());
        storage.set_identity(1, 1).unwrap();
        storage.bootstrap(three_node_config()).await.unwrap();
        storage.append_entry(Entry::user(2, 1, b"a".to_vec())).await;

        assert_eq!(storage.entry_term(0).await.unwrap(), 0);
        assert_eq!(storage.entry_term(1).await.unwrap(), 1);
        assert_eq!(storage.entry_term(2).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_remove_gte_updates_cached_last() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = open_empty(dir.path());
        storage.set_identity(1, 1).unwrap();
        storage.bootstrap(three_node_config()).await.unwrap();
        storage.append_entry(Entry::user(2, 1, b"a".to_vec())).await;
        storage.append_entry(Entry::user(3, 1, b"b".to_vec())).await;

        storage.remove_gte(2, 1).await;
        assert_eq!(storage.last_log_index, 1);
        assert_eq!(storage.last_log_term, 1);
    }

    #[tokio::test]
    async fn test_remove_lte_requires_snapshot_cover() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = open_empty(dir.path());
        storage.set_identity(1, 1).unwrap();
        storage.bootstrap(three_node_config()).await.unwrap();
        storage.append_entry(Entry::user(2, 1, b"a".to_vec())).await;

        assert!(storage.remove_lte(1).await.is_err());
    }
}
