//! Stable variable storage: identity and vote.
//!
//! Two records live here. The identity `(cluster_id, node_id)` is
//! immutable once set; the vote `(term, voted_for)` advances atomically,
//! and `term` never regresses.

use std::path::{Path, PathBuf};

use raftforge_core::{ClusterId, NodeId, RaftError, Result, Term};
use serde::{Deserialize, Serialize};

/// Persistent variables of a replica.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vars {
    /// Cluster identity; zero when unset.
    pub cluster_id: ClusterId,
    /// Node identity; zero when unset.
    pub node_id: NodeId,
    /// Latest term seen.
    pub term: Term,
    /// Candidate voted for in `term`; zero when none.
    pub voted_for: NodeId,
}

/// Store for [`Vars`]. `set_vote` must persist term and vote as one
/// atomic write.
pub trait Stable: Send + Sync {
    /// Current variables.
    fn get(&self) -> Vars;

    /// Record the cluster identity.
    fn set_identity(&mut self, cluster_id: ClusterId, node_id: NodeId) -> Result<()>;

    /// Record `(term, voted_for)` atomically.
    fn set_vote(&mut self, term: Term, voted_for: NodeId) -> Result<()>;
}

/// Volatile [`Stable`] for tests.
#[derive(Debug, Default)]
pub struct MemStable {
    vars: Vars,
}

impl MemStable {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Stable for MemStable {
    fn get(&self) -> Vars {
        self.vars
    }

    fn set_identity(&mut self, cluster_id: ClusterId, node_id: NodeId) -> Result<()> {
        self.vars.cluster_id = cluster_id;
        self.vars.node_id = node_id;
        Ok(())
    }

    fn set_vote(&mut self, term: Term, voted_for: NodeId) -> Result<()> {
        self.vars.term = term;
        self.vars.voted_for = voted_for;
        Ok(())
    }
}

/// File-backed [`Stable`]. Writes go to a temporary file renamed over
/// the target, so a crash leaves either the old or the new record.
#[derive(Debug)]
pub struct FileStable {
    path: PathBuf,
    vars: Vars,
}

impl FileStable {
    /// Open or create the vars file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let vars = match std::fs::read(&path) {
            Ok(raw) => bincode::deserialize(&raw)
                .map_err(|e| RaftError::Storage(format!("corrupt vars file: {e}")))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vars::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self { path, vars })
    }

    fn persist(&self) -> Result<()> {
        let raw = bincode::serialize(&self.vars)
            .map_err(|e| RaftError::Storage(format!("encode vars: {e}")))?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, raw)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl Stable for FileStable {
    fn get(&self) -> Vars {
        self.vars
    }

    fn set_identity(&mut self, cluster_id: ClusterId, node_id: NodeId) -> Result<()> {
        let prev = self.vars;
        self.vars.cluster_id = cluster_id;
        self.vars.node_id = node_id;
        if let Err(e) = self.persist() {
            self.vars = prev;
            return Err(e);
        }
        Ok(())
    }

    fn set_vote(&mut self, term: Term, voted_for: NodeId) -> Result<()> {
        let prev = self.vars;
        self.vars.term = term;
        self.vars.voted_for = voted_for;
        if let Err(e) = self.persist() {
            self.vars = prev;
            return Err(e);
        }
        Ok(())
    }
}
