//! User task API.
//!
//! Tasks are submitted over the replica's task channel and replied to
//! through a oneshot. Each constructor returns the task together with
//! the receiver for its reply.

use std::time::Duration;

use raftforge_core::{ClusterId, LogIndex, NodeId, Result, Role, Term};
use serde::Serialize;
use tokio::sync::oneshot;

use crate::entry::EntryType;
use crate::membership::{ClusterConfig, Configs};

/// Point-in-time view of a replica, for observability and tests.
#[derive(Debug, Clone, Serialize)]
pub struct Info {
    /// Cluster identity.
    pub cluster_id: ClusterId,
    /// Node identity.
    pub node_id: NodeId,
    /// Current term.
    pub term: Term,
    /// Current role.
    pub role: Role,
    /// Known leader of the current term; zero when none.
    pub leader: NodeId,
    /// Index of the last log entry.
    pub last_log_index: LogIndex,
    /// Term of the last log entry.
    pub last_log_term: Term,
    /// Highest committed index.
    pub commit_index: LogIndex,
    /// Highest index handed to the state machine.
    pub last_applied: LogIndex,
    /// Committed and latest configurations.
    pub configs: Configs,
}

/// A request submitted to the replica.
pub enum Task {
    /// Replicate a user command and return the state machine's reply.
    Apply {
        /// Opaque command bytes.
        data: Vec<u8>,
        /// Reply slot.
        resp: oneshot::Sender<Result<Vec<u8>>>,
    },
    /// Serve a read-only query, serialized through the commit pipeline.
    Read {
        /// Opaque query bytes.
        data: Vec<u8>,
        /// Reply slot.
        resp: oneshot::Sender<Result<Vec<u8>>>,
    },
    /// Complete once every prior entry has been applied.
    Barrier {
        /// Reply slot.
        resp: oneshot::Sender<Result<()>>,
    },
    /// Propose a new cluster configuration (or bootstrap a fresh one).
    ChangeConfig {
        /// The proposed configuration.
        new_config: ClusterConfig,
        /// Reply slot.
        resp: oneshot::Sender<Result<()>>,
    },
    /// Complete when the configuration is committed and stable.
    WaitForStableConfig {
        /// Reply slot, carrying the stable configuration.
        resp: oneshot::Sender<Result<ClusterConfig>>,
    },
    /// Take a state machine snapshot if at least `threshold` entries
    /// were applied since the last one.
    TakeSnapshot {
        /// Minimum applied entries since the previous snapshot.
        threshold: u64,
        /// Reply slot, carrying the new snapshot index.
        resp: oneshot::Sender<Result<LogIndex>>,
    },
    /// Hand leadership to another voter.
    TransferLeadership {
        /// The node to transfer to.
        target: NodeId,
        /// Give up after this long.
        timeout: Duration,
        /// Reply slot.
        resp: oneshot::Sender<Result<()>>,
    },
    /// Snapshot the replica's state for inspection.
    Info {
        /// Reply slot.
        resp: oneshot::Sender<Info>,
    },
}

impl Task {
    /// Build an apply task.
    pub fn apply(data: Vec<u8>) -> (Self, oneshot::Receiver<Result<Vec<u8>>>) {
        let (resp, rx) = oneshot::channel();
        (Task::Apply { data, resp }, rx)
    }

    /// Build a read task.
    pub fn read(data: Vec<u8>) -> (Self, oneshot::Receiver<Result<Vec<u8>>>) {
        let (resp, rx) = oneshot::channel();
        (Task::Read { data, resp }, rx)
    }

    /// Build a barrier task.
    pub fn barrier() -> (Self, oneshot::Receiver<Result<()>>) {
        let (resp, rx) = oneshot::channel();
        (Task::Barrier { resp }, rx)
    }

    /// Build a configuration change task.
    pub fn change_config(new_config: ClusterConfig) -> (Self, oneshot::Receiver<Result<()>>) {
        let (resp, rx) = oneshot::channel();
        (Task::ChangeConfig { new_config, resp }, rx)
    }

    /// Build a wait-for-stable-config task.
    pub fn wait_for_stable_config() -> (Self, oneshot::Receiver<Result<ClusterConfig>>) {
        let (resp, rx) = oneshot::channel();
        (Task::WaitForStableConfig { resp }, rx)
    }

    /// Build a snapshot task.
    pub fn take_snapshot(threshold: u64) -> (Self, oneshot::Receiver<Result<LogIndex>>) {
        let (resp, rx) = oneshot::channel();
        (Task::TakeSnapshot { threshold, resp }, rx)
    }

    /// Build a leadership transfer task.
    pub fn transfer_leadership(
        target: NodeId,
        timeout: Duration,
    ) -> (Self, oneshot::Receiver<Result<()>>) {
        let (resp, rx) = oneshot::channel();
        (Task::TransferLeadership { target, timeout, resp }, rx)
    }

    /// Build an info task.
    pub fn info() -> (Self, oneshot::Receiver<Info>) {
        let (resp, rx) = oneshot::channel();
        (Task::Info { resp }, rx)
    }
}

/// Reply slot of a pending leader entry.
pub(crate) enum PendingResp {
    /// Nothing waits on this entry (noop, follower-side config).
    None,
    /// Byte reply from the state machine.
    Bytes(oneshot::Sender<Result<Vec<u8>>>),
    /// Unit acknowledgment.
    Unit(oneshot::Sender<Result<()>>),
}

impl PendingResp {
    pub(crate) fn reply_err(self, err: raftforge_core::RaftError) {
        match self {
            PendingResp::None => {}
            PendingResp::Bytes(tx) => {
                let _ = tx.send(Err(err));
            }
            PendingResp::Unit(tx) => {
                let _ = tx.send(Err(err));
            }
        }
    }
}

/// An entry the leader has accepted but not yet resolved. Query and
/// barrier entries are placeholder-ordered here without being logged.
pub(crate) struct PendingEntry {
    pub(crate) index: LogIndex,
    pub(crate) typ: EntryType,
    /// Query payload; empty for other kinds.
    pub(crate) data: Vec<u8>,
    pub(crate) resp: PendingResp,
}
