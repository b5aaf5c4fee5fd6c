//! Error taxonomy for RaftForge
//!
//! Two disjoint classes exist in the system. Recoverable conditions are
//! surfaced to callers through this enum: protocol rejections travel as
//! response values over the wire and never appear here, while task
//! validation failures and leadership errors do. Fatal conditions
//! (storage corruption, invariant violations) are panics raised by the
//! replica's main task, not values of this type.

use thiserror::Error;

use crate::types::NodeId;

/// Error returned to task submitters and storage callers.
#[derive(Debug, Error)]
pub enum RaftError {
    /// The replica is not the leader. `leader` carries the id and address
    /// of the current leader when known; `lost` is true when leadership
    /// was held and has just been lost, in which case submitted entries
    /// may or may not survive.
    #[error("node is not the leader")]
    NotLeader {
        /// Current leader, if known.
        leader: Option<(NodeId, String)>,
        /// True when this node just lost leadership.
        lost: bool,
    },

    /// Another operation of the same kind is still in flight.
    #[error("{0} already in progress")]
    InProgress(&'static str),

    /// The leader has not yet committed an entry of its own term.
    #[error("leader has not committed an entry in its term yet")]
    NotCommitReady,

    /// The configuration changed since the proposal was prepared.
    #[error("configuration has changed since the proposal was prepared")]
    ConfigChanged,

    /// Storage has no cluster/node identity recorded.
    #[error("cluster identity is not set")]
    IdentityNotSet,

    /// Storage already carries a different cluster/node identity.
    #[error("cluster identity is already set")]
    IdentityAlreadySet,

    /// This node has been removed from the cluster configuration.
    #[error("node has been removed from the cluster")]
    NodeRemoved,

    /// The replica has shut down.
    #[error("server closed")]
    ServerClosed,

    /// Not enough new entries applied since the last snapshot.
    #[error("snapshot threshold not reached")]
    SnapshotThreshold,

    /// A leadership transfer is already running.
    #[error("leadership transfer already in progress")]
    LeadershipTransferInProgress,

    /// The leadership transfer did not complete within its deadline.
    #[error("leadership transfer timed out")]
    LeadershipTransferTimeout,

    /// A proposed configuration failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Bootstrap was rejected.
    #[error("bootstrap: {0}")]
    Bootstrap(String),

    /// A storage operation failed in a recoverable way.
    #[error("storage: {0}")]
    Storage(String),

    /// Underlying I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RaftError {
    /// Shorthand for a `NotLeader` error with no known leader.
    pub fn not_leader(leader: Option<(NodeId, String)>, lost: bool) -> Self {
        RaftError::NotLeader { leader, lost }
    }
}

/// Result alias used across the workspace.
pub type Result<T> = std::result::Result<T, RaftError>;
