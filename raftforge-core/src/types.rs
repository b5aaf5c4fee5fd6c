//! Core type definitions for RaftForge

use std::fmt;

use serde::{Deserialize, Serialize};

/// Unique identifier of a node in the cluster. Zero means "unset".
pub type NodeId = u64;

/// Unique identifier of the cluster. Zero means "unset".
pub type ClusterId = u64;

/// Monotonic logical time of leadership.
pub type Term = u64;

/// Position of an entry in the replicated log, starting at 1.
pub type LogIndex = u64;

/// Role of a replica in the consensus protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Accepts log entries from the leader.
    Follower,
    /// Attempting to become leader.
    Candidate,
    /// Coordinates log replication.
    Leader,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Follower => write!(f, "Follower"),
            Role::Candidate => write!(f, "Candidate"),
            Role::Leader => write!(f, "Leader"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_display() {
        assert_eq!(Role::Follower.to_string(), "Follower");
        assert_eq!(Role::Candidate.to_string(), "Candidate");
        assert_eq!(Role::Leader.to_string(), "Leader");
    }
}
