//! # RaftForge
//!
//! A single-node participant in the Raft replicated-log protocol:
//! leader election, log replication with per-peer progress tracking,
//! single-step membership changes driven by per-node actions, and
//! snapshot take/install, applied to a user-supplied state machine.
//!
//! ## Architecture
//!
//! A replica is one main loop task that owns every piece of consensus
//! state, plus cooperating tasks it spawns: one replicator per peer
//! while leading, one applier feeding the state machine, and one task
//! per inbound connection. Everything else talks to the main loop over
//! channels.
//!
//! - **Storage layer**: stable vars, the durable log behind
//!   [`log::LogStore`], and directory-backed snapshots
//! - **Membership layer**: committed/latest configuration pair with
//!   promotion, demotion and removal actions
//! - **Wire layer**: framed big-endian RPC protocol over pluggable
//!   transport seams
//! - **Role layer**: follower / candidate / leader state machine
//! - **Task layer**: the user-facing API ([`tasks::Task`],
//!   [`node::RaftNode`])

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

mod applier;
mod candidate;
mod follower;
mod leader;
mod replicate;
mod server;
mod wire;

pub mod entry;
pub mod fsm;
pub mod log;
pub mod membership;
pub mod message;
pub mod node;
pub mod snapshot;
pub mod stable;
pub mod storage;
pub mod tasks;
pub mod transport;

pub use raftforge_core::{ClusterId, LogIndex, NodeId, RaftError, Result, Role, Term};

pub use entry::{Entry, EntryType};
pub use fsm::Fsm;
pub use log::{FileLog, LogStore, MemLog};
pub use membership::{ClusterConfig, ConfigAction, Configs, Node};
pub use node::RaftNode;
pub use snapshot::{SnapshotMeta, SnapshotStore};
pub use stable::{FileStable, MemStable, Stable};
pub use storage::{Storage, VoteGuard};
pub use tasks::{Info, Task};
pub use transport::{Conn, Dialer, Listener, TcpDialer, TcpServerListener};

/// Version information.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
