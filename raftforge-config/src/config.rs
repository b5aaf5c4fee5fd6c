//! Configuration structures

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration for a RaftForge node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftForgeConfig {
    /// Node-local settings (storage location, bind address).
    pub node: NodeConfig,

    /// Consensus tuning knobs.
    pub raft: RaftOptions,

    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Node-local settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Directory holding the stable vars, log and snapshots.
    pub data_dir: PathBuf,

    /// Address the RPC server binds to.
    pub bind_address: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            bind_address: "127.0.0.1:7000".to_string(),
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level filter (`error`, `warn`, `info`, `debug`, `trace`).
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string() }
    }
}

/// Consensus tuning knobs.
///
/// The heartbeat timeout is the base unit: election timers fire at a
/// random point in `[heartbeat, 2*heartbeat]`, replicators heartbeat at
/// a random fraction of it, and the leader lease defaults to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftOptions {
    /// Heartbeat timeout in milliseconds.
    pub heartbeat_timeout_ms: u64,

    /// Leader lease timeout in milliseconds. When a quorum of voters has
    /// been unreachable for this long the leader steps down.
    pub lease_timeout_ms: u64,

    /// Dial timeout for outbound peer connections, in milliseconds.
    pub dial_timeout_ms: u64,

    /// Idle timeout for inbound connections, in milliseconds. Idle
    /// connections recheck the shutdown signal at this cadence.
    pub idle_timeout_ms: u64,

    /// Maximum number of entries per AppendEntries request.
    pub max_append_entries: usize,

    /// Capacity of the bounded channel feeding the state machine.
    pub fsm_channel_capacity: usize,

    /// Capacity of the user task channel.
    pub task_channel_capacity: usize,

    /// Maximum pooled idle connections per peer.
    pub max_pooled_connections: usize,

    /// Shut the replica down when a committed configuration no longer
    /// contains this node.
    pub shutdown_on_remove: bool,
}

impl Default for RaftOptions {
    fn default() -> Self {
        Self {
            heartbeat_timeout_ms: 50,
            lease_timeout_ms: 50,
            dial_timeout_ms: 10_000,
            idle_timeout_ms: 10_000,
            max_append_entries: 64,
            fsm_channel_capacity: 128,
            task_channel_capacity: 128,
            max_pooled_connections: 3,
            shutdown_on_remove: false,
        }
    }
}

impl RaftOptions {
    /// Heartbeat timeout as a [`Duration`].
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    /// Leader lease timeout as a [`Duration`].
    pub fn lease_timeout(&self) -> Duration {
        Duration::from_millis(self.lease_timeout_ms)
    }

    /// Dial timeout as a [`Duration`].
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    /// Idle timeout as a [`Duration`].
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}
