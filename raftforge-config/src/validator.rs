//! Configuration validation

use raftforge_core::{RaftError, Result};

use crate::{RaftForgeConfig, RaftOptions};

/// Validate a full node configuration.
pub fn validate(config: &RaftForgeConfig) -> Result<()> {
    if config.node.bind_address.is_empty() {
        return Err(RaftError::InvalidConfig("bind_address must not be empty".into()));
    }
    validate_options(&config.raft)
}

/// Validate consensus options.
pub fn validate_options(options: &RaftOptions) -> Result<()> {
    if options.heartbeat_timeout_ms == 0 {
        return Err(RaftError::InvalidConfig("heartbeat_timeout_ms must be positive".into()));
    }
    if options.lease_timeout_ms > options.heartbeat_timeout_ms {
        return Err(RaftError::InvalidConfig(
            "lease_timeout_ms must not exceed heartbeat_timeout_ms".into(),
        ));
    }
    if options.max_append_entries == 0 {
        return Err(RaftError::InvalidConfig("max_append_entries must be positive".into()));
    }
    if options.fsm_channel_capacity == 0 {
        return Err(RaftError::InvalidConfig("fsm_channel_capacity must be positive".into()));
    }
    if options.task_channel_capacity == 0 {
        return Err(RaftError::InvalidConfig("task_channel_capacity must be positive".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(validate(&RaftForgeConfig::default()).is_ok());
    }

    #[test]
    fn test_zero_heartbeat_rejected() {
        let mut config = RaftForgeConfig::default();
        config.raft.heartbeat_timeout_ms = 0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_lease_longer_than_heartbeat_rejected() {
        let mut options = RaftOptions::default();
        options.lease_timeout_ms = options.heartbeat_timeout_ms + 1;
        assert!(validate_options(&options).is_err());
    }
}
