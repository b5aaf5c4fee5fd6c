//! Configuration loading

use std::path::Path;

use raftforge_core::{RaftError, Result};

use crate::{validate, RaftForgeConfig};

/// Loads configuration from files and the environment.
///
/// Precedence, highest first: environment variables (`RAFTFORGE_`
/// prefix), the given file, built-in defaults.
pub struct ConfigLoader;

impl ConfigLoader {
    pub fn new() -> Self {
        Self
    }

    /// Load configuration from a specific file, with environment
    /// overrides applied on top.
    pub fn load_from_file<P: AsRef<Path>>(&self, path: P) -> Result<RaftForgeConfig> {
        let mut builder = config::Config::builder()
            .add_source(config::File::from_str(&self.default_config(), config::FileFormat::Toml));

        let path = path.as_ref();
        let name = path.to_str().ok_or_else(|| {
            RaftError::InvalidConfig(format!("non-utf8 config path: {}", path.display()))
        })?;
        builder = builder.add_source(config::File::with_name(name));
        builder = builder.add_source(
            config::Environment::with_prefix("RAFTFORGE").separator("__").try_parsing(true),
        );

        let loaded = builder
            .build()
            .map_err(|e| RaftError::InvalidConfig(format!("failed to build configuration: {e}")))?;

        let config: RaftForgeConfig = loaded.try_deserialize().map_err(|e| {
            RaftError::InvalidConfig(format!("failed to deserialize configuration: {e}"))
        })?;

        validate(&config)?;
        Ok(config)
    }

    /// Load configuration from defaults and the environment only.
    pub fn load(&self) -> Result<RaftForgeConfig> {
        let loaded = config::Config::builder()
            .add_source(config::File::from_str(&self.default_config(), config::FileFormat::Toml))
            .add_source(
                config::Environment::with_prefix("RAFTFORGE").separator("__").try_parsing(true),
            )
            .build()
            .map_err(|e| RaftError::InvalidConfig(format!("failed to build configuration: {e}")))?;

        let config: RaftForgeConfig = loaded.try_deserialize().map_err(|e| {
            RaftError::InvalidConfig(format!("failed to deserialize configuration: {e}"))
        })?;

        validate(&config)?;
        Ok(config)
    }

    /// Serialize a configuration to a TOML file.
    pub fn save_to_file<P: AsRef<Path>>(&self, config: &RaftForgeConfig, path: P) -> Result<()> {
        let text = toml::to_string_pretty(config).map_err(|e| {
            RaftError::InvalidConfig(format!("failed to serialize configuration: {e}"))
        })?;
        std::fs::write(path, text)?;
        Ok(())
    }

    fn default_config(&self) -> String {
        toml::to_string_pretty(&RaftForgeConfig::default())
            .expect("default configuration must serialize")
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_defaults() {
        let config = ConfigLoader::new().load().unwrap();
        assert_eq!(config.raft.heartbeat_timeout_ms, 50);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raftforge.toml");
        std::fs::write(
            &path,
            r#"
            [node]
            bind_address = "127.0.0.1:7201"

            [raft]
            heartbeat_timeout_ms = 25
            "#,
        )
        .unwrap();

        let config = ConfigLoader::new().load_from_file(&path).unwrap();
        assert_eq!(config.node.bind_address, "127.0.0.1:7201");
        assert_eq!(config.raft.heartbeat_timeout_ms, 25);
        // untouched fields keep defaults
        assert_eq!(config.raft.max_append_entries, 64);
    }

    #[test]
    fn test_invalid_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raftforge.toml");
        std::fs::write(
            &path,
            r#"
            [raft]
            heartbeat_timeout_ms = 0
            "#,
        )
        .unwrap();

        assert!(ConfigLoader::new().load_from_file(&path).is_err());
    }
}
