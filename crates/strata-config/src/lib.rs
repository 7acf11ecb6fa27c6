//! Configuration management for the Strata cluster controller
//!
//! Provides hierarchical configuration loading from multiple sources:
//! 1. Environment variables (STRATA_* prefix, highest precedence)
//! 2. strata.local.toml (gitignored, local overrides)
//! 3. strata.toml (git-tracked, deployment config)
//! 4. ~/.config/strata/config.toml (user defaults)
//! 5. Built-in defaults (lowest precedence)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use strata_types::MAX_REPLICAS;

mod error;
mod loader;
mod paths;

pub use error::ConfigError;
pub use loader::{ConfigLoader, ENV_PREFIX};
pub use paths::Paths;

/// Main controller configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub vgroup: VGroupConfig,
    pub database_defaults: DatabaseConfig,
}

/// Settings for vgroup orchestration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VGroupConfig {
    /// Port dnodes listen on for controller requests.
    pub dnode_mgmt_port: u16,
    /// How long a fan-out waits for missing responses before it is failed.
    pub fanout_timeout_ms: u64,
    /// Period of the background sweep that expires stale fan-outs.
    pub sweep_interval_ms: u64,
    /// WAL count pushed to every new vnode.
    pub wals: u8,
    /// Write quorum pushed to every new vnode.
    pub quorum: u8,
}

impl Default for VGroupConfig {
    fn default() -> Self {
        Self {
            dnode_mgmt_port: 6035,
            fanout_timeout_ms: 10_000,
            sweep_interval_ms: 1_000,
            wals: 3,
            quorum: 1,
        }
    }
}

/// Timestamp precision of a database.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Precision {
    #[default]
    Milli,
    Micro,
}

/// Per-database configuration that vgroups are sized and announced from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Replication factor: replica slots per vgroup.
    pub replications: u8,
    /// Table-slot capacity of every vgroup in the database.
    pub max_tables_per_vgroup: u32,
    pub days_per_file: u32,
    pub days_to_keep: u32,
    pub days_to_keep1: u32,
    pub days_to_keep2: u32,
    pub commit_time_secs: u32,
    pub precision: Precision,
    pub compression: u8,
    pub commit_log: u8,
    pub cache_block_size: u32,
    pub cache_blocks: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            replications: 1,
            max_tables_per_vgroup: 1000,
            days_per_file: 10,
            days_to_keep: 3650,
            days_to_keep1: 3650,
            days_to_keep2: 3650,
            commit_time_secs: 3600,
            precision: Precision::Milli,
            compression: 2,
            commit_log: 1,
            cache_block_size: 16 * 1024,
            cache_blocks: 64,
        }
    }
}

impl DatabaseConfig {
    /// Cache budget of one vnode in bytes.
    pub fn max_cache_size(&self) -> u64 {
        u64::from(self.cache_block_size) * u64::from(self.cache_blocks)
    }
}

impl ControllerConfig {
    /// Load configuration from default locations
    pub fn load() -> Result<Self> {
        ConfigLoader::new().load()
    }

    /// Load configuration from specific project directory
    pub fn load_from_dir(project_dir: impl AsRef<Path>) -> Result<Self> {
        ConfigLoader::new().with_project_dir(project_dir).load()
    }

    /// Parse a single TOML file without merging other sources.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&content).map_err(|source| ConfigError::ParseError {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the controller cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.vgroup.fanout_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "vgroup.fanout_timeout_ms must be > 0".to_string(),
            ));
        }
        if self.vgroup.sweep_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "vgroup.sweep_interval_ms must be > 0".to_string(),
            ));
        }

        let replications = usize::from(self.database_defaults.replications);
        if replications == 0 || replications > MAX_REPLICAS {
            return Err(ConfigError::ValidationError(format!(
                "database_defaults.replications must be in 1..={MAX_REPLICAS}, got {replications}"
            )));
        }
        if self.database_defaults.max_tables_per_vgroup == 0 {
            return Err(ConfigError::ValidationError(
                "database_defaults.max_tables_per_vgroup must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = ControllerConfig::default();
        assert_eq!(config.vgroup.dnode_mgmt_port, 6035);
        assert_eq!(config.vgroup.wals, 3);
        assert_eq!(config.database_defaults.replications, 1);
        assert_eq!(config.database_defaults.precision, Precision::Milli);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_max_cache_size() {
        let cfg = DatabaseConfig {
            cache_block_size: 1024,
            cache_blocks: 4,
            ..Default::default()
        };
        assert_eq!(cfg.max_cache_size(), 4096);
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let mut config = ControllerConfig::default();
        config.vgroup.fanout_timeout_ms = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_validate_rejects_replication_out_of_range() {
        let mut config = ControllerConfig::default();
        config.database_defaults.replications = (MAX_REPLICAS + 1) as u8;
        assert!(config.validate().is_err());

        config.database_defaults.replications = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_toml_file() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("strata.toml");
        fs::write(
            &path,
            r#"
[vgroup]
fanout_timeout_ms = 2500

[database_defaults]
replications = 3
precision = "micro"
"#,
        )
        .unwrap();

        let config = ControllerConfig::from_toml_file(&path).unwrap();
        assert_eq!(config.vgroup.fanout_timeout_ms, 2500);
        assert_eq!(config.vgroup.dnode_mgmt_port, 6035);
        assert_eq!(config.database_defaults.replications, 3);
        assert_eq!(config.database_defaults.precision, Precision::Micro);
    }

    #[test]
    fn test_from_toml_file_reports_path() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("missing.toml");

        let err = ControllerConfig::from_toml_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::ReadError { .. }));
        assert!(err.to_string().contains("missing.toml"));
    }
}
