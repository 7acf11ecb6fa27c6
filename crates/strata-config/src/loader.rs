//! Layered controller configuration.
//!
//! Sources, lowest precedence first:
//!
//! 1. built-in defaults ([`ControllerConfig::default`])
//! 2. the operator's user file, `~/.config/strata/config.toml`
//! 3. the deployment file, `strata.toml` in the deployment directory
//! 4. `strata.local.toml` next to it, for per-host tweaks
//! 5. an explicit file passed with [`ConfigLoader::with_config_file`]
//! 6. `STRATA_*` environment variables
//!
//! Environment keys use `__` between sections, so a single `_` can stay
//! inside a field name:
//!
//! | variable                             | field                                   |
//! |--------------------------------------|-----------------------------------------|
//! | `STRATA_VGROUP__DNODE_MGMT_PORT`     | `vgroup.dnode_mgmt_port`                |
//! | `STRATA_VGROUP__FANOUT_TIMEOUT_MS`   | `vgroup.fanout_timeout_ms`              |
//! | `STRATA_VGROUP__SWEEP_INTERVAL_MS`   | `vgroup.sweep_interval_ms`              |
//! | `STRATA_VGROUP__WALS`                | `vgroup.wals`                           |
//! | `STRATA_VGROUP__QUORUM`              | `vgroup.quorum`                         |
//! | `STRATA_DATABASE_DEFAULTS__REPLICATIONS` | `database_defaults.replications`    |
//! | `STRATA_DATABASE_DEFAULTS__MAX_TABLES_PER_VGROUP` | `database_defaults.max_tables_per_vgroup` |

use crate::{ControllerConfig, Paths};
use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat, Map};
use std::env;
use std::path::{Path, PathBuf};

/// Default prefix of environment overrides.
pub const ENV_PREFIX: &str = "STRATA";

/// Builds a [`ControllerConfig`] from every configured source.
pub struct ConfigLoader {
    deploy_dir: PathBuf,
    explicit_file: Option<PathBuf>,
    env_prefix: String,
    env_vars: Option<Map<String, String>>,
}

impl ConfigLoader {
    /// Loader rooted at the current directory.
    pub fn new() -> Self {
        Self {
            deploy_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            explicit_file: None,
            env_prefix: ENV_PREFIX.to_string(),
            env_vars: None,
        }
    }

    /// Directory holding `strata.toml` and `strata.local.toml`.
    pub fn with_project_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.deploy_dir = dir.as_ref().to_path_buf();
        self
    }

    /// A file that must exist and overrides every other file layer.
    pub fn with_config_file(mut self, path: impl AsRef<Path>) -> Self {
        self.explicit_file = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Reads overrides from `vars` instead of the process environment.
    pub fn with_env_vars(mut self, vars: Map<String, String>) -> Self {
        self.env_vars = Some(vars);
        self
    }

    /// Optional files that exist on disk, lowest precedence first.
    fn optional_files(&self) -> Vec<PathBuf> {
        let user = Paths::new().user_config_file().ok();
        user.into_iter()
            .chain([
                Paths::project_config_file(&self.deploy_dir),
                Paths::local_config_file(&self.deploy_dir),
            ])
            .filter(|path| path.exists())
            .collect()
    }

    /// Merges every source and validates the result.
    pub fn load(self) -> Result<ControllerConfig> {
        let defaults = Config::try_from(&ControllerConfig::default())
            .context("Failed to serialize built-in defaults")?;
        let mut builder = Config::builder().add_source(defaults);

        for path in self.optional_files() {
            tracing::debug!(path = %path.display(), "reading config file");
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(false));
        }

        if let Some(path) = &self.explicit_file {
            builder = builder.add_source(File::from(path.as_path()).format(FileFormat::Toml).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix(&self.env_prefix)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .source(self.env_vars.clone()),
        );

        let controller_config: ControllerConfig = builder
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        controller_config
            .validate()
            .context("Configuration failed validation")?;

        Ok(controller_config)
    }

    /// Like [`load`](Self::load), falling back to defaults on any error.
    pub fn load_or_default(self) -> ControllerConfig {
        match self.load() {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!(error = %err, "using default controller configuration");
                ControllerConfig::default()
            }
        }
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
    use std::fs;
    use tempfile::tempdir;

    fn vars(pairs: &[(&str, &str)]) -> Map<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    fn loader(dir: &Path) -> ConfigLoader {
        ConfigLoader::new()
            .with_project_dir(dir)
            .with_env_vars(Map::new())
    }

    #[test]
    fn test_load_defaults() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let config = loader(temp_dir.path()).load().expect("Failed to load config");

        assert_eq!(config.vgroup.dnode_mgmt_port, 6035);
        assert_eq!(config.database_defaults.max_tables_per_vgroup, 1000);
    }

    #[test]
    fn test_load_deployment_config() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let project_dir = temp_dir.path();

        let config_content = r#"
[vgroup]
dnode_mgmt_port = 7100
fanout_timeout_ms = 3000

[database_defaults]
replications = 3
max_tables_per_vgroup = 4
"#;
        fs::write(project_dir.join("strata.toml"), config_content)
            .expect("Failed to write config");

        let config = loader(project_dir).load().expect("Failed to load config");

        assert_eq!(config.vgroup.dnode_mgmt_port, 7100);
        assert_eq!(config.vgroup.fanout_timeout_ms, 3000);
        assert_eq!(config.database_defaults.replications, 3);
        assert_eq!(config.database_defaults.max_tables_per_vgroup, 4);
        // Untouched keys keep their defaults
        assert_eq!(config.vgroup.wals, 3);
    }

    #[test]
    fn test_local_overrides_deployment() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let project_dir = temp_dir.path();

        fs::write(project_dir.join("strata.toml"), "[vgroup]\nquorum = 1\n")
            .expect("Failed to write project config");
        fs::write(project_dir.join("strata.local.toml"), "[vgroup]\nquorum = 2\n")
            .expect("Failed to write local config");

        let config = loader(project_dir).load().expect("Failed to load config");
        assert_eq!(config.vgroup.quorum, 2);
    }

    #[test]
    fn test_explicit_file_beats_local_file() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let project_dir = temp_dir.path();
        let explicit = project_dir.join("override.toml");

        fs::write(project_dir.join("strata.local.toml"), "[vgroup]\nwals = 2\n")
            .expect("Failed to write local config");
        fs::write(&explicit, "[vgroup]\nwals = 5\n").expect("Failed to write explicit config");

        let config = loader(project_dir)
            .with_config_file(&explicit)
            .load()
            .expect("Failed to load config");
        assert_eq!(config.vgroup.wals, 5);
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let result = loader(temp_dir.path())
            .with_config_file(temp_dir.path().join("absent.toml"))
            .load();
        assert!(result.is_err());
    }

    #[test]
    fn test_env_overrides_vgroup_settings() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let project_dir = temp_dir.path();
        fs::write(project_dir.join("strata.toml"), "[vgroup]\nfanout_timeout_ms = 3000\n")
            .expect("Failed to write project config");

        let config = ConfigLoader::new()
            .with_project_dir(project_dir)
            .with_env_vars(vars(&[
                ("STRATA_VGROUP__FANOUT_TIMEOUT_MS", "2500"),
                ("STRATA_DATABASE_DEFAULTS__MAX_TABLES_PER_VGROUP", "64"),
            ]))
            .load()
            .expect("Failed to load config");

        assert_eq!(config.vgroup.fanout_timeout_ms, 2500);
        assert_eq!(config.database_defaults.max_tables_per_vgroup, 64);
    }

    #[test]
    fn test_invalid_replication_is_rejected() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let project_dir = temp_dir.path();

        fs::write(
            project_dir.join("strata.toml"),
            "[database_defaults]\nreplications = 9\n",
        )
        .expect("Failed to write project config");

        assert!(loader(project_dir).load().is_err());
    }

    #[test]
    fn test_load_or_default_falls_back() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let config = loader(temp_dir.path())
            .with_env_vars(vars(&[("STRATA_VGROUP__SWEEP_INTERVAL_MS", "0")]))
            .load_or_default();
        assert_eq!(config.vgroup.sweep_interval_ms, ControllerConfig::default().vgroup.sweep_interval_ms);
    }
}
