//! Configuration loader with multi-source merging

use crate::{Paths, TesseraConfig};
use anyhow::{Context, Result};
use std::env;
use std::path::{Path, PathBuf};

/// Configuration loader with builder pattern
pub struct ConfigLoader {
    project_dir: PathBuf,
    env_prefix: String,
    explicit_file: Option<PathBuf>,
    user_config: bool,
}

impl ConfigLoader {
    /// Create a new config loader with default project directory (current dir)
    pub fn new() -> Self {
        Self {
            project_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            env_prefix: "TESSERA".to_string(),
            explicit_file: None,
            user_config: true,
        }
    }

    /// Set the project directory
    pub fn with_project_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.project_dir = dir.as_ref().to_path_buf();
        self
    }

    /// Set the environment variable prefix (default: "TESSERA")
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Load this file instead of tessera.toml / tessera.local.toml. It must exist.
    pub fn with_file(mut self, path: impl AsRef<Path>) -> Self {
        self.explicit_file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Skip ~/.config/tessera/config.toml
    pub fn without_user_config(mut self) -> Self {
        self.user_config = false;
        self
    }

    /// Load configuration from all sources with proper precedence
    pub fn load(self) -> Result<TesseraConfig> {
        let mut builder = config::Config::builder();

        // 1. Start with built-in defaults
        let defaults = TesseraConfig::default();
        builder = builder.add_source(config::Config::try_from(&defaults)?);

        // 2. User config (~/.config/tessera/config.toml)
        if self.user_config {
            if let Ok(user_config_file) = Paths::new().user_config_file() {
                if user_config_file.exists() {
                    builder = builder.add_source(
                        config::File::from(user_config_file)
                            .required(false)
                            .format(config::FileFormat::Toml),
                    );
                }
            }
        }

        if let Some(file) = &self.explicit_file {
            // 3. Explicit config file
            builder = builder.add_source(
                config::File::from(file.as_path())
                    .required(true)
                    .format(config::FileFormat::Toml),
            );
        } else {
            // 3. Project config (tessera.toml)
            let project_config_file = Paths::project_config_file(&self.project_dir);
            if project_config_file.exists() {
                builder = builder.add_source(
                    config::File::from(project_config_file)
                        .required(false)
                        .format(config::FileFormat::Toml),
                );
            }

            // 4. Local config (tessera.local.toml, gitignored)
            let local_config_file = Paths::local_config_file(&self.project_dir);
            if local_config_file.exists() {
                builder = builder.add_source(
                    config::File::from(local_config_file)
                        .required(false)
                        .format(config::FileFormat::Toml),
                );
            }
        }

        // 5. Environment variables (TESSERA_REPLICATION__LEASE_MS=...)
        builder = builder.add_source(
            config::Environment::with_prefix(&self.env_prefix)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        // Build and deserialize
        let config = builder.build().context("Failed to build configuration")?;

        let mut tessera_config: TesseraConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        // Resolve relative paths
        tessera_config.resolve_paths(&self.project_dir);

        tessera_config
            .validate()
            .context("Configuration failed validation")?;

        Ok(tessera_config)
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

    fn loader(dir: &Path) -> ConfigLoader {
        ConfigLoader::new()
            .with_project_dir(dir)
            .without_user_config()
            // Keep the process environment out of these tests
            .with_env_prefix("TESSERA_CONFIG_LOADER_TEST")
    }

    #[test]
    fn test_load_defaults() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let config = loader(temp_dir.path()).load().expect("Failed to load config");

        assert_eq!(config.cluster.peers.len(), 3);
        assert_eq!(config.replication.lease_ms, 2000);
    }

    #[test]
    fn test_load_project_config() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let project_dir = temp_dir.path();

        let config_content = r#"
[cluster]
replica_id = 4
peers = ["10.0.0.1:7000", "10.0.0.2:7000", "10.0.0.3:7000", "10.0.0.4:7000", "10.0.0.5:7000"]

[replication]
lease_ms = 3000
snapshot_every = 50
"#;
        fs::write(project_dir.join("tessera.toml"), config_content)
            .expect("Failed to write config");

        let config = loader(project_dir).load().expect("Failed to load config");

        assert_eq!(config.cluster.replica_id, 4);
        assert_eq!(config.cluster.peers.len(), 5);
        assert_eq!(config.replication.lease_ms, 3000);
        assert_eq!(config.replication.snapshot_every, 50);
        // Unset fields keep their defaults
        assert_eq!(config.replication.renew_factor, 2);
    }

    #[test]
    fn test_local_overrides() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let project_dir = temp_dir.path();

        fs::write(
            project_dir.join("tessera.toml"),
            r#"
[cluster]
replica_id = 0
"#,
        )
        .expect("Failed to write project config");

        fs::write(
            project_dir.join("tessera.local.toml"),
            r#"
[cluster]
replica_id = 2
"#,
        )
        .expect("Failed to write local config");

        let config = loader(project_dir).load().expect("Failed to load config");

        // Local config should override project config
        assert_eq!(config.cluster.replica_id, 2);
    }

    #[test]
    fn test_explicit_file() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let project_dir = temp_dir.path();
        let file = project_dir.join("replica-1.toml");
        fs::write(&file, "[cluster]\nreplica_id = 1\n").expect("Failed to write config");

        let config = loader(project_dir)
            .with_file(&file)
            .load()
            .expect("Failed to load config");
        assert_eq!(config.cluster.replica_id, 1);

        let missing = loader(project_dir).with_file(project_dir.join("missing.toml")).load();
        assert!(missing.is_err());
    }

    #[test]
    fn test_invalid_file_is_rejected() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let project_dir = temp_dir.path();
        fs::write(
            project_dir.join("tessera.toml"),
            "[cluster]\npeers = [\"127.0.0.1:7000\", \"127.0.0.1:7001\"]\n",
        )
        .expect("Failed to write config");

        assert!(loader(project_dir).load().is_err());
    }

    #[test]
    fn test_written_config_loads_back() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let project_dir = temp_dir.path();
        let mut written = TesseraConfig::development();
        written.cluster.replica_id = 1;
        written
            .write_to(Paths::project_config_file(project_dir))
            .expect("Failed to write config");

        let loaded = loader(project_dir).load().expect("Failed to load config");
        assert_eq!(loaded.cluster.replica_id, 1);
        assert_eq!(loaded.replication, written.replication);
    }

    #[test]
    fn test_path_resolution() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let config = loader(temp_dir.path()).load().expect("Failed to load config");

        // Relative paths should be resolved to absolute
        assert!(config.storage.data_dir.is_absolute());
    }
}
