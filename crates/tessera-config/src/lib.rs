//! Configuration management for Tessera
//!
//! Provides hierarchical configuration loading from multiple sources:
//! 1. Environment variables (TESSERA_* prefix, highest precedence)
//! 2. tessera.local.toml (gitignored, local overrides)
//! 3. tessera.toml (git-tracked, cluster config)
//! 4. ~/.config/tessera/config.toml (user defaults)
//! 5. Built-in defaults (lowest precedence)
//!
//! The loaded [`TesseraConfig`] is plain data with millisecond fields. The
//! replica and the client take their own `Duration`-based configs, built with
//! [`TesseraConfig::replica_config`] and [`TesseraConfig::client_config`].

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tessera_vr::{ReplicaId, TimeoutConfig};

mod error;
mod loader;
mod paths;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use paths::Paths;

/// Main Tessera configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TesseraConfig {
    pub cluster: ClusterConfig,
    pub replication: ReplicationConfig,
    pub rpc: RpcConfig,
    pub storage: StorageConfig,
    pub client: ClientConfig,
}

/// Cluster membership. Replica `i` listens on `peers[i]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub replica_id: u8,
    pub peers: Vec<String>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            replica_id: 0,
            peers: vec![
                "127.0.0.1:7000".to_string(),
                "127.0.0.1:7001".to_string(),
                "127.0.0.1:7002".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    pub lease_ms: u64,
    pub max_clock_drift_ms: u64,
    pub renew_factor: u32,
    pub tick_ms: u64,
    /// Ops between snapshots.
    pub snapshot_every: u64,
    /// Commands the master keeps in flight at once.
    pub max_in_flight: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self::from_timeouts(TimeoutConfig::production())
    }
}

impl ReplicationConfig {
    fn from_timeouts(timeouts: TimeoutConfig) -> Self {
        Self {
            lease_ms: millis(timeouts.lease),
            max_clock_drift_ms: millis(timeouts.max_clock_drift),
            renew_factor: timeouts.renew_factor,
            tick_ms: millis(timeouts.tick_interval),
            snapshot_every: 1000,
            max_in_flight: 1,
        }
    }

    pub fn timeouts(&self) -> TimeoutConfig {
        TimeoutConfig {
            lease: Duration::from_millis(self.lease_ms),
            max_clock_drift: Duration::from_millis(self.max_clock_drift_ms),
            renew_factor: self.renew_factor,
            tick_interval: Duration::from_millis(self.tick_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub max_tries: u32,
    pub backoff_ms: u64,
    pub call_timeout_ms: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        let rpc = tessera_vr::RpcConfig::default();
        Self {
            max_tries: rpc.max_tries,
            backoff_ms: millis(rpc.backoff),
            call_timeout_ms: millis(rpc.call_timeout),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Where the replica keeps its snapshot.
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".tessera/data"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Time allowed for one call to a replica.
    pub timeout_ms: u64,
    /// A request is abandoned after `timeout_ms * give_up_factor`.
    pub give_up_factor: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let client = tessera_client::ClientConfig::default();
        Self {
            timeout_ms: millis(client.timeout),
            give_up_factor: client.give_up_factor,
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl TesseraConfig {
    /// Load configuration from default locations
    pub fn load() -> Result<Self> {
        ConfigLoader::new().load()
    }

    /// Load configuration from specific project directory
    pub fn load_from_dir(project_dir: impl AsRef<Path>) -> Result<Self> {
        ConfigLoader::new().with_project_dir(project_dir).load()
    }

    /// Create a development configuration: shorter leases, frequent snapshots
    pub fn development() -> Self {
        Self {
            replication: ReplicationConfig {
                snapshot_every: 100,
                ..ReplicationConfig::from_timeouts(TimeoutConfig::development())
            },
            ..Default::default()
        }
    }

    /// Create a production configuration
    pub fn production() -> Self {
        Self {
            replication: ReplicationConfig::from_timeouts(TimeoutConfig::production()),
            ..Default::default()
        }
    }

    /// Resolve relative paths to absolute
    pub fn resolve_paths(&mut self, base_dir: impl AsRef<Path>) {
        let base = base_dir.as_ref();

        if self.storage.data_dir.is_relative() {
            self.storage.data_dir = base.join(&self.storage.data_dir);
        }
    }

    /// Checks the constraints the protocol relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let peers = self.cluster.peers.len();
        if peers == 0 || peers % 2 == 0 {
            return Err(ConfigError::ValidationError(format!(
                "cluster needs an odd number of peers, got {peers}"
            )));
        }
        if peers > tessera_vr::types::MAX_REPLICAS {
            return Err(ConfigError::ValidationError(format!(
                "cluster has {peers} peers, at most {} are supported",
                tessera_vr::types::MAX_REPLICAS
            )));
        }
        if usize::from(self.cluster.replica_id) >= peers {
            return Err(ConfigError::ValidationError(format!(
                "replica_id {} is out of range for {peers} peers",
                self.cluster.replica_id
            )));
        }
        if self.replication.renew_factor < 2 {
            return Err(ConfigError::ValidationError(
                "replication.renew_factor must be at least 2".to_string(),
            ));
        }
        if self.replication.lease_ms <= self.replication.max_clock_drift_ms {
            return Err(ConfigError::ValidationError(
                "replication.lease_ms must be greater than max_clock_drift_ms".to_string(),
            ));
        }
        if self.replication.tick_ms == 0 || self.replication.snapshot_every == 0 {
            return Err(ConfigError::ValidationError(
                "replication.tick_ms and snapshot_every must be positive".to_string(),
            ));
        }
        if self.rpc.max_tries == 0 {
            return Err(ConfigError::ValidationError(
                "rpc.max_tries must be positive".to_string(),
            ));
        }
        self.peer_addrs()?;
        Ok(())
    }

    /// Parses the peer list. Position in the list is the replica id.
    pub fn peer_addrs(&self) -> Result<Vec<SocketAddr>, ConfigError> {
        self.cluster
            .peers
            .iter()
            .map(|peer| {
                peer.parse().map_err(|_| {
                    ConfigError::ValidationError(format!("invalid peer address '{peer}'"))
                })
            })
            .collect()
    }

    /// Builds the replica runtime configuration.
    pub fn replica_config(&self) -> Result<tessera_vr::ReplicaConfig, ConfigError> {
        self.validate()?;
        let cluster = tessera_vr::ClusterConfig::new(self.cluster.peers.len())
            .with_timeouts(self.replication.timeouts())
            .with_snapshot_every(self.replication.snapshot_every)
            .with_max_in_flight(self.replication.max_in_flight);

        let mut config = tessera_vr::ReplicaConfig::new(ReplicaId::new(self.cluster.replica_id), cluster)
            .with_data_dir(&self.storage.data_dir);
        config.rpc = tessera_vr::RpcConfig {
            max_tries: self.rpc.max_tries,
            backoff: Duration::from_millis(self.rpc.backoff_ms),
            call_timeout: Duration::from_millis(self.rpc.call_timeout_ms),
        };
        Ok(config)
    }

    /// Builds the client configuration.
    pub fn client_config(&self) -> tessera_client::ClientConfig {
        tessera_client::ClientConfig {
            timeout: Duration::from_millis(self.client.timeout_ms),
            give_up_factor: self.client.give_up_factor,
            ..tessera_client::ClientConfig::default()
        }
    }

    /// Serializes the configuration as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Writes the configuration to `path` as TOML.
    pub fn write_to(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        std::fs::write(path, self.to_toml()?).map_err(|source| ConfigError::WriteError {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_default_config() {
        let config = TesseraConfig::default();
        assert_eq!(config.cluster.peers.len(), 3);
        assert_eq!(config.replication.lease_ms, 2000);
        assert_eq!(config.replication.renew_factor, 2);
        assert_eq!(config.rpc.max_tries, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_development_config() {
        let config = TesseraConfig::development();
        assert_eq!(config.replication.lease_ms, 1000);
        assert_eq!(config.replication.snapshot_every, 100);
    }

    #[test]
    fn test_production_config() {
        let config = TesseraConfig::production();
        assert_eq!(config.replication.timeouts(), TimeoutConfig::production());
    }

    #[test]
    fn test_path_resolution() {
        let mut config = TesseraConfig::default();
        config.resolve_paths("/srv/tessera");
        assert_eq!(config.storage.data_dir, PathBuf::from("/srv/tessera/.tessera/data"));
    }

    #[test_case(|c: &mut TesseraConfig| c.cluster.peers.truncate(2) ; "even peer count")]
    #[test_case(|c: &mut TesseraConfig| c.cluster.peers.clear() ; "no peers")]
    #[test_case(|c: &mut TesseraConfig| c.cluster.replica_id = 3 ; "id out of range")]
    #[test_case(|c: &mut TesseraConfig| c.replication.renew_factor = 1 ; "renew factor")]
    #[test_case(|c: &mut TesseraConfig| c.replication.max_clock_drift_ms = 2000 ; "drift exceeds lease")]
    #[test_case(|c: &mut TesseraConfig| c.rpc.max_tries = 0 ; "no tries")]
    #[test_case(|c: &mut TesseraConfig| c.cluster.peers[1] = "nowhere".to_string() ; "bad address")]
    fn test_invalid_configs(mutate: fn(&mut TesseraConfig)) {
        let mut config = TesseraConfig::default();
        mutate(&mut config);
        assert!(matches!(config.validate(), Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_replica_config_conversion() {
        let mut config = TesseraConfig::development();
        config.cluster.replica_id = 2;
        config.rpc.backoff_ms = 10;

        let replica = config.replica_config().expect("valid");
        assert_eq!(replica.replica_id, ReplicaId::new(2));
        assert_eq!(replica.cluster.cluster_size(), 3);
        assert_eq!(replica.cluster.timeouts, TimeoutConfig::development());
        assert_eq!(replica.cluster.snapshot_every, 100);
        assert_eq!(replica.rpc.backoff, Duration::from_millis(10));
        assert_eq!(replica.data_dir.as_deref(), Some(Path::new(".tessera/data")));
        assert!(replica.validate().is_ok());
    }

    #[test]
    fn test_client_config_conversion() {
        let mut config = TesseraConfig::default();
        config.client.timeout_ms = 500;
        config.client.give_up_factor = 4;

        let client = config.client_config();
        assert_eq!(client.give_up_after(), Duration::from_secs(2));
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = TesseraConfig::development();
        let text = config.to_toml().expect("serialize");
        assert!(text.contains("[replication]"));
        let parsed: TesseraConfig = toml::from_str(&text).expect("parse");
        assert_eq!(parsed, config);
    }
}
