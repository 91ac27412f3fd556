//! VR cluster configuration.
//!
//! This module defines the configuration for a VR cluster: membership,
//! lease timing, retry policy and compaction. Everything here is supplied at
//! startup and never changes while a replica runs.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::client_sessions::ClientSessionsConfig;
use crate::error::VrError;
use crate::types::{MAX_REPLICAS, ReplicaId, ViewNumber, max_failures, quorum_size};

// ============================================================================
// Cluster Configuration
// ============================================================================

/// Configuration for a VR cluster.
///
/// Replica identity is the position in the configured peer list, so the
/// replicas are always `0..n`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    replicas: Vec<ReplicaId>,

    /// Lease and timer configuration.
    pub timeouts: TimeoutConfig,

    /// Committed ops between snapshots.
    pub snapshot_every: u64,

    /// Maximum number of submitted commands awaiting commit at once.
    pub max_in_flight: usize,
}

impl ClusterConfig {
    /// Creates a configuration for a cluster of `size` replicas.
    ///
    /// # Panics
    ///
    /// Panics if:
    /// - `size` is zero
    /// - `size` is even (must be 2f+1)
    /// - `size` exceeds `MAX_REPLICAS`
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "cluster must have at least one replica");
        assert!(
            size % 2 == 1,
            "cluster size must be odd (2f+1) for proper quorum behavior"
        );
        assert!(size <= MAX_REPLICAS, "cluster size exceeds MAX_REPLICAS");

        Self {
            replicas: (0..size as u8).map(ReplicaId::new).collect(),
            timeouts: TimeoutConfig::default(),
            snapshot_every: 1000,
            max_in_flight: 1,
        }
    }

    /// Returns the number of replicas in the cluster.
    pub fn cluster_size(&self) -> usize {
        self.replicas.len()
    }

    /// Returns the quorum size (`F+1`) for this cluster.
    pub fn quorum_size(&self) -> usize {
        quorum_size(self.replicas.len())
    }

    /// Returns the maximum number of failures (`F`) this cluster can tolerate.
    pub fn max_failures(&self) -> usize {
        max_failures(self.replicas.len())
    }

    pub fn replicas(&self) -> impl Iterator<Item = ReplicaId> + '_ {
        self.replicas.iter().copied()
    }

    pub fn contains(&self, id: ReplicaId) -> bool {
        id.as_usize() < self.replicas.len()
    }

    /// Determines the leader for a given view (`view mod N`).
    pub fn leader_for_view(&self, view: ViewNumber) -> ReplicaId {
        let index = (view.as_u64() % self.replicas.len() as u64) as usize;
        self.replicas[index]
    }

    /// Returns the other replicas (excluding the given replica).
    pub fn others(&self, exclude: ReplicaId) -> impl Iterator<Item = ReplicaId> + '_ {
        self.replicas.iter().copied().filter(move |&r| r != exclude)
    }

    pub fn with_timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_snapshot_every(mut self, snapshot_every: u64) -> Self {
        self.snapshot_every = snapshot_every.max(1);
        self
    }

    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight.max(1);
        self
    }
}

// ============================================================================
// Timeout Configuration
// ============================================================================

/// Lease and timer configuration.
///
/// A follower promises not to join a view change for `lease` after hearing
/// from the master. The master only trusts that promise up to `lease` minus
/// `max_clock_drift`, and renews it `renew_factor` times per lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Length of a lease promise.
    pub lease: Duration,

    /// Maximum clock difference tolerated between replicas.
    pub max_clock_drift: Duration,

    /// Heartbeats sent per lease.
    pub renew_factor: u32,

    /// Granularity of the timer task that checks deadlines.
    pub tick_interval: Duration,
}

impl TimeoutConfig {
    /// Short timings for in-process test clusters.
    pub fn testing() -> Self {
        Self {
            lease: Duration::from_millis(400),
            max_clock_drift: Duration::from_millis(50),
            renew_factor: 2,
            tick_interval: Duration::from_millis(10),
        }
    }

    /// Moderate timings for local development.
    pub fn development() -> Self {
        Self {
            lease: Duration::from_secs(1),
            max_clock_drift: Duration::from_millis(50),
            renew_factor: 2,
            tick_interval: Duration::from_millis(25),
        }
    }

    /// Conservative timings for production networks.
    pub fn production() -> Self {
        Self {
            lease: Duration::from_secs(2),
            max_clock_drift: Duration::from_millis(100),
            renew_factor: 2,
            tick_interval: Duration::from_millis(50),
        }
    }

    /// Interval between master heartbeats when no lease renewal is pending.
    pub fn heartbeat_interval(&self) -> Duration {
        self.lease / self.renew_factor.max(1)
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self::production()
    }
}

// ============================================================================
// RPC Configuration
// ============================================================================

/// Retry policy for the fanout engine.
///
/// A failed call to one peer is retried after `backoff * 2^(tries-1)`, up to
/// `max_tries` attempts. Each attempt is bounded by `call_timeout`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcConfig {
    pub max_tries: u32,
    pub backoff: Duration,
    pub call_timeout: Duration,
}

impl RpcConfig {
    pub fn testing() -> Self {
        Self {
            max_tries: 3,
            backoff: Duration::from_millis(20),
            call_timeout: Duration::from_millis(250),
        }
    }

    /// Delay before attempt `tries + 1`, given `tries` failed attempts.
    pub fn backoff_for(&self, tries: u32) -> Duration {
        let exponent = tries.saturating_sub(1).min(16);
        self.backoff.saturating_mul(1 << exponent)
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            max_tries: 5,
            backoff: Duration::from_millis(50),
            call_timeout: Duration::from_secs(1),
        }
    }
}

// ============================================================================
// Replica Configuration
// ============================================================================

/// Everything a single replica needs to start.
#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    /// This replica's identity.
    pub replica_id: ReplicaId,

    pub cluster: ClusterConfig,

    pub rpc: RpcConfig,

    /// Directory holding the snapshot file. `None` disables snapshots.
    pub data_dir: Option<PathBuf>,

    /// How long a submitted command may wait for its commit.
    pub commit_timeout: Duration,

    pub sessions: ClientSessionsConfig,
}

impl ReplicaConfig {
    pub fn new(replica_id: ReplicaId, cluster: ClusterConfig) -> Self {
        let commit_timeout = cluster.timeouts.lease.saturating_mul(5);
        Self {
            replica_id,
            cluster,
            rpc: RpcConfig::default(),
            data_dir: None,
            commit_timeout,
            sessions: ClientSessionsConfig::default(),
        }
    }

    /// Test configuration: fast timers, short retries, no snapshots.
    pub fn testing(replica_id: ReplicaId, cluster_size: usize) -> Self {
        let cluster = ClusterConfig::new(cluster_size)
            .with_timeouts(TimeoutConfig::testing())
            .with_snapshot_every(1_000_000);
        Self {
            rpc: RpcConfig::testing(),
            sessions: ClientSessionsConfig::testing(),
            ..Self::new(replica_id, cluster)
        }
    }

    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(data_dir.into());
        self
    }

    /// Checks the invariants the protocol relies on.
    pub fn validate(&self) -> Result<(), VrError> {
        let timeouts = &self.cluster.timeouts;
        if !self.cluster.contains(self.replica_id) {
            return Err(VrError::Config(format!(
                "replica {} is not a member of a {}-replica cluster",
                self.replica_id,
                self.cluster.cluster_size()
            )));
        }
        if timeouts.renew_factor < 2 {
            return Err(VrError::Config("renew_factor must be at least 2".into()));
        }
        if timeouts.lease <= timeouts.max_clock_drift {
            return Err(VrError::Config(
                "lease must be longer than max_clock_drift".into(),
            ));
        }
        if self.rpc.max_tries == 0 {
            return Err(VrError::Config("max_tries must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn cluster_config_creation() {
        let config = ClusterConfig::new(3);

        assert_eq!(config.cluster_size(), 3);
        assert_eq!(config.quorum_size(), 2);
        assert_eq!(config.max_failures(), 1);
        assert!(config.contains(ReplicaId::new(2)));
        assert!(!config.contains(ReplicaId::new(3)));
    }

    #[test_case(0, 0; "view zero")]
    #[test_case(1, 1; "view one")]
    #[test_case(2, 2; "view two")]
    #[test_case(3, 0; "wraps")]
    #[test_case(7, 1; "wraps twice")]
    fn leader_rotation(view: u64, leader: u8) {
        let config = ClusterConfig::new(3);
        assert_eq!(
            config.leader_for_view(ViewNumber::new(view)),
            ReplicaId::new(leader)
        );
    }

    #[test]
    fn others_excludes_self() {
        let config = ClusterConfig::new(3);
        let others: Vec<_> = config.others(ReplicaId::new(1)).collect();
        assert_eq!(others, vec![ReplicaId::new(0), ReplicaId::new(2)]);
    }

    #[test]
    #[should_panic(expected = "odd")]
    fn even_cluster_rejected() {
        let _ = ClusterConfig::new(4);
    }

    #[test_case(1, 50; "first retry")]
    #[test_case(2, 100; "second retry")]
    #[test_case(3, 200; "third retry")]
    #[test_case(5, 800; "fifth retry")]
    fn backoff_doubles(tries: u32, expected_ms: u64) {
        let rpc = RpcConfig::default();
        assert_eq!(rpc.backoff_for(tries), Duration::from_millis(expected_ms));
    }

    #[test]
    fn validate_rejects_short_lease() {
        let mut config = ReplicaConfig::testing(ReplicaId::new(0), 3);
        config.cluster.timeouts.max_clock_drift = config.cluster.timeouts.lease;
        assert!(matches!(config.validate(), Err(VrError::Config(_))));
    }

    #[test]
    fn validate_rejects_foreign_replica() {
        let config = ReplicaConfig::testing(ReplicaId::new(5), 3);
        assert!(config.validate().is_err());
    }

    #[test]
    fn testing_config_is_valid() {
        let config = ReplicaConfig::testing(ReplicaId::new(1), 5);
        assert!(config.validate().is_ok());
        assert_eq!(config.cluster.timeouts.heartbeat_interval(), Duration::from_millis(200));
    }
}
