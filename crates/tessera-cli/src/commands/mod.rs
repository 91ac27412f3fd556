//! CLI command implementations.

pub mod config;
pub mod init;
pub mod queue;
pub mod start;
pub mod tree;
pub mod version;

use anyhow::{Context, Result};
use tessera_client::Client;
use tessera_config::TesseraConfig;

use crate::Target;

/// Builds the multi-threaded runtime the async commands run on.
pub(crate) fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")
}

/// Connects a client to the cluster named by `--peers`, or by the project
/// config when no peers are given.
pub(crate) fn connect(target: &Target) -> Result<Client> {
    let mut config = TesseraConfig::load_from_dir(&target.project)
        .context("Failed to load configuration")?;
    if !target.peers.is_empty() {
        config.cluster.peers.clone_from(&target.peers);
        config.cluster.replica_id = 0;
    }
    let peers = config.peer_addrs()?;
    Ok(Client::connect(peers, config.client_config()))
}
