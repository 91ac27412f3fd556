//! Start command - runs one replica over TCP.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tessera_config::{ConfigLoader, TesseraConfig};
use tessera_kernel::{Queue, StateMachine, Tree};
use tessera_vr::{Replica, TcpTransport};
use tracing::info;

use crate::App;

pub fn run(project: &str, config_file: Option<&str>, replica: Option<u8>, app: App) -> Result<()> {
    let project_dir = Path::new(project);

    let mut loader = ConfigLoader::new().with_project_dir(project_dir);
    if let Some(file) = config_file {
        loader = loader.with_file(file);
    }
    let mut config = loader.load().context("Failed to load configuration")?;
    if let Some(id) = replica {
        config.cluster.replica_id = id;
    }
    // Replicas started from one project keep separate snapshots.
    config.storage.data_dir = replica_data_dir(&config);

    super::runtime()?.block_on(async {
        match app {
            App::Tree => serve(&config, Tree::new()).await,
            App::Queue => serve(&config, Queue::new()).await,
        }
    })
}

fn replica_data_dir(config: &TesseraConfig) -> std::path::PathBuf {
    config
        .storage
        .data_dir
        .join(format!("replica-{}", config.cluster.replica_id))
}

async fn serve<S: StateMachine>(config: &TesseraConfig, app: S) -> Result<()> {
    let replica_config = config.replica_config()?;
    let id = replica_config.replica_id;
    let peers = config.peer_addrs()?;
    let listen = peers[id.as_usize()];

    println!();
    println!("Tessera replica {id}");
    println!();
    println!("  Listen address: {listen}");
    println!("  Cluster size:   {}", peers.len());
    println!("  Data directory: {}", config.storage.data_dir.display());
    println!();
    println!("Replica is running. Press Ctrl+C to stop.");
    println!();

    let transport = Arc::new(TcpTransport::new(Some(id), peers));
    let replica = Replica::start(replica_config, transport, app)
        .await
        .context("Failed to start replica")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;

    info!(replica = %id, "shutting down");
    replica.shutdown().await;
    println!();
    println!("Replica stopped gracefully.");
    Ok(())
}
