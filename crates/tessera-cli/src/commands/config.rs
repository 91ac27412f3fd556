//! Configuration management commands.

use std::path::Path;

use anyhow::{Context, Result};
use tessera_config::TesseraConfig;

/// Show current configuration.
pub fn show(project: &str, format: &str) -> Result<()> {
    let config = TesseraConfig::load_from_dir(Path::new(project))
        .context("Failed to load configuration")?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&config)?),
        "toml" => println!("{}", config.to_toml()?),
        _ => {
            println!("Tessera Configuration");
            println!("=====================\n");

            println!("Cluster:");
            println!("  Replica id: {}", config.cluster.replica_id);
            for (id, peer) in config.cluster.peers.iter().enumerate() {
                println!("  Replica {id}: {peer}");
            }
            println!();

            println!("Replication:");
            println!("  Lease: {}ms", config.replication.lease_ms);
            println!("  Max clock drift: {}ms", config.replication.max_clock_drift_ms);
            println!("  Renew factor: {}", config.replication.renew_factor);
            println!("  Tick: {}ms", config.replication.tick_ms);
            println!("  Snapshot every: {} ops", config.replication.snapshot_every);
            println!("  Max in flight: {}", config.replication.max_in_flight);
            println!();

            println!("RPC:");
            println!("  Max tries: {}", config.rpc.max_tries);
            println!("  Backoff: {}ms", config.rpc.backoff_ms);
            println!("  Call timeout: {}ms", config.rpc.call_timeout_ms);
            println!();

            println!("Storage:");
            println!("  Data directory: {}", config.storage.data_dir.display());
            println!();

            println!("Client:");
            println!("  Timeout: {}ms", config.client.timeout_ms);
            println!("  Give up after: {} timeouts", config.client.give_up_factor);
        }
    }
    Ok(())
}
