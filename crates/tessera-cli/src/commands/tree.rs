//! Tree commands - talk to a cluster running `--app tree`.

use anyhow::{Context, Result};
use tessera_client::{DataNode, Stat};

use crate::{Target, TreeCommands};

/// Prints the current master.
pub fn master(target: &Target) -> Result<()> {
    let mut client = super::connect(target)?;
    let master = super::runtime()?
        .block_on(client.discover_master())
        .context("No master found")?;
    println!("{master}");
    Ok(())
}

pub fn run(target: &Target, command: TreeCommands) -> Result<()> {
    let mut client = super::connect(target)?;
    super::runtime()?.block_on(async move {
        match command {
            TreeCommands::Create { path, value } => print_node(&client.create(&path, &value).await?),
            TreeCommands::Get { path } => print_node(&client.get(&path).await?),
            TreeCommands::Set { path, value } => print_node(&client.set(&path, &value).await?),
            TreeCommands::Delete { path } => {
                client.delete(&path).await?;
                println!("Deleted {path}");
            }
            TreeCommands::Exists { path } => println!("{}", client.exists(&path).await?),
            TreeCommands::Children { path } => {
                for child in client.children(&path).await? {
                    println!("{child}");
                }
            }
            TreeCommands::Stat { path } => print_stat(&client.stat(&path).await?),
            TreeCommands::Hash => println!("{}", client.sha256().await?),
        }
        Ok::<(), anyhow::Error>(())
    })
}

fn print_node(node: &DataNode) {
    println!("{}", node.value);
    print_stat(&node.stat);
}

fn print_stat(stat: &Stat) {
    println!(
        "version={} cversion={} children={}",
        stat.version, stat.cversion, stat.num_children
    );
}
