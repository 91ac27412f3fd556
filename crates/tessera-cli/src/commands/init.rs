//! Initialize command - writes tessera.toml for a new cluster.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use tessera_config::{Paths, TesseraConfig};

pub fn run(path: &str, development: bool, replicas: usize, base_port: u16) -> Result<()> {
    let project_dir = Path::new(path);

    // Check if already initialized
    if Paths::is_initialized(project_dir) {
        bail!(
            "Project already initialized in {}. tessera.toml already exists.",
            project_dir.display()
        );
    }

    let mut config = if development {
        TesseraConfig::development()
    } else {
        TesseraConfig::production()
    };
    config.cluster.peers = peer_list(replicas, base_port)?;
    config.validate()?;

    fs::create_dir_all(project_dir).context("Failed to create project directory")?;
    config
        .write_to(Paths::project_config_file(project_dir))
        .context("Failed to write tessera.toml")?;

    let gitignore_path = project_dir.join(".gitignore");
    if !gitignore_path.exists() {
        fs::write(&gitignore_path, "# Tessera snapshots\n.tessera/\n\n# Local config overrides\ntessera.local.toml\n")
            .context("Failed to write .gitignore")?;
    }

    println!("Initialized {}-replica cluster in {}", replicas, project_dir.display());
    println!();
    for (id, peer) in config.cluster.peers.iter().enumerate() {
        println!("  tessera start --project {path} --replica {id}    # {peer}");
    }
    Ok(())
}

/// `replicas` loopback addresses starting at `base_port`.
fn peer_list(replicas: usize, base_port: u16) -> Result<Vec<String>> {
    (0..replicas)
        .map(|i| {
            let port = u16::try_from(i)
                .ok()
                .and_then(|i| base_port.checked_add(i))
                .context("Port range overflows")?;
            Ok(format!("127.0.0.1:{port}"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_list_counts_up_from_base() {
        let peers = peer_list(3, 9000).unwrap();
        assert_eq!(peers, ["127.0.0.1:9000", "127.0.0.1:9001", "127.0.0.1:9002"]);
    }

    #[test]
    fn peer_list_rejects_overflow() {
        assert!(peer_list(3, u16::MAX).is_err());
    }
}
