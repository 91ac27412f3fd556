//! Tessera unified CLI.
//!
//! Runs Viewstamped Replication replicas over TCP and talks to them.
//!
//! # Quick Start
//!
//! ```bash
//! # Write tessera.toml for a three-replica cluster on localhost
//! tessera init ./cluster --development
//!
//! # Start each replica (one terminal each)
//! tessera start --project ./cluster --replica 0
//! tessera start --project ./cluster --replica 1
//! tessera start --project ./cluster --replica 2
//!
//! # Use the replicated tree
//! tessera tree --project ./cluster create /config '{"mode":"fast"}'
//! tessera tree --project ./cluster get /config
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};

/// Tessera - a replicated tree and queue built on Viewstamped Replication.
#[derive(Parser)]
#[command(name = "tessera")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Where a command finds the cluster.
#[derive(clap::Args, Debug, Clone)]
struct Target {
    /// Project directory holding tessera.toml.
    #[arg(short, long, default_value = ".", global = true)]
    project: String,

    /// Replica addresses, in replica id order. Overrides the project config.
    #[arg(long, value_delimiter = ',', global = true)]
    peers: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version information.
    Version,

    /// Write a tessera.toml for a new cluster.
    Init {
        /// Project directory to initialize.
        #[arg(default_value = ".")]
        path: String,

        /// Use short leases and frequent snapshots.
        #[arg(long)]
        development: bool,

        /// Number of replicas (odd).
        #[arg(short, long, default_value = "3")]
        replicas: usize,

        /// Port of replica 0. Replica `i` listens on `base_port + i`.
        #[arg(long, default_value = "7000")]
        base_port: u16,
    },

    /// Run one replica until Ctrl+C.
    Start {
        /// Project directory holding tessera.toml.
        #[arg(short, long, default_value = ".")]
        project: String,

        /// Load this file instead of tessera.toml.
        #[arg(short, long)]
        config: Option<String>,

        /// Replica id. Overrides `cluster.replica_id`.
        #[arg(short, long)]
        replica: Option<u8>,

        /// Replicated application.
        #[arg(long, value_enum, default_value_t = App::Tree)]
        app: App,
    },

    /// Show the effective configuration.
    Config {
        /// Project directory holding tessera.toml.
        #[arg(short, long, default_value = ".")]
        project: String,

        /// Output format.
        #[arg(short, long, default_value = "text", value_parser = ["text", "toml", "json"])]
        format: String,
    },

    /// Ask the cluster which replica is master.
    Master {
        #[command(flatten)]
        target: Target,
    },

    /// Replicated tree commands.
    Tree {
        #[command(flatten)]
        target: Target,

        #[command(subcommand)]
        command: TreeCommands,
    },

    /// Replicated queue commands.
    Queue {
        #[command(flatten)]
        target: Target,

        #[command(subcommand)]
        command: QueueCommands,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum App {
    Tree,
    Queue,
}

#[derive(Subcommand, Debug)]
enum TreeCommands {
    /// Create a node. The parent must exist.
    Create { path: String, value: String },
    /// Print a node's value and stat.
    Get { path: String },
    /// Replace a node's value.
    Set { path: String, value: String },
    /// Delete a node without children.
    Delete { path: String },
    /// Print whether a node exists.
    Exists { path: String },
    /// List a node's children.
    Children { path: String },
    /// Print a node's stat.
    Stat { path: String },
    /// Print the SHA-256 digest of the whole tree.
    Hash,
}

#[derive(Subcommand, Debug)]
enum QueueCommands {
    /// Append a message.
    Push { value: String },
    /// Take the oldest message. It stays in progress until `done`.
    Pop,
    /// Acknowledge an in-progress message.
    Done { id: u64 },
    /// Number of waiting messages.
    Len,
    /// Number of in-progress messages.
    InProgress,
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Version => {
            commands::version::run();
            Ok(())
        }
        Commands::Init {
            path,
            development,
            replicas,
            base_port,
        } => commands::init::run(&path, development, replicas, base_port),
        Commands::Start {
            project,
            config,
            replica,
            app,
        } => commands::start::run(&project, config.as_deref(), replica, app),
        Commands::Config { project, format } => commands::config::show(&project, &format),
        Commands::Master { target } => commands::tree::master(&target),
        Commands::Tree { target, command } => commands::tree::run(&target, command),
        Commands::Queue { target, command } => commands::queue::run(&target, command),
    }
}
