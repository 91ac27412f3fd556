//! # tessera-client: client for a Tessera cluster
//!
//! The client finds the master by asking replicas in turn, sends commands to
//! it, and follows redirects and failovers until the command commits or the
//! retry budget runs out.
//!
//! Each command carries the client's id and a request number. A command that
//! is retried keeps its number, so the cluster applies it at most once and
//! answers the retry with the reply it cached.
//!
//! ## Usage
//!
//! ```ignore
//! use tessera_client::{Client, ClientConfig};
//!
//! let peers = vec!["127.0.0.1:7000".parse()?, "127.0.0.1:7001".parse()?, "127.0.0.1:7002".parse()?];
//! let mut client = Client::connect(peers, ClientConfig::default());
//!
//! client.create("/services/api", "10.0.0.7:8080").await?;
//! let node = client.get("/services/api").await?;
//!
//! let id = client.push("job-1").await?;
//! if let Some(job) = client.pop().await? {
//!     client.done(job.id).await?;
//! }
//! ```

mod client;
mod error;

pub use client::{Client, ClientConfig};
pub use error::{ClientError, ClientResult};

// Re-export reply types so callers need not depend on the kernel directly
pub use tessera_kernel::{DataNode, QueueMessage, Stat};
