//! # tessera-kernel: replicated application state machines
//!
//! The kernel holds the deterministic command interpreters that sit behind the
//! consensus layer. A command reaches the kernel only after it is committed,
//! and every replica applies the same commands in the same order, so every
//! interpreter here must be a pure function of its state and input.
//!
//! ## Key Principles
//!
//! - **No IO**: interpreters never touch disk or network
//! - **No clocks, no randomness**: same input always produces same output
//! - **Opaque at the boundary**: the consensus layer only sees bytes; commands
//!   and replies are encoded with postcard by [`codec`]
//!
//! ## Architecture
//!
//! - [`traits`]: the [`StateMachine`] commit contract the replica drives
//! - [`tree`]: hierarchical key/value namespace with per-node stats
//! - [`queue`]: FIFO message queue with in-progress tracking
//! - [`codec`]: postcard helpers shared by servers and clients

pub mod codec;
pub mod error;
pub mod queue;
pub mod traits;
pub mod tree;

pub use error::KernelError;
pub use queue::{Queue, QueueCommand, QueueError, QueueMessage, QueueOutput, QueueReply};
pub use traits::StateMachine;
pub use tree::{DataNode, Stat, Tree, TreeCommand, TreeError, TreeOutput, TreeReply};
