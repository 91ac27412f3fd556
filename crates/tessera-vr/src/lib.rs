//! # tessera-vr: Viewstamped Replication for Tessera
//!
//! This crate implements the Viewstamped Replication (VR) protocol for
//! crash-fault-tolerant replication of a deterministic state machine across
//! `2F + 1` replicas.
//!
//! ## Architecture
//!
//! The crate follows the Functional Core, Imperative Shell (FCIS) pattern:
//!
//! - **Core** ([`replica`]): [`ReplicaState::process`] is a pure function from
//!   `(state, event)` to `(state, output)`. It owns every protocol decision:
//!   normal operation, leases, view changes, recovery and state transfer.
//! - **Shell** ([`Replica`]): owns the lock around the core, the timers, the
//!   [`Fanout`] engine and the serial commit [`executor`].
//!
//! ## Protocol Summary
//!
//! 1. **Normal operation**: the master of view `v` (replica `v mod N`)
//!    appends commands and sends `Prepare`. Once `F + 1` replicas hold an op
//!    it is committed; `Commit` messages carry the commit number to backups
//!    and double as heartbeats.
//! 2. **Leases**: every acknowledgement carries a promise not to join a view
//!    change for one lease. A master that holds `F` promises may answer
//!    read-only commands locally.
//! 3. **View change**: a backup that hears nothing from the master for a
//!    lease starts a view change. The new master takes the log with the
//!    highest `(normal view, op)` among `F + 1` replicas.
//! 4. **Recovery**: every replica starts by asking its peers for the current
//!    state, so a restart never needs a write-ahead log.
//!
//! ## Example
//!
//! ```ignore
//! use tessera_kernel::Tree;
//! use tessera_vr::{MemoryNetwork, Replica, ReplicaConfig, ReplicaId};
//!
//! let network = MemoryNetwork::new();
//! let config = ReplicaConfig::testing(ReplicaId::new(0), 1);
//! let replica = Replica::start(config, Arc::new(network.transport(ReplicaId::new(0))), Tree::new()).await?;
//! ```

pub mod client_sessions;
pub mod config;
pub mod error;
pub mod executor;
pub mod fanout;
pub mod log;
pub mod message;
pub mod replica;
pub mod runtime;
pub mod snapshot;
pub mod transport;
pub mod types;


pub use client_sessions::{ClientId, ClientSessions, ClientSessionsConfig, SessionCheck};
pub use config::{ClusterConfig, ReplicaConfig, RpcConfig, TimeoutConfig};
pub use error::{RpcError, TransportError, VrError, VrResult};
pub use executor::{Machine, Waiters};
pub use fanout::{Fanout, FanoutOutcome};
pub use log::Log;
pub use message::{ClientRequest, Request, Response, RpcResult};
pub use replica::{Apply, Completion, OutboundRpc, ReplicaEvent, ReplicaOutput, ReplicaState};
pub use runtime::Replica;
pub use snapshot::{Snapshot, SnapshotManager};
pub use transport::{MemoryNetwork, MemoryTransport, RpcHandler, TcpTransport, Transport};
pub use types::{
    Command, CommitNumber, LogEntry, Nonce, OpNumber, ReplicaId, ReplicaStatus, Timestamp,
    ViewNumber,
};
