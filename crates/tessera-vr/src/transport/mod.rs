//! Transport abstraction for VR RPCs.
//!
//! This module defines the [`Transport`] trait that abstracts over different
//! request/response delivery mechanisms:
//!
//! - [`MemoryNetwork`]: in-process delivery for tests, with per-replica
//!   disconnect and reconnect
//! - [`TcpTransport`]: length-prefixed postcard frames over TCP
//!
//! # Design
//!
//! A call either yields the peer's [`RpcResult`] or a [`TransportError`].
//! Transports do not retry; the fanout engine owns retries and backoff. The
//! protocol tolerates lost, duplicated and reordered calls.
//!
//! # FCIS Pattern
//!
//! Transport is part of the imperative shell. The pure replica state
//! machine produces requests as output; the shell hands them to a transport
//! and feeds the replies back in.

mod framing;
mod memory;
mod tcp;

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::TransportError;
use crate::message::{Request, RpcResult};
use crate::types::ReplicaId;

pub use framing::{MAX_FRAME_SIZE, read_frame, write_frame};
pub use memory::{MemoryNetwork, MemoryTransport};
pub use tcp::TcpTransport;

/// Serves inbound requests on behalf of a replica.
#[async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    /// Handles one request and produces its reply.
    async fn handle(&self, request: Request) -> RpcResult;
}

impl Debug for dyn RpcHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RpcHandler")
    }
}

/// Request/response delivery between replicas (and from clients).
#[async_trait]
pub trait Transport: Debug + Send + Sync + 'static {
    /// Sends `request` to `to` and waits for the reply.
    async fn call(&self, to: ReplicaId, request: Request) -> Result<RpcResult, TransportError>;

    /// Starts accepting inbound requests for this replica.
    async fn listen(&self, handler: Arc<dyn RpcHandler>) -> Result<(), TransportError>;

    /// Stops serving and drops every connection. Calls fail until
    /// [`reconnect`](Transport::reconnect).
    async fn disconnect(&self);

    /// Resumes serving with the last registered handler.
    async fn reconnect(&self) -> Result<(), TransportError>;
}
