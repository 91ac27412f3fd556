//! TCP transport.
//!
//! Each call checks a connection to the target out of a per-replica pool (or
//! dials a new one), writes one request frame and reads one reply frame. A
//! connection that fails mid-call is dropped, so the next attempt redials.
//!
//! The listener serves every accepted connection on its own task, one
//! request at a time. Disconnecting aborts the listener together with every
//! connection it accepted, and empties the outbound pool.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::message::{Request, RpcResult};
use crate::types::ReplicaId;

use super::framing::{read_frame, write_frame};
use super::{RpcHandler, Transport};

/// Length-prefixed postcard RPC over TCP.
#[derive(Debug)]
pub struct TcpTransport {
    local: Option<ReplicaId>,
    /// Position in the list is the replica id.
    peers: Vec<SocketAddr>,
    pool: Mutex<HashMap<ReplicaId, Vec<TcpStream>>>,
    server: Mutex<Option<JoinHandle<()>>>,
    handler: Mutex<Option<Arc<dyn RpcHandler>>>,
    connected: AtomicBool,
}

impl TcpTransport {
    /// Creates a transport for replica `local`, or a client-only transport
    /// when `local` is `None`.
    pub fn new(local: Option<ReplicaId>, peers: Vec<SocketAddr>) -> Self {
        Self {
            local,
            peers,
            pool: Mutex::new(HashMap::new()),
            server: Mutex::new(None),
            handler: Mutex::new(None),
            connected: AtomicBool::new(true),
        }
    }

    /// Address of replica `id`.
    pub fn peer_addr(&self, id: ReplicaId) -> Option<SocketAddr> {
        self.peers.get(id.as_usize()).copied()
    }

    fn checkout(&self, to: ReplicaId) -> Option<TcpStream> {
        self.pool
            .lock()
            .expect("lock poisoned")
            .get_mut(&to)
            .and_then(Vec::pop)
    }

    fn checkin(&self, to: ReplicaId, stream: TcpStream) {
        if self.connected.load(Ordering::Acquire) {
            self.pool
                .lock()
                .expect("lock poisoned")
                .entry(to)
                .or_default()
                .push(stream);
        }
    }

    async fn dial(&self, to: ReplicaId) -> Result<TcpStream, TransportError> {
        let addr = self.peer_addr(to).ok_or(TransportError::Unreachable(to))?;
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|_| TransportError::Unreachable(to))?;
        stream.set_nodelay(true)?;
        debug!(to = %to, %addr, "connected");
        Ok(stream)
    }

    async fn exchange(stream: &mut TcpStream, request: &Request) -> Result<RpcResult, TransportError> {
        write_frame(stream, request).await?;
        read_frame(stream).await
    }

    async fn start_server(&self) -> Result<(), TransportError> {
        let Some(id) = self.local else {
            return Err(TransportError::Disconnected);
        };
        let addr = self.peer_addr(id).ok_or(TransportError::Unreachable(id))?;
        let handler = self
            .handler
            .lock()
            .expect("lock poisoned")
            .clone()
            .ok_or(TransportError::Disconnected)?;

        let listener = TcpListener::bind(addr).await?;
        info!(replica = %id, %addr, "listening");

        let task = tokio::spawn(accept_loop(listener, handler));
        if let Some(old) = self.server.lock().expect("lock poisoned").replace(task) {
            old.abort();
        }
        self.connected.store(true, Ordering::Release);
        Ok(())
    }
}

async fn accept_loop(listener: TcpListener, handler: Arc<dyn RpcHandler>) {
    let mut connections = JoinSet::new();
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                if let Err(err) = stream.set_nodelay(true) {
                    debug!(%peer, error = %err, "set_nodelay failed");
                }
                connections.spawn(serve_connection(stream, Arc::clone(&handler)));
            }
            Err(err) => warn!(error = %err, "accept failed"),
        }
        while connections.try_join_next().is_some() {}
    }
}

async fn serve_connection(mut stream: TcpStream, handler: Arc<dyn RpcHandler>) {
    loop {
        let request: Request = match read_frame(&mut stream).await {
            Ok(request) => request,
            Err(_) => return,
        };
        let reply = handler.handle(request).await;
        if write_frame(&mut stream, &reply).await.is_err() {
            return;
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn call(&self, to: ReplicaId, request: Request) -> Result<RpcResult, TransportError> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(TransportError::Disconnected);
        }

        if let Some(mut stream) = self.checkout(to) {
            match Self::exchange(&mut stream, &request).await {
                Ok(reply) => {
                    self.checkin(to, stream);
                    return Ok(reply);
                }
                // The peer may have restarted since the connection was pooled.
                Err(err) => debug!(to = %to, error = %err, "pooled connection failed"),
            }
        }

        let mut stream = self.dial(to).await?;
        match Self::exchange(&mut stream, &request).await {
            Ok(reply) => {
                self.checkin(to, stream);
                Ok(reply)
            }
            Err(TransportError::Io(_)) => Err(TransportError::Shutdown(to)),
            Err(err) => Err(err),
        }
    }

    async fn listen(&self, handler: Arc<dyn RpcHandler>) -> Result<(), TransportError> {
        *self.handler.lock().expect("lock poisoned") = Some(handler);
        self.start_server().await
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
        let server = self.server.lock().expect("lock poisoned").take();
        if let Some(server) = server {
            server.abort();
            let _ = server.await;
        }
        self.pool.lock().expect("lock poisoned").clear();
        if let Some(id) = self.local {
            info!(replica = %id, "disconnected");
        }
    }

    async fn reconnect(&self) -> Result<(), TransportError> {
        if self.local.is_none() {
            self.connected.store(true, Ordering::Release);
            return Ok(());
        }
        self.start_server().await
    }
}
