//! In-process network for tests.
//!
//! Every replica registers a handler with a shared [`MemoryNetwork`]. A call
//! runs the target's handler on its own task, like a remote peer would. A
//! disconnected replica neither sends nor receives, and a reply is dropped if
//! either end disconnected while the call was in flight.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::debug;

use crate::error::TransportError;
use crate::message::{Request, RpcResult};
use crate::types::ReplicaId;

use super::{RpcHandler, Transport};

#[derive(Default)]
struct NetworkState {
    handlers: HashMap<ReplicaId, Arc<dyn RpcHandler>>,
    connected: HashMap<ReplicaId, bool>,
}

impl NetworkState {
    fn is_connected(&self, id: ReplicaId) -> bool {
        self.connected.get(&id).copied().unwrap_or(false)
    }
}

/// A shared in-memory network.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the transport endpoint of replica `id`.
    pub fn transport(&self, id: ReplicaId) -> MemoryTransport {
        MemoryTransport {
            local: Some(id),
            network: self.clone(),
        }
    }

    /// Returns an endpoint that can only make calls (a client).
    pub fn client(&self) -> MemoryTransport {
        MemoryTransport {
            local: None,
            network: self.clone(),
        }
    }

    pub fn is_connected(&self, id: ReplicaId) -> bool {
        self.state.lock().expect("lock poisoned").is_connected(id)
    }

    fn set_connected(&self, id: ReplicaId, connected: bool) {
        self.state
            .lock()
            .expect("lock poisoned")
            .connected
            .insert(id, connected);
    }
}

impl fmt::Debug for MemoryNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock().expect("lock poisoned");
        let mut connected: Vec<_> = state
            .connected
            .iter()
            .filter(|(_, up)| **up)
            .map(|(id, _)| *id)
            .collect();
        connected.sort();
        f.debug_struct("MemoryNetwork")
            .field("connected", &connected)
            .finish()
    }
}

/// One endpoint of a [`MemoryNetwork`].
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    local: Option<ReplicaId>,
    network: MemoryNetwork,
}

impl MemoryTransport {
    fn local_up(&self) -> bool {
        self.local.is_none_or(|id| self.network.is_connected(id))
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn call(&self, to: ReplicaId, request: Request) -> Result<RpcResult, TransportError> {
        if !self.local_up() {
            return Err(TransportError::Disconnected);
        }

        let handler = {
            let state = self.network.state.lock().expect("lock poisoned");
            if !state.is_connected(to) {
                return Err(TransportError::Unreachable(to));
            }
            state
                .handlers
                .get(&to)
                .cloned()
                .ok_or(TransportError::Unreachable(to))?
        };

        let reply = tokio::spawn(async move { handler.handle(request).await })
            .await
            .map_err(|_| TransportError::Shutdown(to))?;

        if !self.local_up() || !self.network.is_connected(to) {
            debug!(to = %to, "reply lost to disconnect");
            return Err(TransportError::Shutdown(to));
        }
        Ok(reply)
    }

    async fn listen(&self, handler: Arc<dyn RpcHandler>) -> Result<(), TransportError> {
        let Some(id) = self.local else {
            return Err(TransportError::Disconnected);
        };
        {
            let mut state = self.network.state.lock().expect("lock poisoned");
            state.handlers.insert(id, handler);
            state.connected.insert(id, true);
        }
        Ok(())
    }

    async fn disconnect(&self) {
        if let Some(id) = self.local {
            self.network.set_connected(id, false);
        }
    }

    async fn reconnect(&self) -> Result<(), TransportError> {
        if let Some(id) = self.local {
            self.network.set_connected(id, true);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Response;

    struct Echo(ReplicaId);

    #[async_trait]
    impl RpcHandler for Echo {
        async fn handle(&self, _request: Request) -> RpcResult {
            Ok(Response::Master(self.0))
        }
    }

    #[tokio::test]
    async fn call_reaches_listener() {
        let network = MemoryNetwork::new();
        let server = network.transport(ReplicaId::new(1));
        server
            .listen(Arc::new(Echo(ReplicaId::new(1))))
            .await
            .expect("listen");

        let reply = network
            .client()
            .call(ReplicaId::new(1), Request::GetMaster)
            .await
            .expect("call");
        assert_eq!(reply, Ok(Response::Master(ReplicaId::new(1))));
    }

    #[tokio::test]
    async fn disconnected_peer_is_unreachable() {
        let network = MemoryNetwork::new();
        let server = network.transport(ReplicaId::new(1));
        server
            .listen(Arc::new(Echo(ReplicaId::new(1))))
            .await
            .expect("listen");
        server.disconnect().await;

        let result = network.client().call(ReplicaId::new(1), Request::GetMaster).await;
        assert!(matches!(result, Err(TransportError::Unreachable(_))));

        server.reconnect().await.expect("reconnect");
        assert!(network.client().call(ReplicaId::new(1), Request::GetMaster).await.is_ok());
    }

    #[tokio::test]
    async fn disconnected_sender_cannot_call() {
        let network = MemoryNetwork::new();
        let a = network.transport(ReplicaId::new(0));
        let b = network.transport(ReplicaId::new(1));
        a.listen(Arc::new(Echo(ReplicaId::new(0)))).await.expect("listen");
        b.listen(Arc::new(Echo(ReplicaId::new(1)))).await.expect("listen");

        a.disconnect().await;
        let result = a.call(ReplicaId::new(1), Request::GetMaster).await;
        assert!(matches!(result, Err(TransportError::Disconnected)));
    }
}
