//! RPC fanout engine.
//!
//! ```text
//!                 ┌──────────────┐
//!    request ────►│   Fanout     │
//!                 └──────┬───────┘
//!          ┌─────────────┼─────────────┐
//!          ▼             ▼             ▼
//!     call+retry    call+retry    call+retry      one task per peer
//!          │             │             │
//!          └─────────────┼─────────────┘
//!                        ▼
//!                 ┌──────────────┐
//!                 │  supervisor  │  on_reply(from, reply) -> done?
//!                 └──────┬───────┘
//!                        ▼
//!                  caller released
//! ```
//!
//! The caller is released as soon as `on_reply` reports that it has heard
//! enough. Peers that have not answered yet keep being retried in the
//! background, and their replies still reach `on_reply`, so stragglers
//! converge even after the quorum is in.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{trace, warn};

use crate::config::RpcConfig;
use crate::error::TransportError;
use crate::message::{Request, RpcResult};
use crate::transport::Transport;
use crate::types::ReplicaId;

/// How a fanout ended, from the caller's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanoutOutcome {
    /// `on_reply` reported completion.
    Satisfied,
    /// Every peer answered or gave up without `on_reply` reporting completion.
    Exhausted,
}

/// Sends requests to sets of peers with per-peer retries.
#[derive(Debug, Clone)]
pub struct Fanout {
    transport: Arc<dyn Transport>,
    rpc: RpcConfig,
}

impl Fanout {
    pub fn new(transport: Arc<dyn Transport>, rpc: RpcConfig) -> Self {
        Self { transport, rpc }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Sends `request` to every target concurrently and waits until
    /// `on_reply` returns true or every target is done.
    ///
    /// `on_reply` sees each peer's reply at most once, in arrival order. It
    /// keeps being called after it has returned true.
    pub async fn send_and_await<F>(
        &self,
        targets: Vec<ReplicaId>,
        request: Request,
        on_reply: F,
    ) -> FanoutOutcome
    where
        F: FnMut(ReplicaId, RpcResult) -> bool + Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        self.start(targets, request, on_reply, done_tx);
        done_rx.await.unwrap_or(FanoutOutcome::Exhausted)
    }

    fn start<F>(
        &self,
        targets: Vec<ReplicaId>,
        request: Request,
        mut on_reply: F,
        done: oneshot::Sender<FanoutOutcome>,
    ) where
        F: FnMut(ReplicaId, RpcResult) -> bool + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel(targets.len().max(1));
        for to in targets {
            let tx = tx.clone();
            let transport = Arc::clone(&self.transport);
            let request = request.clone();
            let rpc = self.rpc;
            tokio::spawn(async move {
                if let Some(reply) = call_with_retry(transport.as_ref(), rpc, to, request).await {
                    let _ = tx.send((to, reply)).await;
                }
            });
        }
        drop(tx);

        let name = request.name();
        tokio::spawn(async move {
            let mut done = Some(done);
            while let Some((from, reply)) = rx.recv().await {
                trace!(rpc = name, from = %from, ok = reply.is_ok(), "reply");
                if on_reply(from, reply) {
                    if let Some(done) = done.take() {
                        let _ = done.send(FanoutOutcome::Satisfied);
                    }
                }
            }
            if let Some(done) = done.take() {
                let _ = done.send(FanoutOutcome::Exhausted);
            }
        });
    }
}

/// Calls one peer until it answers or the attempts run out.
///
/// Only transport failures are retried. A protocol rejection is an answer.
pub async fn call_with_retry(
    transport: &dyn Transport,
    rpc: RpcConfig,
    to: ReplicaId,
    request: Request,
) -> Option<RpcResult> {
    let mut last = TransportError::Unreachable(to);
    for tries in 1..=rpc.max_tries {
        let attempt = tokio::time::timeout(rpc.call_timeout, transport.call(to, request.clone())).await;
        match attempt {
            Ok(Ok(reply)) => return Some(reply),
            Ok(Err(TransportError::Disconnected)) => return None,
            Ok(Err(err)) => last = err,
            Err(_) => last = TransportError::Timeout(to),
        }
        if tries < rpc.max_tries {
            tokio::time::sleep(rpc.backoff_for(tries)).await;
        }
    }
    warn!(
        rpc = request.name(),
        to = %to,
        tries = rpc.max_tries,
        error = %last,
        "giving up on peer"
    );
    None
}
