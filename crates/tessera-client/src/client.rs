//! Client implementation.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tessera_kernel::codec::{decode, encode};
use tessera_kernel::{
    DataNode, QueueCommand, QueueMessage, QueueOutput, QueueReply, Stat, TreeCommand, TreeOutput,
    TreeReply,
};
use tessera_vr::{
    ClientId, ClientRequest, ReplicaId, Request, Response, RpcError, RpcResult, TcpTransport,
    Transport, TransportError,
};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::{ClientError, ClientResult};

/// Configuration for the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientConfig {
    /// Time allowed for a single call to a replica.
    pub timeout: Duration,
    /// A request is abandoned after `timeout * give_up_factor`.
    pub give_up_factor: u32,
    /// Pause between rounds when no master is reachable.
    pub backoff: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(3),
            give_up_factor: 5,
            backoff: Duration::from_millis(100),
        }
    }
}

impl ClientConfig {
    /// Short timeouts for in-process clusters.
    pub fn testing() -> Self {
        Self {
            timeout: Duration::from_millis(250),
            give_up_factor: 40,
            backoff: Duration::from_millis(20),
        }
    }

    /// Total time a request may take, retries included.
    pub fn give_up_after(&self) -> Duration {
        self.timeout.saturating_mul(self.give_up_factor.max(1))
    }
}

/// How one attempt at a request ended.
enum Attempt {
    Done(ClientResult<Bytes>),
    Redirect(ReplicaId),
    Retry(ClientError),
}

/// A Tessera client.
///
/// Every command carries this client's id and a fresh request number. A
/// command retried after a timeout or a failover keeps its number, so the
/// cluster applies it at most once.
#[derive(Debug)]
pub struct Client {
    transport: Arc<dyn Transport>,
    replicas: usize,
    config: ClientConfig,
    client_id: ClientId,
    next_request: u64,
    master: Option<ReplicaId>,
}

impl Client {
    /// Creates a client for a cluster of `replicas` reachable through
    /// `transport`.
    pub fn new(transport: Arc<dyn Transport>, replicas: usize, config: ClientConfig) -> Self {
        Self::with_id(transport, replicas, config, ClientId::random())
    }

    /// Like [`new`](Self::new), with a caller-chosen client id.
    ///
    /// Request numbers start at 1, so the id must not have been used before.
    pub fn with_id(
        transport: Arc<dyn Transport>,
        replicas: usize,
        config: ClientConfig,
        client_id: ClientId,
    ) -> Self {
        assert!(replicas > 0, "a cluster has at least one replica");
        Self {
            transport,
            replicas,
            config,
            client_id,
            next_request: 1,
            master: None,
        }
    }

    /// Connects to a cluster over TCP. Replica `i` listens on `peers[i]`.
    pub fn connect(peers: Vec<SocketAddr>, config: ClientConfig) -> Self {
        let replicas = peers.len();
        Self::new(Arc::new(TcpTransport::new(None, peers)), replicas, config)
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// The master this client currently sends to, if known.
    pub fn master(&self) -> Option<ReplicaId> {
        self.master
    }

    // ========================================================================
    // Master Discovery
    // ========================================================================

    /// Asks the replicas in turn who the master is.
    pub async fn discover_master(&mut self) -> ClientResult<ReplicaId> {
        let deadline = Instant::now() + self.config.give_up_after();
        self.discover_until(deadline).await
    }

    async fn discover_until(&mut self, deadline: Instant) -> ClientResult<ReplicaId> {
        let start = self.master.map_or(0, |m| m.as_usize());
        loop {
            for offset in 0..self.replicas {
                let id = ReplicaId::new(((start + offset) % self.replicas) as u8);
                match self.call(id, Request::GetMaster).await {
                    Ok(Ok(Response::Master(master))) => {
                        debug!(client = %self.client_id, asked = %id, master = %master, "found master");
                        self.master = Some(master);
                        return Ok(master);
                    }
                    Ok(reply) => trace!(asked = %id, ?reply, "no master yet"),
                    Err(err) => trace!(asked = %id, error = %err, "replica unreachable"),
                }
                if Instant::now() >= deadline {
                    return Err(ClientError::TimedOut);
                }
            }
            tokio::time::sleep(self.config.backoff).await;
        }
    }

    // ========================================================================
    // Commands
    // ========================================================================

    /// Submits an encoded command and returns the state machine's encoded
    /// reply.
    pub async fn submit(&mut self, payload: Bytes) -> ClientResult<Bytes> {
        let request = ClientRequest {
            client_id: self.client_id,
            request_number: self.next_request,
            payload,
        };
        self.next_request += 1;

        let deadline = Instant::now() + self.config.give_up_after();
        let mut last = ClientError::TimedOut;
        while Instant::now() < deadline {
            let master = match self.master {
                Some(master) => master,
                None => match self.discover_until(deadline).await {
                    Ok(master) => master,
                    Err(err) => return Err(last_or(last, err)),
                },
            };

            match self.attempt(master, &request).await {
                Attempt::Done(result) => return result,
                Attempt::Redirect(to) => {
                    debug!(client = %self.client_id, from = %master, to = %to, "redirected");
                    last = ClientError::NotMaster { master: to };
                    self.master = Some(to);
                    tokio::time::sleep(self.config.backoff).await;
                }
                Attempt::Retry(err) => {
                    debug!(client = %self.client_id, master = %master, error = %err, "retrying");
                    self.master = None;
                    last = err;
                    tokio::time::sleep(self.config.backoff).await;
                }
            }
        }
        Err(last)
    }

    async fn attempt(&self, master: ReplicaId, request: &ClientRequest) -> Attempt {
        match self.call(master, Request::Send(request.clone())).await {
            Ok(Ok(Response::Reply(bytes))) => Attempt::Done(Ok(bytes)),
            Ok(Ok(other)) => Attempt::Done(Err(ClientError::Unexpected(format!("{other:?}")))),
            Ok(Err(RpcError::NotMaster { master: to })) if to != master => Attempt::Redirect(to),
            Ok(Err(RpcError::OldRequest)) => Attempt::Done(Err(ClientError::OldRequest)),
            Ok(Err(RpcError::StateMachine(msg))) => Attempt::Done(Err(ClientError::Rejected(msg))),
            Ok(Err(err)) => Attempt::Retry(ClientError::Rejected(err.to_string())),
            Err(err) => Attempt::Retry(ClientError::Transport(err)),
        }
    }

    async fn call(&self, to: ReplicaId, request: Request) -> Result<RpcResult, TransportError> {
        match tokio::time::timeout(self.config.timeout, self.transport.call(to, request)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(to)),
        }
    }

    // ========================================================================
    // Tree
    // ========================================================================

    /// Runs a tree command.
    pub async fn tree(&mut self, command: &TreeCommand) -> ClientResult<TreeReply> {
        let reply = self.submit(encode(command)?).await?;
        Ok(decode(&reply)?)
    }

    async fn tree_output(&mut self, command: TreeCommand) -> ClientResult<TreeOutput> {
        Ok(self.tree(&command).await??)
    }

    /// Creates a node, along with any missing parents.
    pub async fn create(&mut self, path: &str, value: &str) -> ClientResult<DataNode> {
        let command = TreeCommand::Create {
            path: path.to_owned(),
            value: value.to_owned(),
        };
        match self.tree_output(command).await? {
            TreeOutput::Node(node) => Ok(node),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn get(&mut self, path: &str) -> ClientResult<DataNode> {
        let command = TreeCommand::Get {
            path: path.to_owned(),
        };
        match self.tree_output(command).await? {
            TreeOutput::Node(node) => Ok(node),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn set(&mut self, path: &str, value: &str) -> ClientResult<DataNode> {
        let command = TreeCommand::Set {
            path: path.to_owned(),
            value: value.to_owned(),
        };
        match self.tree_output(command).await? {
            TreeOutput::Node(node) => Ok(node),
            other => Err(unexpected(&other)),
        }
    }

    /// Deletes a childless node and returns its last stat.
    pub async fn delete(&mut self, path: &str) -> ClientResult<Stat> {
        let command = TreeCommand::Delete {
            path: path.to_owned(),
        };
        match self.tree_output(command).await? {
            TreeOutput::Stat(stat) => Ok(stat),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn exists(&mut self, path: &str) -> ClientResult<bool> {
        let command = TreeCommand::Exists {
            path: path.to_owned(),
        };
        match self.tree_output(command).await? {
            TreeOutput::Exists(exists) => Ok(exists),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn children(&mut self, path: &str) -> ClientResult<Vec<String>> {
        let command = TreeCommand::Children {
            path: path.to_owned(),
        };
        match self.tree_output(command).await? {
            TreeOutput::Children(children) => Ok(children),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn stat(&mut self, path: &str) -> ClientResult<Stat> {
        let command = TreeCommand::Stat {
            path: path.to_owned(),
        };
        match self.tree_output(command).await? {
            TreeOutput::Stat(stat) => Ok(stat),
            other => Err(unexpected(&other)),
        }
    }

    /// Hex digest of the whole tree.
    pub async fn sha256(&mut self) -> ClientResult<String> {
        match self.tree_output(TreeCommand::Sha256).await? {
            TreeOutput::Hash(hash) => Ok(hash),
            other => Err(unexpected(&other)),
        }
    }

    // ========================================================================
    // Queue
    // ========================================================================

    /// Runs a queue command.
    pub async fn queue(&mut self, command: &QueueCommand) -> ClientResult<QueueReply> {
        let reply = self.submit(encode(command)?).await?;
        Ok(decode(&reply)?)
    }

    async fn queue_output(&mut self, command: QueueCommand) -> ClientResult<QueueOutput> {
        Ok(self.queue(&command).await??)
    }

    /// Appends a message and returns its id.
    pub async fn push(&mut self, value: &str) -> ClientResult<u64> {
        match self.queue_output(QueueCommand::Push(value.to_owned())).await? {
            QueueOutput::Pushed(id) => Ok(id),
            other => Err(unexpected(&other)),
        }
    }

    /// Takes the head message, moving it to in-progress.
    pub async fn pop(&mut self) -> ClientResult<Option<QueueMessage>> {
        match self.queue_output(QueueCommand::Pop).await? {
            QueueOutput::Popped(message) => Ok(message),
            other => Err(unexpected(&other)),
        }
    }

    /// Acknowledges an in-progress message.
    pub async fn done(&mut self, id: u64) -> ClientResult<()> {
        match self.queue_output(QueueCommand::Done(id)).await? {
            QueueOutput::Done => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn len(&mut self) -> ClientResult<u64> {
        match self.queue_output(QueueCommand::Len).await? {
            QueueOutput::Len(len) => Ok(len),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn len_in_progress(&mut self) -> ClientResult<u64> {
        match self.queue_output(QueueCommand::LenInProgress).await? {
            QueueOutput::Len(len) => Ok(len),
            other => Err(unexpected(&other)),
        }
    }
}

fn unexpected(output: &impl std::fmt::Debug) -> ClientError {
    ClientError::Unexpected(format!("{output:?}"))
}

/// Prefers the error from the last real attempt over a bare timeout.
fn last_or(last: ClientError, fallback: ClientError) -> ClientError {
    match last {
        ClientError::TimedOut => fallback,
        last => last,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use tessera_kernel::{Tree, TreeError};
    use tessera_vr::RpcHandler;
    use test_case::test_case;

    use super::*;

    /// Replica 1 is the master and runs a real tree. Everyone else
    /// redirects to it; `refusals` makes the master answer with a failover
    /// error that many times first.
    #[derive(Debug)]
    struct FakeCluster {
        tree: Mutex<Tree>,
        refusals: Mutex<usize>,
        seen: Mutex<HashMap<(ClientId, u64), Bytes>>,
        sends: Mutex<usize>,
    }

    impl FakeCluster {
        fn new(refusals: usize) -> Arc<Self> {
            Arc::new(Self {
                tree: Mutex::new(Tree::new()),
                refusals: Mutex::new(refusals),
                seen: Mutex::new(HashMap::new()),
                sends: Mutex::new(0),
            })
        }

        fn sends(&self) -> usize {
            *self.sends.lock().expect("lock")
        }
    }

    #[async_trait]
    impl Transport for FakeCluster {
        async fn call(&self, to: ReplicaId, request: Request) -> Result<RpcResult, TransportError> {
            let master = ReplicaId::new(1);
            match request {
                Request::GetMaster => Ok(Ok(Response::Master(master))),
                Request::Send(_) if to != master => Ok(Err(RpcError::NotMaster { master })),
                Request::Send(req) => {
                    *self.sends.lock().expect("lock") += 1;
                    {
                        let mut refusals = self.refusals.lock().expect("lock");
                        if *refusals > 0 {
                            *refusals -= 1;
                            return Ok(Err(RpcError::MasterFailover));
                        }
                    }
                    let mut seen = self.seen.lock().expect("lock");
                    if let Some(reply) = seen.get(&(req.client_id, req.request_number)) {
                        return Ok(Ok(Response::Reply(reply.clone())));
                    }
                    let command: TreeCommand = decode(&req.payload).expect("decode");
                    let reply = encode(&self.tree.lock().expect("lock").execute(&command)).expect("encode");
                    seen.insert((req.client_id, req.request_number), reply.clone());
                    Ok(Ok(Response::Reply(reply)))
                }
                _ => Ok(Err(RpcError::NotNormal)),
            }
        }

        async fn listen(&self, _handler: Arc<dyn RpcHandler>) -> Result<(), TransportError> {
            Ok(())
        }

        async fn disconnect(&self) {}

        async fn reconnect(&self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    /// Answers every call with the same rejection.
    #[derive(Debug)]
    struct Refusing(RpcError);

    #[async_trait]
    impl Transport for Refusing {
        async fn call(&self, _to: ReplicaId, request: Request) -> Result<RpcResult, TransportError> {
            match request {
                Request::GetMaster => Ok(Ok(Response::Master(ReplicaId::new(0)))),
                _ => Ok(Err(self.0.clone())),
            }
        }

        async fn listen(&self, _handler: Arc<dyn RpcHandler>) -> Result<(), TransportError> {
            Ok(())
        }

        async fn disconnect(&self) {}

        async fn reconnect(&self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn fast() -> ClientConfig {
        ClientConfig {
            timeout: Duration::from_millis(50),
            give_up_factor: 4,
            backoff: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn discovers_the_master() {
        let cluster = FakeCluster::new(0);
        let mut client = Client::new(cluster, 3, fast());
        assert_eq!(client.discover_master().await.expect("master"), ReplicaId::new(1));
        assert_eq!(client.master(), Some(ReplicaId::new(1)));
    }

    #[tokio::test]
    async fn follows_redirects() {
        let cluster = FakeCluster::new(0);
        let mut client = Client::new(cluster.clone(), 3, fast());
        client.master = Some(ReplicaId::new(2));

        let node = client.create("/a", "1").await.expect("create");
        assert_eq!(node.value, "1");
        assert_eq!(client.master(), Some(ReplicaId::new(1)));
        assert_eq!(cluster.sends(), 1);
    }

    #[tokio::test]
    async fn retries_through_failover_without_reapplying() {
        let cluster = FakeCluster::new(2);
        let mut client = Client::new(cluster.clone(), 3, fast());

        client.create("/once", "v").await.expect("create");
        assert_eq!(cluster.sends(), 3);
        assert_eq!(client.get("/once").await.expect("get").stat.version, 1);
    }

    #[tokio::test]
    async fn tree_errors_are_typed() {
        let cluster = FakeCluster::new(0);
        let mut client = Client::new(cluster, 3, fast());

        let err = client.get("/missing").await.expect_err("missing");
        assert!(matches!(err, ClientError::Tree(TreeError::NotFound { .. })));
    }

    #[tokio::test]
    async fn gives_up_while_the_cluster_fails_over() {
        let mut client = Client::new(Arc::new(Refusing(RpcError::MasterFailover)), 3, fast());
        let err = client.submit(Bytes::from_static(b"x")).await.expect_err("no master");
        assert!(matches!(err, ClientError::Rejected(_)));
    }

    #[test_case(RpcError::OldRequest ; "old request")]
    #[test_case(RpcError::StateMachine("boom".into()) ; "state machine")]
    #[tokio::test]
    async fn final_rejections_are_not_retried(error: RpcError) {
        let mut client = Client::new(Arc::new(Refusing(error.clone())), 3, fast());
        let err = client.submit(Bytes::from_static(b"x")).await.expect_err("rejected");
        match (error, err) {
            (RpcError::OldRequest, ClientError::OldRequest) => {}
            (RpcError::StateMachine(expected), ClientError::Rejected(msg)) => assert_eq!(msg, expected),
            (_, other) => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn give_up_budget_scales_with_timeout() {
        let config = ClientConfig::default();
        assert_eq!(config.give_up_after(), Duration::from_secs(15));
    }
}
