//! Client against real replicas on the in-memory network.

use std::sync::Arc;

use tessera_client::{Client, ClientConfig, ClientError};
use tessera_kernel::{Queue, StateMachine, Tree, TreeError};
use tessera_vr::{MemoryNetwork, Replica, ReplicaConfig, ReplicaId};

async fn start<S: StateMachine + Clone>(size: usize, app: S) -> (MemoryNetwork, Vec<Replica<S>>) {
    let network = MemoryNetwork::new();
    let mut replicas = Vec::new();
    for i in 0..size {
        let id = ReplicaId::new(i as u8);
        let replica = Replica::start(
            ReplicaConfig::testing(id, size),
            Arc::new(network.transport(id)),
            app.clone(),
        )
        .await
        .expect("start");
        replicas.push(replica);
    }
    (network, replicas)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_tree_operations() {
    let (network, replicas) = start(3, Tree::new()).await;
    let mut client = Client::new(Arc::new(network.client()), 3, ClientConfig::testing());

    let node = client.create("/dev/null", "void").await.expect("create");
    assert_eq!(node.value, "void");
    assert_eq!(node.stat.version, 1);

    assert!(client.exists("/dev").await.expect("exists"));
    assert_eq!(client.children("/dev").await.expect("children"), vec!["null".to_owned()]);

    let updated = client.set("/dev/null", "still void").await.expect("set");
    assert_eq!(updated.stat.version, 2);
    assert_eq!(client.get("/dev/null").await.expect("get").value, "still void");

    let err = client.create("/dev/null", "again").await.expect_err("exists");
    assert!(matches!(err, ClientError::Tree(TreeError::NodeExists { .. })));
    let err = client.delete("/dev").await.expect_err("not empty");
    assert!(matches!(err, ClientError::Tree(TreeError::NotEmpty { .. })));

    client.delete("/dev/null").await.expect("delete");
    assert!(!client.exists("/dev/null").await.expect("exists"));
    assert_eq!(client.stat("/dev").await.expect("stat").num_children, 0);

    let hash = client.sha256().await.expect("hash");
    assert_eq!(hash.len(), 64);

    for replica in &replicas {
        replica.shutdown().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_queue_operations() {
    let (network, replicas) = start(3, Queue::new()).await;
    let mut client = Client::new(Arc::new(network.client()), 3, ClientConfig::testing());

    let first = client.push("a").await.expect("push");
    let second = client.push("b").await.expect("push");
    assert!(second > first);
    assert_eq!(client.len().await.expect("len"), 2);

    let message = client.pop().await.expect("pop").expect("a message");
    assert_eq!(message.value, "a");
    assert_eq!(client.len_in_progress().await.expect("in progress"), 1);

    client.done(message.id).await.expect("done");
    assert!(client.done(message.id).await.is_err());
    assert_eq!(client.len_in_progress().await.expect("in progress"), 0);
    assert_eq!(client.len().await.expect("len"), 1);

    for replica in &replicas {
        replica.shutdown().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_client_survives_master_failover() {
    let (network, replicas) = start(3, Tree::new()).await;
    let mut client = Client::new(Arc::new(network.client()), 3, ClientConfig::testing());

    client.create("/before", "1").await.expect("create");
    let master = client.master().expect("known master");
    replicas[master.as_usize()].disconnect().await;

    client.create("/after", "2").await.expect("create after failover");
    assert_ne!(client.master(), Some(master));
    assert_eq!(client.get("/before").await.expect("get").value, "1");

    for replica in &replicas {
        replica.shutdown().await;
    }
}
