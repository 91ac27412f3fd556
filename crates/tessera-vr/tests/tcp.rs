//! A three-replica cluster on loopback TCP.

use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::time::Duration;

use tessera_kernel::codec::{decode, encode};
use tessera_kernel::{Queue, QueueCommand, QueueOutput, QueueReply};
use tessera_vr::{
    ClientId, ClientRequest, Replica, ReplicaConfig, ReplicaId, Request, Response, TcpTransport,
    Transport,
};

fn free_addrs(n: usize) -> Vec<SocketAddr> {
    let listeners: Vec<_> = (0..n)
        .map(|_| TcpListener::bind("127.0.0.1:0").expect("bind"))
        .collect();
    listeners
        .iter()
        .map(|l| l.local_addr().expect("local addr"))
        .collect()
}

/// Asks every replica for the master until one answers, the way a client
/// does.
async fn discover(client: &TcpTransport) -> ReplicaId {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        for i in 0..3 {
            if let Ok(Ok(Response::Master(id))) = client.call(ReplicaId::new(i), Request::GetMaster).await {
                return id;
            }
        }
        assert!(tokio::time::Instant::now() < deadline, "no master");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_queue_over_tcp() {
    let peers = free_addrs(3);
    let mut replicas = Vec::new();
    for i in 0..3u8 {
        let id = ReplicaId::new(i);
        let transport = TcpTransport::new(Some(id), peers.clone());
        let replica = Replica::start(ReplicaConfig::testing(id, 3), Arc::new(transport), Queue::new())
            .await
            .expect("start");
        replicas.push(replica);
    }

    let client = TcpTransport::new(None, peers.clone());
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    let mut master = discover(&client).await;

    let mut request_number = 0;
    let mut send = |command: QueueCommand| {
        request_number += 1;
        Request::Send(ClientRequest {
            client_id: ClientId::new(1),
            request_number,
            payload: encode(&command).expect("encode"),
        })
    };

    let mut replies = Vec::new();
    for command in [
        QueueCommand::Push("first".to_owned()),
        QueueCommand::Push("second".to_owned()),
        QueueCommand::Pop,
        QueueCommand::Len,
    ] {
        let request = send(command);
        let reply = loop {
            match client.call(master, request.clone()).await {
                Ok(Ok(Response::Reply(bytes))) => break decode::<QueueReply>(&bytes).expect("decode"),
                _ => {
                    assert!(tokio::time::Instant::now() < deadline, "command never committed");
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    master = discover(&client).await;
                }
            }
        };
        replies.push(reply);
    }

    assert_eq!(replies[0], Ok(QueueOutput::Pushed(1)));
    assert_eq!(replies[1], Ok(QueueOutput::Pushed(2)));
    assert!(matches!(&replies[2], Ok(QueueOutput::Popped(Some(m))) if m.value == "first"));
    assert_eq!(replies[3], Ok(QueueOutput::Len(1)));

    client.disconnect().await;
    for replica in &replicas {
        replica.shutdown().await;
    }
}
