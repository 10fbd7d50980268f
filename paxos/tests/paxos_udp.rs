use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;

use paxos::{
    receive_and_handle_paxos_message, send_request, Acceptor, MemoryLog, PaxosNode, PaxosReply,
    RequestBody, UdpTransport,
};

async fn start_replicas(count: usize) -> Vec<String> {
    let mut sockets = Vec::new();
    for _ in 0..count {
        sockets.push(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    }
    let addrs: Vec<String> = sockets
        .iter()
        .map(|s| s.local_addr().unwrap().to_string())
        .collect();

    for (socket, me) in sockets.into_iter().zip(addrs.iter()) {
        let acceptor = Arc::new(Acceptor::open(me, MemoryLog::new(), None, None).unwrap());
        let node = PaxosNode::new(
            me,
            addrs.clone(),
            acceptor,
            UdpTransport::new(me),
            Duration::from_millis(500),
        );
        tokio::spawn(receive_and_handle_paxos_message(
            Arc::new(socket),
            Arc::new(node),
        ));
    }
    addrs
}

async fn status(addr: &str) -> paxos::NodeStatus {
    match send_request("test", addr, RequestBody::Status).await.unwrap() {
        PaxosReply::Status(status) => status,
        other => panic!("unexpected reply {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn replicas_agree_over_udp() {
    let addrs = start_replicas(3).await;

    let reply = tokio::time::timeout(
        Duration::from_secs(10),
        send_request(
            "test",
            &addrs[0],
            RequestBody::Propose {
                value: "x".to_string(),
            },
        ),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(
        reply,
        PaxosReply::Proposed {
            instance: 1,
            decided: true
        }
    );

    for addr in &addrs {
        let status = status(addr).await;
        assert_eq!(status.me, *addr);
        assert_eq!(status.highest_committed, 1);
        assert_eq!(status.last_value.as_deref(), Some("x"));
    }

    let reply = send_request(
        &addrs[0],
        &addrs[1],
        RequestBody::CommittedSince { after: 0 },
    )
    .await
    .unwrap();
    assert_eq!(reply, PaxosReply::Committed(vec![(1, "x".to_string())]));
}

#[tokio::test]
async fn garbage_datagrams_are_ignored() {
    let addrs = start_replicas(1).await;

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.send_to(b"not json", addrs[0].as_str()).await.unwrap();

    let status = status(&addrs[0]).await;
    assert_eq!(status.highest_committed, 0);
    assert!(!status.running);
}
