use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;

use crate::message::{PaxosMessage, PaxosReply};
use crate::node::PaxosNode;
use crate::transport::{AcceptorRpc, MAX_DATAGRAM};

pub async fn send_reply(socket: &UdpSocket, addr: SocketAddr, reply: &PaxosReply) {
    let serialized_reply = match serde_json::to_vec(reply) {
        Ok(bytes) => bytes,
        Err(err) => {
            log::error!("Failed to serialize {} reply: {}", reply.kind(), err);
            return;
        }
    };
    if serialized_reply.len() > MAX_DATAGRAM {
        log::error!(
            "Dropping {} reply to {}: {} bytes exceeds datagram limit",
            reply.kind(),
            addr,
            serialized_reply.len()
        );
        return;
    }
    if let Err(err) = socket.send_to(&serialized_reply, addr).await {
        log::warn!("Error sending reply to {}: {}", addr, err);
    }
}

/// Receives requests on `socket` forever, handling each on its own task and
/// replying to the datagram's source address.
pub async fn receive_and_handle_paxos_message<T>(socket: Arc<UdpSocket>, node: Arc<PaxosNode<T>>)
where
    T: AcceptorRpc + Clone + 'static,
{
    match socket.local_addr() {
        Ok(addr) => log::info!("Paxos node {} serving on {}", node.me(), addr),
        Err(err) => log::warn!("Paxos node {} serving on unknown address: {}", node.me(), err),
    }

    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (len, addr) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(err) => {
                log::warn!("Error receiving message: {}", err);
                continue;
            }
        };

        let message: PaxosMessage = match serde_json::from_slice(&buf[..len]) {
            Ok(message) => message,
            Err(err) => {
                log::warn!("Dropping undecodable datagram from {}: {}", addr, err);
                continue;
            }
        };
        log::debug!("Received {:?} from {} ({})", message.body, message.src, addr);

        let node = node.clone();
        let socket = socket.clone();
        tokio::spawn(async move {
            let reply = node.handle(&message.src, message.body).await;
            send_reply(&socket, addr, &reply).await;
        });
    }
}
