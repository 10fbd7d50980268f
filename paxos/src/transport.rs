use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::net::{lookup_host, UdpSocket};

use crate::acceptor::Acceptor;
use crate::error::RpcError;
use crate::message::{
    AcceptArgs, DecideArgs, PaxosMessage, PaxosReply, PrepareArgs, PrepareReply, RequestBody,
};
use crate::types::Instance;

/// Largest datagram the server and clients will read.
pub const MAX_DATAGRAM: usize = 64 * 1024;

/// How a proposer reaches acceptors, including its own. Callers bound each
/// call with a timeout; implementations need not.
#[async_trait]
pub trait AcceptorRpc: Send + Sync {
    async fn prepare(&self, node: &str, args: PrepareArgs) -> Result<PrepareReply, RpcError>;

    async fn accept(&self, node: &str, args: AcceptArgs) -> Result<bool, RpcError>;

    async fn decide(&self, node: &str, args: DecideArgs) -> Result<(), RpcError>;

    /// Committed values at `node` above `after`, used for catch-up.
    async fn committed_since(
        &self,
        node: &str,
        after: Instance,
    ) -> Result<Vec<(Instance, String)>, RpcError>;
}

/// In-process transport that calls acceptors directly.
///
/// Nodes can be marked down to simulate crashes and partitions. The caller
/// identity `me` is passed through to the handlers as the request source.
#[derive(Clone, Default)]
pub struct LocalTransport {
    me: String,
    cluster: Arc<Mutex<LocalCluster>>,
}

#[derive(Default)]
struct LocalCluster {
    acceptors: HashMap<String, Arc<Acceptor>>,
    down: HashSet<String>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// A handle on the same cluster that identifies itself as `me`.
    pub fn as_node(&self, me: &str) -> Self {
        LocalTransport {
            me: me.to_string(),
            cluster: self.cluster.clone(),
        }
    }

    fn cluster(&self) -> MutexGuard<'_, LocalCluster> {
        self.cluster.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds or replaces the acceptor reachable as `node`.
    pub fn register(&self, node: &str, acceptor: Arc<Acceptor>) {
        self.cluster().acceptors.insert(node.to_string(), acceptor);
    }

    pub fn set_down(&self, node: &str, down: bool) {
        let mut cluster = self.cluster();
        if down {
            cluster.down.insert(node.to_string());
        } else {
            cluster.down.remove(node);
        }
    }

    fn target(&self, node: &str) -> Result<Arc<Acceptor>, RpcError> {
        let cluster = self.cluster();
        if cluster.down.contains(node) {
            return Err(RpcError::Unreachable(node.to_string()));
        }
        cluster
            .acceptors
            .get(node)
            .cloned()
            .ok_or_else(|| RpcError::UnknownNode(node.to_string()))
    }
}

#[async_trait]
impl AcceptorRpc for LocalTransport {
    async fn prepare(&self, node: &str, args: PrepareArgs) -> Result<PrepareReply, RpcError> {
        let acceptor = self.target(node)?;
        tokio::task::yield_now().await;
        acceptor
            .handle_prepare(&self.me, args.instance, &args.n)
            .map_err(|e| RpcError::Remote(e.to_string()))
    }

    async fn accept(&self, node: &str, args: AcceptArgs) -> Result<bool, RpcError> {
        let acceptor = self.target(node)?;
        tokio::task::yield_now().await;
        acceptor
            .handle_accept(&self.me, args.instance, &args.n, &args.value)
            .map_err(|e| RpcError::Remote(e.to_string()))
    }

    async fn decide(&self, node: &str, args: DecideArgs) -> Result<(), RpcError> {
        let acceptor = self.target(node)?;
        tokio::task::yield_now().await;
        acceptor
            .handle_decide(&self.me, args.instance, &args.value)
            .map_err(|e| RpcError::Remote(e.to_string()))
    }

    async fn committed_since(
        &self,
        node: &str,
        after: Instance,
    ) -> Result<Vec<(Instance, String)>, RpcError> {
        let acceptor = self.target(node)?;
        Ok(acceptor.committed_since(after))
    }
}

/// JSON-over-UDP transport. Each call binds a fresh ephemeral socket, sends
/// one request datagram and waits for one reply datagram.
#[derive(Debug, Clone)]
pub struct UdpTransport {
    me: String,
}

impl UdpTransport {
    pub fn new(me: &str) -> Self {
        UdpTransport { me: me.to_string() }
    }

    pub async fn call(&self, node: &str, body: RequestBody) -> Result<PaxosReply, RpcError> {
        send_request(&self.me, node, body).await
    }
}

/// Sends one request to `node` and waits for its reply.
pub async fn send_request(src: &str, node: &str, body: RequestBody) -> Result<PaxosReply, RpcError> {
    let addr: SocketAddr = lookup_host(node)
        .await?
        .next()
        .ok_or_else(|| RpcError::UnknownNode(node.to_string()))?;
    let bind: SocketAddr = if addr.is_ipv4() {
        "0.0.0.0:0".parse().map_err(|_| RpcError::UnknownNode(node.to_string()))?
    } else {
        "[::]:0".parse().map_err(|_| RpcError::UnknownNode(node.to_string()))?
    };

    let message = PaxosMessage {
        src: src.to_string(),
        body,
    };
    let serialized_message = serde_json::to_vec(&message)?;
    let socket = UdpSocket::bind(bind).await?;
    socket.connect(addr).await?;
    socket.send(&serialized_message).await?;

    let mut buf = vec![0u8; MAX_DATAGRAM];
    let len = socket.recv(&mut buf).await?;
    let reply: PaxosReply = serde_json::from_slice(&buf[..len])?;
    match reply {
        PaxosReply::Error(reason) => Err(RpcError::Remote(reason)),
        reply => Ok(reply),
    }
}

#[async_trait]
impl AcceptorRpc for UdpTransport {
    async fn prepare(&self, node: &str, args: PrepareArgs) -> Result<PrepareReply, RpcError> {
        match self.call(node, RequestBody::Prepare(args)).await? {
            PaxosReply::Prepare(reply) => Ok(reply),
            other => Err(RpcError::UnexpectedReply(other.kind())),
        }
    }

    async fn accept(&self, node: &str, args: AcceptArgs) -> Result<bool, RpcError> {
        match self.call(node, RequestBody::Accept(args)).await? {
            PaxosReply::Accept(accepted) => Ok(accepted),
            other => Err(RpcError::UnexpectedReply(other.kind())),
        }
    }

    async fn decide(&self, node: &str, args: DecideArgs) -> Result<(), RpcError> {
        match self.call(node, RequestBody::Decide(args)).await? {
            PaxosReply::Decided => Ok(()),
            other => Err(RpcError::UnexpectedReply(other.kind())),
        }
    }

    async fn committed_since(
        &self,
        node: &str,
        after: Instance,
    ) -> Result<Vec<(Instance, String)>, RpcError> {
        match self.call(node, RequestBody::CommittedSince { after }).await? {
            PaxosReply::Committed(values) => Ok(values),
            other => Err(RpcError::UnexpectedReply(other.kind())),
        }
    }
}
