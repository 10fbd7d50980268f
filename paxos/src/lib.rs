extern crate common;

pub mod acceptor;
pub mod error;
pub mod log;
pub mod message;
pub mod network;
pub mod node;
pub mod proposer;
pub mod quorum;
pub mod transport;
pub mod types;

pub use crate::acceptor::{Acceptor, AcceptorState, CommitListener, Slot};
pub use crate::error::{LogError, PaxosError, RpcError};
pub use crate::log::{FileLog, LogRecord, LogStore, MemoryLog};
pub use crate::message::{NodeStatus, PaxosMessage, PaxosReply, RequestBody};
pub use crate::network::receive_and_handle_paxos_message;
pub use crate::node::PaxosNode;
pub use crate::proposer::{Breakpoint, CrashHook, Proposer};
pub use crate::transport::{send_request, AcceptorRpc, LocalTransport, UdpTransport};
pub use crate::types::{Instance, ProposalNumber};
