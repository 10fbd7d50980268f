use serde::{Deserialize, Serialize};

use crate::types::{Instance, ProposalNumber};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareArgs {
    pub instance: Instance,
    pub n: ProposalNumber,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PrepareReply {
    /// The instance is already committed here; `value` holds the decision.
    pub old_instance: bool,
    pub accept: bool,
    /// Highest proposal accepted so far (`ZERO` if none) and its value.
    pub n_a: ProposalNumber,
    pub v_a: Option<String>,
    /// Committed value when `old_instance` is set.
    pub value: Option<String>,
    /// The acceptor's promise at the time of the reply.
    pub promised: ProposalNumber,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptArgs {
    pub instance: Instance,
    pub n: ProposalNumber,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecideArgs {
    pub instance: Instance,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub me: String,
    pub highest_committed: Instance,
    pub promised: ProposalNumber,
    pub running: bool,
    pub last_value: Option<String>,
}

/// A request datagram. `src` names the sender for logging and catch-up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaxosMessage {
    pub src: String,
    pub body: RequestBody,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestBody {
    Prepare(PrepareArgs),
    Accept(AcceptArgs),
    Decide(DecideArgs),
    CommittedSince { after: Instance },
    Propose { value: String },
    Status,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaxosReply {
    Prepare(PrepareReply),
    Accept(bool),
    Decided,
    Committed(Vec<(Instance, String)>),
    Proposed { instance: Instance, decided: bool },
    Status(NodeStatus),
    Error(String),
}

impl PaxosReply {
    pub fn kind(&self) -> &'static str {
        match self {
            PaxosReply::Prepare(_) => "prepare",
            PaxosReply::Accept(_) => "accept",
            PaxosReply::Decided => "decided",
            PaxosReply::Committed(_) => "committed",
            PaxosReply::Proposed { .. } => "proposed",
            PaxosReply::Status(_) => "status",
            PaxosReply::Error(_) => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_wire_shape() {
        let msg = PaxosMessage {
            src: "a".to_string(),
            body: RequestBody::Prepare(PrepareArgs {
                instance: 2,
                n: ProposalNumber::new(7, "a"),
            }),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["src"], "a");
        assert_eq!(json["body"]["Prepare"]["instance"], 2);
        assert_eq!(json["body"]["Prepare"]["n"]["round"], 7);
    }

    #[test]
    fn unit_variants_decode() {
        let msg: PaxosMessage = serde_json::from_str(r#"{"src":"cli","body":"Status"}"#).unwrap();
        assert_eq!(msg.body, RequestBody::Status);
        let reply: PaxosReply = serde_json::from_str(r#""Decided""#).unwrap();
        assert_eq!(reply.kind(), "decided");
    }
}
