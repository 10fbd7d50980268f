use thiserror::Error;

use crate::types::Instance;

#[derive(Debug, Error)]
pub enum LogError {
    #[error("log I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt log record at line {line}: {source}")]
    Corrupt {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode log record: {0}")]
    Encode(#[source] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum PaxosError {
    /// A decide arrived for an instance past `highest + 1`.
    #[error("decide for instance {instance} but highest committed is {highest}")]
    InstanceGap { instance: Instance, highest: Instance },

    #[error("instance {instance} committed '{committed}' but was asked to decide '{proposed}'")]
    ValueMismatch {
        instance: Instance,
        committed: String,
        proposed: String,
    },

    #[error(transparent)]
    Log(#[from] LogError),

    #[error("catch-up failed: {0}")]
    CatchUp(#[from] RpcError),
}

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("call timed out")]
    Timeout,

    #[error("network I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode or decode message: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("unknown node {0}")]
    UnknownNode(String),

    #[error("node {0} is unreachable")]
    Unreachable(String),

    #[error("remote error: {0}")]
    Remote(String),

    #[error("unexpected {0} reply")]
    UnexpectedReply(&'static str),
}
