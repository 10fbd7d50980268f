use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_millis(1000);

/// Size of a strict majority of `n` replicas.
pub fn quorum_size(n: usize) -> usize {
    n / 2 + 1
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("line {line}: unknown configuration directive '{directive}'")]
    UnknownDirective { line: usize, directive: String },

    #[error("line {line}: bad value for '{directive}': {reason}")]
    BadValue {
        line: usize,
        directive: String,
        reason: String,
    },

    #[error("configuration did not specify any replicas")]
    NoReplicas,
}

/// Cluster configuration shared by the server and client binaries.
///
/// Replicas are opaque node ids; for the UDP transport they are `host:port`.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Config {
    pub replicas: Vec<String>,
    pub rpc_timeout: Duration,
    pub log_dir: PathBuf,
}

impl Config {
    pub fn new(replicas: Vec<String>) -> Self {
        Config {
            replicas,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            log_dir: PathBuf::from("."),
        }
    }

    pub fn n(&self) -> usize {
        self.replicas.len()
    }

    pub fn quorum_size(&self) -> usize {
        quorum_size(self.n())
    }

    pub fn is_member(&self, node: &str) -> bool {
        self.replicas.iter().any(|r| r == node)
    }

    /// Path of the durable acceptor log for `node` inside `log_dir`.
    pub fn log_path(&self, node: &str) -> PathBuf {
        let file: String = node
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        self.log_dir.join(format!("paxos-{}.log", file))
    }
}
