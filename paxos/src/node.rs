use std::sync::Arc;
use std::time::Duration;

use crate::acceptor::Acceptor;
use crate::error::{PaxosError, RpcError};
use crate::message::{NodeStatus, PaxosReply, RequestBody};
use crate::proposer::{CrashHook, Proposer};
use crate::transport::AcceptorRpc;
use crate::types::Instance;

/// One replica: its acceptor, its proposer and the replica set it proposes to.
pub struct PaxosNode<T> {
    me: String,
    nodes: Vec<String>,
    acceptor: Arc<Acceptor>,
    proposer: Proposer<T>,
    rpc: T,
    timeout: Duration,
}

impl<T: AcceptorRpc + Clone> PaxosNode<T> {
    pub fn new(
        me: &str,
        nodes: Vec<String>,
        acceptor: Arc<Acceptor>,
        rpc: T,
        timeout: Duration,
    ) -> Self {
        let proposer = Proposer::new(me, acceptor.clone(), rpc.clone(), timeout);
        PaxosNode {
            me: me.to_string(),
            nodes,
            acceptor,
            proposer,
            rpc,
            timeout,
        }
    }

    pub fn with_crash_hook(mut self, hook: Arc<dyn CrashHook>) -> Self {
        self.proposer = self.proposer.with_crash_hook(hook);
        self
    }

    pub fn me(&self) -> &str {
        &self.me
    }

    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    pub fn acceptor(&self) -> &Arc<Acceptor> {
        &self.acceptor
    }

    pub fn proposer(&self) -> &Proposer<T> {
        &self.proposer
    }

    /// Proposes `value` for the instance after the highest one committed here.
    pub async fn propose(&self, value: &str) -> (Instance, bool) {
        let instance = self.acceptor.highest_committed() + 1;
        let decided = self.proposer.run(instance, &self.nodes, value).await;
        (instance, decided)
    }

    /// Pulls every value `peer` has committed past our highest committed
    /// instance and commits them locally in order. Returns how many were new.
    pub async fn catch_up(&self, peer: &str) -> Result<usize, PaxosError> {
        let after = self.acceptor.highest_committed();
        let values = match tokio::time::timeout(self.timeout, self.rpc.committed_since(peer, after))
            .await
        {
            Ok(result) => result?,
            Err(_) => return Err(RpcError::Timeout.into()),
        };

        let mut applied = 0;
        for (instance, value) in values {
            if self.acceptor.commit(instance, &value)? {
                applied += 1;
            }
        }
        log::info!(
            "node({}) caught up {} instances from {}; highest committed now {}",
            self.me,
            applied,
            peer,
            self.acceptor.highest_committed()
        );
        Ok(applied)
    }

    /// Applies a decide; if it is ahead of us, catches up from the sender
    /// first and then applies it again.
    pub async fn decide(&self, src: &str, instance: Instance, value: &str) -> Result<(), PaxosError> {
        match self.acceptor.handle_decide(src, instance, value) {
            Err(PaxosError::InstanceGap { highest, .. }) => {
                log::warn!(
                    "node({}) missing instances {}..{}; catching up from {}",
                    self.me,
                    highest + 1,
                    instance,
                    src
                );
                self.catch_up(src).await?;
                self.acceptor.handle_decide(src, instance, value)
            }
            other => other,
        }
    }

    pub fn status(&self) -> NodeStatus {
        let highest_committed = self.acceptor.highest_committed();
        NodeStatus {
            me: self.me.clone(),
            highest_committed,
            promised: self.acceptor.promised(),
            running: self.proposer.is_running(),
            last_value: self.acceptor.value(highest_committed),
        }
    }

    /// Serves one request from `src`.
    pub async fn handle(&self, src: &str, body: RequestBody) -> PaxosReply {
        let result = match body {
            RequestBody::Prepare(args) => self
                .acceptor
                .handle_prepare(src, args.instance, &args.n)
                .map(PaxosReply::Prepare),
            RequestBody::Accept(args) => self
                .acceptor
                .handle_accept(src, args.instance, &args.n, &args.value)
                .map(PaxosReply::Accept),
            RequestBody::Decide(args) => self
                .decide(src, args.instance, &args.value)
                .await
                .map(|_| PaxosReply::Decided),
            RequestBody::CommittedSince { after } => {
                Ok(PaxosReply::Committed(self.acceptor.committed_since(after)))
            }
            RequestBody::Propose { value } => {
                let (instance, decided) = self.propose(&value).await;
                Ok(PaxosReply::Proposed { instance, decided })
            }
            RequestBody::Status => Ok(PaxosReply::Status(self.status())),
        };

        result.unwrap_or_else(|err| {
            log::warn!("node({}) request from {} failed: {}", self.me, src, err);
            PaxosReply::Error(err.to_string())
        })
    }
}
