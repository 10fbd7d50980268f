//! Proposer side of single-decree Paxos.
//!
//! `run` drives one instance through prepare, accept and decide against the
//! given node list, one node at a time. The proposer's own mutex guards the
//! busy flag and round counter; it is released around every network call and
//! taken again to fold a prepare reply's rounds into the counter.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::acceptor::Acceptor;
use crate::error::RpcError;
use crate::message::{AcceptArgs, DecideArgs, PrepareArgs};
use crate::quorum::majority;
use crate::transport::AcceptorRpc;
use crate::types::{Instance, ProposalNumber};

/// Points in `run` where a test can make the proposer "crash".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Breakpoint {
    AfterPrepare,
    AfterAccept,
}

impl fmt::Display for Breakpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Breakpoint::AfterPrepare => write!(f, "1 (between prepare and accept)"),
            Breakpoint::AfterAccept => write!(f, "2 (between accept and decide)"),
        }
    }
}

/// Called when an armed breakpoint is reached. The run stops right after,
/// whether or not the hook returns.
pub trait CrashHook: Send + Sync {
    fn crash(&self, at: Breakpoint);
}

impl<F> CrashHook for F
where
    F: Fn(Breakpoint) + Send + Sync,
{
    fn crash(&self, at: Breakpoint) {
        self(at)
    }
}

struct ProposerState {
    stable: bool,
    my_n: ProposalNumber,
    /// Highest round seen in replies from acceptors.
    seen_round: u64,
    break1: bool,
    break2: bool,
}

struct Prepared {
    accepts: Vec<String>,
    value: Option<String>,
}

pub struct Proposer<T> {
    me: String,
    acceptor: Arc<Acceptor>,
    rpc: T,
    timeout: Duration,
    state: Mutex<ProposerState>,
    crash_hook: Arc<dyn CrashHook>,
}

/// Marks the proposer stable again however `run` exits.
struct Running<'a>(&'a Mutex<ProposerState>);

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).stable = true;
    }
}

impl<T: AcceptorRpc> Proposer<T> {
    pub fn new(me: &str, acceptor: Arc<Acceptor>, rpc: T, timeout: Duration) -> Self {
        Proposer {
            me: me.to_string(),
            acceptor,
            rpc,
            timeout,
            state: Mutex::new(ProposerState {
                stable: true,
                my_n: ProposalNumber::new(0, me),
                seen_round: 0,
                break1: false,
                break2: false,
            }),
            crash_hook: Arc::new(|at: Breakpoint| {
                log::warn!("breakpoint {} reached with no crash hook installed", at);
            }),
        }
    }

    pub fn with_crash_hook(mut self, hook: Arc<dyn CrashHook>) -> Self {
        self.crash_hook = hook;
        self
    }

    fn lock(&self) -> MutexGuard<'_, ProposerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn me(&self) -> &str {
        &self.me
    }

    pub fn is_running(&self) -> bool {
        !self.lock().stable
    }

    /// The proposal number used by the latest run.
    pub fn proposal(&self) -> ProposalNumber {
        self.lock().my_n.clone()
    }

    pub fn arm(&self, at: Breakpoint) {
        log::info!("proposer({}) arming breakpoint {}", self.me, at);
        self.set_breakpoint(at, true);
    }

    pub fn disarm(&self, at: Breakpoint) {
        self.set_breakpoint(at, false);
    }

    fn set_breakpoint(&self, at: Breakpoint, armed: bool) {
        let mut state = self.lock();
        match at {
            Breakpoint::AfterPrepare => state.break1 = armed,
            Breakpoint::AfterAccept => state.break2 = armed,
        }
    }

    /// Returns true if the breakpoint was armed and the run must stop.
    fn breakpoint(&self, at: Breakpoint) -> bool {
        let armed = {
            let state = self.lock();
            match at {
                Breakpoint::AfterPrepare => state.break1,
                Breakpoint::AfterAccept => state.break2,
            }
        };
        if armed {
            log::warn!("proposer({}) dying at breakpoint {}", self.me, at);
            self.crash_hook.crash(at);
        }
        armed
    }

    /// Picks a round above our last one and above every round observed,
    /// locally or in replies.
    fn setn(&self, state: &mut ProposerState) {
        let local = self.acceptor.promised().round;
        let round = state.my_n.round.max(local).max(state.seen_round) + 1;
        state.my_n = ProposalNumber::new(round, &self.me);
    }

    async fn call<R, F>(&self, fut: F) -> Result<R, RpcError>
    where
        F: Future<Output = Result<R, RpcError>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(RpcError::Timeout),
        }
    }

    /// Runs one instance of Paxos. Returns true only if this call got a
    /// majority in both phases and sent out the decision.
    pub async fn run(&self, instance: Instance, nodes: &[String], value: &str) -> bool {
        let n = {
            let mut state = self.lock();
            log::info!(
                "proposer({}) start: initiate paxos for {} w. i={} v={} stable={}",
                self.me,
                nodes.join(","),
                instance,
                value,
                state.stable
            );
            if !state.stable {
                log::info!("proposer({}) run: already running", self.me);
                return false;
            }
            state.stable = false;
            self.setn(&mut state);
            state.my_n.clone()
        };
        let _running = Running(&self.state);

        let prepared = match self.prepare(instance, nodes, &n).await {
            Some(prepared) => prepared,
            None => return false,
        };
        if !majority(nodes, &prepared.accepts) {
            log::info!(
                "proposer({}) no majority of prepare responses ({} of {})",
                self.me,
                prepared.accepts.len(),
                nodes.len()
            );
            return false;
        }
        log::info!(
            "proposer({}) received a majority of prepare responses ({} of {})",
            self.me,
            prepared.accepts.len(),
            nodes.len()
        );

        let v = match prepared.value {
            Some(v) => v,
            None => {
                log::debug!("proposer({}) no value accepted yet, using own value", self.me);
                value.to_string()
            }
        };

        if self.breakpoint(Breakpoint::AfterPrepare) {
            return false;
        }

        let accepts = self.accept(instance, &prepared.accepts, &n, &v).await;
        if !majority(nodes, &accepts) {
            log::info!(
                "proposer({}) no majority of accept responses ({} of {})",
                self.me,
                accepts.len(),
                nodes.len()
            );
            return false;
        }
        log::info!(
            "proposer({}) received a majority of accept responses ({} of {})",
            self.me,
            accepts.len(),
            nodes.len()
        );

        if self.breakpoint(Breakpoint::AfterAccept) {
            return false;
        }

        self.decide(instance, &accepts, &v).await;
        true
    }

    /// Phase 1. Returns `None` if some node reported the instance as
    /// already decided; in that case the decision has been adopted locally.
    async fn prepare(
        &self,
        instance: Instance,
        nodes: &[String],
        n: &ProposalNumber,
    ) -> Option<Prepared> {
        let args = PrepareArgs {
            instance,
            n: n.clone(),
        };
        let mut accepts = Vec::new();
        let mut highest: Option<(ProposalNumber, String)> = None;

        for node in nodes {
            let result = self.call(self.rpc.prepare(node, args.clone())).await;

            let old_value = {
                let mut state = self.lock();
                let reply = match result {
                    Ok(reply) => reply,
                    Err(err) => {
                        log::warn!("proposer({}) prepare to {} failed: {}", self.me, node, err);
                        continue;
                    }
                };
                state.seen_round = state
                    .seen_round
                    .max(reply.promised.round)
                    .max(reply.n_a.round);

                if reply.old_instance {
                    Some(reply.value)
                } else {
                    if reply.accept {
                        accepts.push(node.clone());
                        if let Some(v_a) = reply.v_a {
                            let higher = match &highest {
                                Some((n_a, _)) => reply.n_a > *n_a,
                                None => true,
                            };
                            if higher {
                                highest = Some((reply.n_a, v_a));
                            }
                        }
                    }
                    None
                }
            };

            if let Some(value) = old_value {
                log::info!(
                    "proposer({}) prepare: {} reports instance {} already decided",
                    self.me,
                    node,
                    instance
                );
                match value {
                    Some(value) => {
                        if let Err(err) = self.acceptor.commit(instance, &value) {
                            log::error!(
                                "proposer({}) failed to adopt decided instance {}: {}",
                                self.me,
                                instance,
                                err
                            );
                        }
                    }
                    None => log::warn!(
                        "proposer({}) {} has no value for decided instance {}",
                        self.me,
                        node,
                        instance
                    ),
                }
                return None;
            }
        }

        log::debug!("proposer({}) prepare: done", self.me);
        Some(Prepared {
            accepts,
            value: highest.map(|(_, v)| v),
        })
    }

    async fn accept(
        &self,
        instance: Instance,
        nodes: &[String],
        n: &ProposalNumber,
        value: &str,
    ) -> Vec<String> {
        let args = AcceptArgs {
            instance,
            n: n.clone(),
            value: value.to_string(),
        };
        let mut accepts = Vec::new();

        for node in nodes {
            match self.call(self.rpc.accept(node, args.clone())).await {
                Ok(true) => accepts.push(node.clone()),
                Ok(false) => log::debug!("proposer({}) accept rejected by {}", self.me, node),
                Err(err) => log::warn!("proposer({}) accept to {} failed: {}", self.me, node, err),
            }
        }

        log::debug!("proposer({}) accept: done", self.me);
        accepts
    }

    async fn decide(&self, instance: Instance, accepts: &[String], value: &str) {
        let args = DecideArgs {
            instance,
            value: value.to_string(),
        };

        for node in accepts {
            if let Err(err) = self.call(self.rpc.decide(node, args.clone())).await {
                log::warn!("proposer({}) decide to {} failed: {}", self.me, node, err);
            }
        }

        log::debug!("proposer({}) decide: done", self.me);
    }
}
