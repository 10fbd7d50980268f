#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use paxos::{
    Acceptor, CommitListener, CrashHook, Instance, LocalTransport, MemoryLog, PaxosNode,
};

pub const TIMEOUT: Duration = Duration::from_millis(200);

pub type Commits = Arc<Mutex<Vec<(String, Instance, String)>>>;

/// In-process replicas wired together through one `LocalTransport`.
pub struct Cluster {
    pub transport: LocalTransport,
    pub names: Vec<String>,
    pub logs: Vec<MemoryLog>,
    pub nodes: Vec<Arc<PaxosNode<LocalTransport>>>,
    pub commits: Commits,
}

fn listener(commits: &Commits, me: &str) -> Arc<dyn CommitListener> {
    let commits = commits.clone();
    let me = me.to_string();
    Arc::new(move |instance: Instance, value: &str| {
        commits
            .lock()
            .unwrap()
            .push((me.clone(), instance, value.to_string()));
    })
}

impl Cluster {
    pub fn new(names: &[&str]) -> Self {
        let transport = LocalTransport::new();
        let commits: Commits = Arc::new(Mutex::new(Vec::new()));
        let mut cluster = Cluster {
            transport,
            names: names.iter().map(|n| n.to_string()).collect(),
            logs: Vec::new(),
            nodes: Vec::new(),
            commits,
        };
        for i in 0..names.len() {
            let log = MemoryLog::new();
            cluster.logs.push(log.clone());
            let node = cluster.build(i, log, None);
            cluster.nodes.push(node);
        }
        cluster
    }

    fn build(
        &self,
        i: usize,
        log: MemoryLog,
        hook: Option<Arc<dyn CrashHook>>,
    ) -> Arc<PaxosNode<LocalTransport>> {
        let me = &self.names[i];
        let acceptor =
            Arc::new(Acceptor::open(me, log, None, Some(listener(&self.commits, me))).unwrap());
        self.transport.register(me, acceptor.clone());
        let node = PaxosNode::new(
            me,
            self.names.clone(),
            acceptor,
            self.transport.as_node(me),
            TIMEOUT,
        );
        let node = match hook {
            Some(hook) => node.with_crash_hook(hook),
            None => node,
        };
        Arc::new(node)
    }

    pub fn node(&self, i: usize) -> &Arc<PaxosNode<LocalTransport>> {
        &self.nodes[i]
    }

    pub fn acceptor(&self, i: usize) -> &Arc<Acceptor> {
        self.nodes[i].acceptor()
    }

    pub fn set_down(&self, i: usize, down: bool) {
        self.transport.set_down(&self.names[i], down);
    }

    /// Replaces node `i` with a fresh one replayed from its log, as after a
    /// process restart.
    pub fn restart(&mut self, i: usize) {
        self.restart_with_hook(i, None);
    }

    pub fn restart_with_hook(&mut self, i: usize, hook: Option<Arc<dyn CrashHook>>) {
        let node = self.build(i, self.logs[i].clone(), hook);
        self.nodes[i] = node;
    }

    /// Values committed for `instance`, one per node, `None` where missing.
    pub fn values(&self, instance: Instance) -> Vec<Option<String>> {
        self.nodes
            .iter()
            .map(|n| n.acceptor().value(instance))
            .collect()
    }
}
