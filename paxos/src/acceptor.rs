//! Acceptor side of single-decree Paxos.
//!
//! Every handler runs under one mutex that also covers the log append, so
//! the three handlers are linearizable with respect to each other. State is
//! only changed by applying a record that has already been appended, which
//! is the same function used to replay the log on startup.
//!
//! Promises and acceptances are kept per instance. A node that has fallen
//! behind may take part in a later instance before it learns an earlier one,
//! and the two must never share a slot.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};

use crate::error::PaxosError;
use crate::log::{LogRecord, LogStore};
use crate::message::PrepareReply;
use crate::types::{Instance, ProposalNumber};

/// Upcall invoked once a value is durably committed for an instance.
///
/// Runs after the acceptor's lock has been released, so it may call back into
/// the acceptor. Upcalls are delivered one at a time in commit order.
pub trait CommitListener: Send + Sync {
    fn paxos_commit(&self, instance: Instance, value: &str);
}

impl<F> CommitListener for F
where
    F: Fn(Instance, &str) + Send + Sync,
{
    fn paxos_commit(&self, instance: Instance, value: &str) {
        self(instance, value)
    }
}

/// n_h, n_a and v_a for one instance not yet committed here.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Slot {
    pub promised: ProposalNumber,
    pub n_a: ProposalNumber,
    pub v_a: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AcceptorState {
    /// Working state of every instance above `highest_committed` that has
    /// seen a promise or an acceptance.
    pub slots: BTreeMap<Instance, Slot>,
    pub values: BTreeMap<Instance, String>,
    /// instance_h
    pub highest_committed: Instance,
}

impl AcceptorState {
    pub fn replay(records: &[LogRecord]) -> Self {
        let mut state = AcceptorState::default();
        for record in records {
            state.apply(record);
        }
        state
    }

    /// The slot for `instance`, empty if it has none.
    pub fn slot(&self, instance: Instance) -> Slot {
        self.slots.get(&instance).cloned().unwrap_or_default()
    }

    /// Highest number promised for any open instance.
    pub fn promised(&self) -> ProposalNumber {
        self.slots
            .values()
            .map(|slot| &slot.promised)
            .max()
            .cloned()
            .unwrap_or_default()
    }

    fn apply(&mut self, record: &LogRecord) {
        match record {
            LogRecord::Promise { instance, n } => {
                self.slots.entry(*instance).or_default().promised = n.clone();
            }
            LogRecord::Accept { instance, n, value } => {
                let slot = self.slots.entry(*instance).or_default();
                if *n > slot.promised {
                    slot.promised = n.clone();
                }
                slot.n_a = n.clone();
                slot.v_a = Some(value.clone());
            }
            LogRecord::Commit { instance, value } => {
                self.values.insert(*instance, value.clone());
                self.highest_committed = *instance;
                self.slots = self.slots.split_off(&(*instance + 1));
            }
        }
    }
}

struct Inner {
    state: AcceptorState,
    log: Box<dyn LogStore>,
    /// Commits whose upcall has not run yet, in commit order.
    pending: VecDeque<(Instance, String)>,
}

impl Inner {
    fn record(&mut self, record: LogRecord) -> Result<(), PaxosError> {
        self.log.append(&record)?;
        self.state.apply(&record);
        Ok(())
    }

    /// Commits `instance` if it is ahead of `highest_committed`.
    fn commit(&mut self, me: &str, instance: Instance, value: &str) -> Result<bool, PaxosError> {
        if instance <= self.state.highest_committed {
            return Ok(false);
        }
        log::info!(
            "acceptor({}) commit: instance {} has value '{}'",
            me,
            instance,
            value
        );
        self.record(LogRecord::Commit {
            instance,
            value: value.to_string(),
        })?;
        Ok(true)
    }
}

pub struct Acceptor {
    me: String,
    inner: Mutex<Inner>,
    listener: Option<Arc<dyn CommitListener>>,
    /// Held by whichever thread is currently running upcalls.
    delivering: Mutex<()>,
}

impl Acceptor {
    /// Opens an acceptor over `log`, replaying it first. If nothing has been
    /// committed yet and `first` is given, instance 1 is committed with it.
    pub fn open<L>(
        me: &str,
        log: L,
        first: Option<&str>,
        listener: Option<Arc<dyn CommitListener>>,
    ) -> Result<Self, PaxosError>
    where
        L: LogStore + 'static,
    {
        let records = log.records()?;
        let state = AcceptorState::replay(&records);
        log::info!(
            "acceptor({}) replayed {} log records: highest committed {}, {} open instances",
            me,
            records.len(),
            state.highest_committed,
            state.slots.len()
        );

        let mut inner = Inner {
            state,
            log: Box::new(log),
            pending: VecDeque::new(),
        };
        if let Some(value) = first {
            if inner.state.highest_committed == 0 {
                inner.commit(me, 1, value)?;
            }
        }

        Ok(Acceptor {
            me: me.to_string(),
            inner: Mutex::new(inner),
            listener,
            delivering: Mutex::new(()),
        })
    }

    pub fn me(&self) -> &str {
        &self.me
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Commits under the held lock and queues the upcall.
    fn commit_locked(
        &self,
        inner: &mut Inner,
        instance: Instance,
        value: &str,
    ) -> Result<bool, PaxosError> {
        let committed = inner.commit(&self.me, instance, value)?;
        if committed && self.listener.is_some() {
            inner.pending.push_back((instance, value.to_string()));
        }
        Ok(committed)
    }

    /// Runs queued upcalls. Must be called without the state lock held.
    ///
    /// Only one thread delivers at a time; a thread that finds delivery busy
    /// leaves its upcalls to the current deliverer, which re-checks the queue
    /// after letting go.
    fn deliver(&self) {
        let listener = match &self.listener {
            Some(listener) => listener,
            None => return,
        };
        loop {
            let delivering = match self.delivering.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => return,
            };
            loop {
                let next = self.lock().pending.pop_front();
                match next {
                    Some((instance, value)) => listener.paxos_commit(instance, &value),
                    None => break,
                }
            }
            drop(delivering);
            if self.lock().pending.is_empty() {
                return;
            }
        }
    }

    pub fn handle_prepare(
        &self,
        src: &str,
        instance: Instance,
        n: &ProposalNumber,
    ) -> Result<PrepareReply, PaxosError> {
        let mut inner = self.lock();

        if instance <= inner.state.highest_committed {
            let value = inner.state.values.get(&instance).cloned();
            if value.is_none() {
                log::warn!(
                    "acceptor({}) old instance {} (highest {}) has no stored value",
                    self.me,
                    instance,
                    inner.state.highest_committed
                );
            }
            return Ok(PrepareReply {
                old_instance: true,
                value,
                ..PrepareReply::default()
            });
        }

        let slot = inner.state.slot(instance);
        if *n > slot.promised {
            inner.record(LogRecord::Promise {
                instance,
                n: n.clone(),
            })?;
            log::debug!(
                "acceptor({}) from({}) prepare: promised {} for instance {}",
                self.me,
                src,
                n,
                instance
            );
            return Ok(PrepareReply {
                accept: true,
                n_a: slot.n_a,
                v_a: slot.v_a,
                promised: n.clone(),
                ..PrepareReply::default()
            });
        }

        log::warn!(
            "acceptor({}) from({}) prepare: rejected {} <= promised {} for instance {}",
            self.me,
            src,
            n,
            slot.promised,
            instance
        );
        Ok(PrepareReply {
            promised: slot.promised,
            ..PrepareReply::default()
        })
    }

    pub fn handle_accept(
        &self,
        src: &str,
        instance: Instance,
        n: &ProposalNumber,
        value: &str,
    ) -> Result<bool, PaxosError> {
        let mut inner = self.lock();

        if instance <= inner.state.highest_committed {
            log::warn!(
                "acceptor({}) from({}) accept: instance {} already committed",
                self.me,
                src,
                instance
            );
            return Ok(false);
        }

        let promised = inner.state.slot(instance).promised;
        if *n >= promised {
            inner.record(LogRecord::Accept {
                instance,
                n: n.clone(),
                value: value.to_string(),
            })?;
            log::debug!(
                "acceptor({}) from({}) accept: accepted {} for instance {}",
                self.me,
                src,
                n,
                instance
            );
            return Ok(true);
        }

        log::warn!(
            "acceptor({}) from({}) accept: rejected {} < promised {} for instance {}",
            self.me,
            src,
            n,
            promised,
            instance
        );
        Ok(false)
    }

    pub fn handle_decide(&self, src: &str, instance: Instance, value: &str) -> Result<(), PaxosError> {
        let mut inner = self.lock();
        let highest = inner.state.highest_committed;

        if instance <= highest {
            return match inner.state.values.get(&instance) {
                Some(committed) if committed != value => {
                    log::error!(
                        "acceptor({}) from({}) decide: instance {} committed '{}' but got '{}'",
                        self.me,
                        src,
                        instance,
                        committed,
                        value
                    );
                    Err(PaxosError::ValueMismatch {
                        instance,
                        committed: committed.clone(),
                        proposed: value.to_string(),
                    })
                }
                _ => Ok(()),
            };
        }

        if instance > highest + 1 {
            log::error!(
                "acceptor({}) from({}) decide: instance {} is ahead of highest committed {}",
                self.me,
                src,
                instance,
                highest
            );
            return Err(PaxosError::InstanceGap { instance, highest });
        }

        if let Some(v_a) = inner.state.slots.get(&instance).and_then(|s| s.v_a.as_ref()) {
            if v_a != value {
                log::error!(
                    "acceptor({}) from({}) decide: instance {} decided '{}' but accepted '{}'",
                    self.me,
                    src,
                    instance,
                    value,
                    v_a
                );
            }
        }

        self.commit_locked(&mut inner, instance, value)?;
        drop(inner);
        self.deliver();
        Ok(())
    }

    /// Catch-up path: commits `value` for any instance beyond the highest
    /// committed one, skipping over instances this node never learned.
    /// Returns whether anything changed.
    pub fn commit(&self, instance: Instance, value: &str) -> Result<bool, PaxosError> {
        let committed = {
            let mut inner = self.lock();
            self.commit_locked(&mut inner, instance, value)?
        };
        self.deliver();
        Ok(committed)
    }

    /// Highest number promised for any instance not yet committed here.
    pub fn promised(&self) -> ProposalNumber {
        self.lock().state.promised()
    }

    pub fn slot(&self, instance: Instance) -> Slot {
        self.lock().state.slot(instance)
    }

    pub fn highest_committed(&self) -> Instance {
        self.lock().state.highest_committed
    }

    pub fn value(&self, instance: Instance) -> Option<String> {
        self.lock().state.values.get(&instance).cloned()
    }

    /// Committed values above `after`, in instance order.
    pub fn committed_since(&self, after: Instance) -> Vec<(Instance, String)> {
        self.lock()
            .state
            .values
            .range(after + 1..)
            .map(|(i, v)| (*i, v.clone()))
            .collect()
    }

    pub fn state(&self) -> AcceptorState {
        self.lock().state.clone()
    }

    pub fn dump(&self) -> Result<String, PaxosError> {
        Ok(self.lock().log.dump()?)
    }

    /// Replaces the log with `contents` and rebuilds state from it.
    pub fn restore(&self, contents: &str) -> Result<(), PaxosError> {
        let mut inner = self.lock();
        inner.log.restore(contents)?;
        let records = inner.log.records()?;
        inner.state = AcceptorState::replay(&records);
        log::info!(
            "acceptor({}) restored {} records: highest committed {}",
            self.me,
            records.len(),
            inner.state.highest_committed
        );
        Ok(())
    }
}

impl fmt::Debug for Acceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Acceptor")
            .field("me", &self.me)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::MemoryLog;

    fn pn(round: u64, who: &str) -> ProposalNumber {
        ProposalNumber::new(round, who)
    }

    fn acceptor(log: &MemoryLog) -> Acceptor {
        Acceptor::open("a", log.clone(), None, None).unwrap()
    }

    #[test]
    fn promises_only_higher_numbers() {
        let acc = acceptor(&MemoryLog::new());

        let r = acc.handle_prepare("p", 1, &pn(1, "p")).unwrap();
        assert!(r.accept && !r.old_instance);
        assert!(r.n_a.is_zero());
        assert_eq!(r.v_a, None);

        let r = acc.handle_prepare("q", 1, &pn(1, "p")).unwrap();
        assert!(!r.accept, "equal number must be rejected");
        assert_eq!(r.promised, pn(1, "p"));

        let r = acc.handle_prepare("q", 1, &pn(1, "o")).unwrap();
        assert!(!r.accept);

        let r = acc.handle_prepare("q", 1, &pn(1, "q")).unwrap();
        assert!(r.accept);
        assert_eq!(acc.promised(), pn(1, "q"));
    }

    #[test]
    fn accept_requires_number_at_least_promised() {
        let acc = acceptor(&MemoryLog::new());
        acc.handle_prepare("p", 1, &pn(3, "p")).unwrap();

        assert!(!acc.handle_accept("o", 1, &pn(2, "o"), "low").unwrap());
        assert!(acc.handle_accept("p", 1, &pn(3, "p"), "x").unwrap());
        assert!(acc.handle_accept("q", 1, &pn(4, "q"), "y").unwrap());

        let r = acc.handle_prepare("r", 1, &pn(5, "r")).unwrap();
        assert!(r.accept);
        assert_eq!(r.n_a, pn(4, "q"));
        assert_eq!(r.v_a.as_deref(), Some("y"));
    }

    #[test]
    fn decide_commits_next_instance_and_resets_working_state() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let listener: Arc<dyn CommitListener> = Arc::new(move |i: Instance, v: &str| {
            sink.lock().unwrap().push((i, v.to_string()));
        });
        let acc = Acceptor::open("a", MemoryLog::new(), None, Some(listener)).unwrap();

        acc.handle_prepare("p", 1, &pn(1, "p")).unwrap();
        acc.handle_accept("p", 1, &pn(1, "p"), "x").unwrap();
        acc.handle_decide("p", 1, "x").unwrap();

        let state = acc.state();
        assert_eq!(state.highest_committed, 1);
        assert_eq!(state.values.get(&1).map(String::as_str), Some("x"));
        assert!(state.slots.is_empty());
        assert!(acc.promised().is_zero());
        assert_eq!(*seen.lock().unwrap(), vec![(1, "x".to_string())]);
    }

    #[test]
    fn prepare_for_committed_instance_reports_old_instance() {
        let acc = acceptor(&MemoryLog::new());
        acc.handle_decide("p", 1, "x").unwrap();

        let r = acc.handle_prepare("late", 1, &pn(9, "late")).unwrap();
        assert!(r.old_instance);
        assert!(!r.accept);
        assert_eq!(r.value.as_deref(), Some("x"));
        assert!(acc.promised().is_zero(), "old-instance prepare must not promise");

        assert!(!acc.handle_accept("late", 1, &pn(9, "late"), "y").unwrap());
    }

    #[test]
    fn duplicate_decide_is_a_noop_and_mismatch_is_detected() {
        let log = MemoryLog::new();
        let count = Arc::new(Mutex::new(0));
        let c = count.clone();
        let listener: Arc<dyn CommitListener> = Arc::new(move |_: Instance, _: &str| {
            *c.lock().unwrap() += 1;
        });
        let acc = Acceptor::open("a", log.clone(), None, Some(listener)).unwrap();

        acc.handle_decide("p", 1, "x").unwrap();
        let before = acc.state();
        let records = log.len();

        acc.handle_decide("p", 1, "x").unwrap();
        assert_eq!(acc.state(), before);
        assert_eq!(log.len(), records);
        assert_eq!(*count.lock().unwrap(), 1);

        let err = acc.handle_decide("p", 1, "y").unwrap_err();
        assert!(matches!(err, PaxosError::ValueMismatch { instance: 1, .. }));
        assert_eq!(acc.state(), before);
    }

    #[test]
    fn decide_gap_is_rejected_without_state_change() {
        let acc = acceptor(&MemoryLog::new());
        acc.handle_decide("p", 1, "x").unwrap();
        let before = acc.state();

        let err = acc.handle_decide("p", 3, "z").unwrap_err();
        assert!(matches!(
            err,
            PaxosError::InstanceGap {
                instance: 3,
                highest: 1
            }
        ));
        assert_eq!(acc.state(), before);
    }

    #[test]
    fn catch_up_commit_may_jump_ahead() {
        let acc = acceptor(&MemoryLog::new());
        assert!(acc.commit(4, "d").unwrap());
        assert!(!acc.commit(2, "b").unwrap());
        assert_eq!(acc.highest_committed(), 4);
        assert_eq!(acc.value(4).as_deref(), Some("d"));
        assert_eq!(acc.value(2), None);

        let r = acc.handle_prepare("p", 2, &pn(1, "p")).unwrap();
        assert!(r.old_instance);
        assert_eq!(r.value, None);
    }

    #[test]
    fn committed_since_lists_values_in_order() {
        let acc = acceptor(&MemoryLog::new());
        acc.handle_decide("p", 1, "a").unwrap();
        acc.handle_decide("p", 2, "b").unwrap();
        acc.handle_decide("p", 3, "c").unwrap();

        assert_eq!(
            acc.committed_since(1),
            vec![(2, "b".to_string()), (3, "c".to_string())]
        );
        assert!(acc.committed_since(3).is_empty());
    }

    #[test]
    fn reopen_reproduces_state_exactly() {
        let log = MemoryLog::new();
        let before = {
            let acc = acceptor(&log);
            acc.handle_prepare("p", 1, &pn(1, "p")).unwrap();
            acc.handle_accept("p", 1, &pn(1, "p"), "x").unwrap();
            acc.handle_decide("p", 1, "x").unwrap();
            acc.handle_prepare("q", 2, &pn(4, "q")).unwrap();
            acc.handle_accept("q", 2, &pn(4, "q"), "y").unwrap();
            acc.handle_prepare("r", 2, &pn(5, "r")).unwrap();
            acc.state()
        };

        let reopened = acceptor(&log);
        assert_eq!(reopened.state(), before);
        assert_eq!(reopened.promised(), pn(5, "r"));
        assert_eq!(reopened.slot(2).v_a.as_deref(), Some("y"));
        assert_eq!(reopened.slot(2).n_a, pn(4, "q"));
    }

    #[test]
    fn first_node_bootstraps_instance_one_once() {
        let log = MemoryLog::new();
        {
            let acc = Acceptor::open("a", log.clone(), Some("view-1"), None).unwrap();
            assert_eq!(acc.highest_committed(), 1);
            assert_eq!(acc.value(1).as_deref(), Some("view-1"));
        }
        let records = log.len();
        let acc = Acceptor::open("a", log.clone(), Some("other"), None).unwrap();
        assert_eq!(acc.value(1).as_deref(), Some("view-1"));
        assert_eq!(log.len(), records);
    }

    #[test]
    fn restore_rebuilds_state_from_a_dump() {
        let source = acceptor(&MemoryLog::new());
        source.handle_decide("p", 1, "x").unwrap();
        source.handle_prepare("p", 2, &pn(2, "p")).unwrap();

        let target = Acceptor::open("b", MemoryLog::new(), None, None).unwrap();
        target.restore(&source.dump().unwrap()).unwrap();
        assert_eq!(target.state(), source.state());
    }

    #[test]
    fn listener_may_reenter_the_acceptor() {
        let slot: Arc<Mutex<Option<Arc<Acceptor>>>> = Arc::new(Mutex::new(None));
        let observed = Arc::new(Mutex::new(0));
        let (s, o) = (slot.clone(), observed.clone());
        let listener: Arc<dyn CommitListener> = Arc::new(move |_: Instance, _: &str| {
            if let Some(acc) = s.lock().unwrap().as_ref() {
                *o.lock().unwrap() = acc.highest_committed();
            }
        });
        let acc = Arc::new(Acceptor::open("a", MemoryLog::new(), None, Some(listener)).unwrap());
        *slot.lock().unwrap() = Some(acc.clone());

        acc.handle_decide("p", 1, "x").unwrap();
        assert_eq!(*observed.lock().unwrap(), 1);
        slot.lock().unwrap().take();
    }

    #[test]
    fn promises_and_acceptances_are_kept_per_instance() {
        let acc = acceptor(&MemoryLog::new());

        // Behind on instance 1, but taking part in instance 2.
        assert!(acc.handle_prepare("p", 2, &pn(2, "p")).unwrap().accept);
        assert!(acc.handle_accept("p", 2, &pn(2, "p"), "y").unwrap());

        let r = acc.handle_prepare("q", 1, &pn(1, "q")).unwrap();
        assert!(r.accept, "instance 1 has no promise yet");
        assert!(r.n_a.is_zero());
        assert_eq!(r.v_a, None);
        assert!(acc.handle_accept("q", 1, &pn(1, "q"), "x").unwrap());

        acc.handle_decide("q", 1, "x").unwrap();
        assert_eq!(acc.slot(2).v_a.as_deref(), Some("y"));
        assert_eq!(acc.slot(2).n_a, pn(2, "p"));
        assert!(acc.state().slots.get(&1).is_none());
    }

    #[test]
    fn accept_for_an_instance_never_promised_is_checked_against_that_instance() {
        let acc = acceptor(&MemoryLog::new());
        acc.handle_prepare("p", 1, &pn(5, "p")).unwrap();

        assert!(acc.handle_accept("q", 2, &pn(1, "q"), "y").unwrap());
        assert!(!acc.handle_accept("q", 1, &pn(1, "q"), "y").unwrap());

        let r = acc.handle_prepare("o", 2, &pn(1, "o")).unwrap();
        assert!(!r.accept, "an accepted number counts as promised");
        assert_eq!(r.promised, pn(1, "q"));
    }

    #[test]
    fn upcalls_follow_commit_order_across_threads() {
        const THREADS: u64 = 4;
        const INSTANCES: u64 = 200;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let listener: Arc<dyn CommitListener> = Arc::new(move |i: Instance, _: &str| {
            std::thread::yield_now();
            sink.lock().unwrap().push(i);
        });
        let acc = Acceptor::open("a", MemoryLog::new(), None, Some(listener)).unwrap();

        std::thread::scope(|scope| {
            for t in 0..THREADS {
                let acc = &acc;
                scope.spawn(move || {
                    for instance in (1..=INSTANCES).filter(|i| i % THREADS == t) {
                        while acc.handle_decide("p", instance, "v").is_err() {
                            std::thread::yield_now();
                        }
                    }
                });
            }
        });

        assert_eq!(*seen.lock().unwrap(), (1..=INSTANCES).collect::<Vec<_>>());
    }

    #[test]
    fn commit_from_inside_an_upcall_is_delivered_after_it() {
        let slot: Arc<Mutex<Option<Arc<Acceptor>>>> = Arc::new(Mutex::new(None));
        let events = Arc::new(Mutex::new(Vec::new()));
        let (s, e) = (slot.clone(), events.clone());
        let listener: Arc<dyn CommitListener> = Arc::new(move |i: Instance, _: &str| {
            e.lock().unwrap().push(("start", i));
            if i == 1 {
                let acc = s.lock().unwrap().clone();
                if let Some(acc) = acc {
                    acc.commit(2, "b").unwrap();
                }
            }
            e.lock().unwrap().push(("end", i));
        });
        let acc = Arc::new(Acceptor::open("a", MemoryLog::new(), None, Some(listener)).unwrap());
        *slot.lock().unwrap() = Some(acc.clone());

        acc.handle_decide("p", 1, "a").unwrap();

        assert_eq!(acc.highest_committed(), 2);
        assert_eq!(
            *events.lock().unwrap(),
            vec![("start", 1), ("end", 1), ("start", 2), ("end", 2)]
        );
        slot.lock().unwrap().take();
    }
}
