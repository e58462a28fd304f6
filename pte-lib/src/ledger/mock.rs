//! Scripted ledger for tests.
//!
//! Every submit gets a unique `tx-{n}` id (`n` counts submits from 0) and
//! a commit event scheduled according to the configured plan. All calls
//! are recorded so tests can assert on what the driver sent, and when.

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use rama::error::BoxError;
use tokio::{sync::mpsc, time::Instant};

use super::{
    CommitEvent, CommitEventStream, CredentialProvider, LedgerClient, SubmitError, SubmitStage,
    TxId, ValidationCode,
};
use crate::{tx::TxSpec, workload::EventListenerMode};

/// What happens to the n-th submitted transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockCommit {
    /// Commit event with the given code after the given delay.
    After(Duration, ValidationCode),
    /// The commit event is never delivered.
    Never,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockCallKind {
    Submit,
    Evaluate,
    Endorse,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    pub kind: MockCallKind,
    pub seq: u64,
    pub key: String,
    pub args: Vec<String>,
    pub targets: Vec<String>,
    pub orderer: Option<String>,
    pub at: Instant,
    pub ok: bool,
}

type CommitPlan = Box<dyn Fn(u64) -> MockCommit + Send + Sync>;
type FailurePlan = Box<dyn Fn(MockCallKind, &[String]) -> bool + Send + Sync>;
type OrderingFailurePlan = Box<dyn Fn(Option<&str>) -> bool + Send + Sync>;

/// Scripted [`LedgerClient`]. Clones share state.
#[derive(Clone)]
pub struct MockLedger {
    inner: Arc<MockInner>,
}

struct MockInner {
    call_latency: Duration,
    commit_plan: CommitPlan,
    failure_plan: FailurePlan,
    ordering_failure_plan: OrderingFailurePlan,
    submits: AtomicU64,
    calls: Mutex<Vec<MockCall>>,
    failures: Mutex<VecDeque<bool>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<CommitEvent>>>,
}

impl std::fmt::Debug for MockLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockLedger")
            .field("call_latency", &self.inner.call_latency)
            .field("submits", &self.inner.submits)
            .finish()
    }
}

impl Default for MockLedger {
    fn default() -> Self {
        MockLedgerBuilder::default().build()
    }
}

impl MockLedger {
    pub fn builder() -> MockLedgerBuilder {
        MockLedgerBuilder::default()
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.inner.calls.lock().clone()
    }

    pub fn calls_of(&self, kind: MockCallKind) -> Vec<MockCall> {
        self.inner
            .calls
            .lock()
            .iter()
            .filter(|call| call.kind == kind)
            .cloned()
            .collect()
    }

    /// Deliver an arbitrary event to all subscribers right now.
    pub fn emit(&self, tx_id: impl Into<TxId>, code: ValidationCode) {
        let event = CommitEvent {
            tx_id: tx_id.into(),
            code,
            observed_at: Instant::now(),
        };
        self.inner
            .subscribers
            .lock()
            .retain(|sub| sub.send(event.clone()).is_ok());
    }

    /// Drop all subscriptions, closing their streams.
    pub fn close_streams(&self) {
        self.inner.subscribers.lock().clear();
    }

    /// Record a call, failing it at the stage its plans decide.
    async fn call(
        &self,
        kind: MockCallKind,
        tx: &TxSpec,
        targets: &[String],
        orderer: Option<&str>,
    ) -> Result<(), SubmitStage> {
        if !self.inner.call_latency.is_zero() {
            tokio::time::sleep(self.inner.call_latency).await;
        }
        let scripted = self.inner.failures.lock().pop_front();
        let endorsed = match scripted {
            Some(fail) => !fail,
            None => !(self.inner.failure_plan)(kind, targets),
        };
        let result = if !endorsed {
            Err(SubmitStage::Endorsement)
        } else if kind == MockCallKind::Submit && (self.inner.ordering_failure_plan)(orderer) {
            Err(SubmitStage::Ordering)
        } else {
            Ok(())
        };
        self.inner.calls.lock().push(MockCall {
            kind,
            seq: tx.seq,
            key: tx.key.clone(),
            args: tx.args.clone(),
            targets: targets.to_vec(),
            orderer: orderer.map(str::to_owned),
            at: Instant::now(),
            ok: result.is_ok(),
        });
        result
    }
}

impl LedgerClient for MockLedger {
    async fn submit(
        &self,
        tx: &TxSpec,
        targets: &[String],
        orderer: Option<&str>,
    ) -> Result<TxId, SubmitError> {
        match self.call(MockCallKind::Submit, tx, targets, orderer).await {
            Ok(()) => (),
            Err(SubmitStage::Endorsement) => {
                return Err(SubmitError::endorsement("mock ledger: proposal rejected"));
            }
            Err(SubmitStage::Ordering) => {
                return Err(SubmitError::ordering("mock ledger: broadcast rejected"));
            }
        }
        let n = self.inner.submits.fetch_add(1, Ordering::Relaxed);
        let tx_id = TxId::new(format!("tx-{n}"));
        if let MockCommit::After(delay, code) = (self.inner.commit_plan)(n) {
            let ledger = self.clone();
            let id = tx_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                ledger.emit(id, code);
            });
        }
        Ok(tx_id)
    }

    async fn evaluate(&self, tx: &TxSpec, targets: &[String]) -> Result<Vec<Vec<u8>>, BoxError> {
        if self.call(MockCallKind::Evaluate, tx, targets, None).await.is_err() {
            return Err(BoxError::from("mock ledger: evaluate rejected"));
        }
        Ok(vec![tx.key.clone().into_bytes(); targets.len().max(1)])
    }

    async fn endorse(&self, tx: &TxSpec, targets: &[String]) -> Result<(), BoxError> {
        if self.call(MockCallKind::Endorse, tx, targets, None).await.is_err() {
            return Err(BoxError::from("mock ledger: endorsement rejected"));
        }
        Ok(())
    }

    fn subscribe(&self, _mode: EventListenerMode) -> Result<CommitEventStream, BoxError> {
        let (tx, stream) = CommitEventStream::channel();
        self.inner.subscribers.lock().push(tx);
        Ok(stream)
    }
}

pub struct MockLedgerBuilder {
    call_latency: Duration,
    commit_plan: CommitPlan,
    failure_plan: FailurePlan,
    ordering_failure_plan: OrderingFailurePlan,
    failures: VecDeque<bool>,
}

impl Default for MockLedgerBuilder {
    fn default() -> Self {
        Self {
            call_latency: Duration::ZERO,
            commit_plan: Box::new(|_| {
                MockCommit::After(Duration::from_millis(10), ValidationCode::VALID)
            }),
            failure_plan: Box::new(never_fail),
            ordering_failure_plan: Box::new(|_| false),
            failures: VecDeque::new(),
        }
    }
}

fn never_fail(_: MockCallKind, _: &[String]) -> bool {
    false
}

impl MockLedgerBuilder {
    /// Time every submit, evaluate and endorse call takes.
    pub fn call_latency(mut self, latency: Duration) -> Self {
        self.call_latency = latency;
        self
    }

    /// Decide the commit outcome of the n-th submit.
    pub fn commit_plan(mut self, plan: impl Fn(u64) -> MockCommit + Send + Sync + 'static) -> Self {
        self.commit_plan = Box::new(plan);
        self
    }

    /// Fail calls for which `plan` returns true.
    pub fn fail_when(
        mut self,
        plan: impl Fn(MockCallKind, &[String]) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.failure_plan = Box::new(plan);
        self
    }

    /// Fail the broadcast of endorsed submits for which `plan` returns true.
    pub fn fail_ordering_when(
        mut self,
        plan: impl Fn(Option<&str>) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.ordering_failure_plan = Box::new(plan);
        self
    }

    /// Script the outcome of the first calls, in order. `true` fails the call.
    pub fn scripted_failures(mut self, failures: impl IntoIterator<Item = bool>) -> Self {
        self.failures = failures.into_iter().collect();
        self
    }

    pub fn build(self) -> MockLedger {
        MockLedger {
            inner: Arc::new(MockInner {
                call_latency: self.call_latency,
                commit_plan: self.commit_plan,
                failure_plan: self.failure_plan,
                ordering_failure_plan: self.ordering_failure_plan,
                submits: AtomicU64::new(0),
                calls: Mutex::new(Vec::new()),
                failures: Mutex::new(self.failures),
                subscribers: Mutex::new(Vec::new()),
            }),
        }
    }
}

/// Credential provider creating a fresh mock per authentication.
pub struct MockCredentials {
    factory: Box<dyn Fn(&str, &str) -> Result<MockLedger, BoxError> + Send + Sync>,
    sessions: Mutex<Vec<(String, String, MockLedger)>>,
}

impl MockCredentials {
    pub fn new(
        factory: impl Fn(&str, &str) -> Result<MockLedger, BoxError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            factory: Box::new(factory),
            sessions: Mutex::new(Vec::new()),
        }
    }

    /// `(org, identity, ledger)` of every session handed out so far.
    pub fn sessions(&self) -> Vec<(String, String, MockLedger)> {
        self.sessions.lock().clone()
    }
}

impl CredentialProvider for MockCredentials {
    type Client = MockLedger;

    async fn authenticate(&self, org: &str, identity: &str) -> Result<Self::Client, BoxError> {
        let ledger = (self.factory)(org, identity)?;
        self.sessions
            .lock()
            .push((org.to_owned(), identity.to_owned(), ledger.clone()));
        Ok(ledger)
    }
}
