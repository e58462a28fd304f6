//! The execution loop: one worker's attempt cadence, from the first
//! attempt until every commit event is accounted for.
//!
//! A single task owns the [`WorkerStats`], the [`EventCorrelator`] and the
//! commit event stream. It only suspends while waiting for the next
//! attempt slot or for the drain deadline, and keeps consuming commit
//! events during both.

use std::{future::Future, pin::Pin, time::Duration};

use rama::telemetry::tracing;
use tokio::time::{Instant, sleep_until};

use crate::{
    correlator::{EventCorrelator, Registration},
    ledger::{CommitEvent, CommitEventStream, LedgerClient, SubmitError, SubmitStage, TxId},
    pacing::{FrequencyController, Pacing},
    stats::WorkerStats,
    tx::TxSpecResolver,
    utils::clock::WallClock,
    workload::{
        CheckScope, ConfigError, EventListenerMode, FailoverMethod, InvokeCheck, InvokeKind,
        StopCondition, TargetPeers, TransactionMode, WorkloadDescriptor,
    },
};

mod failover;
pub use failover::TargetSet;


/// Everything one execution loop needs to know about its run.
#[derive(Debug)]
pub struct ExecConfig {
    pub kind: InvokeKind,
    pub mode: TransactionMode,
    pub stop: StopCondition,
    /// Sequence number of the first attempt.
    pub first_seq: u64,
    pub listener: EventListenerMode,
    pub event_timeout: Duration,
    pub targets: TargetSet,
    /// At most one orderer, rotated when ordering fails.
    pub orderer: TargetSet,
}

impl ExecConfig {
    /// Configuration of the main run of a worker belonging to `org`.
    pub fn from_descriptor(
        descriptor: &WorkloadDescriptor,
        org: &str,
    ) -> Result<Self, ConfigError> {
        let targets = descriptor.resolve_targets()?;
        let targets = if descriptor.peer_failover
            && descriptor.target_peers != TargetPeers::Discovery
        {
            let candidates = descriptor.failover_candidates(org, &targets)?;
            TargetSet::with_failover(targets, candidates, descriptor.failover.method)
        } else {
            TargetSet::fixed(targets)
        };

        let orderer: Vec<String> = descriptor
            .topology
            .orderer_for(org)
            .map(str::to_owned)
            .into_iter()
            .collect();
        let orderer = if descriptor.orderer_failover {
            TargetSet::with_failover(
                orderer,
                descriptor.topology.orderers.clone(),
                FailoverMethod::RoundRobin,
            )
        } else {
            TargetSet::fixed(orderer)
        };

        Ok(Self {
            kind: descriptor.invoke,
            mode: descriptor.mode.clone(),
            stop: descriptor.stop_condition(),
            first_seq: 0,
            listener: descriptor.event.listener,
            event_timeout: descriptor.event_timeout(),
            targets,
            orderer,
        })
    }

    /// Configuration of the read-back that follows a MOVE run of `attempts`
    /// attempts, or `None` when there is nothing to check.
    pub fn for_validation(
        descriptor: &WorkloadDescriptor,
        check: &InvokeCheck,
        attempts: u64,
    ) -> Result<Option<Self>, ConfigError> {
        let (first_seq, count) = match check.transactions {
            CheckScope::All => (0, attempts),
            CheckScope::Last => {
                let count = check.tx_num.min(attempts);
                (attempts - count, count)
            }
        };
        if count == 0 {
            return Ok(None);
        }

        let strategy = check.peers.as_ref().unwrap_or(&descriptor.target_peers);
        let targets = descriptor
            .topology
            .target_peers(strategy, &descriptor.orgs)?;

        Ok(Some(Self {
            kind: InvokeKind::Query,
            mode: TransactionMode::Constant {
                freq_ms: 0,
                jitter_ms: 0,
            },
            stop: StopCondition::Count(count),
            first_seq,
            listener: EventListenerMode::None,
            event_timeout: descriptor.event_timeout(),
            targets: TargetSet::fixed(targets),
            orderer: TargetSet::fixed(vec![]),
        }))
    }

    /// The loop correlates commit events and needs a subscription.
    pub fn tracks_events(&self) -> bool {
        self.kind == InvokeKind::Move
            && self.listener != EventListenerMode::None
            && !matches!(self.mode, TransactionMode::Proposal { .. })
    }
}

/// Result of one completed execution loop.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecReport {
    pub kind: InvokeKind,
    pub mode: &'static str,
    pub stats: WorkerStats,
    /// Number of attempts this loop issued.
    pub attempts: u64,
    pub started_at: Instant,
    pub ended_at: Instant,
    /// Wall-clock start, ms since the unix epoch.
    pub start_ms: u64,
    /// Wall-clock end, ms since the unix epoch.
    pub end_ms: u64,
    /// The loop was stopped by a cancellation signal.
    pub cancelled: bool,
}

impl ExecReport {
    pub fn duration(&self) -> Duration {
        self.ended_at.duration_since(self.started_at)
    }
}

/// Drives one worker's attempts against a ledger client.
pub struct ExecutionLoop<'a, C> {
    client: &'a C,
    resolver: &'a TxSpecResolver,
    cfg: ExecConfig,
    clock: WallClock,
}

impl<'a, C: LedgerClient> ExecutionLoop<'a, C> {
    pub fn new(client: &'a C, resolver: &'a TxSpecResolver, cfg: ExecConfig) -> Self {
        Self {
            client,
            resolver,
            cfg,
            clock: WallClock::now(),
        }
    }

    pub fn with_clock(mut self, clock: WallClock) -> Self {
        self.clock = clock;
        self
    }

    /// Run until the stop condition is reached and all commit events are
    /// accounted for, or until `cancel` resolves.
    ///
    /// Cancellation stops sending and expires the drain immediately.
    /// [`StopCondition::Unbounded`] loops only ever end through `cancel`.
    pub async fn run<F>(
        mut self,
        events: Option<CommitEventStream>,
        cancel: F,
    ) -> Result<ExecReport, ConfigError>
    where
        F: Future<Output = ()>,
    {
        let cancel = std::pin::pin!(cancel);
        let tracks_events = self.cfg.tracks_events();
        let mut state = LoopState {
            stats: WorkerStats::default(),
            correlator: EventCorrelator::new(self.cfg.event_timeout),
            events: if tracks_events { events } else { None },
            cancel,
            cancelled: false,
        };

        let started_at = Instant::now();
        let loop_deadline = match self.cfg.stop {
            StopCondition::Duration(d) => Some(started_at + d),
            StopCondition::Count(_) | StopCondition::Unbounded => None,
        };
        let mut pacer = FrequencyController::new(Pacing::from_mode(&self.cfg.mode), started_at);

        tracing::debug!(
            kind = %self.cfg.kind,
            mode = self.cfg.mode.name(),
            stop = ?self.cfg.stop,
            first_seq = self.cfg.first_seq,
            "execution loop started"
        );

        let mut seq = self.cfg.first_seq;
        let mut attempts = 0;
        let mut last_sent;

        loop {
            let attempt_start = Instant::now();
            let attempt = self.attempt(seq, attempt_start, tracks_events, &mut state).await?;
            last_sent = attempt_start;
            attempts += 1;

            match (&self.cfg.mode, &attempt) {
                (TransactionMode::Latency, Attempt::Tracked(tx_id)) => {
                    let until = attempt_start + self.cfg.event_timeout;
                    state
                        .wait_until(until, |c: &EventCorrelator| !c.is_tracked(tx_id))
                        .await;
                }
                (TransactionMode::Mix { freq_ms }, Attempt::Tracked(_) | Attempt::Completed) => {
                    let until = Instant::now() + Duration::from_millis(*freq_ms);
                    state.wait_until(until, |_: &EventCorrelator| false).await;
                    if !state.cancelled {
                        self.read_back(seq, &mut state.stats).await?;
                    }
                }
                _ => (),
            }

            seq += 1;

            if state.cancelled {
                tracing::info!(attempts, "execution loop cancelled");
                break;
            }

            let now = Instant::now();
            let done = match self.cfg.stop {
                StopCondition::Count(n) => attempts >= n,
                StopCondition::Duration(_) => loop_deadline.is_some_and(|deadline| now > deadline),
                StopCondition::Unbounded => false,
            };
            if done {
                break;
            }

            let delay = pacer.next_delay(attempt_start, now);
            if delay.is_zero() {
                state.poll_cancel().await;
            } else {
                state
                    .wait_until(now + delay, |_: &EventCorrelator| false)
                    .await;
            }
            if state.cancelled {
                tracing::info!(attempts, "execution loop cancelled");
                break;
            }
        }

        if tracks_events {
            state.correlator.begin_drain(last_sent);
            if state.cancelled {
                state.handle_queued();
                state.correlator.on_drain_timeout(&mut state.stats);
            }
            while let Some(deadline) = state.correlator.drain_deadline() {
                state
                    .wait_until(deadline, |c: &EventCorrelator| c.is_done())
                    .await;
                state.handle_queued();
                if !state.correlator.is_done() {
                    state.correlator.on_drain_timeout(&mut state.stats);
                }
            }
        }

        let ended_at = Instant::now();
        let report = ExecReport {
            kind: self.cfg.kind,
            mode: self.cfg.mode.name(),
            stats: state.stats,
            attempts,
            started_at,
            ended_at,
            start_ms: self.clock.epoch_ms(started_at),
            end_ms: self.clock.epoch_ms(ended_at),
            cancelled: state.cancelled,
        };

        tracing::debug!(
            sent = report.stats.sent,
            received = report.stats.received,
            failed = report.stats.failed,
            unreceived = report.stats.unreceived,
            elapsed = ?report.duration(),
            "execution loop completed"
        );

        Ok(report)
    }

    /// Issue attempt `seq` and account for its synchronous outcome.
    async fn attempt<F: Future<Output = ()>>(
        &mut self,
        seq: u64,
        attempt_start: Instant,
        tracks_events: bool,
        state: &mut LoopState<'_, F>,
    ) -> Result<Attempt, ConfigError> {
        let spec = self.resolver.resolve(seq, self.cfg.kind)?;
        let stats = &mut state.stats;
        stats.sent += 1;

        let targets = self.cfg.targets.current();
        let orderer = self.cfg.orderer.current().first().map(String::as_str);
        let result = match (&self.cfg.mode, self.cfg.kind) {
            (TransactionMode::Proposal { .. }, _) => self
                .client
                .endorse(&spec, targets)
                .await
                .map(|()| None)
                .map_err(SubmitError::endorsement),
            (_, InvokeKind::Move) => self
                .client
                .submit(&spec, targets, orderer)
                .await
                .map(Some),
            (_, InvokeKind::Query) => self
                .client
                .evaluate(&spec, targets)
                .await
                .map(|responses| {
                    stats.received += responses.len() as u64;
                    None
                })
                .map_err(SubmitError::endorsement),
        };

        let tx_id = match result {
            Ok(tx_id) => {
                stats
                    .submit_latency
                    .record(Instant::now().saturating_duration_since(attempt_start));
                tx_id
            }
            Err(err) => {
                stats.failed += 1;
                tracing::debug!(
                    seq,
                    kind = %self.cfg.kind,
                    stage = %err.stage,
                    "attempt failed: {err}"
                );
                match err.stage {
                    SubmitStage::Endorsement => self.cfg.targets.fail_over(),
                    SubmitStage::Ordering => self.cfg.orderer.fail_over(),
                }
                return Ok(Attempt::Failed);
            }
        };

        match tx_id {
            Some(tx_id) if tracks_events => {
                match state.correlator.register(tx_id.clone(), attempt_start, stats) {
                    Registration::Tracked => Ok(Attempt::Tracked(tx_id)),
                    Registration::Duplicate | Registration::Rejected => Ok(Attempt::Failed),
                }
            }
            Some(_) => {
                stats.received += 1;
                Ok(Attempt::Completed)
            }
            None => {
                if self.cfg.kind == InvokeKind::Move {
                    // endorsed proposal
                    stats.received += 1;
                }
                Ok(Attempt::Completed)
            }
        }
    }

    async fn read_back(&self, seq: u64, stats: &mut WorkerStats) -> Result<(), ConfigError> {
        let spec = self.resolver.resolve(seq, InvokeKind::Query)?;
        match self.client.evaluate(&spec, self.cfg.targets.current()).await {
            Ok(_) => stats.mix_read += 1,
            Err(err) => {
                tracing::debug!(seq, "mix read-back failed: {err}");
                stats.mix_read_failed += 1;
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
enum Attempt {
    /// Submitted and waiting for its commit event.
    Tracked(TxId),
    /// Fully accounted for without an event phase.
    Completed,
    Failed,
}

struct LoopState<'c, F> {
    stats: WorkerStats,
    correlator: EventCorrelator,
    events: Option<CommitEventStream>,
    cancel: Pin<&'c mut F>,
    cancelled: bool,
}

impl<F: Future<Output = ()>> LoopState<'_, F> {
    /// Yield once and pick up a pending cancellation without waiting.
    async fn poll_cancel(&mut self) {
        tokio::task::yield_now().await;
        if self.cancelled {
            return;
        }
        tokio::select! {
            biased;

            _ = self.cancel.as_mut() => {
                self.cancelled = true;
            }
            _ = std::future::ready(()) => (),
        }
    }

    /// Handle every commit event already delivered, without waiting.
    fn handle_queued(&mut self) {
        let Some(stream) = &mut self.events else {
            return;
        };
        while let Some(event) = stream.try_recv() {
            self.correlator.handle_event(&event, &mut self.stats);
        }
    }

    /// Consume commit events until `until`, cancellation, or `done` holds.
    async fn wait_until(&mut self, until: Instant, done: impl Fn(&EventCorrelator) -> bool) {
        while !self.cancelled && !done(&self.correlator) {
            tokio::select! {
                biased;

                _ = self.cancel.as_mut() => {
                    self.cancelled = true;
                }
                _ = sleep_until(until) => return,
                event = next_event(&mut self.events) => match event {
                    Some(event) => {
                        self.correlator.handle_event(&event, &mut self.stats);
                    }
                    None => {
                        tracing::warn!("commit event stream closed, waiting for deadline");
                        self.events = None;
                    }
                },
            }
        }
    }
}

async fn next_event(events: &mut Option<CommitEventStream>) -> Option<CommitEvent> {
    match events {
        Some(stream) => stream.recv().await,
        None => std::future::pending().await,
    }
}
