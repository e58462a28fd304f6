//! In-process simulated ledger.
//!
//! Models endorsement latency, commit latency and the usual failure
//! modes of a network under load, so the driver can be exercised end to
//! end without a real network.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use rama::{
    error::{BoxError, ErrorExt as _},
    telemetry::tracing,
};
use serde::{Deserialize, Serialize};
use tokio::{sync::mpsc, time::Instant};

use super::{
    CommitEvent, CommitEventStream, CredentialProvider, LedgerClient, SubmitError, TxId,
    ValidationCode,
};
use crate::{
    tx::TxSpec,
    workload::{ConfigError, EventListenerMode},
};

/// Simulated ledger behavior.
/// Unset properties fall back to a fast and fully reliable network.
#[derive(Debug, Clone, clap::Args, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SimConfig {
    /// Endorsement (submit / evaluate) latency.
    #[arg(long, value_name = "MS")]
    pub base_latency_ms: Option<u64>,

    /// Uniform jitter added to the endorsement latency.
    #[arg(long = "sim-jitter-ms", value_name = "MS")]
    pub jitter_ms: Option<u64>,

    /// Time between submission and commit event.
    #[arg(long, value_name = "MS")]
    pub commit_latency_ms: Option<u64>,

    /// Probability of a submit or evaluate being rejected.
    #[arg(long)]
    pub error_rate: Option<f64>,

    /// Probability of an endorsed transaction being rejected by the orderer.
    #[arg(long)]
    pub ordering_error_rate: Option<f64>,

    /// Probability of a commit event never being delivered.
    #[arg(long)]
    pub drop_rate: Option<f64>,

    /// Probability of a transaction committing with a non-valid code.
    #[arg(long)]
    pub invalid_rate: Option<f64>,

    /// Probability of a foreign transaction showing up in block events.
    #[arg(long)]
    pub foreign_rate: Option<f64>,

    /// SDK deadline: calls slower than this fail.
    #[arg(long, value_name = "MS")]
    pub request_timeout_ms: Option<u64>,
}

/// Simulated network presets.
#[derive(Debug, Clone, Copy, clap::ValueEnum, Default, PartialEq, Eq)]
pub enum LedgerScenario {
    /// Fast and fully reliable network.
    #[default]
    Baseline,

    /// Variable endorsement and commit latency.
    LatencyJitter,

    /// Rejected submissions, lost and invalid commits.
    Flaky,
}

impl LedgerScenario {
    pub fn sim_config(self) -> SimConfig {
        match self {
            LedgerScenario::Baseline => SimConfig {
                base_latency_ms: Some(2),
                commit_latency_ms: Some(20),
                ..Default::default()
            },
            LedgerScenario::LatencyJitter => SimConfig {
                base_latency_ms: Some(30),
                jitter_ms: Some(20),
                commit_latency_ms: Some(400),
                foreign_rate: Some(0.2),
                ..Default::default()
            },
            LedgerScenario::Flaky => SimConfig {
                base_latency_ms: Some(20),
                jitter_ms: Some(10),
                commit_latency_ms: Some(200),
                error_rate: Some(0.02),
                ordering_error_rate: Some(0.01),
                drop_rate: Some(0.01),
                invalid_rate: Some(0.01),
                foreign_rate: Some(0.1),
                request_timeout_ms: Some(45),
            },
        }
    }

    /// Overlay `overwrite` on this preset.
    pub fn merge(self, overwrite: &SimConfig) -> SimConfig {
        self.sim_config().overlay(overwrite)
    }
}

impl SimConfig {
    /// Overlay `overwrite` on this config, logging where each property came from.
    pub fn overlay(&self, overwrite: &SimConfig) -> SimConfig {
        let base = self;

        macro_rules! merge_config {
            ($base:ident, $overwrite:ident, {$($property:ident),+ $(,)?}) => {
                SimConfig {
                    $(
                        $property: if let Some(value) = $overwrite.$property {
                            tracing::info!("property '{}': use overwrite: {value}", stringify!($property));
                            Some(value)
                        } else if let Some(value) = $base.$property {
                            tracing::info!("property '{}': use base: {value}", stringify!($property));
                            Some(value)
                        } else {
                            tracing::debug!("property '{}': undefined", stringify!($property));
                            None
                        },
                    )+
                }
            };
        }

        merge_config!(
            base, overwrite,
            {
                base_latency_ms,
                jitter_ms,
                commit_latency_ms,
                error_rate,
                ordering_error_rate,
                drop_rate,
                invalid_rate,
                foreign_rate,
                request_timeout_ms,
            }
        )
    }
}

/// Resolved simulation settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimSettings {
    base_latency: Duration,
    jitter: Duration,
    commit_latency: Duration,
    error_rate: f64,
    ordering_error_rate: f64,
    drop_rate: f64,
    invalid_rate: f64,
    foreign_rate: f64,
    request_timeout: Option<Duration>,
}

impl TryFrom<&SimConfig> for SimSettings {
    type Error = ConfigError;

    fn try_from(cfg: &SimConfig) -> Result<Self, Self::Error> {
        fn rate(field: &'static str, value: Option<f64>) -> Result<f64, ConfigError> {
            let value = value.unwrap_or_default();
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::InvalidValue {
                    field,
                    reason: format!("{value} is not a probability"),
                });
            }
            Ok(value)
        }

        let error_rate = rate("error_rate", cfg.error_rate)?;
        let ordering_error_rate = rate("ordering_error_rate", cfg.ordering_error_rate)?;
        let drop_rate = rate("drop_rate", cfg.drop_rate)?;
        let invalid_rate = rate("invalid_rate", cfg.invalid_rate)?;
        let foreign_rate = rate("foreign_rate", cfg.foreign_rate)?;

        let sum = error_rate + drop_rate + invalid_rate;
        if sum > 1.0 {
            return Err(ConfigError::InvalidValue {
                field: "error_rate + drop_rate + invalid_rate",
                reason: format!("sum {sum} must be <= 1.0"),
            });
        }

        Ok(Self {
            base_latency: Duration::from_millis(cfg.base_latency_ms.unwrap_or_default()),
            jitter: Duration::from_millis(cfg.jitter_ms.unwrap_or_default()),
            commit_latency: Duration::from_millis(cfg.commit_latency_ms.unwrap_or_default()),
            error_rate,
            ordering_error_rate,
            drop_rate,
            invalid_rate,
            foreign_rate,
            request_timeout: cfg.request_timeout_ms.map(Duration::from_millis),
        })
    }
}

impl SimSettings {
    fn pick_outcome(&self) -> SimOutcome {
        let r: f64 = rand::random();

        let t_error = self.error_rate;
        let t_drop = t_error + self.drop_rate;
        let t_invalid = t_drop + self.invalid_rate;

        if r < t_error {
            SimOutcome::Rejected
        } else if r < t_drop {
            SimOutcome::Lost
        } else if r < t_invalid {
            SimOutcome::Invalid
        } else {
            SimOutcome::Valid
        }
    }

    fn compute_delay(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.base_latency;
        }

        let base = self.base_latency.as_secs_f64();
        let jitter = self.jitter.as_secs_f64();

        let u: f64 = rand::random();
        let delta = (u * jitter * 2.0) - jitter;

        Duration::from_secs_f64((base + delta).max(0.0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SimOutcome {
    Rejected,
    Lost,
    Invalid,
    Valid,
}

/// A simulated ledger session. Cloning shares the session.
#[derive(Debug, Clone)]
pub struct SimulatedLedger {
    inner: Arc<SimInner>,
}

#[derive(Debug)]
struct SimInner {
    settings: SimSettings,
    session: String,
    counter: AtomicU64,
    subscribers: Mutex<Vec<Subscriber>>,
}

#[derive(Debug)]
struct Subscriber {
    mode: EventListenerMode,
    tx: mpsc::UnboundedSender<CommitEvent>,
}

impl SimulatedLedger {
    pub fn new(settings: SimSettings, session: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(SimInner {
                settings,
                session: session.into(),
                counter: AtomicU64::new(0),
                subscribers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Wait out the endorsement latency, failing like an SDK deadline would.
    async fn endorsement_round(&self) -> Result<SimOutcome, BoxError> {
        let settings = &self.inner.settings;
        let delay = settings.compute_delay();
        if let Some(timeout) = settings.request_timeout
            && delay > timeout
        {
            tokio::time::sleep(timeout).await;
            return Err(BoxError::from("request timed out")
                .context_debug_field("timeout", timeout)
                .context_field("session", self.inner.session.clone()));
        }
        tokio::time::sleep(delay).await;

        let outcome = settings.pick_outcome();
        if outcome == SimOutcome::Rejected {
            return Err(BoxError::from("proposal rejected by endorsing peer")
                .context_field("session", self.inner.session.clone()));
        }
        Ok(outcome)
    }

    fn next_tx_id(&self) -> TxId {
        let n = self.inner.counter.fetch_add(1, Ordering::Relaxed);
        TxId::new(format!(
            "{}{n:08x}",
            hex::encode(rand::random::<[u8; 8]>())
        ))
    }

    fn schedule_commit(&self, tx_id: TxId, outcome: SimOutcome) {
        let code = match outcome {
            SimOutcome::Lost | SimOutcome::Rejected => return,
            SimOutcome::Invalid => ValidationCode::MVCC_READ_CONFLICT,
            SimOutcome::Valid => ValidationCode::VALID,
        };
        let foreign = rand::random_bool(self.inner.settings.foreign_rate);
        let ledger = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(ledger.inner.settings.commit_latency).await;
            ledger.publish(tx_id, code, foreign);
        });
    }

    fn publish(&self, tx_id: TxId, code: ValidationCode, with_foreign: bool) {
        let observed_at = Instant::now();
        let mut subscribers = self.inner.subscribers.lock();
        subscribers.retain(|sub| {
            if with_foreign && sub.mode == EventListenerMode::Block {
                let foreign = CommitEvent {
                    tx_id: TxId::new(hex::encode(rand::random::<[u8; 12]>())),
                    code: ValidationCode::VALID,
                    observed_at,
                };
                if sub.tx.send(foreign).is_err() {
                    return false;
                }
            }
            sub.tx
                .send(CommitEvent {
                    tx_id: tx_id.clone(),
                    code,
                    observed_at,
                })
                .is_ok()
        });
    }
}

impl LedgerClient for SimulatedLedger {
    async fn submit(
        &self,
        tx: &TxSpec,
        targets: &[String],
        orderer: Option<&str>,
    ) -> Result<TxId, SubmitError> {
        let outcome = self
            .endorsement_round()
            .await
            .map_err(SubmitError::endorsement)?;
        if rand::random_bool(self.inner.settings.ordering_error_rate) {
            return Err(SubmitError::ordering(
                BoxError::from("broadcast rejected by orderer")
                    .context_debug_field("orderer", orderer.map(str::to_owned))
                    .context_field("session", self.inner.session.clone()),
            ));
        }
        let tx_id = self.next_tx_id();
        tracing::trace!(
            %tx_id,
            seq = tx.seq,
            targets = targets.len(),
            orderer = ?orderer,
            "simulated ledger: transaction accepted for ordering"
        );
        self.schedule_commit(tx_id.clone(), outcome);
        Ok(tx_id)
    }

    async fn evaluate(&self, tx: &TxSpec, targets: &[String]) -> Result<Vec<Vec<u8>>, BoxError> {
        self.endorsement_round().await?;
        let answering = targets.len().max(1);
        Ok(vec![tx.key.clone().into_bytes(); answering])
    }

    async fn endorse(&self, _tx: &TxSpec, _targets: &[String]) -> Result<(), BoxError> {
        self.endorsement_round().await.map(|_| ())
    }

    fn subscribe(&self, mode: EventListenerMode) -> Result<CommitEventStream, BoxError> {
        let (tx, stream) = CommitEventStream::channel();
        if mode != EventListenerMode::None {
            self.inner.subscribers.lock().push(Subscriber { mode, tx });
        }
        Ok(stream)
    }
}

/// Credential provider handing out independent simulated sessions.
#[derive(Debug, Clone)]
pub struct SimCredentialProvider {
    settings: SimSettings,
}

impl SimCredentialProvider {
    pub fn try_new(cfg: &SimConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            settings: SimSettings::try_from(cfg)?,
        })
    }
}

impl CredentialProvider for SimCredentialProvider {
    type Client = SimulatedLedger;

    async fn authenticate(&self, org: &str, identity: &str) -> Result<Self::Client, BoxError> {
        tracing::debug!(org, identity, "simulated ledger: open session");
        Ok(SimulatedLedger::new(self.settings, format!("{identity}@{org}")))
    }
}

#[cfg(test)]
mod tests {
    use tokio::time;

    use super::*;
    use crate::{
        ledger::SubmitStage,
        tx::{KeyScope, TxSpecResolver},
        workload::{InvokeKind, fixture},
    };

    fn spec(seq: u64, kind: InvokeKind) -> TxSpec {
        TxSpecResolver::try_new(
            fixture::descriptor(kind).transaction,
            &KeyScope {
                channel: "ch".to_owned(),
                org: "org1".to_owned(),
                run_id: "r".to_owned(),
                worker: "0".to_owned(),
            },
            &[kind],
        )
        .unwrap()
        .resolve(seq, kind)
        .unwrap()
    }

    fn ledger(cfg: SimConfig) -> SimulatedLedger {
        SimulatedLedger::new(SimSettings::try_from(&cfg).unwrap(), "test")
    }

    fn assert_about(actual: Duration, expected_ms: u64) {
        let expected = Duration::from_millis(expected_ms);
        assert!(
            actual >= expected && actual < expected + Duration::from_millis(2),
            "actual: {actual:?}, expected: {expected:?}"
        );
    }

    #[test]
    fn test_settings_reject_rates_above_one() {
        let cfg = SimConfig {
            error_rate: Some(0.5),
            drop_rate: Some(0.4),
            invalid_rate: Some(0.2),
            ..Default::default()
        };
        assert!(SimSettings::try_from(&cfg).is_err());

        let cfg = SimConfig {
            foreign_rate: Some(1.5),
            ..Default::default()
        };
        assert!(SimSettings::try_from(&cfg).is_err());

        for scenario in [
            LedgerScenario::Baseline,
            LedgerScenario::LatencyJitter,
            LedgerScenario::Flaky,
        ] {
            SimSettings::try_from(&scenario.sim_config()).unwrap();
        }
    }

    #[test]
    fn test_scenario_merge_prefers_overwrite() {
        let merged = LedgerScenario::Flaky.merge(&SimConfig {
            error_rate: Some(0.0),
            ..Default::default()
        });
        assert_eq!(merged.error_rate, Some(0.0));
        assert_eq!(merged.commit_latency_ms, Some(200));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_submit_delivers_commit_event_after_commit_latency() {
        time::pause();

        let ledger = ledger(SimConfig {
            base_latency_ms: Some(5),
            commit_latency_ms: Some(100),
            ..Default::default()
        });
        let mut events = ledger.subscribe(EventListenerMode::Transaction).unwrap();

        let start = Instant::now();
        let tx_id = ledger.submit(&spec(0, InvokeKind::Move), &[], None).await.unwrap();
        assert_about(start.elapsed(), 5);

        let event = events.recv().await.unwrap();
        assert_eq!(event.tx_id, tx_id);
        assert_eq!(event.code, ValidationCode::VALID);
        assert_about(event.observed_at.duration_since(start), 105);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_invalid_and_rejected_outcomes() {
        time::pause();

        let invalid = ledger(SimConfig {
            invalid_rate: Some(1.0),
            ..Default::default()
        });
        let mut events = invalid.subscribe(EventListenerMode::Transaction).unwrap();
        invalid.submit(&spec(0, InvokeKind::Move), &[], None).await.unwrap();
        let event = events.recv().await.unwrap();
        assert_eq!(event.code, ValidationCode::MVCC_READ_CONFLICT);

        let rejecting = ledger(SimConfig {
            error_rate: Some(1.0),
            ..Default::default()
        });
        let err = rejecting
            .submit(&spec(0, InvokeKind::Move), &[], None)
            .await
            .unwrap_err();
        assert_eq!(err.stage, SubmitStage::Endorsement);
        assert!(
            rejecting
                .evaluate(&spec(0, InvokeKind::Query), &[])
                .await
                .is_err()
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_orderer_rejection_is_an_ordering_failure() {
        time::pause();

        let ledger = ledger(SimConfig {
            ordering_error_rate: Some(1.0),
            ..Default::default()
        });
        let mut events = ledger.subscribe(EventListenerMode::Transaction).unwrap();

        let err = ledger
            .submit(&spec(0, InvokeKind::Move), &[], Some("orderer0"))
            .await
            .unwrap_err();
        assert_eq!(err.stage, SubmitStage::Ordering);
        assert!(events.try_recv().is_none());

        let responses = ledger
            .evaluate(&spec(0, InvokeKind::Query), &[])
            .await
            .unwrap();
        assert_eq!(responses.len(), 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_request_timeout() {
        time::pause();

        let ledger = ledger(SimConfig {
            base_latency_ms: Some(100),
            request_timeout_ms: Some(40),
            ..Default::default()
        });

        let start = Instant::now();
        assert!(ledger.submit(&spec(0, InvokeKind::Move), &[], None).await.is_err());
        assert_about(start.elapsed(), 40);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_evaluate_answers_once_per_target() {
        time::pause();

        let ledger = ledger(SimConfig::default());
        let targets = vec!["peer0.org1".to_owned(), "peer1.org1".to_owned()];

        let responses = ledger
            .evaluate(&spec(1, InvokeKind::Query), &targets)
            .await
            .unwrap();
        assert_eq!(responses.len(), 2);

        let responses = ledger
            .evaluate(&spec(1, InvokeKind::Query), &[])
            .await
            .unwrap();
        assert_eq!(responses.len(), 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_block_listener_sees_foreign_transactions() {
        time::pause();

        let ledger = ledger(SimConfig {
            foreign_rate: Some(1.0),
            ..Default::default()
        });
        let mut block_events = ledger.subscribe(EventListenerMode::Block).unwrap();
        let mut tx_events = ledger.subscribe(EventListenerMode::Transaction).unwrap();

        let tx_id = ledger.submit(&spec(0, InvokeKind::Move), &[], None).await.unwrap();

        let first = block_events.recv().await.unwrap();
        let second = block_events.recv().await.unwrap();
        assert_ne!(first.tx_id, tx_id);
        assert_eq!(second.tx_id, tx_id);

        assert_eq!(tx_events.recv().await.unwrap().tx_id, tx_id);
    }
}
