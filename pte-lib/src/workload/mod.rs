//! Workload descriptor: what a worker sends, how fast, to whom, and for how long.
//!
//! A descriptor is loaded from JSON, optionally overwritten from the CLI
//! and validated once. Everything downstream treats it as read-only.

use std::{collections::BTreeMap, fmt, path::Path, time::Duration};

use rama::{
    error::{BoxError, ErrorContext as _, ErrorExt as _},
    telemetry::tracing,
};
use serde::{Deserialize, Serialize};

mod error;
mod topology;

pub use self::{
    error::ConfigError,
    topology::{NetworkTopology, OrgTopology, TargetPeers},
};

#[cfg(any(test, feature = "test-utils"))]
pub mod fixture;


/// Kind of transaction a worker issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InvokeKind {
    /// State-changing transaction: submitted, ordered and committed.
    Move,
    /// Read-only evaluation answered synchronously by the target peers.
    Query,
}

impl InvokeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvokeKind::Move => "MOVE",
            InvokeKind::Query => "QUERY",
        }
    }
}

impl fmt::Display for InvokeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for InvokeKind {
    type Err = BoxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("move") {
            Ok(InvokeKind::Move)
        } else if s.eq_ignore_ascii_case("query") {
            Ok(InvokeKind::Query)
        } else {
            Err(BoxError::from("unknown invoke kind").context_field("value", s.to_owned()))
        }
    }
}

/// How a worker paces its attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransactionMode {
    /// Fixed inter-attempt period with optional uniform jitter.
    Constant {
        #[serde(default)]
        freq_ms: u64,
        #[serde(default)]
        jitter_ms: u64,
    },
    /// One transaction in flight at a time: wait for its event before the next.
    Latency,
    /// Alternate between two frequency bands.
    Burst { bands: [BurstBand; 2] },
    /// Every MOVE is followed by a QUERY of the same key.
    Mix {
        #[serde(default)]
        freq_ms: u64,
    },
    /// Endorse only: proposals are never submitted for ordering.
    Proposal {
        #[serde(default)]
        freq_ms: u64,
    },
}

impl TransactionMode {
    pub fn name(&self) -> &'static str {
        match self {
            TransactionMode::Constant { .. } => "CONSTANT",
            TransactionMode::Latency => "LATENCY",
            TransactionMode::Burst { .. } => "BURST",
            TransactionMode::Mix { .. } => "MIX",
            TransactionMode::Proposal { .. } => "PROPOSAL",
        }
    }
}

impl Default for TransactionMode {
    fn default() -> Self {
        TransactionMode::Constant {
            freq_ms: 0,
            jitter_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BurstBand {
    pub freq_ms: u64,
    pub duration_ms: u64,
}

/// When a worker stops issuing new attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCondition {
    Count(u64),
    Duration(Duration),
    Unbounded,
}

/// How commit events are observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventListenerMode {
    /// Subscribe to per-transaction commit events.
    #[default]
    Transaction,
    /// Subscribe to block events and scan them for tracked txIDs.
    Block,
    /// Do not listen: an accepted submission counts as received.
    None,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EventOptions {
    #[serde(default)]
    pub listener: EventListenerMode,
    #[serde(default = "default_event_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for EventOptions {
    fn default() -> Self {
        Self {
            listener: EventListenerMode::default(),
            timeout_ms: default_event_timeout_ms(),
        }
    }
}

fn default_event_timeout_ms() -> u64 {
    120_000
}

/// Which peers a failing target may be replaced with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverList {
    /// The resolved target peers.
    #[default]
    TargetPeers,
    /// The peers of the worker's own org.
    OrgPeers,
    /// Every peer in the topology.
    All,
}

/// How the replacement peer is picked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverMethod {
    #[default]
    RoundRobin,
    Random,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FailoverOptions {
    #[serde(default)]
    pub list: FailoverList,
    #[serde(default)]
    pub method: FailoverMethod,
}

/// Per-request timeouts handed to the ledger client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestTimeouts {
    #[serde(default = "default_request_timeout_ms")]
    pub request_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_ms: u64,
}

impl Default for RequestTimeouts {
    fn default() -> Self {
        Self {
            request_ms: default_request_timeout_ms(),
            connect_ms: default_connect_timeout_ms(),
        }
    }
}

fn default_request_timeout_ms() -> u64 {
    45_000
}

fn default_connect_timeout_ms() -> u64 {
    3_000
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FunctionTemplate {
    #[serde(default = "default_fcn")]
    pub fcn: String,
    #[serde(default)]
    pub args: Vec<String>,
}

fn default_fcn() -> String {
    "invoke".to_owned()
}

/// Size range of the random payload in bytes, both bounds inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PayloadRange {
    pub min: usize,
    pub max: usize,
}

impl Default for PayloadRange {
    fn default() -> Self {
        Self { min: 8, max: 8 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransientFieldKind {
    String,
    Integer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransientField {
    pub name: String,
    pub kind: TransientFieldKind,
}

/// Private data attached to MOVE proposals.
///
/// Each entry of `map` is a JSON object. Before sending, the listed
/// `fields` of the entries named in `keys` (all entries when empty)
/// are made unique per attempt, then each entry is JSON encoded
/// and base64 encoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransientTemplate {
    pub map: BTreeMap<String, serde_json::Map<String, serde_json::Value>>,
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default)]
    pub fields: Vec<TransientField>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransactionTemplate {
    #[serde(rename = "move")]
    pub move_fn: FunctionTemplate,
    pub query: FunctionTemplate,
    /// Arg positions that receive the per-attempt key.
    #[serde(default)]
    pub key_idx: Vec<usize>,
    /// Arg positions that receive a random payload (MOVE only).
    #[serde(default)]
    pub payload_idx: Vec<usize>,
    /// Offset added to the attempt sequence number when building keys.
    #[serde(default)]
    pub key_start: u64,
    #[serde(default)]
    pub payload: PayloadRange,
    #[serde(default)]
    pub transient: Option<TransientTemplate>,
}

impl TransactionTemplate {
    pub fn function(&self, kind: InvokeKind) -> &FunctionTemplate {
        match kind {
            InvokeKind::Move => &self.move_fn,
            InvokeKind::Query => &self.query,
        }
    }

    /// Ensure every configured arg index fits the template of `kind`.
    pub fn check_indices(&self, kind: InvokeKind) -> Result<(), ConfigError> {
        let len = self.function(kind).args.len();
        let payload_idx: &[usize] = match kind {
            InvokeKind::Move => &self.payload_idx,
            InvokeKind::Query => &[],
        };
        for (field, indices) in [("key_idx", &self.key_idx[..]), ("payload_idx", payload_idx)] {
            if let Some(&index) = indices.iter().find(|&&index| index >= len) {
                return Err(ConfigError::ArgIndexOutOfRange {
                    kind,
                    field,
                    index,
                    len,
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckScope {
    /// Only the last `tx_num` keys written.
    #[default]
    Last,
    /// Every key written by the run.
    All,
}

/// Post-run read-back of the keys a MOVE run wrote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InvokeCheck {
    /// Peers queried for the check, defaults to the run's target peers.
    #[serde(default)]
    pub peers: Option<TargetPeers>,
    #[serde(default)]
    pub transactions: CheckScope,
    #[serde(default = "default_check_tx_num")]
    pub tx_num: u64,
}

fn default_check_tx_num() -> u64 {
    1
}

/// Complete description of the load one worker generates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkloadDescriptor {
    pub channel: String,
    /// Orgs taking part in the run. One group of workers is started per org.
    pub orgs: Vec<String>,
    #[serde(default = "default_processes_per_org")]
    pub processes_per_org: usize,
    pub chaincode_id: String,
    pub invoke: InvokeKind,
    #[serde(default)]
    pub mode: TransactionMode,
    /// Number of attempts per worker, 0 means not count bounded.
    #[serde(default)]
    pub n_request: u64,
    /// Run duration per worker in seconds, used when `n_request` is 0.
    /// Both 0 means the worker runs until cancelled.
    #[serde(default)]
    pub run_duration_secs: u64,
    /// Unix epoch ms at which all workers start issuing load.
    #[serde(default)]
    pub start_at_ms: Option<u64>,
    /// Minimum sync wait in ms, applied even when `start_at_ms` is in the past.
    #[serde(default)]
    pub min_sync_ms: u64,
    #[serde(default)]
    pub event: EventOptions,
    #[serde(default)]
    pub target_peers: TargetPeers,
    #[serde(default)]
    pub peer_failover: bool,
    /// Rotate over `topology.orderers` when ordering fails.
    #[serde(default)]
    pub orderer_failover: bool,
    #[serde(default)]
    pub failover: FailoverOptions,
    #[serde(default)]
    pub invoke_check: Option<InvokeCheck>,
    pub transaction: TransactionTemplate,
    pub topology: NetworkTopology,
    #[serde(default)]
    pub timeouts: RequestTimeouts,
}

/// 9999-12-31T23:59:59.999Z
const MAX_START_AT_MS: u64 = 253_402_300_799_999;

fn default_processes_per_org() -> usize {
    1
}

impl WorkloadDescriptor {
    /// Read, parse and validate a descriptor from a JSON file.
    pub async fn load(path: &Path) -> Result<Self, BoxError> {
        let raw = tokio::fs::read(path)
            .await
            .context("read workload descriptor")
            .with_context_debug_field("path", || path.to_owned())?;
        let descriptor: Self = serde_json::from_slice(&raw)
            .context("parse workload descriptor as json")
            .with_context_debug_field("path", || path.to_owned())?;
        descriptor
            .validate()
            .context("validate workload descriptor")?;
        Ok(descriptor)
    }

    pub fn stop_condition(&self) -> StopCondition {
        if self.n_request > 0 {
            StopCondition::Count(self.n_request)
        } else if self.run_duration_secs > 0 {
            StopCondition::Duration(Duration::from_secs(self.run_duration_secs))
        } else {
            StopCondition::Unbounded
        }
    }

    pub fn event_timeout(&self) -> Duration {
        Duration::from_millis(self.event.timeout_ms)
    }

    /// Peers the run's transactions target.
    pub fn resolve_targets(&self) -> Result<Vec<String>, ConfigError> {
        self.topology.target_peers(&self.target_peers, &self.orgs)
    }

    /// Peers a worker of `org` may fail over to, given its resolved `targets`.
    pub fn failover_candidates(
        &self,
        org: &str,
        targets: &[String],
    ) -> Result<Vec<String>, ConfigError> {
        Ok(match self.failover.list {
            FailoverList::TargetPeers => targets.to_vec(),
            FailoverList::OrgPeers => self
                .topology
                .org(org)
                .ok_or_else(|| ConfigError::UnknownOrg(org.to_owned()))?
                .peers
                .clone(),
            FailoverList::All => self.topology.all_peers(),
        })
    }

    /// Expected responses per query for the run's target strategy.
    pub fn fanout_factor(&self) -> usize {
        self.topology.fanout_factor(&self.target_peers, &self.orgs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channel.is_empty() {
            return Err(ConfigError::MissingValue("channel"));
        }
        if self.chaincode_id.is_empty() {
            return Err(ConfigError::MissingValue("chaincode_id"));
        }
        if self.orgs.is_empty() {
            return Err(ConfigError::MissingValue("orgs"));
        }
        // names end up in whitespace separated summary lines
        let names = [("channel", &self.channel), ("chaincode_id", &self.chaincode_id)]
            .into_iter()
            .chain(self.orgs.iter().map(|org| ("orgs", org)));
        for (field, name) in names {
            if name.chars().any(char::is_whitespace) {
                return Err(ConfigError::InvalidValue {
                    field,
                    reason: format!("'{name}' contains whitespace"),
                });
            }
        }
        if self.processes_per_org == 0 {
            return Err(ConfigError::InvalidValue {
                field: "processes_per_org",
                reason: "must be at least 1".to_owned(),
            });
        }
        for org in &self.orgs {
            let topo = self
                .topology
                .org(org)
                .ok_or_else(|| ConfigError::UnknownOrg(org.clone()))?;
            if topo.peers.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "topology.orgs.peers",
                    reason: format!("org '{org}' has no peers"),
                });
            }
            if let Some(orderer) = &topo.orderer
                && !self.topology.orderers.contains(orderer)
            {
                return Err(ConfigError::UnknownOrderer(orderer.clone()));
            }
        }
        if self.orderer_failover && self.topology.orderers.is_empty() {
            return Err(ConfigError::MissingValue("topology.orderers"));
        }
        if self
            .start_at_ms
            .is_some_and(|start_at_ms| start_at_ms > MAX_START_AT_MS)
        {
            return Err(ConfigError::InvalidValue {
                field: "start_at_ms",
                reason: "must be a unix epoch in ms before year 10000".to_owned(),
            });
        }

        match (&self.mode, self.invoke) {
            (TransactionMode::Mix { .. }, InvokeKind::Query)
            | (TransactionMode::Proposal { .. }, InvokeKind::Query) => {
                return Err(ConfigError::IncompatibleMode {
                    mode: self.mode.name(),
                    kind: self.invoke,
                });
            }
            (TransactionMode::Burst { bands }, _) => {
                if bands.iter().any(|band| band.duration_ms == 0) {
                    return Err(ConfigError::InvalidValue {
                        field: "mode.bands.duration_ms",
                        reason: "every burst band needs a non-zero duration".to_owned(),
                    });
                }
            }
            _ => (),
        }

        let payload = self.transaction.payload;
        if payload.min > payload.max {
            return Err(ConfigError::InvalidValue {
                field: "transaction.payload",
                reason: format!("min ({}) > max ({})", payload.min, payload.max),
            });
        }

        self.transaction.check_indices(self.invoke)?;
        if matches!(self.mode, TransactionMode::Mix { .. }) || self.invoke_check.is_some() {
            self.transaction.check_indices(InvokeKind::Query)?;
        }

        if let Some(transient) = &self.transaction.transient
            && let Some(missing) = transient
                .keys
                .iter()
                .find(|key| !transient.map.contains_key(key.as_str()))
        {
            return Err(ConfigError::InvalidValue {
                field: "transaction.transient.keys",
                reason: format!("'{missing}' is not an entry of the transient map"),
            });
        }

        if let Some(check) = &self.invoke_check {
            if self.invoke != InvokeKind::Move {
                return Err(ConfigError::IncompatibleMode {
                    mode: "INVOKE_CHECK",
                    kind: self.invoke,
                });
            }
            if let Some(peers) = &check.peers {
                self.topology.target_peers(peers, &self.orgs)?;
            }
        }

        if self.invoke == InvokeKind::Move
            && self.event.listener != EventListenerMode::None
            && self.event.timeout_ms == 0
        {
            return Err(ConfigError::InvalidValue {
                field: "event.timeout_ms",
                reason: "must be non-zero when listening for commit events".to_owned(),
            });
        }

        self.resolve_targets()?;
        Ok(())
    }

    /// Apply CLI overwrites on top of the descriptor, logging each decision.
    pub fn apply_overrides(&mut self, overwrite: &WorkloadOverrides) {
        macro_rules! merge_overrides {
            ($target:expr, $overwrite:ident, {$($property:ident),+ $(,)?}) => {
                $(
                    if let Some(value) = $overwrite.$property {
                        tracing::info!("property '{}': use overwrite: {value}", stringify!($property));
                        $target.$property = value;
                    } else {
                        tracing::debug!("property '{}': use descriptor: {}", stringify!($property), $target.$property);
                    }
                )+
            };
        }

        merge_overrides!(
            self, overwrite,
            {
                n_request,
                run_duration_secs,
                processes_per_org,
                min_sync_ms,
            }
        );

        if let Some(timeout_ms) = overwrite.event_timeout_ms {
            tracing::info!("property 'event_timeout_ms': use overwrite: {timeout_ms}");
            self.event.timeout_ms = timeout_ms;
        }

        if let Some(freq) = overwrite.freq_ms {
            match &mut self.mode {
                TransactionMode::Constant { freq_ms, .. }
                | TransactionMode::Mix { freq_ms }
                | TransactionMode::Proposal { freq_ms } => {
                    tracing::info!("property 'freq_ms': use overwrite: {freq}");
                    *freq_ms = freq;
                }
                TransactionMode::Latency | TransactionMode::Burst { .. } => {
                    tracing::warn!(
                        "property 'freq_ms': overwrite ignored for mode {}",
                        self.mode.name()
                    );
                }
            }
        }

        if let Some(jitter) = overwrite.jitter_ms {
            if let TransactionMode::Constant { jitter_ms, .. } = &mut self.mode {
                tracing::info!("property 'jitter_ms': use overwrite: {jitter}");
                *jitter_ms = jitter;
            } else {
                tracing::warn!(
                    "property 'jitter_ms': overwrite ignored for mode {}",
                    self.mode.name()
                );
            }
        }
    }
}

/// Workload properties that can be overwritten from the command line.
#[derive(Debug, Clone, clap::Args, Default)]
pub struct WorkloadOverrides {
    /// Number of attempts per worker.
    #[arg(long, value_name = "N")]
    pub n_request: Option<u64>,

    /// Run duration per worker, used when no request count is set.
    #[arg(long, value_name = "SECONDS")]
    pub run_duration_secs: Option<u64>,

    /// Number of workers started per org.
    #[arg(long, value_name = "N")]
    pub processes_per_org: Option<usize>,

    /// Minimum start sync wait.
    #[arg(long, value_name = "MS")]
    pub min_sync_ms: Option<u64>,

    /// Inter-attempt period for constant, mix and proposal modes.
    #[arg(long, value_name = "MS")]
    pub freq_ms: Option<u64>,

    /// Uniform jitter applied to the constant mode period.
    #[arg(long, value_name = "MS")]
    pub jitter_ms: Option<u64>,

    /// How long to wait for commit events once sending stopped.
    #[arg(long, value_name = "MS")]
    pub event_timeout_ms: Option<u64>,
}
