//! Ledger collaborators: the client the execution loop drives,
//! the credential provider that authenticates it and the commit
//! event stream it exposes.
//!
//! Only [`sim`] ships as a backend. A real network adapter implements
//! [`LedgerClient`] and [`CredentialProvider`] and plugs in unchanged.

use std::{fmt, future::Future};

use rama::error::BoxError;
use tokio::{sync::mpsc, time::Instant};

use crate::{tx::TxSpec, workload::EventListenerMode};

pub mod sim;

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

/// Identifier the ledger assigns to a submitted transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxId(String);

impl TxId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for TxId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for TxId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// Terminal validation code of a committed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ValidationCode(pub i32);

impl ValidationCode {
    /// The single code meaning "valid and committed".
    pub const VALID: Self = Self(0);
    pub const ENDORSEMENT_POLICY_FAILURE: Self = Self(10);
    pub const MVCC_READ_CONFLICT: Self = Self(11);
    pub const PHANTOM_READ_CONFLICT: Self = Self(12);

    pub fn is_valid(self) -> bool {
        self == Self::VALID
    }
}

impl fmt::Display for ValidationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Self::VALID => "VALID",
            Self::ENDORSEMENT_POLICY_FAILURE => "ENDORSEMENT_POLICY_FAILURE",
            Self::MVCC_READ_CONFLICT => "MVCC_READ_CONFLICT",
            Self::PHANTOM_READ_CONFLICT => "PHANTOM_READ_CONFLICT",
            Self(code) => return write!(f, "CODE_{code}"),
        };
        f.write_str(name)
    }
}

/// Commit notification for one transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitEvent {
    pub tx_id: TxId,
    pub code: ValidationCode,
    pub observed_at: Instant,
}

/// Receiving end of a commit event subscription.
///
/// Events arrive in commit order, which need not match submission order.
#[derive(Debug)]
pub struct CommitEventStream {
    rx: mpsc::UnboundedReceiver<CommitEvent>,
}

impl CommitEventStream {
    pub fn new(rx: mpsc::UnboundedReceiver<CommitEvent>) -> Self {
        Self { rx }
    }

    pub fn channel() -> (mpsc::UnboundedSender<CommitEvent>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self::new(rx))
    }

    /// Next event, `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<CommitEvent> {
        self.rx.recv().await
    }

    /// An event that was already delivered, without waiting.
    pub fn try_recv(&mut self) -> Option<CommitEvent> {
        self.rx.try_recv().ok()
    }
}

/// Stage of a transaction at which the network turned it down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitStage {
    /// Proposal, evaluation or endorsement by the target peers.
    Endorsement,
    /// Broadcast of an endorsed transaction to the orderer.
    Ordering,
}

impl fmt::Display for SubmitStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SubmitStage::Endorsement => "endorsement",
            SubmitStage::Ordering => "ordering",
        })
    }
}

/// A failed ledger call, tagged with the stage that failed.
#[derive(Debug)]
pub struct SubmitError {
    pub stage: SubmitStage,
    pub source: BoxError,
}

impl SubmitError {
    pub fn endorsement(source: impl Into<BoxError>) -> Self {
        Self {
            stage: SubmitStage::Endorsement,
            source: source.into(),
        }
    }

    pub fn ordering(source: impl Into<BoxError>) -> Self {
        Self {
            stage: SubmitStage::Ordering,
            source: source.into(),
        }
    }
}

impl fmt::Display for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.stage, self.source)
    }
}

impl std::error::Error for SubmitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&*self.source)
    }
}

/// An authenticated session with the ledger network.
///
/// Calls carry their own SDK deadline: the driver adds no per-call timeout.
pub trait LedgerClient: Send + Sync + 'static {
    /// Endorse a MOVE on `targets` and broadcast it to `orderer`, returning
    /// its id once accepted. Without an orderer the client picks one.
    fn submit(
        &self,
        tx: &TxSpec,
        targets: &[String],
        orderer: Option<&str>,
    ) -> impl Future<Output = Result<TxId, SubmitError>> + Send;

    /// Evaluate a QUERY, returning one response per answering peer.
    fn evaluate(
        &self,
        tx: &TxSpec,
        targets: &[String],
    ) -> impl Future<Output = Result<Vec<Vec<u8>>, BoxError>> + Send;

    /// Collect endorsements for a proposal without submitting it for ordering.
    fn endorse(
        &self,
        tx: &TxSpec,
        targets: &[String],
    ) -> impl Future<Output = Result<(), BoxError>> + Send;

    /// Register a commit event subscription for the given listener mode.
    fn subscribe(&self, mode: EventListenerMode) -> Result<CommitEventStream, BoxError>;
}

/// Hands out authenticated ledger clients.
pub trait CredentialProvider: Send + Sync + 'static {
    type Client: LedgerClient;

    fn authenticate(
        &self,
        org: &str,
        identity: &str,
    ) -> impl Future<Output = Result<Self::Client, BoxError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_code_display() {
        assert_eq!(ValidationCode::VALID.to_string(), "VALID");
        assert_eq!(
            ValidationCode::MVCC_READ_CONFLICT.to_string(),
            "MVCC_READ_CONFLICT"
        );
        assert_eq!(ValidationCode(254).to_string(), "CODE_254");
        assert!(ValidationCode::VALID.is_valid());
        assert!(!ValidationCode(11).is_valid());
    }

    #[test]
    fn test_submit_error_names_its_stage() {
        let err = SubmitError::ordering("service unavailable");
        assert_eq!(err.stage, SubmitStage::Ordering);
        assert_eq!(err.to_string(), "ordering failed: service unavailable");
        assert!(std::error::Error::source(&err).is_some());

        let err = SubmitError::endorsement("policy failure");
        assert_eq!(err.stage, SubmitStage::Endorsement);
    }
}
