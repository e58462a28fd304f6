//! Matches commit events to the transactions a worker submitted.
//!
//! The correlator is a plain state machine with no timers of its own:
//! the execution loop feeds it events through [`EventCorrelator::handle_event`]
//! and calls [`EventCorrelator::on_drain_timeout`] once the deadline
//! returned by [`EventCorrelator::drain_deadline`] passes. Correlation
//! is keyed by transaction id, so arrival order does not matter.

use std::{collections::HashMap, time::Duration};

use rama::telemetry::tracing;
use tokio::time::Instant;

use crate::{
    ledger::{CommitEvent, TxId},
    stats::WorkerStats,
};


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrelatorState {
    /// Nothing submitted yet.
    Idle,
    /// Attempts are being sent and events consumed.
    AwaitingEvents,
    /// All attempts sent, waiting for the remaining events until `deadline`.
    Draining { deadline: Instant },
    /// Every tracked transaction is accounted for.
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Tracked,
    /// The id is already in flight: the attempt is counted as failed.
    Duplicate,
    /// The correlator is done: the attempt is counted as unreceived.
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    /// A tracked transaction completed.
    Matched {
        latency: Duration,
        valid: bool,
        late: bool,
    },
    /// Not one of ours (foreign, duplicate or already accounted for).
    Ignored,
}

#[derive(Debug)]
pub struct EventCorrelator {
    state: CorrelatorState,
    in_flight: HashMap<TxId, Instant>,
    event_timeout: Duration,
}

impl EventCorrelator {
    pub fn new(event_timeout: Duration) -> Self {
        Self {
            state: CorrelatorState::Idle,
            in_flight: HashMap::new(),
            event_timeout,
        }
    }

    pub fn state(&self) -> CorrelatorState {
        self.state
    }

    pub fn is_done(&self) -> bool {
        self.state == CorrelatorState::Done
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_tracked(&self, tx_id: &TxId) -> bool {
        self.in_flight.contains_key(tx_id)
    }

    pub fn event_timeout(&self) -> Duration {
        self.event_timeout
    }

    /// Deadline of the drain phase, if draining.
    pub fn drain_deadline(&self) -> Option<Instant> {
        match self.state {
            CorrelatorState::Draining { deadline } => Some(deadline),
            _ => None,
        }
    }

    /// Start tracking a submitted transaction.
    pub fn register(
        &mut self,
        tx_id: TxId,
        submitted_at: Instant,
        stats: &mut WorkerStats,
    ) -> Registration {
        if self.state == CorrelatorState::Done {
            tracing::warn!(%tx_id, "transaction registered after correlation finished");
            stats.unreceived += 1;
            return Registration::Rejected;
        }
        if self.in_flight.contains_key(&tx_id) {
            tracing::warn!(%tx_id, "duplicate transaction id returned by ledger client");
            stats.failed += 1;
            return Registration::Duplicate;
        }
        self.in_flight.insert(tx_id, submitted_at);
        if self.state == CorrelatorState::Idle {
            self.state = CorrelatorState::AwaitingEvents;
        }
        Registration::Tracked
    }

    /// Single entry point for commit events.
    pub fn handle_event(&mut self, event: &CommitEvent, stats: &mut WorkerStats) -> EventOutcome {
        let Some(submitted_at) = self.in_flight.remove(&event.tx_id) else {
            tracing::trace!(tx_id = %event.tx_id, "ignore untracked commit event");
            return EventOutcome::Ignored;
        };

        let latency = event.observed_at.saturating_duration_since(submitted_at);
        let valid = event.code.is_valid();
        let late = latency > self.event_timeout;

        stats.received += 1;
        stats.event_latency.record(latency);
        if !valid {
            tracing::debug!(tx_id = %event.tx_id, code = %event.code, "transaction committed as invalid");
            stats.invalid += 1;
        }
        if late {
            tracing::debug!(tx_id = %event.tx_id, ?latency, "commit event arrived after event timeout");
            stats.timeout += 1;
        }

        if matches!(self.state, CorrelatorState::Draining { .. }) && self.in_flight.is_empty() {
            tracing::debug!("all commit events received while draining");
            self.state = CorrelatorState::Done;
        }

        EventOutcome::Matched {
            latency,
            valid,
            late,
        }
    }

    /// All attempts are sent: wait at most `event_timeout` after the last one.
    pub fn begin_drain(&mut self, last_sent: Instant) {
        if self.state == CorrelatorState::Done {
            return;
        }
        if self.in_flight.is_empty() {
            self.state = CorrelatorState::Done;
            return;
        }
        let deadline = last_sent + self.event_timeout;
        tracing::debug!(in_flight = self.in_flight.len(), "start draining commit events");
        self.state = CorrelatorState::Draining { deadline };
    }

    /// Single entry point for drain expiry: whatever is still in flight
    /// is counted as unreceived.
    pub fn on_drain_timeout(&mut self, stats: &mut WorkerStats) {
        if self.state == CorrelatorState::Done {
            return;
        }
        let unreceived = self.in_flight.len() as u64;
        if unreceived > 0 {
            tracing::info!(unreceived, "drain timeout: commit events never received");
        }
        stats.unreceived += unreceived;
        self.in_flight.clear();
        self.state = CorrelatorState::Done;
    }
}
