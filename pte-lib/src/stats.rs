//! Per-worker counters and running latency aggregates.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Running `(count, total, min, max)` aggregate of latencies in ms.
///
/// Memory use is constant regardless of how many samples are recorded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencySample {
    pub count: u64,
    pub total_ms: u64,
    pub min_ms: u64,
    pub max_ms: u64,
}

impl LatencySample {
    pub fn record(&mut self, latency: Duration) {
        let ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        if self.count == 0 {
            self.min_ms = ms;
            self.max_ms = ms;
        } else {
            self.min_ms = self.min_ms.min(ms);
            self.max_ms = self.max_ms.max(ms);
        }
        self.count += 1;
        self.total_ms = self.total_ms.saturating_add(ms);
    }

    /// Combine two aggregates: sums for count and total,
    /// min-of-mins and max-of-maxes. Empty aggregates are neutral.
    pub fn merge(&mut self, other: &LatencySample) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = *other;
            return;
        }
        self.count += other.count;
        self.total_ms = self.total_ms.saturating_add(other.total_ms);
        self.min_ms = self.min_ms.min(other.min_ms);
        self.max_ms = self.max_ms.max(other.max_ms);
    }

    pub fn average_ms(&self) -> Option<f64> {
        (self.count > 0).then(|| self.total_ms as f64 / self.count as f64)
    }
}

/// Counters of a single worker, owned by its execution loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStats {
    /// Attempts issued.
    pub sent: u64,
    /// MOVE: commit events received. QUERY: peer responses received.
    pub received: u64,
    /// Attempts rejected at submission.
    pub failed: u64,
    /// Received events that arrived later than the event timeout.
    pub timeout: u64,
    /// Tracked transactions whose event never arrived before drain end.
    pub unreceived: u64,
    /// Received events with a non-valid terminal code.
    pub invalid: u64,
    /// Mix mode read-backs that succeeded.
    pub mix_read: u64,
    /// Mix mode read-backs that failed.
    pub mix_read_failed: u64,
    /// Submission acknowledgement latency.
    pub submit_latency: LatencySample,
    /// Submission to commit event latency.
    pub event_latency: LatencySample,
}

impl WorkerStats {
    /// Every attempt ended in exactly one of received, failed or unreceived.
    ///
    /// Only meaningful for MOVE workloads: a query may be answered
    /// by several peers.
    pub fn is_balanced(&self) -> bool {
        self.sent == self.received + self.failed + self.unreceived
    }

    pub fn merge(&mut self, other: &WorkerStats) {
        self.sent += other.sent;
        self.received += other.received;
        self.failed += other.failed;
        self.timeout += other.timeout;
        self.unreceived += other.unreceived;
        self.invalid += other.invalid;
        self.mix_read += other.mix_read;
        self.mix_read_failed += other.mix_read_failed;
        self.submit_latency.merge(&other.submit_latency);
        self.event_latency.merge(&other.event_latency);
    }
}
