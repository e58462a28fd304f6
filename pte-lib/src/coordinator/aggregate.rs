use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{
    stats::WorkerStats,
    worker::{WorkerReport, WorkerSummary, throughput},
    workload::{InvokeKind, TransactionMode, WorkloadDescriptor},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Pass,
    Fail,
}

impl Verdict {
    pub fn is_pass(self) -> bool {
        self == Verdict::Pass
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Verdict::Pass => "PASS",
            Verdict::Fail => "FAIL",
        })
    }
}

/// Counters of one phase summed over every worker, with the overall window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseAggregate {
    pub workers: usize,
    pub stats: WorkerStats,
    /// Earliest worker start, unix epoch ms.
    pub start_ms: u64,
    /// Latest worker end, unix epoch ms.
    pub end_ms: u64,
}

impl PhaseAggregate {
    fn reduce<'a>(summaries: impl IntoIterator<Item = &'a WorkerSummary>) -> Option<Self> {
        summaries.into_iter().fold(None, |acc, summary| {
            let mut agg = acc.unwrap_or(PhaseAggregate {
                workers: 0,
                stats: WorkerStats::default(),
                start_ms: summary.start_ms,
                end_ms: summary.end_ms,
            });
            agg.workers += 1;
            agg.stats.merge(&summary.stats);
            agg.start_ms = agg.start_ms.min(summary.start_ms);
            agg.end_ms = agg.end_ms.max(summary.end_ms);
            Some(agg)
        })
    }

    pub fn duration_ms(&self) -> u64 {
        self.end_ms.saturating_sub(self.start_ms)
    }

    /// Received per second over the overall window.
    pub fn throughput(&self) -> f64 {
        throughput(self.stats.received, self.duration_ms())
    }
}

/// The reduced outcome of a whole run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateReport {
    pub run_id: String,
    pub channel: String,
    pub chaincode_id: String,
    pub kind: InvokeKind,
    pub mode: String,
    pub target_peers: String,
    pub orgs: usize,
    pub processes_per_org: usize,
    /// Expected responses per query.
    pub fanout: usize,
    pub run: PhaseAggregate,
    pub validation: Option<PhaseAggregate>,
    /// At least one worker was stopped by a cancellation signal.
    pub cancelled: bool,
}

impl AggregateReport {
    /// Reduce the reports of every worker of a run.
    pub fn reduce(run_id: &str, descriptor: &WorkloadDescriptor, reports: &[WorkerReport]) -> Self {
        Self {
            run_id: run_id.to_owned(),
            channel: descriptor.channel.clone(),
            chaincode_id: descriptor.chaincode_id.clone(),
            kind: descriptor.invoke,
            mode: descriptor.mode.name().to_owned(),
            target_peers: descriptor.target_peers.name().to_owned(),
            orgs: descriptor.orgs.len(),
            processes_per_org: descriptor.processes_per_org,
            fanout: descriptor.fanout_factor(),
            run: PhaseAggregate::reduce(reports.iter().map(|r| &r.run)).unwrap_or_default(),
            validation: PhaseAggregate::reduce(reports.iter().filter_map(|r| r.validation.as_ref())),
            cancelled: reports.iter().any(|r| r.run.cancelled),
        }
    }

    pub fn is_latency_mode(&self) -> bool {
        self.mode == TransactionMode::Latency.name()
    }

    /// Average time per received transaction in latency mode.
    pub fn avg_latency_ms(&self) -> Option<f64> {
        match self.run.stats.received {
            0 => None,
            received => Some(self.run.duration_ms() as f64 / received as f64),
        }
    }

    /// Responses a passing run must have received.
    pub fn expected_received(&self) -> u64 {
        match self.kind {
            InvokeKind::Move => self.run.stats.sent,
            InvokeKind::Query => self.run.stats.sent * self.fanout as u64,
        }
    }

    pub fn verdict(&self) -> Verdict {
        let stats = &self.run.stats;
        let run_ok = stats.sent > 0
            && stats.received == self.expected_received()
            && match self.kind {
                InvokeKind::Move => stats.invalid == 0,
                InvokeKind::Query => true,
            };
        let validation_ok = self
            .validation
            .as_ref()
            .is_none_or(|validation| validation.stats.failed == 0);

        if run_ok && validation_ok {
            Verdict::Pass
        } else {
            Verdict::Fail
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        stats::LatencySample,
        workload::{TargetPeers, fixture},
    };

    fn summary(kind: InvokeKind, stats: WorkerStats, start_ms: u64, end_ms: u64) -> WorkerSummary {
        WorkerSummary {
            kind,
            mode: "CONSTANT".to_owned(),
            org: "org1".to_owned(),
            slot: 0,
            chaincode_id: "sample_cc".to_owned(),
            stats,
            start_ms,
            end_ms,
            cancelled: false,
        }
    }

    fn report(summary: WorkerSummary) -> WorkerReport {
        WorkerReport {
            run: summary,
            validation: None,
        }
    }

    fn latency(count: u64, total_ms: u64, min_ms: u64, max_ms: u64) -> LatencySample {
        LatencySample {
            count,
            total_ms,
            min_ms,
            max_ms,
        }
    }

    #[test]
    fn test_reduce_sums_counts_and_widens_window() {
        let descriptor = fixture::descriptor(InvokeKind::Move);
        let a = WorkerStats {
            sent: 10,
            received: 9,
            unreceived: 1,
            event_latency: latency(9, 900, 50, 200),
            ..Default::default()
        };
        let b = WorkerStats {
            sent: 10,
            received: 8,
            failed: 2,
            invalid: 1,
            event_latency: latency(8, 400, 20, 90),
            ..Default::default()
        };

        let agg = AggregateReport::reduce(
            "r1",
            &descriptor,
            &[
                report(summary(InvokeKind::Move, a, 1_000, 3_000)),
                report(summary(InvokeKind::Move, b, 900, 2_500)),
            ],
        );

        assert_eq!(agg.run.workers, 2);
        assert_eq!(agg.run.stats.sent, 20);
        assert_eq!(agg.run.stats.received, 17);
        assert_eq!(agg.run.stats.failed, 2);
        assert_eq!(agg.run.stats.unreceived, 1);
        assert_eq!(agg.run.stats.invalid, 1);
        assert_eq!(agg.run.stats.event_latency, latency(17, 1_300, 20, 200));
        assert_eq!(agg.run.start_ms, 900);
        assert_eq!(agg.run.end_ms, 3_000);
        assert!((agg.run.throughput() - 8.095).abs() < 0.001);
        assert!(agg.validation.is_none());
        assert_eq!(agg.verdict(), Verdict::Fail);
    }

    #[test]
    fn test_move_verdict() {
        let descriptor = fixture::descriptor(InvokeKind::Move);
        let passing = WorkerStats {
            sent: 5,
            received: 5,
            ..Default::default()
        };
        let agg = AggregateReport::reduce(
            "r1",
            &descriptor,
            &[report(summary(InvokeKind::Move, passing, 0, 100))],
        );
        assert_eq!(agg.verdict(), Verdict::Pass);

        let invalid = WorkerStats {
            invalid: 1,
            ..passing
        };
        let agg = AggregateReport::reduce(
            "r1",
            &descriptor,
            &[report(summary(InvokeKind::Move, invalid, 0, 100))],
        );
        assert_eq!(agg.verdict(), Verdict::Fail);

        let agg = AggregateReport::reduce(
            "r1",
            &descriptor,
            &[report(summary(InvokeKind::Move, WorkerStats::default(), 0, 0))],
        );
        assert_eq!(agg.verdict(), Verdict::Fail);
    }

    #[test]
    fn test_query_verdict_requires_full_fanout() {
        let mut descriptor = fixture::descriptor(InvokeKind::Query);
        descriptor.target_peers = TargetPeers::AllPeers;

        let verdict = |received| {
            let stats = WorkerStats {
                sent: 40,
                received,
                ..Default::default()
            };
            let agg = AggregateReport::reduce(
                "r1",
                &descriptor,
                &[report(summary(InvokeKind::Query, stats, 0, 1_000))],
            );
            assert_eq!(agg.fanout, 4);
            assert_eq!(agg.expected_received(), 160);
            agg.verdict()
        };

        assert_eq!(verdict(160), Verdict::Pass);
        assert_eq!(verdict(40), Verdict::Fail);
        assert_eq!(verdict(161), Verdict::Fail);
    }

    #[test]
    fn test_validation_failures_fail_the_run() {
        let descriptor = fixture::descriptor(InvokeKind::Move);
        let run = WorkerStats {
            sent: 3,
            received: 3,
            ..Default::default()
        };
        let validation = |failed| WorkerStats {
            sent: 1,
            received: 1 - failed,
            failed,
            ..Default::default()
        };

        let reduce = |failed| {
            AggregateReport::reduce(
                "r1",
                &descriptor,
                &[
                    WorkerReport {
                        run: summary(InvokeKind::Move, run, 0, 100),
                        validation: Some(summary(InvokeKind::Query, validation(0), 100, 110)),
                    },
                    WorkerReport {
                        run: summary(InvokeKind::Move, run, 0, 100),
                        validation: Some(summary(InvokeKind::Query, validation(failed), 100, 120)),
                    },
                ],
            )
        };

        let agg = reduce(0);
        let checked = agg.validation.unwrap();
        assert_eq!(checked.workers, 2);
        assert_eq!(checked.start_ms, 100);
        assert_eq!(checked.end_ms, 120);
        assert_eq!(agg.verdict(), Verdict::Pass);

        assert_eq!(reduce(1).verdict(), Verdict::Fail);
    }

    #[test]
    fn test_latency_mode_average() {
        let mut descriptor = fixture::descriptor(InvokeKind::Move);
        descriptor.mode = TransactionMode::Latency;
        let stats = WorkerStats {
            sent: 4,
            received: 4,
            ..Default::default()
        };
        let agg = AggregateReport::reduce(
            "r1",
            &descriptor,
            &[report(summary(InvokeKind::Move, stats, 1_000, 1_200))],
        );
        assert!(agg.is_latency_mode());
        assert_eq!(agg.avg_latency_ms(), Some(50.0));
    }
}
