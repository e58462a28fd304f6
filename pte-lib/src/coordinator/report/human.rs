use std::{fmt::Display, time::SystemTime};

use super::{Reporter, rfc3339_ms};
use crate::{
    coordinator::{AggregateReport, PhaseAggregate},
    stats::LatencySample,
};

/// Plain text report, one block per run, meant to be appended to a log
/// of runs (`pteReport.txt`).
pub struct HumanReporter {
    generated_at: SystemTime,
}

impl HumanReporter {
    pub fn new() -> Self {
        Self::with_generated_at(SystemTime::now())
    }

    pub fn with_generated_at(generated_at: SystemTime) -> Self {
        Self { generated_at }
    }
}

impl Default for HumanReporter {
    fn default() -> Self {
        Self::new()
    }
}

fn line(out: &mut String, label: &str, value: impl Display) {
    out.push_str(&format!("{:<22}{value}\n", format!("{label}:")));
}

fn latency(sample: &LatencySample) -> String {
    match sample.average_ms() {
        Some(avg) => format!(
            "count={} avg={avg:.2}ms min={}ms max={}ms",
            sample.count, sample.min_ms, sample.max_ms
        ),
        None => "count=0".to_owned(),
    }
}

fn phase_window(out: &mut String, phase: &PhaseAggregate) {
    line(out, "start", rfc3339_ms(phase.start_ms));
    line(out, "end", rfc3339_ms(phase.end_ms));
    line(out, "duration", format!("{} ms", phase.duration_ms()));
}

impl Reporter for HumanReporter {
    fn render(&self, report: &AggregateReport) -> String {
        let stats = &report.run.stats;
        let mut out = format!(
            "========== PTE report {} ==========\n",
            humantime::format_rfc3339_seconds(self.generated_at)
        );

        line(&mut out, "run id", &report.run_id);
        line(&mut out, "channel", &report.channel);
        line(&mut out, "chaincode", &report.chaincode_id);
        line(&mut out, "transaction", format!("{} {}", report.kind, report.mode));
        line(
            &mut out,
            "processes",
            format!(
                "{} orgs x {} per org = {} workers",
                report.orgs, report.processes_per_org, report.run.workers
            ),
        );
        line(
            &mut out,
            "target peers",
            format!("{} (fanout {})", report.target_peers, report.fanout),
        );
        line(&mut out, "sent", stats.sent);
        line(
            &mut out,
            "received",
            format!("{} (expected {})", stats.received, report.expected_received()),
        );
        line(&mut out, "failures", format!("failed={}", stats.failed));
        line(
            &mut out,
            "events",
            format!(
                "timeout={} unreceived={} invalid={}",
                stats.timeout, stats.unreceived, stats.invalid
            ),
        );
        phase_window(&mut out, &report.run);
        if report.is_latency_mode() {
            let avg = report
                .avg_latency_ms()
                .map(|avg| format!("{avg:.2} ms"))
                .unwrap_or_else(|| "n/a".to_owned());
            line(&mut out, "avg latency", avg);
        } else {
            line(&mut out, "TPS", format!("{:.2}", report.run.throughput()));
        }
        line(&mut out, "submit ack latency", latency(&stats.submit_latency));
        line(&mut out, "event latency", latency(&stats.event_latency));
        if stats.mix_read + stats.mix_read_failed > 0 {
            line(
                &mut out,
                "mix read-back",
                format!("read={} failed={}", stats.mix_read, stats.mix_read_failed),
            );
        }

        if let Some(validation) = &report.validation {
            out.push_str("---------- validation ----------\n");
            line(&mut out, "workers", validation.workers);
            line(&mut out, "sent", validation.stats.sent);
            line(&mut out, "received", validation.stats.received);
            line(&mut out, "failures", format!("failed={}", validation.stats.failed));
            phase_window(&mut out, validation);
        }

        if report.cancelled {
            line(&mut out, "cancelled", "yes");
        }
        line(&mut out, "verdict", report.verdict());
        out.push('\n');
        out
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, UNIX_EPOCH};

    use super::*;
    use crate::{
        stats::WorkerStats,
        worker::{WorkerReport, WorkerSummary},
        workload::{InvokeKind, TransactionMode, WorkloadDescriptor, fixture},
    };

    fn aggregate(descriptor: &WorkloadDescriptor, stats: WorkerStats) -> AggregateReport {
        let run = WorkerSummary {
            kind: descriptor.invoke,
            mode: descriptor.mode.name().to_owned(),
            org: "org1".to_owned(),
            slot: 0,
            chaincode_id: descriptor.chaincode_id.clone(),
            stats,
            start_ms: 1_700_000_000_000,
            end_ms: 1_700_000_002_000,
            cancelled: false,
        };
        AggregateReport::reduce(
            "r1",
            descriptor,
            &[WorkerReport {
                run,
                validation: None,
            }],
        )
    }

    fn reporter() -> HumanReporter {
        HumanReporter::with_generated_at(UNIX_EPOCH + Duration::from_secs(1_700_000_010))
    }

    #[test]
    fn test_human_report_sections() {
        let descriptor = fixture::descriptor(InvokeKind::Move);
        let stats = WorkerStats {
            sent: 10,
            received: 10,
            event_latency: LatencySample {
                count: 10,
                total_ms: 500,
                min_ms: 40,
                max_ms: 60,
            },
            ..Default::default()
        };

        let text = reporter().render(&aggregate(&descriptor, stats));

        assert!(text.starts_with("========== PTE report 2023-11-14T22:13:30Z =========="));
        assert!(text.contains("transaction:          MOVE CONSTANT\n"));
        assert!(text.contains("processes:            2 orgs x 1 per org = 1 workers\n"));
        assert!(text.contains("received:             10 (expected 10)\n"));
        assert!(text.contains("start:                2023-11-14T22:13:20.000Z\n"));
        assert!(text.contains("duration:             2000 ms\n"));
        assert!(text.contains("TPS:                  5.00\n"));
        assert!(text.contains("event latency:        count=10 avg=50.00ms min=40ms max=60ms\n"));
        assert!(text.contains("submit ack latency:   count=0\n"));
        assert!(!text.contains("validation"));
        assert!(text.ends_with("verdict:              PASS\n\n"));
    }

    #[test]
    fn test_human_report_latency_mode() {
        let mut descriptor = fixture::descriptor(InvokeKind::Move);
        descriptor.mode = TransactionMode::Latency;
        let stats = WorkerStats {
            sent: 4,
            received: 4,
            ..Default::default()
        };

        let text = reporter().render(&aggregate(&descriptor, stats));

        assert!(text.contains("avg latency:          500.00 ms\n"));
        assert!(!text.contains("TPS"));
    }
}
