use serde_json::{Value, json};

use super::{Reporter, rfc3339_ms};
use crate::{
    coordinator::{AggregateReport, PhaseAggregate},
    stats::LatencySample,
};

/// Structured report carrying the same aggregate as the human one plus
/// the verdict.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonReporter {
    pretty: bool,
}

impl JsonReporter {
    pub fn new(pretty: bool) -> Self {
        Self { pretty }
    }

    pub fn to_value(report: &AggregateReport) -> Value {
        json!({
            "run_id": report.run_id,
            "channel": report.channel,
            "chaincode_id": report.chaincode_id,
            "kind": report.kind,
            "mode": report.mode,
            "target_peers": report.target_peers,
            "fanout": report.fanout,
            "orgs": report.orgs,
            "processes_per_org": report.processes_per_org,
            "run": phase(&report.run),
            "expected_received": report.expected_received(),
            "tps": report.run.throughput(),
            "avg_latency_ms": report.is_latency_mode().then(|| report.avg_latency_ms()).flatten(),
            "validation": report.validation.as_ref().map(phase),
            "cancelled": report.cancelled,
            "verdict": report.verdict(),
        })
    }
}

fn latency(sample: &LatencySample) -> Value {
    json!({
        "count": sample.count,
        "total_ms": sample.total_ms,
        "min_ms": sample.min_ms,
        "max_ms": sample.max_ms,
        "avg_ms": sample.average_ms(),
    })
}

fn phase(phase: &PhaseAggregate) -> Value {
    let stats = &phase.stats;
    json!({
        "workers": phase.workers,
        "sent": stats.sent,
        "received": stats.received,
        "failed": stats.failed,
        "timeout": stats.timeout,
        "unreceived": stats.unreceived,
        "invalid": stats.invalid,
        "mix_read": stats.mix_read,
        "mix_read_failed": stats.mix_read_failed,
        "start_ms": phase.start_ms,
        "end_ms": phase.end_ms,
        "start": rfc3339_ms(phase.start_ms),
        "end": rfc3339_ms(phase.end_ms),
        "duration_ms": phase.duration_ms(),
        "submit_latency": latency(&stats.submit_latency),
        "event_latency": latency(&stats.event_latency),
    })
}

impl Reporter for JsonReporter {
    fn render(&self, report: &AggregateReport) -> String {
        let value = Self::to_value(report);
        let mut out = if self.pretty {
            format!("{value:#}")
        } else {
            value.to_string()
        };
        out.push('\n');
        out
    }
}
