//! Worker → coordinator summary line.
//!
//! One line per phase, a marker token followed by `label=value` pairs:
//!
//! ```text
//! pte-exec:completed kind=MOVE mode=CONSTANT org=org1 slot=0 chaincodeId=sample_cc sent=10 Rcvd=10 failed=0 timeout=0 unreceived=0 invalid=0 start=1700000000000 end=1700000001000 throughput=10.00 submitLatency=10/52/3/9 eventLatency=10/410/38/45 mixRead=0 mixReadFailed=0 cancelled=false
//! ```
//!
//! Parsing looks labels up by name, so fields may be appended freely but
//! existing labels must never be renamed.

use std::{collections::HashMap, fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{
    stats::{LatencySample, WorkerStats},
    workload::InvokeKind,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SummaryMarker {
    /// The main run of a worker.
    Completed,
    /// The post-run validation read-back.
    Validated,
}

impl SummaryMarker {
    pub const fn as_str(&self) -> &'static str {
        match self {
            SummaryMarker::Completed => "pte-exec:completed",
            SummaryMarker::Validated => "pte-exec:validated",
        }
    }
}

/// Outcome of one worker phase, as reported to the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSummary {
    pub kind: InvokeKind,
    pub mode: String,
    pub org: String,
    pub slot: usize,
    pub chaincode_id: String,
    pub stats: WorkerStats,
    pub start_ms: u64,
    pub end_ms: u64,
    pub cancelled: bool,
}

impl WorkerSummary {
    pub fn duration_ms(&self) -> u64 {
        self.end_ms.saturating_sub(self.start_ms)
    }

    /// Received per second over the worker's own window.
    pub fn throughput(&self) -> f64 {
        throughput(self.stats.received, self.duration_ms())
    }

    pub fn to_line(&self, marker: SummaryMarker) -> String {
        let s = &self.stats;
        format!(
            "{} kind={} mode={} org={} slot={} chaincodeId={} sent={} Rcvd={} failed={} timeout={} unreceived={} invalid={} start={} end={} throughput={:.2} submitLatency={} eventLatency={} mixRead={} mixReadFailed={} cancelled={}",
            marker.as_str(),
            self.kind,
            self.mode,
            self.org,
            self.slot,
            self.chaincode_id,
            s.sent,
            s.received,
            s.failed,
            s.timeout,
            s.unreceived,
            s.invalid,
            self.start_ms,
            self.end_ms,
            self.throughput(),
            LatencyField(&s.submit_latency),
            LatencyField(&s.event_latency),
            s.mix_read,
            s.mix_read_failed,
            self.cancelled,
        )
    }

    /// Parse the summary following `marker` in `line`.
    pub fn parse_line(line: &str, marker: SummaryMarker) -> Result<Self, SummaryParseError> {
        let idx = line
            .find(marker.as_str())
            .ok_or(SummaryParseError::MissingMarker(marker))?;
        let fields: HashMap<&str, &str> = line[idx + marker.as_str().len()..]
            .split_whitespace()
            .filter_map(|token| token.split_once('='))
            .collect();
        let fields = Fields(fields);

        Ok(Self {
            kind: fields.parse("kind")?,
            mode: fields.get("mode")?.to_owned(),
            org: fields.get("org")?.to_owned(),
            slot: fields.parse("slot")?,
            chaincode_id: fields.get("chaincodeId")?.to_owned(),
            stats: WorkerStats {
                sent: fields.parse("sent")?,
                received: fields.parse("Rcvd")?,
                failed: fields.parse("failed")?,
                timeout: fields.parse("timeout")?,
                unreceived: fields.parse("unreceived")?,
                invalid: fields.parse("invalid")?,
                mix_read: fields.parse_or_default("mixRead")?,
                mix_read_failed: fields.parse_or_default("mixReadFailed")?,
                submit_latency: fields.latency("submitLatency")?,
                event_latency: fields.latency("eventLatency")?,
            },
            start_ms: fields.parse("start")?,
            end_ms: fields.parse("end")?,
            cancelled: fields.parse_or_default("cancelled")?,
        })
    }

    /// Find and parse the first summary line carrying `marker` in `output`.
    pub fn find_in_output(output: &str, marker: SummaryMarker) -> Result<Self, SummaryParseError> {
        output
            .lines()
            .find(|line| line.contains(marker.as_str()))
            .ok_or(SummaryParseError::MissingMarker(marker))
            .and_then(|line| Self::parse_line(line, marker))
    }
}

pub fn throughput(received: u64, duration_ms: u64) -> f64 {
    if duration_ms == 0 {
        return 0.0;
    }
    received as f64 * 1000.0 / duration_ms as f64
}

struct LatencyField<'a>(&'a LatencySample);

impl fmt::Display for LatencyField<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.0.count, self.0.total_ms, self.0.min_ms, self.0.max_ms
        )
    }
}

struct Fields<'a>(HashMap<&'a str, &'a str>);

impl<'a> Fields<'a> {
    fn get(&self, field: &'static str) -> Result<&'a str, SummaryParseError> {
        self.0
            .get(field)
            .copied()
            .ok_or(SummaryParseError::MissingField(field))
    }

    fn parse<T: FromStr>(&self, field: &'static str) -> Result<T, SummaryParseError> {
        let value = self.get(field)?;
        value.parse().map_err(|_| SummaryParseError::InvalidField {
            field,
            value: value.to_owned(),
        })
    }

    fn parse_or_default<T: FromStr + Default>(
        &self,
        field: &'static str,
    ) -> Result<T, SummaryParseError> {
        match self.0.contains_key(field) {
            true => self.parse(field),
            false => Ok(T::default()),
        }
    }

    fn latency(&self, field: &'static str) -> Result<LatencySample, SummaryParseError> {
        let value = self.get(field)?;
        let invalid = || SummaryParseError::InvalidField {
            field,
            value: value.to_owned(),
        };
        let parts: Vec<u64> = value
            .split('/')
            .map(|part| part.parse().map_err(|_| invalid()))
            .collect::<Result<_, _>>()?;
        let [count, total_ms, min_ms, max_ms] = parts[..] else {
            return Err(invalid());
        };
        Ok(LatencySample {
            count,
            total_ms,
            min_ms,
            max_ms,
        })
    }
}

/// A worker summary line that cannot be used for aggregation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SummaryParseError {
    MissingMarker(SummaryMarker),
    MissingField(&'static str),
    InvalidField { field: &'static str, value: String },
}

impl fmt::Display for SummaryParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SummaryParseError::MissingMarker(marker) => {
                write!(f, "SummaryParseError: no '{}' line found", marker.as_str())
            }
            SummaryParseError::MissingField(field) => {
                write!(f, "SummaryParseError: missing field '{field}'")
            }
            SummaryParseError::InvalidField { field, value } => {
                write!(f, "SummaryParseError: invalid value '{value}' for field '{field}'")
            }
        }
    }
}

impl std::error::Error for SummaryParseError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary() -> WorkerSummary {
        WorkerSummary {
            kind: InvokeKind::Move,
            mode: "CONSTANT".to_owned(),
            org: "org1".to_owned(),
            slot: 3,
            chaincode_id: "sample_cc".to_owned(),
            stats: WorkerStats {
                sent: 10,
                received: 8,
                failed: 1,
                timeout: 1,
                unreceived: 1,
                invalid: 2,
                mix_read: 0,
                mix_read_failed: 0,
                submit_latency: LatencySample {
                    count: 9,
                    total_ms: 45,
                    min_ms: 2,
                    max_ms: 11,
                },
                event_latency: LatencySample {
                    count: 8,
                    total_ms: 800,
                    min_ms: 50,
                    max_ms: 230,
                },
            },
            start_ms: 1_700_000_000_000,
            end_ms: 1_700_000_002_000,
            cancelled: false,
        }
    }

    #[test]
    fn test_summary_line_format() {
        let line = summary().to_line(SummaryMarker::Completed);
        assert!(line.starts_with("pte-exec:completed kind=MOVE mode=CONSTANT org=org1 slot=3"));
        assert!(line.contains(" sent=10 Rcvd=8 failed=1 timeout=1 unreceived=1 invalid=2 "));
        assert!(line.contains(" throughput=4.00 "));
        assert!(line.contains(" submitLatency=9/45/2/11 eventLatency=8/800/50/230 "));
        assert!(!line.contains('\n'));
    }

    #[test]
    fn test_parse_line_with_prefix_and_extra_fields() {
        let line = format!(
            "2024-01-01T00:00:00Z INFO worker: {} futureField=42",
            summary().to_line(SummaryMarker::Completed)
        );
        let parsed = WorkerSummary::parse_line(&line, SummaryMarker::Completed).unwrap();
        assert_eq!(parsed, summary());
    }

    #[test]
    fn test_parse_line_is_label_based() {
        let line = "pte-exec:completed Rcvd=5 sent=5 kind=QUERY mode=CONSTANT org=org2 slot=0 \
            chaincodeId=cc failed=0 timeout=0 unreceived=0 invalid=0 end=2000 start=1000 \
            submitLatency=5/10/1/3 eventLatency=0/0/0/0";
        let parsed = WorkerSummary::parse_line(line, SummaryMarker::Completed).unwrap();
        assert_eq!(parsed.kind, InvokeKind::Query);
        assert_eq!(parsed.stats.sent, 5);
        assert_eq!(parsed.stats.received, 5);
        assert_eq!(parsed.stats.mix_read, 0);
        assert!(!parsed.cancelled);
        assert_eq!(parsed.throughput(), 5.0);
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            WorkerSummary::parse_line("sent=5", SummaryMarker::Completed),
            Err(SummaryParseError::MissingMarker(SummaryMarker::Completed))
        );

        let line = summary()
            .to_line(SummaryMarker::Completed)
            .replace(" Rcvd=8", "");
        assert_eq!(
            WorkerSummary::parse_line(&line, SummaryMarker::Completed),
            Err(SummaryParseError::MissingField("Rcvd"))
        );

        let line = summary()
            .to_line(SummaryMarker::Completed)
            .replace("sent=10", "sent=ten");
        assert_eq!(
            WorkerSummary::parse_line(&line, SummaryMarker::Completed),
            Err(SummaryParseError::InvalidField {
                field: "sent",
                value: "ten".to_owned()
            })
        );

        let line = summary()
            .to_line(SummaryMarker::Completed)
            .replace("submitLatency=9/45/2/11", "submitLatency=9/45");
        assert!(matches!(
            WorkerSummary::parse_line(&line, SummaryMarker::Completed),
            Err(SummaryParseError::InvalidField {
                field: "submitLatency",
                ..
            })
        ));
    }

    #[test]
    fn test_find_in_output_picks_marker() {
        let mut validated = summary();
        validated.kind = InvokeKind::Query;
        let output = format!(
            "some noise\n{}\n{}\n",
            validated.to_line(SummaryMarker::Validated),
            summary().to_line(SummaryMarker::Completed),
        );

        assert_eq!(
            WorkerSummary::find_in_output(&output, SummaryMarker::Completed).unwrap(),
            summary()
        );
        assert_eq!(
            WorkerSummary::find_in_output(&output, SummaryMarker::Validated).unwrap(),
            validated
        );
        assert!(WorkerSummary::find_in_output("noise", SummaryMarker::Completed).is_err());
    }
}
