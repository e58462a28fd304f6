use std::{fmt, time::Duration};

use crate::worker::SummaryParseError;

/// A run whose workers cannot all be accounted for.
///
/// Never reduced into the aggregate as a zero contribution.
#[derive(Debug, Clone)]
pub enum ReportError {
    /// The worker ended without ever reporting.
    WorkerMissing { org: String, slot: usize },
    /// The worker did not report before the run ceiling.
    WorkerHung {
        org: String,
        slot: usize,
        ceiling: Duration,
    },
    /// The worker exited but its output carries no usable summary.
    NoSummary {
        org: String,
        slot: usize,
        source: SummaryParseError,
    },
    /// The worker failed during setup.
    WorkerFailed {
        org: String,
        slot: usize,
        reason: String,
    },
}

impl fmt::Display for ReportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportError::WorkerMissing { org, slot } => {
                write!(f, "ReportError: worker {org}/{slot} ended without a report")
            }
            ReportError::WorkerHung { org, slot, ceiling } => write!(
                f,
                "ReportError: worker {org}/{slot} still running after the {} ceiling",
                humantime::format_duration(*ceiling)
            ),
            ReportError::NoSummary { org, slot, source } => {
                write!(f, "ReportError: worker {org}/{slot} summary unusable: {source}")
            }
            ReportError::WorkerFailed { org, slot, reason } => {
                write!(f, "ReportError: worker {org}/{slot} failed: {reason}")
            }
        }
    }
}

impl std::error::Error for ReportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReportError::NoSummary { source, .. } => Some(source),
            _ => None,
        }
    }
}
