//! Report artifacts of a reduced run.

use std::{
    path::Path,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use rama::error::{BoxError, ErrorContext as _};
use tokio::io::AsyncWriteExt as _;

use super::AggregateReport;

mod human;
mod json;

pub use self::{human::HumanReporter, json::JsonReporter};

/// Renders an [`AggregateReport`] into one artifact format.
pub trait Reporter: Send + Sync + 'static {
    fn render(&self, report: &AggregateReport) -> String;
}

/// Append a rendered report to `path`, creating the file if needed.
pub async fn append_report(
    path: &Path,
    reporter: &dyn Reporter,
    report: &AggregateReport,
) -> Result<(), BoxError> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .context("open report file")
        .with_context_debug_field("path", || path.to_owned())?;
    file.write_all(reporter.render(report).as_bytes())
        .await
        .context("write report")
        .with_context_debug_field("path", || path.to_owned())?;
    file.flush().await.context("flush report file")?;
    Ok(())
}

/// Replace `path` with a rendered report.
pub async fn write_report(
    path: &Path,
    reporter: &dyn Reporter,
    report: &AggregateReport,
) -> Result<(), BoxError> {
    tokio::fs::write(path, reporter.render(report))
        .await
        .context("write report file")
        .with_context_debug_field("path", || path.to_owned())
}

fn rfc3339_ms(epoch_ms: u64) -> String {
    let at: SystemTime = UNIX_EPOCH + Duration::from_millis(epoch_ms);
    humantime::format_rfc3339_millis(at).to_string()
}
