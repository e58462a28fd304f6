use std::path::Path;

use pte_lib::ledger::sim::{LedgerScenario, SimConfig};
use rama::{
    error::{BoxError, ErrorContext as _},
    telemetry::tracing,
};
use tokio::io::AsyncWriteExt as _;

pub mod run;
pub mod worker;

/// Resolve the simulated ledger config: scenario preset (if any) with the
/// manually defined parameters on top.
fn merge_sim_cfg(scenario: Option<LedgerScenario>, config: Option<SimConfig>) -> SimConfig {
    let overwrite_cfg = config.unwrap_or_default();
    match scenario {
        Some(scenario) => {
            tracing::info!("use scenario to define base config: {scenario:?}");
            scenario.merge(&overwrite_cfg)
        }
        None => {
            tracing::info!("no scenario defined, use default as base config");
            SimConfig::default().overlay(&overwrite_cfg)
        }
    }
}

async fn read_sim_cfg(path: &Path) -> Result<SimConfig, BoxError> {
    let raw = tokio::fs::read(path)
        .await
        .context("read simulated ledger config")
        .with_context_debug_field("path", || path.to_owned())?;
    serde_json::from_slice(&raw)
        .context("parse simulated ledger config as json")
        .with_context_debug_field("path", || path.to_owned())
}

async fn write_stdout(text: &str) -> Result<(), BoxError> {
    let mut stdout = tokio::io::stdout();
    stdout
        .write_all(text.as_bytes())
        .await
        .context("write to stdout")?;
    stdout.flush().await.context("flush stdout")?;
    Ok(())
}
