use std::path::PathBuf;

use clap::Args;
use pte_lib::{
    ledger::sim::{LedgerScenario, SimConfig, SimCredentialProvider},
    worker::{WorkerContext, run_worker},
    workload::WorkloadDescriptor,
};
use rama::{
    error::{BoxError, ErrorContext as _},
    graceful::ShutdownGuard,
};

#[derive(Debug, Clone, Args)]
/// run a single worker and print its summary lines to stdout
pub struct WorkerCommand {
    /// workload descriptor (json)
    workload: PathBuf,

    /// org the worker belongs to
    #[arg(long)]
    org: String,

    /// worker slot within its org
    #[arg(long, default_value_t = 0)]
    slot: usize,

    /// run identifier used in transaction keys
    #[arg(long, default_value = "0")]
    run_id: String,

    /// shared test start, unix epoch ms
    #[arg(long, value_name = "EPOCH_MS")]
    test_start_ms: Option<u64>,

    /// simulated ledger config (json) used as base config
    #[arg(long)]
    sim_config: Option<PathBuf>,

    #[clap(flatten)]
    sim: Option<SimConfig>,

    #[arg(long, conflicts_with = "sim_config")]
    /// Simulated ledger scenario,
    /// manually defined parameters overwrite scenario parameters.
    scenario: Option<LedgerScenario>,
}

pub async fn exec(guard: ShutdownGuard, args: WorkerCommand) -> Result<(), BoxError> {
    let descriptor = WorkloadDescriptor::load(&args.workload).await?;

    let sim_cfg = match &args.sim_config {
        Some(path) => super::read_sim_cfg(path)
            .await?
            .overlay(&args.sim.unwrap_or_default()),
        None => super::merge_sim_cfg(args.scenario, args.sim),
    };
    let provider = SimCredentialProvider::try_new(&sim_cfg).context("create simulated ledger")?;

    let ctx = WorkerContext {
        org: args.org,
        slot: args.slot,
        run_id: args.run_id,
        test_start_ms: args.test_start_ms,
    };
    let report = run_worker(&provider, &descriptor, &ctx, guard).await?;

    let mut out = report.to_lines().join("\n");
    out.push('\n');
    super::write_stdout(&out).await
}
