use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use clap::Args;
use pte_lib::{
    coordinator::{
        AggregateReport, Coordinator, Isolation, ProcessLauncher,
        report::{HumanReporter, JsonReporter, Reporter as _, append_report, write_report},
    },
    ledger::sim::{LedgerScenario, SimConfig, SimCredentialProvider},
    utils::clock::unix_epoch_ms,
    workload::{WorkloadDescriptor, WorkloadOverrides},
};
use rama::{
    error::{BoxError, ErrorContext as _, ErrorExt as _},
    graceful::ShutdownGuard,
    telemetry::tracing,
};

#[derive(Debug, Clone, Args)]
/// run a workload: start every worker, reduce their results and report
pub struct RunCommand {
    /// workload descriptor (json)
    workload: PathBuf,

    #[clap(flatten)]
    overrides: WorkloadOverrides,

    #[clap(flatten)]
    sim: Option<SimConfig>,

    #[arg(long)]
    /// Simulated ledger scenario,
    /// manually defined parameters overwrite scenario parameters.
    scenario: Option<LedgerScenario>,

    /// how workers are isolated from each other
    #[arg(long, value_enum, default_value_t = Isolation::Task)]
    isolation: Isolation,

    /// give up on workers that did not report within this time
    #[arg(long, value_parser = humantime::parse_duration, default_value = "10m")]
    ceiling: Duration,

    /// lead time before the shared test start, unless the workload pins one
    #[arg(long, value_parser = humantime::parse_duration, default_value = "0s")]
    start_delay: Duration,

    /// human readable report, appended to
    #[arg(long, default_value = "pteReport.txt")]
    report: PathBuf,

    /// also write the structured (json) report to this file
    #[arg(long)]
    json: Option<PathBuf>,

    /// exit with an error when the verdict is FAIL
    #[arg(long, default_value_t = false)]
    ci_gate: bool,

    /// run identifier used in transaction keys (default: start time in ms)
    #[arg(long)]
    run_id: Option<String>,
}

pub async fn exec(guard: ShutdownGuard, args: RunCommand) -> Result<(), BoxError> {
    let mut descriptor = WorkloadDescriptor::load(&args.workload).await?;
    descriptor.apply_overrides(&args.overrides);
    descriptor
        .validate()
        .context("validate workload descriptor with overrides")?;

    let mut sim_cfg = super::merge_sim_cfg(args.scenario, args.sim);
    sim_cfg
        .request_timeout_ms
        .get_or_insert(descriptor.timeouts.request_ms);

    let run_id = args
        .run_id
        .unwrap_or_else(|| unix_epoch_ms().to_string());

    tracing::info!(
        %run_id,
        workload = ?args.workload,
        kind = %descriptor.invoke,
        mode = descriptor.mode.name(),
        orgs = descriptor.orgs.len(),
        processes_per_org = descriptor.processes_per_org,
        isolation = ?args.isolation,
        "run config ready"
    );

    let coordinator =
        Coordinator::new(descriptor, run_id, args.ceiling).with_start_delay(args.start_delay);

    let aggregate = match args.isolation {
        Isolation::Task => {
            let provider =
                SimCredentialProvider::try_new(&sim_cfg).context("create simulated ledger")?;
            coordinator.run_tasks(Arc::new(provider), guard).await?
        }
        Isolation::Process => {
            let files = WorkerFiles::write(&std::env::temp_dir(), &coordinator, &sim_cfg).await?;
            let result = match files.launcher() {
                Ok(launcher) => coordinator.run_processes(&launcher, guard).await,
                Err(err) => Err(err),
            };
            files.remove().await;
            result?
        }
    };

    write_reports(&args.report, args.json.as_deref(), &aggregate).await?;

    let verdict = aggregate.verdict();
    tracing::info!(%verdict, report = ?args.report, "run completed");
    if args.ci_gate && !verdict.is_pass() {
        return Err(BoxError::from("run verdict is FAIL").context_field("run_id", aggregate.run_id));
    }
    Ok(())
}

async fn write_reports(
    report: &Path,
    json: Option<&Path>,
    aggregate: &AggregateReport,
) -> Result<(), BoxError> {
    let human = HumanReporter::new();
    append_report(report, &human, aggregate).await?;
    if let Some(path) = json {
        write_report(path, &JsonReporter::new(true), aggregate).await?;
    }
    super::write_stdout(&human.render(aggregate)).await
}

/// Effective workload and simulated ledger config, written for workers
/// started as child processes to read.
#[derive(Debug)]
struct WorkerFiles {
    workload: PathBuf,
    sim: PathBuf,
}

impl WorkerFiles {
    async fn write(
        dir: &Path,
        coordinator: &Coordinator,
        sim_cfg: &SimConfig,
    ) -> Result<Self, BoxError> {
        let files = Self {
            workload: dir.join(format!("pte-{}-workload.json", coordinator.run_id())),
            sim: dir.join(format!("pte-{}-sim.json", coordinator.run_id())),
        };

        let workload = serde_json::to_vec_pretty(coordinator.descriptor())
            .context("serialize effective workload descriptor")?;
        tokio::fs::write(&files.workload, workload)
            .await
            .context("write effective workload descriptor")
            .with_context_debug_field("path", || files.workload.clone())?;

        let sim = serde_json::to_vec_pretty(sim_cfg).context("serialize simulated ledger config")?;
        let written = tokio::fs::write(&files.sim, sim)
            .await
            .context("write simulated ledger config")
            .with_context_debug_field("path", || files.sim.clone());
        if written.is_err() {
            files.remove().await;
        }
        written?;

        Ok(files)
    }

    fn launcher(&self) -> Result<ProcessLauncher, BoxError> {
        let program = std::env::current_exe().context("locate pte executable")?;
        Ok(ProcessLauncher::new(
            program,
            [
                OsString::from("worker"),
                OsString::from("--sim-config"),
                self.sim.clone().into_os_string(),
                self.workload.clone().into_os_string(),
            ],
        ))
    }

    /// Best effort: a leftover file is logged, never an error.
    async fn remove(&self) {
        for path in [&self.workload, &self.sim] {
            match tokio::fs::remove_file(path).await {
                Ok(()) => tracing::trace!(?path, "removed worker file"),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => (),
                Err(err) => tracing::warn!(?path, "failed to remove worker file: {err}"),
            }
        }
    }
}
