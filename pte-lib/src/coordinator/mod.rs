//! Run supervision: spawn every worker, collect their reports, reduce.
//!
//! Workers run either as tasks of this process, each with its own ledger
//! session, or as `pte worker` child processes whose stdout carries the
//! tagged summary lines. Either way the coordinator only reduces once every
//! worker has reported, and a worker that does not report before the run
//! ceiling fails the run instead of contributing zero.

use std::{collections::BTreeMap, ffi::OsString, path::PathBuf, process::Stdio, sync::Arc, time::Duration};

use rama::{
    error::{BoxError, ErrorContext as _},
    graceful::ShutdownGuard,
    telemetry::tracing,
};
use tokio::{
    process::Command,
    sync::mpsc,
    time::{Instant, sleep_until},
};

use crate::{
    ledger::CredentialProvider,
    utils::clock::unix_epoch_ms,
    worker::{WorkerContext, WorkerReport, run_worker},
    workload::WorkloadDescriptor,
};

mod aggregate;
pub use aggregate::{AggregateReport, PhaseAggregate, Verdict};

mod error;
pub use error::ReportError;

pub mod report;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum Isolation {
    /// Workers are tasks of the coordinator process.
    #[default]
    Task,
    /// Workers are `pte worker` child processes.
    Process,
}

/// Launches `pte worker` child processes.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<OsString>,
}

impl ProcessLauncher {
    /// `args` select the worker subcommand and everything shared by all
    /// workers; the per-worker flags are appended.
    pub fn new(program: impl Into<PathBuf>, args: impl IntoIterator<Item = impl Into<OsString>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    fn command(&self, ctx: &WorkerContext) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg("--org")
            .arg(&ctx.org)
            .arg("--slot")
            .arg(ctx.slot.to_string())
            .arg("--run-id")
            .arg(&ctx.run_id);
        if let Some(test_start_ms) = ctx.test_start_ms {
            cmd.arg("--test-start-ms").arg(test_start_ms.to_string());
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        cmd
    }
}

/// Supervises one run.
#[derive(Debug, Clone)]
pub struct Coordinator {
    descriptor: Arc<WorkloadDescriptor>,
    run_id: String,
    ceiling: Duration,
    start_delay: Duration,
}

impl Coordinator {
    pub fn new(descriptor: WorkloadDescriptor, run_id: impl Into<String>, ceiling: Duration) -> Self {
        Self {
            descriptor: Arc::new(descriptor),
            run_id: run_id.into(),
            ceiling,
            start_delay: Duration::ZERO,
        }
    }

    /// Lead time between spawning the workers and the shared test start,
    /// unless the descriptor pins `start_at_ms`.
    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    pub fn descriptor(&self) -> &WorkloadDescriptor {
        &self.descriptor
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// One context per `(org, slot)`, all sharing one test start.
    pub fn worker_contexts(&self) -> Vec<WorkerContext> {
        let test_start_ms = self
            .descriptor
            .start_at_ms
            .unwrap_or_else(|| unix_epoch_ms() + self.start_delay.as_millis() as u64);
        self.descriptor
            .orgs
            .iter()
            .flat_map(|org| {
                (0..self.descriptor.processes_per_org).map(move |slot| WorkerContext {
                    org: org.clone(),
                    slot,
                    run_id: self.run_id.clone(),
                    test_start_ms: Some(test_start_ms),
                })
            })
            .collect()
    }

    /// Run every worker as a task with its own session from `provider`.
    pub async fn run_tasks<P: CredentialProvider>(
        &self,
        provider: Arc<P>,
        guard: ShutdownGuard,
    ) -> Result<AggregateReport, BoxError> {
        let contexts = self.worker_contexts();
        let (result_tx, result_rx) = mpsc::channel(contexts.len().max(1));

        tracing::info!(
            run_id = %self.run_id,
            workers = contexts.len(),
            "spawning worker tasks"
        );
        for ctx in contexts.iter().cloned() {
            let provider = provider.clone();
            let descriptor = self.descriptor.clone();
            let result_tx = result_tx.clone();
            guard.spawn_task_fn(async move |guard| {
                let result = run_worker(provider.as_ref(), &descriptor, &ctx, guard)
                    .await
                    .map_err(|err| ReportError::WorkerFailed {
                        org: ctx.org.clone(),
                        slot: ctx.slot,
                        reason: err.to_string(),
                    });
                if let Err(err) = result_tx.send((ctx, result)).await {
                    tracing::debug!("failed to send worker result msg: {err}");
                }
            });
        }
        drop(result_tx);

        self.collect(&contexts, result_rx).await
    }

    /// Run every worker as a child process started by `launcher`.
    ///
    /// On cancellation the children are killed, not drained.
    pub async fn run_processes(
        &self,
        launcher: &ProcessLauncher,
        guard: ShutdownGuard,
    ) -> Result<AggregateReport, BoxError> {
        let contexts = self.worker_contexts();
        let (result_tx, result_rx) = mpsc::channel(contexts.len().max(1));

        tracing::info!(
            run_id = %self.run_id,
            workers = contexts.len(),
            program = ?launcher.program,
            "spawning worker processes"
        );
        for ctx in contexts.iter().cloned() {
            let child = launcher
                .command(&ctx)
                .spawn()
                .context("spawn worker process")
                .with_context_debug_field("program", || launcher.program.clone())?;
            let result_tx = result_tx.clone();
            guard.spawn_task_fn(async move |guard| {
                let output = tokio::select! {
                    _ = guard.cancelled() => {
                        tracing::info!(org = %ctx.org, slot = ctx.slot, "kill worker process: guard shutdown");
                        return;
                    }
                    output = child.wait_with_output() => output,
                };
                let result = match output {
                    Ok(output) if output.status.success() => {
                        WorkerReport::from_output(&String::from_utf8_lossy(&output.stdout)).map_err(
                            |source| ReportError::NoSummary {
                                org: ctx.org.clone(),
                                slot: ctx.slot,
                                source,
                            },
                        )
                    }
                    Ok(output) => Err(ReportError::WorkerFailed {
                        org: ctx.org.clone(),
                        slot: ctx.slot,
                        reason: format!("exited with {}", output.status),
                    }),
                    Err(err) => Err(ReportError::WorkerFailed {
                        org: ctx.org.clone(),
                        slot: ctx.slot,
                        reason: err.to_string(),
                    }),
                };
                if let Err(err) = result_tx.send((ctx, result)).await {
                    tracing::debug!("failed to send worker result msg: {err}");
                }
            });
        }
        drop(result_tx);

        self.collect(&contexts, result_rx).await
    }

    /// Wait for a report of every worker, bounded by the run ceiling.
    async fn collect(
        &self,
        contexts: &[WorkerContext],
        mut result_rx: mpsc::Receiver<(WorkerContext, Result<WorkerReport, ReportError>)>,
    ) -> Result<AggregateReport, BoxError> {
        let deadline = Instant::now() + self.ceiling;
        let mut reports = BTreeMap::new();

        loop {
            tokio::select! {
                biased;

                maybe_result = result_rx.recv() => {
                    let Some((ctx, result)) = maybe_result else {
                        break;
                    };
                    let report = result?;
                    tracing::debug!(
                        org = %ctx.org,
                        slot = ctx.slot,
                        sent = report.run.stats.sent,
                        received = report.run.stats.received,
                        "worker reported"
                    );
                    reports.insert((ctx.org, ctx.slot), report);
                    if reports.len() == contexts.len() {
                        break;
                    }
                }
                _ = sleep_until(deadline) => {
                    let hung = contexts
                        .iter()
                        .find(|ctx| !reports.contains_key(&(ctx.org.clone(), ctx.slot)));
                    if let Some(ctx) = hung {
                        return Err(ReportError::WorkerHung {
                            org: ctx.org.clone(),
                            slot: ctx.slot,
                            ceiling: self.ceiling,
                        }
                        .into());
                    }
                    break;
                }
            }
        }

        let mut ordered = Vec::with_capacity(contexts.len());
        for ctx in contexts {
            let report = reports
                .remove(&(ctx.org.clone(), ctx.slot))
                .ok_or_else(|| ReportError::WorkerMissing {
                    org: ctx.org.clone(),
                    slot: ctx.slot,
                })?;
            ordered.push(report);
        }

        let aggregate = AggregateReport::reduce(&self.run_id, &self.descriptor, &ordered);
        tracing::info!(
            run_id = %self.run_id,
            sent = aggregate.run.stats.sent,
            received = aggregate.run.stats.received,
            verdict = %aggregate.verdict(),
            "run reduced"
        );
        Ok(aggregate)
    }
}

#[cfg(test)]
mod tests;
