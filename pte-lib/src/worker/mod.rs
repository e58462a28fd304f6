//! Worker bootstrap: one authenticated session, one execution loop.

use std::time::Duration;

use rama::{
    error::{BoxError, ErrorContext as _},
    graceful::ShutdownGuard,
    telemetry::tracing::{self, Instrument as _},
};
use serde::{Deserialize, Serialize};
use tokio::time::{Instant, sleep_until};

use crate::{
    exec::{ExecConfig, ExecReport, ExecutionLoop},
    ledger::{CredentialProvider, LedgerClient as _},
    stats::WorkerStats,
    tx::{KeyScope, TxSpecResolver},
    utils::{
        clock::{FAR_FUTURE, WallClock},
        env::process_tag,
    },
    workload::{InvokeKind, TransactionMode, WorkloadDescriptor},
};

mod summary;
pub use summary::{SummaryMarker, SummaryParseError, WorkerSummary, throughput};


/// Identifies one worker within a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerContext {
    pub org: String,
    pub slot: usize,
    pub run_id: String,
    /// Shared test-start timestamp (unix epoch ms), overrides the
    /// descriptor's `start_at_ms`.
    pub test_start_ms: Option<u64>,
}

impl WorkerContext {
    /// Identity used to authenticate this worker's session.
    pub fn identity(&self) -> String {
        format!("pte-{}-{}", self.org, self.slot)
    }
}

/// What a worker hands back to the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerReport {
    pub run: WorkerSummary,
    pub validation: Option<WorkerSummary>,
}

impl WorkerReport {
    /// Summary lines as written to a worker's stdout.
    pub fn to_lines(&self) -> Vec<String> {
        let mut lines = vec![self.run.to_line(SummaryMarker::Completed)];
        if let Some(validation) = &self.validation {
            lines.push(validation.to_line(SummaryMarker::Validated));
        }
        lines
    }

    /// Rebuild a report from a worker's stdout.
    pub fn from_output(output: &str) -> Result<Self, SummaryParseError> {
        let run = WorkerSummary::find_in_output(output, SummaryMarker::Completed)?;
        let validation = match WorkerSummary::find_in_output(output, SummaryMarker::Validated) {
            Ok(summary) => Some(summary),
            Err(SummaryParseError::MissingMarker(_)) => None,
            Err(err) => return Err(err),
        };
        Ok(Self { run, validation })
    }
}

/// Run one worker to completion.
///
/// Errors are setup errors only (credentials, subscription, configuration);
/// per-attempt failures are part of the returned stats.
pub async fn run_worker<P: CredentialProvider>(
    provider: &P,
    descriptor: &WorkloadDescriptor,
    ctx: &WorkerContext,
    guard: ShutdownGuard,
) -> Result<WorkerReport, BoxError> {
    let span = tracing::info_span!(
        "worker",
        org = %ctx.org,
        slot = ctx.slot,
        run_id = %ctx.run_id,
    );
    run_worker_inner(provider, descriptor, ctx, guard)
        .instrument(span)
        .await
}

async fn run_worker_inner<P: CredentialProvider>(
    provider: &P,
    descriptor: &WorkloadDescriptor,
    ctx: &WorkerContext,
    guard: ShutdownGuard,
) -> Result<WorkerReport, BoxError> {
    let cfg = ExecConfig::from_descriptor(descriptor, &ctx.org)
        .context("derive worker execution config")?;

    let mut kinds = vec![descriptor.invoke];
    if matches!(descriptor.mode, TransactionMode::Mix { .. }) || descriptor.invoke_check.is_some()
    {
        kinds.push(InvokeKind::Query);
    }
    let scope = KeyScope {
        channel: descriptor.channel.clone(),
        org: ctx.org.clone(),
        run_id: ctx.run_id.clone(),
        worker: format!("{}.{}", process_tag(), ctx.slot),
    };
    let resolver = TxSpecResolver::try_new(descriptor.transaction.clone(), &scope, &kinds)
        .context("create transaction spec resolver")?;

    let client = provider
        .authenticate(&ctx.org, &ctx.identity())
        .await
        .context("authenticate worker identity")
        .with_context_debug_field("org", || ctx.org.clone())?;

    let events = if cfg.tracks_events() {
        Some(
            client
                .subscribe(cfg.listener)
                .context("subscribe to commit events")?,
        )
    } else {
        None
    };

    tracing::debug!(
        kind = %descriptor.invoke,
        mode = descriptor.mode.name(),
        key_scope = %scope,
        subscribed = events.is_some(),
        "worker ready"
    );

    let clock = WallClock::now();
    if !wait_for_start(descriptor, ctx, &clock, &guard).await {
        tracing::info!("worker cancelled before start");
        let now_ms = clock.epoch_ms(Instant::now());
        return Ok(WorkerReport {
            run: WorkerSummary {
                kind: descriptor.invoke,
                mode: descriptor.mode.name().to_owned(),
                org: ctx.org.clone(),
                slot: ctx.slot,
                chaincode_id: descriptor.chaincode_id.clone(),
                stats: WorkerStats::default(),
                start_ms: now_ms,
                end_ms: now_ms,
                cancelled: true,
            },
            validation: None,
        });
    }

    let report = ExecutionLoop::new(&client, &resolver, cfg)
        .with_clock(clock)
        .run(events, guard.clone_weak().into_cancelled())
        .await
        .context("run execution loop")?;
    let run = summarize(&report, descriptor, ctx);
    tracing::info!(
        sent = run.stats.sent,
        received = run.stats.received,
        failed = run.stats.failed,
        unreceived = run.stats.unreceived,
        invalid = run.stats.invalid,
        throughput = run.throughput(),
        "worker run completed"
    );

    let validation = match &descriptor.invoke_check {
        Some(check) if descriptor.invoke == InvokeKind::Move && !report.cancelled => {
            match ExecConfig::for_validation(descriptor, check, report.attempts)
                .context("derive validation execution config")?
            {
                Some(cfg) => {
                    let report = ExecutionLoop::new(&client, &resolver, cfg)
                        .with_clock(clock)
                        .run(None, guard.clone_weak().into_cancelled())
                        .await
                        .context("run validation loop")?;
                    let validation = summarize(&report, descriptor, ctx);
                    tracing::info!(
                        sent = validation.stats.sent,
                        received = validation.stats.received,
                        failed = validation.stats.failed,
                        "worker validation completed"
                    );
                    Some(validation)
                }
                None => None,
            }
        }
        _ => None,
    };

    Ok(WorkerReport { run, validation })
}

/// Wait until `max(test_start, now + min_sync)`; `false` when cancelled first.
async fn wait_for_start(
    descriptor: &WorkloadDescriptor,
    ctx: &WorkerContext,
    clock: &WallClock,
    guard: &ShutdownGuard,
) -> bool {
    let now = Instant::now();
    let mut start = now + Duration::from_millis(descriptor.min_sync_ms).min(FAR_FUTURE);
    if let Some(test_start_ms) = ctx.test_start_ms.or(descriptor.start_at_ms) {
        start = start.max(clock.instant_at(test_start_ms));
    }
    if start <= now {
        return true;
    }

    tracing::debug!(wait = ?start - now, "waiting for synchronized start");
    tokio::select! {
        _ = guard.cancelled() => false,
        _ = sleep_until(start) => true,
    }
}

fn summarize(report: &ExecReport, descriptor: &WorkloadDescriptor, ctx: &WorkerContext) -> WorkerSummary {
    WorkerSummary {
        kind: report.kind,
        mode: report.mode.to_owned(),
        org: ctx.org.clone(),
        slot: ctx.slot,
        chaincode_id: descriptor.chaincode_id.clone(),
        stats: report.stats,
        start_ms: report.start_ms,
        end_ms: report.end_ms,
        cancelled: report.cancelled,
    }
}
