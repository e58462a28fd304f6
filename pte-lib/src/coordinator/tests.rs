use rama::graceful::Shutdown;
use tokio::time;

use super::*;
use crate::{
    ledger::mock::{MockCredentials, MockLedger},
    stats::WorkerStats,
    worker::{SummaryMarker, WorkerSummary},
    workload::{InvokeKind, TargetPeers, TransactionMode, fixture},
};

fn ms(v: u64) -> Duration {
    Duration::from_millis(v)
}

fn credentials() -> Arc<MockCredentials> {
    Arc::new(MockCredentials::new(|_, _| Ok(MockLedger::builder().build())))
}

fn report_error(err: &BoxError) -> &ReportError {
    err.downcast_ref::<ReportError>()
        .unwrap_or_else(|| panic!("unexpected error: {err}"))
}

#[test]
fn test_worker_contexts_share_test_start() {
    let mut descriptor = fixture::descriptor(InvokeKind::Move);
    descriptor.processes_per_org = 3;
    descriptor.start_at_ms = Some(1_700_000_000_000);

    let contexts = Coordinator::new(descriptor, "r1", Duration::from_secs(60)).worker_contexts();

    let slots: Vec<(&str, usize)> = contexts
        .iter()
        .map(|ctx| (ctx.org.as_str(), ctx.slot))
        .collect();
    assert_eq!(
        slots,
        [
            ("org1", 0),
            ("org1", 1),
            ("org1", 2),
            ("org2", 0),
            ("org2", 1),
            ("org2", 2)
        ]
    );
    assert!(contexts.iter().all(|ctx| ctx.run_id == "r1"));
    assert!(
        contexts
            .iter()
            .all(|ctx| ctx.test_start_ms == Some(1_700_000_000_000))
    );
}

#[tokio::test(flavor = "current_thread")]
async fn test_task_run_reduces_every_worker() {
    time::pause();

    let mut descriptor = fixture::descriptor(InvokeKind::Move);
    descriptor.processes_per_org = 2;
    descriptor.n_request = 5;
    let credentials = credentials();
    let shutdown = Shutdown::new(std::future::pending::<()>());

    let aggregate = Coordinator::new(descriptor, "r1", Duration::from_secs(60))
        .run_tasks(credentials.clone(), shutdown.guard())
        .await
        .unwrap();

    assert_eq!(aggregate.run.workers, 4);
    assert_eq!(aggregate.run.stats.sent, 20);
    assert_eq!(aggregate.run.stats.received, 20);
    assert!(!aggregate.cancelled);
    assert_eq!(aggregate.verdict(), Verdict::Pass);

    let mut identities: Vec<String> = credentials
        .sessions()
        .into_iter()
        .map(|(_, identity, _)| identity)
        .collect();
    identities.sort();
    assert_eq!(
        identities,
        ["pte-org1-0", "pte-org1-1", "pte-org2-0", "pte-org2-1"]
    );
}

#[tokio::test(flavor = "current_thread")]
async fn test_task_run_query_fanout() {
    time::pause();

    let mut descriptor = fixture::descriptor(InvokeKind::Query);
    descriptor.processes_per_org = 2;
    descriptor.target_peers = TargetPeers::AllPeers;
    let shutdown = Shutdown::new(std::future::pending::<()>());

    let aggregate = Coordinator::new(descriptor, "r1", Duration::from_secs(60))
        .run_tasks(credentials(), shutdown.guard())
        .await
        .unwrap();

    assert_eq!(aggregate.fanout, 4);
    assert_eq!(aggregate.run.stats.sent, 40);
    assert_eq!(aggregate.run.stats.received, 160);
    assert_eq!(aggregate.verdict(), Verdict::Pass);
}

#[tokio::test(flavor = "current_thread")]
async fn test_task_run_cancelled_workers_still_report() {
    time::pause();

    let mut descriptor = fixture::descriptor(InvokeKind::Move);
    descriptor.n_request = 0;
    descriptor.mode = TransactionMode::Constant {
        freq_ms: 100,
        jitter_ms: 0,
    };
    let shutdown = Shutdown::new(time::sleep(ms(250)));

    let aggregate = Coordinator::new(descriptor, "r1", Duration::from_secs(60))
        .run_tasks(credentials(), shutdown.guard())
        .await
        .unwrap();

    assert!(aggregate.cancelled);
    assert_eq!(aggregate.run.workers, 2);
    assert_eq!(aggregate.run.stats.sent, 6);
    assert!(aggregate.run.stats.is_balanced());
}

#[tokio::test(flavor = "current_thread")]
async fn test_hung_worker_fails_the_run() {
    time::pause();

    let descriptor = fixture::descriptor(InvokeKind::Move);
    let credentials = Arc::new(MockCredentials::new(|org, _| {
        let builder = MockLedger::builder();
        Ok(match org {
            "org2" => builder.call_latency(Duration::from_secs(3600)).build(),
            _ => builder.build(),
        })
    }));
    let shutdown = Shutdown::new(std::future::pending::<()>());

    let err = Coordinator::new(descriptor, "r1", Duration::from_secs(10))
        .run_tasks(credentials, shutdown.guard())
        .await
        .unwrap_err();

    match report_error(&err) {
        ReportError::WorkerHung { org, slot, ceiling } => {
            assert_eq!(org, "org2");
            assert_eq!(*slot, 0);
            assert_eq!(*ceiling, Duration::from_secs(10));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test(flavor = "current_thread")]
async fn test_worker_setup_failure_fails_the_run() {
    time::pause();

    let descriptor = fixture::descriptor(InvokeKind::Move);
    let credentials = Arc::new(MockCredentials::new(|org, _| match org {
        "org1" => Ok(MockLedger::builder().build()),
        _ => Err(BoxError::from("certificate expired")),
    }));
    let shutdown = Shutdown::new(std::future::pending::<()>());

    let err = Coordinator::new(descriptor, "r1", Duration::from_secs(60))
        .run_tasks(credentials, shutdown.guard())
        .await
        .unwrap_err();

    assert!(matches!(
        report_error(&err),
        ReportError::WorkerFailed { org, .. } if org == "org2"
    ));
}

#[cfg(unix)]
mod process {
    use super::*;
    use crate::worker::SummaryParseError;

    fn summary_line(org: &str) -> String {
        WorkerSummary {
            kind: InvokeKind::Move,
            mode: "CONSTANT".to_owned(),
            org: org.to_owned(),
            slot: 0,
            chaincode_id: "sample_cc".to_owned(),
            stats: WorkerStats {
                sent: 10,
                received: 10,
                ..Default::default()
            },
            start_ms: 1_000,
            end_ms: 2_000,
            cancelled: false,
        }
        .to_line(SummaryMarker::Completed)
    }

    fn launcher(script: &str) -> ProcessLauncher {
        ProcessLauncher::new("sh", ["-c", script, "pte-worker"])
    }

    fn coordinator() -> Coordinator {
        Coordinator::new(
            fixture::descriptor(InvokeKind::Move),
            "r1",
            Duration::from_secs(30),
        )
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_process_run_parses_stdout() {
        let script = format!("echo 'worker starting'; echo '{}'", summary_line("org1"));
        let shutdown = Shutdown::new(std::future::pending::<()>());

        let aggregate = coordinator()
            .run_processes(&launcher(&script), shutdown.guard())
            .await
            .unwrap();

        assert_eq!(aggregate.run.workers, 2);
        assert_eq!(aggregate.run.stats.sent, 20);
        assert_eq!(aggregate.run.stats.received, 20);
        assert_eq!(aggregate.run.start_ms, 1_000);
        assert_eq!(aggregate.run.end_ms, 2_000);
        assert_eq!(aggregate.verdict(), Verdict::Pass);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_process_without_summary_is_a_report_error() {
        let shutdown = Shutdown::new(std::future::pending::<()>());

        let err = coordinator()
            .run_processes(&launcher("echo 'sent=10 Rcvd=10'"), shutdown.guard())
            .await
            .unwrap_err();

        assert!(matches!(
            report_error(&err),
            ReportError::NoSummary {
                source: SummaryParseError::MissingMarker(SummaryMarker::Completed),
                ..
            }
        ));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_process_exit_failure_is_a_report_error() {
        let shutdown = Shutdown::new(std::future::pending::<()>());

        let err = coordinator()
            .run_processes(&launcher("exit 3"), shutdown.guard())
            .await
            .unwrap_err();

        assert!(matches!(
            report_error(&err),
            ReportError::WorkerFailed { .. }
        ));
    }
}
