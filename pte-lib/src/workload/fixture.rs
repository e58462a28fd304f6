//! Small ready-to-use descriptors for tests.

use super::*;

/// Two orgs with two peers each, one MOVE worker per org, 10 attempts.
pub fn descriptor(invoke: InvokeKind) -> WorkloadDescriptor {
    WorkloadDescriptor {
        channel: "testorgschannel1".to_owned(),
        orgs: vec!["org1".to_owned(), "org2".to_owned()],
        processes_per_org: 1,
        chaincode_id: "sample_cc".to_owned(),
        invoke,
        mode: TransactionMode::default(),
        n_request: 10,
        run_duration_secs: 0,
        start_at_ms: None,
        min_sync_ms: 0,
        event: EventOptions {
            listener: EventListenerMode::Transaction,
            timeout_ms: 500,
        },
        target_peers: TargetPeers::OrgAnchor,
        peer_failover: false,
        orderer_failover: false,
        failover: FailoverOptions::default(),
        invoke_check: None,
        transaction: TransactionTemplate {
            move_fn: FunctionTemplate {
                fcn: "invoke".to_owned(),
                args: vec!["put".to_owned(), "a".to_owned(), "payload".to_owned()],
            },
            query: FunctionTemplate {
                fcn: "invoke".to_owned(),
                args: vec!["get".to_owned(), "a".to_owned()],
            },
            key_idx: vec![1],
            payload_idx: vec![2],
            key_start: 0,
            payload: PayloadRange { min: 8, max: 8 },
            transient: None,
        },
        topology: NetworkTopology {
            orgs: ["org1", "org2"]
                .into_iter()
                .map(|org| OrgTopology {
                    name: org.to_owned(),
                    peers: vec![format!("peer0.{org}"), format!("peer1.{org}")],
                    orderer: None,
                })
                .collect(),
            orderers: vec!["orderer0".to_owned(), "orderer1".to_owned()],
        },
        timeouts: RequestTimeouts::default(),
    }
}
