//! Probe runner integration tests against the in-process mock service.

use std::time::Duration;

use steprig_common::{Expectation, ProbeCategory, ProbeSpec, ProbeStatus};
use steprig_probes::fixtures::EMPTY_MD5;
use steprig_probes::testing::{MockConfig, MockStepServer, RepeatPolicy};
use steprig_probes::{Endpoint, ProbeRunner};

fn endpoint_for(server: &MockStepServer) -> Endpoint {
    Endpoint {
        address: server.addr().ip().to_string(),
        port: server.addr().port(),
        username: "tester".into(),
    }
}

fn spec(id: &str, file_size: u64) -> ProbeSpec {
    ProbeSpec {
        id: id.into(),
        category: ProbeCategory::Functional,
        file_size,
        block_size: 20480,
        concurrency: 1,
        timeout: Duration::from_secs(60),
        impairment: None,
        expect: Expectation::Accept,
        repeat_upload: false,
        username: None,
    }
}

#[tokio::test]
async fn baseline_upload_passes_with_matching_hashes() {
    let server = MockStepServer::start(MockConfig::default()).await.unwrap();
    let runner = ProbeRunner::new(endpoint_for(&server));

    let result = runner.run(&spec("A1-baseline", 256 * 1024)).await;

    assert_eq!(result.status, ProbeStatus::Passed, "{:?}", result.failure_reason);
    assert_eq!(result.measurements.bytes_transferred, 256 * 1024);
    assert_eq!(
        result.measurements.local_md5,
        result.measurements.server_md5
    );
    let stored = server.stored("A1-baseline-0.bin").unwrap();
    assert_eq!(stored.len(), 256 * 1024);
}

#[tokio::test]
async fn zero_byte_upload_passes_with_the_empty_hash() {
    let server = MockStepServer::start(MockConfig::default()).await.unwrap();
    let runner = ProbeRunner::new(endpoint_for(&server));

    let result = runner.run(&spec("A2-empty", 0)).await;

    assert_eq!(result.status, ProbeStatus::Passed, "{:?}", result.failure_reason);
    assert_eq!(result.measurements.local_md5.as_deref(), Some(EMPTY_MD5));
    assert_eq!(result.measurements.server_md5.as_deref(), Some(EMPTY_MD5));
    assert_eq!(server.stored("A2-empty-0.bin").unwrap().len(), 0);
}

#[tokio::test]
async fn one_byte_past_a_block_boundary_passes() {
    let server = MockStepServer::start(MockConfig::default()).await.unwrap();
    let runner = ProbeRunner::new(endpoint_for(&server));

    // 20481 bytes against the mock's 20480 block size: one full block plus a
    // one-byte tail.
    let result = runner.run(&spec("A3-tail", 20481)).await;

    assert_eq!(result.status, ProbeStatus::Passed, "{:?}", result.failure_reason);
    assert_eq!(server.stored("A3-tail-0.bin").unwrap().len(), 20481);
}

#[tokio::test]
async fn auth_rejection_passes_when_it_is_expected() {
    let config = MockConfig {
        deny_users: vec!["ghost".into()],
        ..MockConfig::default()
    };
    let server = MockStepServer::start(config).await.unwrap();
    let runner = ProbeRunner::new(endpoint_for(&server));

    let mut s = spec("A5-auth", 1024);
    s.expect = Expectation::RejectAuth;
    s.username = Some("ghost".into());

    let result = runner.run(&s).await;
    assert_eq!(result.status, ProbeStatus::Passed, "{:?}", result.failure_reason);
}

#[tokio::test]
async fn unexpected_acceptance_fails_an_auth_probe() {
    let server = MockStepServer::start(MockConfig::default()).await.unwrap();
    let runner = ProbeRunner::new(endpoint_for(&server));

    // The mock accepts this user, so the expected rejection never happens.
    let mut s = spec("A5-auth", 1024);
    s.expect = Expectation::RejectAuth;

    let result = runner.run(&s).await;
    assert_eq!(result.status, ProbeStatus::Failed);
    assert!(result.failure_reason.unwrap().contains("accepted"));
}

#[tokio::test]
async fn tampered_block_is_detected_through_the_hash() {
    let server = MockStepServer::start(MockConfig::default()).await.unwrap();
    let runner = ProbeRunner::new(endpoint_for(&server));

    let mut s = spec("A6-corrupt", 64 * 1024);
    s.expect = Expectation::DetectCorruption;

    let result = runner.run(&s).await;
    assert_eq!(result.status, ProbeStatus::Passed, "{:?}", result.failure_reason);
    assert_ne!(
        result.measurements.local_md5,
        result.measurements.server_md5
    );
}

#[tokio::test]
async fn repeat_upload_records_the_overwrite_policy() {
    let server = MockStepServer::start(MockConfig::default()).await.unwrap();
    let runner = ProbeRunner::new(endpoint_for(&server));

    let mut s = spec("A4-repeat", 4096);
    s.repeat_upload = true;

    let result = runner.run(&s).await;
    assert_eq!(result.status, ProbeStatus::Passed, "{:?}", result.failure_reason);
    assert!(result.measurements.notes.unwrap().contains("overwrite"));
}

#[tokio::test]
async fn repeat_upload_records_the_reject_policy() {
    let config = MockConfig {
        repeat_policy: RepeatPolicy::Reject,
        ..MockConfig::default()
    };
    let server = MockStepServer::start(config).await.unwrap();
    let runner = ProbeRunner::new(endpoint_for(&server));

    let mut s = spec("A4-repeat", 4096);
    s.repeat_upload = true;

    let result = runner.run(&s).await;
    assert_eq!(result.status, ProbeStatus::Passed, "{:?}", result.failure_reason);
    assert!(result.measurements.notes.unwrap().contains("reject"));
}

#[tokio::test]
async fn connection_refusal_is_a_failure_not_a_crash() {
    // Bind then drop to get a port that refuses connections.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let runner = ProbeRunner::new(Endpoint {
        address: addr.ip().to_string(),
        port: addr.port(),
        username: "tester".into(),
    });

    let result = runner.run(&spec("A1-baseline", 1024)).await;
    assert_eq!(result.status, ProbeStatus::Failed);
    assert!(result.failure_reason.is_some());
}

#[tokio::test]
async fn concurrent_sessions_all_succeed() {
    let server = MockStepServer::start(MockConfig::default()).await.unwrap();
    let runner = ProbeRunner::new(endpoint_for(&server));

    let mut s = spec("C3-parallel", 32 * 1024);
    s.category = ProbeCategory::Performance;
    s.concurrency = 4;

    let result = runner.run(&s).await;
    assert_eq!(result.status, ProbeStatus::Passed, "{:?}", result.failure_reason);
    assert_eq!(result.measurements.success_rate, 1.0);
    assert_eq!(result.measurements.bytes_transferred, 4 * 32 * 1024);
    for idx in 0..4 {
        assert!(server.stored(&format!("C3-parallel-{idx}.bin")).is_some());
    }
}

#[tokio::test]
async fn invalid_probe_definition_is_an_error() {
    let server = MockStepServer::start(MockConfig::default()).await.unwrap();
    let runner = ProbeRunner::new(endpoint_for(&server));

    let mut s = spec("bad", 1024);
    s.concurrency = 0;

    let result = runner.run(&s).await;
    assert_eq!(result.status, ProbeStatus::Error);
}
