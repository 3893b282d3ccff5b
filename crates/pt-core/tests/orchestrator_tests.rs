//! Integration tests for the orchestration engine.
//!
//! Drives [`PolicyTester`] against the scripted fake cluster from
//! `pt-test-utils`: probe verdicts, readiness timing, idempotent
//! preparation, and cleanup scoping.

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]

use pt_core::cluster::{ContainerSpec, PodHandle};
use pt_core::errors::PtError;
use pt_core::loader::load_document;
use pt_core::model::ResolvedModel;
use pt_core::orchestrator::{Phase, PolicyTester, DEFAULT_LABEL_KEY, DEFAULT_LABEL_VALUE};
use pt_core::resolver::resolve;
use pt_test_utils::{FakeCluster, FakePodSpec};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Resolve a document that must be clean.
fn model(source: &str) -> ResolvedModel {
    let (model, errors) = resolve(&load_document(source).unwrap());
    assert!(errors.is_empty(), "unexpected errors: {errors:#?}");
    model
}

/// One client probing one server pod on TCP 80.
fn client_server_model() -> ResolvedModel {
    model(
        r"
pods:
  - name: client
    namespace: ns1
    podname: client-
  - name: server
    namespace: ns1
    podname: server-
targets:
  - name: web
    pods:
      - server
    ports:
      - port: 80
rules:
  - name: allow-web
    from: client
    allowed:
      - web
",
    )
}

/// A cluster matching [`client_server_model`].
fn client_server_cluster() -> FakeCluster {
    let cluster = FakeCluster::new();
    cluster.add_pod(FakePodSpec::new("client-abc", "ns1"));
    cluster.add_pod(FakePodSpec::new("server-xyz", "ns1").ip("10.96.4.7"));
    cluster
}

#[tokio::test]
async fn test_allowed_probe_passes_when_connection_succeeds() {
    let model = client_server_model();
    let cluster = client_server_cluster();
    cluster.script_exec("10.96.4.7 80", 0);

    let mut tester = PolicyTester::new(&model, cluster.clone(), ContainerSpec::default());
    let pods = tester.prepare().await.unwrap();
    assert_eq!(pods.len(), 1);
    let pending = tester
        .wait_until_ready(pods, Duration::from_secs(5))
        .await;
    assert!(pending.is_empty());
    assert_eq!(tester.phase(), Phase::Ready);

    let report = tester.test().await.unwrap();
    assert_eq!(report.tests(), 1);
    assert!(report.passed());
    let case = &report.suites()[0].cases[0];
    assert_eq!(case.name, "client-abc -> web 10.96.4.7:80/TCP allowed");

    // The probe ran from the client pod through the debug container.
    let execs = cluster.execs();
    assert_eq!(execs.len(), 1);
    assert_eq!(execs[0].pod, "client-abc");
    assert_eq!(execs[0].container, "policytester-debug");
    assert_eq!(execs[0].command.join(" "), "sh -c nc -z -w 5 10.96.4.7 80");
}

#[tokio::test]
async fn test_allowed_probe_fails_when_connection_is_refused() {
    let model = client_server_model();
    let cluster = client_server_cluster();
    // Default exit is 1: the connection never succeeds.

    let mut tester = PolicyTester::new(&model, cluster, ContainerSpec::default());
    let pods = tester.prepare().await.unwrap();
    tester.wait_until_ready(pods, Duration::from_secs(5)).await;
    let report = tester.test().await.unwrap();
    assert_eq!((report.tests(), report.failures()), (1, 1));
}

#[tokio::test]
async fn test_denied_probe_fails_when_connection_succeeds() {
    let model = model(
        r"
pods:
  - name: client
    namespace: ns1
    podname: client-
  - name: server
    namespace: ns1
    podname: server-
targets:
  - name: web
    pods:
      - server
    ports:
      - port: 80
rules:
  - name: deny-web
    from: client
    denied:
      - web
",
    );
    let cluster = client_server_cluster();
    cluster.script_exec("10.96.4.7 80", 0);

    let mut tester = PolicyTester::new(&model, cluster, ContainerSpec::default());
    let pods = tester.prepare().await.unwrap();
    tester.wait_until_ready(pods, Duration::from_secs(5)).await;
    let report = tester.test().await.unwrap();

    assert_eq!((report.tests(), report.failures()), (1, 1));
    let case = &report.suites()[0].cases[0];
    assert_eq!(case.name, "client-abc -> web 10.96.4.7:80/TCP denied");
    assert!(!case.ok);
}

#[tokio::test]
async fn test_probe_timeout_counts_as_connection_failure() {
    let model = client_server_model();
    let cluster = client_server_cluster();
    cluster.script_exec_timeout("10.96.4.7 80");

    let mut tester = PolicyTester::new(&model, cluster, ContainerSpec::default());
    let pods = tester.prepare().await.unwrap();
    tester.wait_until_ready(pods, Duration::from_secs(5)).await;
    let report = tester.test().await.unwrap();
    // allowed + timed out probe = failed case.
    assert_eq!((report.tests(), report.failures()), (1, 1));
}

#[tokio::test]
async fn test_prepare_labels_then_injects() {
    let model = client_server_model();
    let cluster = client_server_cluster();

    let mut tester = PolicyTester::new(&model, cluster.clone(), ContainerSpec::default());
    tester.prepare().await.unwrap();

    assert_eq!(cluster.injections(), vec!["client-abc"]);
    let labels = cluster.pod_labels("client-abc").unwrap();
    assert_eq!(
        labels.get(DEFAULT_LABEL_KEY).map(String::as_str),
        Some(DEFAULT_LABEL_VALUE)
    );
    // The target pod is never instrumented.
    assert!(cluster.pod_labels("server-xyz").unwrap().is_empty());
}

#[tokio::test]
async fn test_prepare_is_idempotent() {
    let model = client_server_model();
    let cluster = FakeCluster::new();
    cluster.add_pod(
        FakePodSpec::new("client-abc", "ns1").with_debug_container("policytester-debug", true),
    );
    cluster.add_pod(FakePodSpec::new("server-xyz", "ns1").ip("10.96.4.7"));

    let mut tester = PolicyTester::new(&model, cluster.clone(), ContainerSpec::default());
    let pods = tester.prepare().await.unwrap();
    assert_eq!(pods.len(), 1);
    assert!(cluster.injections().is_empty());
}

#[tokio::test]
async fn test_prepare_fails_without_an_eligible_pod() {
    let model = client_server_model();
    let cluster = FakeCluster::new();
    cluster.add_pod(FakePodSpec::new("server-xyz", "ns1").ip("10.96.4.7"));

    let mut tester = PolicyTester::new(&model, cluster, ContainerSpec::default());
    match tester.prepare().await {
        Err(PtError::NoEligiblePod(source)) => assert_eq!(source, "client"),
        Err(other) => panic!("expected NoEligiblePod, got {other:?}"),
        Ok(_) => panic!("prepare unexpectedly succeeded"),
    }
}

#[tokio::test]
async fn test_injection_failure_marks_probes_untested() {
    let model = client_server_model();
    let cluster = client_server_cluster();
    cluster.fail_injection("client-abc");
    cluster.script_exec("10.96.4.7 80", 0);

    let mut tester = PolicyTester::new(&model, cluster.clone(), ContainerSpec::default());
    let pods = tester.prepare().await.unwrap();
    assert!(pods.is_empty());

    let report = tester.test().await.unwrap();
    assert_eq!((report.tests(), report.failures()), (1, 1));
    let case = &report.suites()[0].cases[0];
    assert!(case.output.starts_with("UNTESTED:"), "{}", case.output);
    // No probe was ever attempted from the uninstrumented pod.
    assert!(cluster.execs().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_readiness_wait_times_out_exactly() {
    let model = client_server_model();
    let cluster = client_server_cluster();
    cluster.set_never_ready();

    let mut tester = PolicyTester::new(&model, cluster, ContainerSpec::default());
    let pods = tester.prepare().await.unwrap();

    let started = tokio::time::Instant::now();
    let pending = tester
        .wait_until_ready(pods, Duration::from_secs(3))
        .await;
    assert_eq!(pending.len(), 1);
    assert_eq!(tester.phase(), Phase::TimedOut);
    assert_eq!(started.elapsed(), Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn test_readiness_wait_succeeds_after_polls() {
    let model = client_server_model();
    let cluster = client_server_cluster();
    cluster.set_ready_after_polls(2);

    let mut tester = PolicyTester::new(&model, cluster, ContainerSpec::default());
    let pods = tester.prepare().await.unwrap();
    let pending = tester
        .wait_until_ready(pods, Duration::from_secs(10))
        .await;
    assert!(pending.is_empty());
    assert_eq!(tester.phase(), Phase::Ready);
}

#[tokio::test]
async fn test_readiness_wait_stops_on_cancellation() {
    let model = client_server_model();
    let cluster = client_server_cluster();
    cluster.set_never_ready();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let mut tester = PolicyTester::new(&model, cluster, ContainerSpec::default())
        .with_cancellation(cancel);
    let pods = tester.prepare().await.unwrap();
    let pending = tester
        .wait_until_ready(pods, Duration::from_secs(3600))
        .await;
    assert_eq!(pending.len(), 1);
}

#[tokio::test]
async fn test_cancelled_run_skips_probes() {
    let model = client_server_model();
    let cluster = client_server_cluster();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let mut tester = PolicyTester::new(&model, cluster.clone(), ContainerSpec::default())
        .with_cancellation(cancel);
    tester.prepare().await.unwrap();
    let report = tester.test().await.unwrap();
    assert_eq!(report.tests(), 0);
    assert!(cluster.execs().is_empty());
}

#[tokio::test]
async fn test_eligible_pod_prefers_an_instrumented_candidate() {
    let model = client_server_model();
    let cluster = FakeCluster::new();
    // Two candidates match the client- prefix; only one already runs
    // the debug container.
    cluster.add_pod(FakePodSpec::new("client-aaa", "ns1"));
    cluster.add_pod(
        FakePodSpec::new("client-bbb", "ns1").with_debug_container("policytester-debug", true),
    );
    cluster.add_pod(FakePodSpec::new("server-xyz", "ns1").ip("10.96.4.7"));
    cluster.script_exec("10.96.4.7 80", 0);

    let mut tester = PolicyTester::new(&model, cluster.clone(), ContainerSpec::default());
    let pods = tester.prepare().await.unwrap();
    tester.wait_until_ready(pods, Duration::from_secs(5)).await;
    tester.test().await.unwrap();

    assert!(cluster.injections().is_empty());
    assert_eq!(cluster.execs()[0].pod, "client-bbb");
}

#[tokio::test]
async fn test_eligible_pod_prefers_a_carrying_candidate_over_a_bare_one() {
    let model = client_server_model();
    let cluster = FakeCluster::new();
    // Neither candidate runs the container yet; the one already
    // carrying it must be chosen, without a second injection.
    cluster.add_pod(FakePodSpec::new("client-aaa", "ns1"));
    cluster.add_pod(
        FakePodSpec::new("client-bbb", "ns1").with_debug_container("policytester-debug", false),
    );
    cluster.add_pod(FakePodSpec::new("server-xyz", "ns1").ip("10.96.4.7"));
    cluster.script_exec("10.96.4.7 80", 0);

    let mut tester = PolicyTester::new(&model, cluster.clone(), ContainerSpec::default());
    let pods = tester.prepare().await.unwrap();
    assert!(cluster.injections().is_empty());
    assert_eq!(pods.len(), 1);
    assert_eq!(pods[0].name(), "client-bbb");

    tester.wait_until_ready(pods, Duration::from_secs(5)).await;
    tester.test().await.unwrap();
    assert_eq!(cluster.execs()[0].pod, "client-bbb");
}

#[tokio::test]
async fn test_namespace_scope_limits_pod_listing() {
    let model = client_server_model();
    let cluster = client_server_cluster();
    // An identically-prefixed pod in another namespace must be ignored.
    cluster.add_pod(FakePodSpec::new("client-other", "ns2"));
    cluster.script_exec("10.96.4.7 80", 0);

    let mut tester = PolicyTester::new(&model, cluster.clone(), ContainerSpec::default())
        .with_namespace("ns1");
    let pods = tester.prepare().await.unwrap();
    tester.wait_until_ready(pods, Duration::from_secs(5)).await;
    let report = tester.test().await.unwrap();

    assert!(report.passed());
    assert_eq!(cluster.injections(), vec!["client-abc"]);
}

#[tokio::test]
async fn test_missing_target_pod_is_fatal() {
    let model = client_server_model();
    let cluster = FakeCluster::new();
    cluster.add_pod(FakePodSpec::new("client-abc", "ns1"));

    let mut tester = PolicyTester::new(&model, cluster, ContainerSpec::default());
    tester.prepare().await.unwrap();
    match tester.test().await {
        Err(PtError::TargetPodNotFound { name, namespace }) => {
            assert_eq!((name.as_str(), namespace.as_str()), ("server", "ns1"));
        }
        other => panic!("expected TargetPodNotFound, got {other:?}"),
    }
}

#[tokio::test]
async fn test_cleanup_deletes_only_instrumented_pods() {
    let model = client_server_model();
    let cluster = FakeCluster::new();
    cluster.add_pod(FakePodSpec::new("client-abc", "ns1").label(DEFAULT_LABEL_KEY, DEFAULT_LABEL_VALUE));
    cluster.add_pod(FakePodSpec::new("wrong-value", "ns1").label(DEFAULT_LABEL_KEY, "false"));
    cluster.add_pod(FakePodSpec::new("unrelated", "ns1").label("app", "web"));

    let mut tester = PolicyTester::new(&model, cluster.clone(), ContainerSpec::default());
    let deleted = tester.cleanup().await.unwrap();
    assert_eq!(deleted, 1);
    assert_eq!(cluster.deletions(), vec!["client-abc"]);
    assert_eq!(cluster.pod_names(), vec!["wrong-value", "unrelated"]);
    assert_eq!(tester.phase(), Phase::CleanedUp);
}

#[tokio::test]
async fn test_cleanup_after_prepare_removes_what_it_added() {
    let model = client_server_model();
    let cluster = client_server_cluster();

    let mut tester = PolicyTester::new(&model, cluster.clone(), ContainerSpec::default());
    let pods = tester.prepare().await.unwrap();
    tester.wait_until_ready(pods, Duration::from_secs(5)).await;
    tester.test().await.unwrap();
    let deleted = tester.cleanup().await.unwrap();

    assert_eq!(deleted, 1);
    assert_eq!(cluster.deletions(), vec!["client-abc"]);
    assert_eq!(cluster.pod_names(), vec!["server-xyz"]);
}

#[tokio::test]
async fn test_custom_container_spec_drives_probe_and_injection() {
    let model = client_server_model();
    let cluster = client_server_cluster();
    cluster.script_exec("curl", 0);

    let container = ContainerSpec {
        name: "net-debug".to_string(),
        tcp_check_command: "curl -s {host}:{port}".to_string(),
        ..ContainerSpec::default()
    };
    let mut tester = PolicyTester::new(&model, cluster.clone(), container);
    let pods = tester.prepare().await.unwrap();
    tester.wait_until_ready(pods, Duration::from_secs(5)).await;
    let report = tester.test().await.unwrap();

    assert!(report.passed());
    let execs = cluster.execs();
    assert_eq!(execs[0].container, "net-debug");
    assert_eq!(execs[0].command.join(" "), "sh -c curl -s 10.96.4.7:80");
}

#[tokio::test]
async fn test_probe_matrix_covers_every_port_and_destination() {
    let model = model(
        r"
pods:
  - name: client
    namespace: ns1
    podname: client-
  - name: server
    namespace: ns1
    podname: server-
addresses:
  - name: dns
    hosts:
      - 8.8.8.8
      - 8.8.4.4
targets:
  - name: web
    pods:
      - server
    addresses:
      - dns
    ports:
      - port: 80
      - port: 53
        type: UDP
rules:
  - name: wide
    from: client
    allowed:
      - web
",
    );
    let cluster = client_server_cluster();
    cluster.set_default_exit(0);

    let mut tester = PolicyTester::new(&model, cluster.clone(), ContainerSpec::default());
    let pods = tester.prepare().await.unwrap();
    tester.wait_until_ready(pods, Duration::from_secs(5)).await;
    let report = tester.test().await.unwrap();

    // 3 destinations x 2 ports.
    assert_eq!(report.tests(), 6);
    assert!(report.passed());
    let udp_probes = cluster
        .execs()
        .iter()
        .filter(|e| e.command.join(" ").contains("-u"))
        .count();
    assert_eq!(udp_probes, 3);
}
