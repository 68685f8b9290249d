use crate::portforward::{
    gateway_for, parse_mapped_port, recover_from_downstream_log, recover_from_lease_log,
    request_mapping, PortForwarder, PortSink,
};
use crate::tests::support::{failed, ok, wait_until, FakeRunner, FakeSink};
use crate::Error;
use std::sync::Arc;
use std::time::Duration;

const NATPMPC_SUCCESS: &str = "\
initnatpmp() returned 0 (SUCCESS)
using gateway : 10.2.0.1
send public address request
readnatpmpresponseorretry returned 0 (OK)
Public IP address : 185.159.157.1
Mapped public port 43210 protocol UDP to local port 6881 lifetime 60
";

const NATPMPC_NO_MAPPING: &str = "\
initnatpmp() returned 0 (SUCCESS)
using gateway : 10.2.0.1
readnatpmpresponseorretry returned -7
";

fn forwarder(
    runner: Arc<FakeRunner>,
    sink: Arc<FakeSink>,
    dir: &std::path::Path,
) -> PortForwarder {
    PortForwarder::with_paths(
        runner,
        6881,
        sink as Arc<dyn PortSink>,
        dir.join("wgward.log"),
        dir.join("qbittorrent.log"),
    )
}

#[test]
fn test_parse_mapped_port() {
    assert_eq!(parse_mapped_port(NATPMPC_SUCCESS), Some(43210));
    assert_eq!(parse_mapped_port(NATPMPC_NO_MAPPING), None);
    assert_eq!(parse_mapped_port(""), None);
}

#[tokio::test]
async fn test_gateway_for_reads_default_route() {
    let runner = FakeRunner::new();
    runner.script(
        "ip route show dev wgwnl7",
        ok("default via 10.2.0.1 proto static\n10.2.0.0/24 proto kernel scope link src 10.2.0.2\n"),
    );

    let gateway = gateway_for(&runner, "wgwnl7").await.unwrap();
    assert_eq!(gateway, "10.2.0.1");
}

#[tokio::test]
async fn test_gateway_for_no_default_route() {
    let runner = FakeRunner::new();
    runner.script(
        "ip route show dev wgwnl7",
        ok("10.2.0.0/24 proto kernel scope link src 10.2.0.2\n"),
    );

    let result = gateway_for(&runner, "wgwnl7").await;
    assert!(matches!(result, Err(Error::Command(_))));
}

#[tokio::test]
async fn test_request_mapping_failure_shapes_collapse_to_zero() {
    let runner = FakeRunner::new();
    runner.script("natpmpc -g 10.2.0.1 6881", failed(1, "connect: timeout"));
    assert_eq!(request_mapping(&runner, "10.2.0.1", 6881).await, 0);

    let runner = FakeRunner::new();
    runner.script("natpmpc -g 10.2.0.1 6881", ok(NATPMPC_NO_MAPPING));
    assert_eq!(request_mapping(&runner, "10.2.0.1", 6881).await, 0);

    let runner = FakeRunner::new();
    runner.script_error("natpmpc -g 10.2.0.1 6881", "natpmpc timed out after 10s");
    assert_eq!(request_mapping(&runner, "10.2.0.1", 6881).await, 0);
}

#[test]
fn test_recover_from_lease_log_latest_wins() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("wgward.log");
    std::fs::write(
        &log,
        "2026-08-29T10:00:00+00:00 Port pair 40123 6881\n\
         some unrelated line\n\
         2026-08-29T11:00:00+00:00 Port pair 41999 6881\n",
    )
    .unwrap();

    assert_eq!(recover_from_lease_log(&log), 41999);
}

#[test]
fn test_recover_from_lease_log_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    assert_eq!(recover_from_lease_log(&dir.path().join("nope.log")), 0);
}

#[test]
fn test_recover_from_downstream_log() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("qbittorrent.log");
    std::fs::write(
        &log,
        "(N) 2026-08-29T10:00:00 - qBittorrent v4.6.2 started\n\
         (N) 2026-08-29T10:00:01 - Successfully listening on IP: 10.2.0.2, port: 40123\n\
         (N) 2026-08-29T10:05:00 - Successfully listening on IP: 10.2.0.2, port: 41999\n",
    )
    .unwrap();

    assert_eq!(recover_from_downstream_log(&log), 41999);
}

#[test]
fn test_recover_from_downstream_log_no_port_lines() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("qbittorrent.log");
    std::fs::write(&log, "(N) started\n(N) shutting down\n").unwrap();
    assert_eq!(recover_from_downstream_log(&log), 0);
}

#[tokio::test]
async fn test_start_returns_mapped_port() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(FakeRunner::new());
    runner.script("ip route show dev wgwnl7", ok("default via 10.2.0.1\n"));
    runner.script("natpmpc -g 10.2.0.1 6881", ok(NATPMPC_SUCCESS));

    let sink = Arc::new(FakeSink::new());
    let fwd = forwarder(runner, sink.clone(), dir.path());

    let port = fwd.start("wgwnl7").await;
    assert_eq!(port, 43210);

    let lease = fwd.current_lease().await.unwrap();
    assert_eq!(lease.external_port, 43210);
    assert_eq!(lease.internal_port, 6881);

    // The initial port goes to the caller, not the sink
    assert!(sink.ports().is_empty());

    let log = std::fs::read_to_string(dir.path().join("wgward.log")).unwrap();
    assert!(log.contains("Port pair 43210 6881"));
}

#[tokio::test]
async fn test_start_recovers_from_lease_log() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("wgward.log"),
        "2026-08-29T10:00:00+00:00 Port pair 40123 6881\n",
    )
    .unwrap();

    let runner = Arc::new(FakeRunner::new());
    runner.script("ip route show dev wgwnl7", ok("default via 10.2.0.1\n"));
    runner.script("natpmpc -g 10.2.0.1 6881", ok(NATPMPC_NO_MAPPING));

    let sink = Arc::new(FakeSink::new());
    let fwd = forwarder(runner, sink, dir.path());

    assert_eq!(fwd.start("wgwnl7").await, 40123);
}

#[tokio::test]
async fn test_lease_log_recovery_precedes_downstream_log() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("wgward.log"),
        "2026-08-29T10:00:00+00:00 Port pair 40123 6881\n",
    )
    .unwrap();
    std::fs::write(
        dir.path().join("qbittorrent.log"),
        "(N) listening on port: 55555\n",
    )
    .unwrap();

    let runner = Arc::new(FakeRunner::new());
    runner.script("ip route show dev wgwnl7", ok("default via 10.2.0.1\n"));
    runner.script("natpmpc -g 10.2.0.1 6881", ok(NATPMPC_NO_MAPPING));

    let sink = Arc::new(FakeSink::new());
    let fwd = forwarder(runner, sink, dir.path());

    assert_eq!(fwd.start("wgwnl7").await, 40123);
}

#[tokio::test]
async fn test_start_without_mapping_or_recovery_yields_zero() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(FakeRunner::new());
    runner.script("ip route show dev wgwnl7", ok("default via 10.2.0.1\n"));
    runner.script("natpmpc -g 10.2.0.1 6881", ok(NATPMPC_NO_MAPPING));

    let sink = Arc::new(FakeSink::new());
    let fwd = forwarder(runner, sink.clone(), dir.path());

    assert_eq!(fwd.start("wgwnl7").await, 0);
    assert!(fwd.current_lease().await.is_none());
    assert!(sink.ports().is_empty());
}

#[tokio::test]
async fn test_refresh_notifies_sink_on_port_change() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(FakeRunner::new());
    runner.script("ip route show dev wgwnl7", ok("default via 10.2.0.1\n"));
    // First request maps 43210; every refresh after that observes 51000
    runner.script("natpmpc -g 10.2.0.1 6881", ok(NATPMPC_SUCCESS));
    runner.script(
        "natpmpc -g 10.2.0.1 6881",
        ok("Mapped public port 51000 protocol UDP to local port 6881 lifetime 60\n"),
    );

    let sink = Arc::new(FakeSink::new());
    let fwd = forwarder(runner, sink.clone(), dir.path())
        .refresh_every(Duration::from_millis(20));

    assert_eq!(fwd.start("wgwnl7").await, 43210);

    let notified = {
        let sink = sink.clone();
        wait_until(Duration::from_secs(2), move || !sink.ports().is_empty()).await
    };
    assert!(notified, "refresh should publish the migrated port");
    assert_eq!(sink.ports(), vec![51000]);

    // Later refreshes see the same port and must not re-publish
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(sink.ports(), vec![51000]);

    let lease = fwd.current_lease().await.unwrap();
    assert_eq!(lease.external_port, 51000);

    let log = std::fs::read_to_string(dir.path().join("wgward.log")).unwrap();
    assert!(log.contains("Port pair 43210 6881"));
    assert!(log.contains("Port pair 51000 6881"));
}

#[tokio::test]
async fn test_refresh_failure_keeps_last_lease() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(FakeRunner::new());
    runner.script("ip route show dev wgwnl7", ok("default via 10.2.0.1\n"));
    runner.script("natpmpc -g 10.2.0.1 6881", ok(NATPMPC_SUCCESS));
    runner.script("natpmpc -g 10.2.0.1 6881", ok(NATPMPC_NO_MAPPING));

    let sink = Arc::new(FakeSink::new());
    let fwd = forwarder(runner.clone(), sink.clone(), dir.path())
        .refresh_every(Duration::from_millis(20));

    assert_eq!(fwd.start("wgwnl7").await, 43210);

    // Give several refresh attempts a chance to fail
    let refreshed = wait_until(Duration::from_secs(2), move || {
        runner.count_calls("natpmpc") >= 3
    })
    .await;
    assert!(refreshed);

    assert!(sink.ports().is_empty());
    assert_eq!(fwd.current_lease().await.unwrap().external_port, 43210);
}

#[tokio::test]
async fn test_query_does_not_mutate_lease() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(FakeRunner::new());
    runner.script("ip route show dev wgwnl7", ok("default via 10.2.0.1\n"));
    runner.script("natpmpc -g 10.2.0.1 6881", ok(NATPMPC_SUCCESS));

    let sink = Arc::new(FakeSink::new());
    let fwd = forwarder(runner, sink.clone(), dir.path());

    assert_eq!(fwd.query("wgwnl7").await, 43210);
    assert!(fwd.current_lease().await.is_none());
    assert!(sink.ports().is_empty());
    assert!(!dir.path().join("wgward.log").exists());
}

#[tokio::test]
async fn test_zero_internal_port_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(FakeRunner::new());
    let sink = Arc::new(FakeSink::new());
    let fwd = PortForwarder::with_paths(
        runner.clone(),
        0,
        sink as Arc<dyn PortSink>,
        dir.path().join("wgward.log"),
        dir.path().join("qbittorrent.log"),
    );

    assert_eq!(fwd.start("wgwnl7").await, 0);
    assert!(runner.calls().is_empty(), "no command runs for port 0");
}
