//! Background connection health monitoring
//!
//! A detached task periodically pings the tunnel's peer endpoint. After a
//! run of consecutive failures (no endpoint, no reply, or latency above the
//! threshold) it cycles the connection — disconnect followed by reconnect —
//! and then exits. The monitor is single-shot: every connect starts a fresh
//! one.

use crate::runner::CommandRunner;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Cap on the probe commands (`wg show`, `ping`)
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Monitor tuning
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Time between probes
    pub interval: Duration,
    /// Consecutive failed probes before the connection is cycled
    pub failure_threshold: u32,
    /// Round-trip time above this counts as a failed probe
    pub latency_threshold_ms: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            failure_threshold: 3,
            latency_threshold_ms: 500.0,
        }
    }
}

/// Performs the cycle action when the monitor gives up on the tunnel
///
/// Implementations tear the connection down and re-establish it with the
/// original parameters. Errors during the cycle are the implementation's to
/// log; the monitor never propagates them.
#[async_trait]
pub trait Reconnector: Send + Sync {
    /// Disconnect and reconnect
    async fn cycle(&self);
}

/// Spawn the monitor task for `iface`
///
/// The task is detached: the caller may await the handle to block until the
/// monitor completes a cycle action, but a panic or error inside it never
/// crashes the hosting process.
pub fn start_monitor(
    runner: Arc<dyn CommandRunner>,
    iface: String,
    config: MonitorConfig,
    reconnector: Arc<dyn Reconnector>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        monitor_loop(runner, &iface, &config, reconnector).await;
    })
}

async fn monitor_loop(
    runner: Arc<dyn CommandRunner>,
    iface: &str,
    config: &MonitorConfig,
    reconnector: Arc<dyn Reconnector>,
) {
    info!(
        "Starting monitor on {} (interval={:?}, failures={}, latency={}ms)",
        iface, config.interval, config.failure_threshold, config.latency_threshold_ms
    );

    let mut failures: u32 = 0;

    loop {
        tokio::time::sleep(config.interval).await;

        if probe_once(runner.as_ref(), iface, config.latency_threshold_ms).await {
            failures = 0;
        } else {
            failures += 1;
        }

        if failures >= config.failure_threshold {
            warn!(
                "monitor: {} consecutive failed probes on {}; cycling connection",
                failures, iface
            );
            reconnector.cycle().await;
            return;
        }
    }
}

/// One probe: resolve the peer endpoint and ping it once
async fn probe_once(runner: &dyn CommandRunner, iface: &str, latency_threshold_ms: f64) -> bool {
    let Some(ip) = endpoint_ip(runner, iface).await else {
        warn!("monitor: could not determine peer endpoint for {}", iface);
        return false;
    };

    match ping_once(runner, &ip).await {
        Some(rtt) if rtt <= latency_threshold_ms => {
            debug!("monitor: latency {:.1}ms to {}", rtt, ip);
            true
        }
        Some(rtt) => {
            warn!(
                "monitor: latency {:.1}ms to {} above {:.0}ms threshold",
                rtt, ip, latency_threshold_ms
            );
            false
        }
        None => {
            warn!("monitor: no reply from {}", ip);
            false
        }
    }
}

/// Endpoint IP of the first peer on `iface`, from `wg show ... endpoints`
pub(crate) async fn endpoint_ip(runner: &dyn CommandRunner, iface: &str) -> Option<String> {
    let output = runner
        .run_with_timeout("wg", &["show", iface, "endpoints"], PROBE_TIMEOUT)
        .await
        .ok()?;
    if !output.success() {
        return None;
    }

    // Per line: "<peer-pubkey>\t<ip>:<port>"
    let endpoint = output
        .stdout
        .lines()
        .next()?
        .split_whitespace()
        .nth(1)?;

    let (host, _port) = endpoint.rsplit_once(':')?;
    Some(host.trim_matches(|c| c == '[' || c == ']').to_string())
}

/// Single echo request; average RTT in milliseconds, or None on no reply
pub(crate) async fn ping_once(runner: &dyn CommandRunner, ip: &str) -> Option<f64> {
    let output = runner
        .run_with_timeout("ping", &["-c", "1", "-W", "2", ip], PROBE_TIMEOUT)
        .await
        .ok()?;
    if !output.success() {
        return None;
    }
    parse_avg_rtt(&output.stdout)
}

/// Extract the average RTT from ping's summary line
/// ("rtt min/avg/max/mdev = 10.1/11.2/12.3/0.5 ms")
pub(crate) fn parse_avg_rtt(output: &str) -> Option<f64> {
    let stats = output.lines().find(|line| line.contains("rtt min/avg"))?;
    let values = stats.split('=').nth(1)?.trim();
    values.split('/').nth(1)?.parse().ok()
}
