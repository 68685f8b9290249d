//! NAT-PMP port-forward lease management
//!
//! Requests an external-port mapping from the tunnel gateway through the
//! `natpmpc` tool and keeps the lease alive with a background refresh task
//! whose cadence is shorter than the mapping's typical expiry. When a live
//! request fails, a previously observed port is recovered from persisted
//! log evidence: the upstream provider may still hold a mapping that
//! outlives this process's knowledge of it.

use crate::config::Config;
use crate::runner::CommandRunner;
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Seconds between lease refreshes; shorter than the typical 60s NAT-PMP
/// lease so the mapping never lapses between renewals
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(50);

/// Cap on a single `natpmpc` invocation
pub const NATPMP_TIMEOUT: Duration = Duration::from_secs(10);

static MAPPED_PORT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Mapped public port\s+(\d+)").expect("static regex is valid"));

static PORT_PAIR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Port pair\s+(\d+)\s+(\d+)").expect("static regex is valid"));

/// A live external-port mapping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortLease {
    /// Local port the mapping forwards to
    pub internal_port: u16,
    /// Port visible on the tunnel's public side
    pub external_port: u16,
    /// When the mapping was last confirmed
    pub obtained_at: DateTime<Utc>,
}

/// Downstream consumer notified when the forwarded port changes
#[async_trait]
pub trait PortSink: Send + Sync {
    /// Deliver a newly observed external port
    async fn publish_port(&self, port: u16);
}

/// A source of previously observed external ports, tried in order when the
/// live mapping request fails
#[derive(Debug, Clone)]
pub enum Recovery {
    /// wgward's own lease log (`Port pair <ext> <int>` lines)
    LeaseLog(PathBuf),
    /// The downstream application's log (digit run adjacent to "port")
    DownstreamLog(PathBuf),
}

impl Recovery {
    /// Attempt recovery; 0 means this source had nothing
    pub fn attempt(&self) -> u16 {
        match self {
            Self::LeaseLog(path) => recover_from_lease_log(path),
            Self::DownstreamLog(path) => recover_from_downstream_log(path),
        }
    }
}

/// Keeps one port-forward lease alive for the tunnel interface
pub struct PortForwarder {
    runner: Arc<dyn CommandRunner>,
    internal_port: u16,
    sink: Arc<dyn PortSink>,
    lease: Arc<Mutex<Option<PortLease>>>,
    lease_log: PathBuf,
    recovery: Vec<Recovery>,
    refresh_interval: Duration,
    refresh_task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl PortForwarder {
    /// Create a forwarder using the default state locations
    pub fn new(runner: Arc<dyn CommandRunner>, internal_port: u16, sink: Arc<dyn PortSink>) -> Self {
        Self::with_paths(
            runner,
            internal_port,
            sink,
            Config::lease_log_path(),
            Config::qb_log_path(),
        )
    }

    /// Create a forwarder with explicit lease-log and downstream-log paths
    pub fn with_paths(
        runner: Arc<dyn CommandRunner>,
        internal_port: u16,
        sink: Arc<dyn PortSink>,
        lease_log: impl Into<PathBuf>,
        downstream_log: impl Into<PathBuf>,
    ) -> Self {
        let lease_log = lease_log.into();
        let recovery = vec![
            Recovery::LeaseLog(lease_log.clone()),
            Recovery::DownstreamLog(downstream_log.into()),
        ];
        Self {
            runner,
            internal_port,
            sink,
            lease: Arc::new(Mutex::new(None)),
            lease_log,
            recovery,
            refresh_interval: REFRESH_INTERVAL,
            refresh_task: Arc::new(Mutex::new(None)),
        }
    }

    /// Override the refresh cadence
    pub fn refresh_every(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    /// Acquire a mapping for the configured internal port and spawn the
    /// background refresh task
    ///
    /// Falls back through the recovery sources when the live request fails.
    /// Returns the external port, or 0 when no mapping could be obtained or
    /// recovered; the caller treats 0 as "connected without port forwarding".
    pub async fn start(&self, iface: &str) -> u16 {
        if self.internal_port == 0 {
            error!("Invalid internal port 0; skipping port forwarding");
            return 0;
        }

        let gateway = match gateway_for(self.runner.as_ref(), iface).await {
            Ok(gw) => gw,
            Err(e) => {
                error!("{}", e);
                return 0;
            }
        };

        let mut external_port = request_mapping(self.runner.as_ref(), &gateway, self.internal_port).await;

        if external_port == 0 {
            for strategy in &self.recovery {
                external_port = strategy.attempt();
                if external_port != 0 {
                    info!("Recovered forwarded port {} from {:?}", external_port, strategy);
                    break;
                }
            }
        }

        if external_port == 0 {
            error!("Initial NAT-PMP mapping failed and no recovery source had a port");
            return 0;
        }

        self.record(external_port).await;
        info!(
            "NAT-PMP mapping: public {} -> internal {}",
            external_port, self.internal_port
        );

        self.spawn_refresh(gateway).await;
        external_port
    }

    /// Single-shot mapping query used by status reporting
    ///
    /// Does not mutate lease state and never notifies the sink.
    pub async fn query(&self, iface: &str) -> u16 {
        match gateway_for(self.runner.as_ref(), iface).await {
            Ok(gateway) => request_mapping(self.runner.as_ref(), &gateway, self.internal_port).await,
            Err(e) => {
                debug!("{}", e);
                0
            }
        }
    }

    /// The currently known lease, if any
    pub async fn current_lease(&self) -> Option<PortLease> {
        self.lease.lock().await.clone()
    }

    async fn record(&self, external_port: u16) {
        *self.lease.lock().await = Some(PortLease {
            internal_port: self.internal_port,
            external_port,
            obtained_at: Utc::now(),
        });
        append_lease_log(&self.lease_log, external_port, self.internal_port);
    }

    /// Spawn the detached refresh task, replacing any previous one
    ///
    /// The task re-requests the mapping on a fixed cadence. A refresh that
    /// observes a different external port notifies the sink first, then
    /// updates lease state — ports can silently migrate server-side and the
    /// downstream application must learn the new one.
    async fn spawn_refresh(&self, gateway: String) {
        let runner = self.runner.clone();
        let sink = self.sink.clone();
        let lease = self.lease.clone();
        let lease_log = self.lease_log.clone();
        let internal_port = self.internal_port;
        let interval = self.refresh_interval;

        if let Some(task) = self.refresh_task.lock().await.take() {
            task.abort();
        }

        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;

                let new_port = request_mapping(runner.as_ref(), &gateway, internal_port).await;
                if new_port == 0 {
                    warn!("Lease refresh failed; keeping last known mapping");
                    continue;
                }

                let known = lease.lock().await.as_ref().map(|l| l.external_port);
                if known == Some(new_port) {
                    debug!("Lease refreshed, public port {} unchanged", new_port);
                    continue;
                }

                info!(
                    "Forwarded port changed: {:?} -> {}; notifying downstream",
                    known, new_port
                );
                sink.publish_port(new_port).await;

                *lease.lock().await = Some(PortLease {
                    internal_port,
                    external_port: new_port,
                    obtained_at: Utc::now(),
                });
                append_lease_log(&lease_log, new_port, internal_port);
            }
        });

        *self.refresh_task.lock().await = Some(task);
    }
}

/// Determine the tunnel gateway from the route table for `iface`
pub async fn gateway_for(runner: &dyn CommandRunner, iface: &str) -> Result<String> {
    let output = runner
        .run_checked("ip", &["route", "show", "dev", iface])
        .await?;

    for line in output.lines() {
        let mut tokens = line.split_whitespace();
        if tokens.next() != Some("default") {
            continue;
        }
        while let Some(token) = tokens.next() {
            if token == "via" {
                if let Some(gateway) = tokens.next() {
                    return Ok(gateway.to_string());
                }
            }
        }
    }

    Err(Error::Command(format!("no default route on interface {}", iface)))
}

/// Request a mapping from the gateway via `natpmpc`; 0 on any failure
///
/// Timeout, non-zero exit, and a missing marker string are distinct
/// failure causes and are logged separately, but they all collapse to
/// "no mapping" for the caller.
pub async fn request_mapping(runner: &dyn CommandRunner, gateway: &str, internal_port: u16) -> u16 {
    let port_arg = internal_port.to_string();

    match runner
        .run_with_timeout("natpmpc", &["-g", gateway, port_arg.as_str()], NATPMP_TIMEOUT)
        .await
    {
        Ok(output) if output.success() => match parse_mapped_port(&output.stdout) {
            Some(port) => port,
            None => {
                error!("No mapped-port marker in natpmpc output:\n{}", output.stdout.trim());
                0
            }
        },
        Ok(output) => {
            error!(
                "natpmpc exited with status {}: {}",
                output.status,
                output.stderr.trim()
            );
            0
        }
        Err(e) => {
            error!("natpmpc invocation failed: {}", e);
            0
        }
    }
}

/// Extract the external port from natpmpc's success marker line
///
/// All knowledge of the tool's output format lives here, so drift in
/// natpmpc's wording is isolated to one adapter.
pub(crate) fn parse_mapped_port(output: &str) -> Option<u16> {
    MAPPED_PORT_RE
        .captures(output)
        .and_then(|caps| caps[1].parse().ok())
}

/// Scan wgward's own lease log for the most recent `Port pair` line
pub(crate) fn recover_from_lease_log(path: &Path) -> u16 {
    let Ok(text) = std::fs::read_to_string(path) else {
        return 0;
    };

    for line in text.lines().rev() {
        if let Some(caps) = PORT_PAIR_RE.captures(line) {
            if let Ok(port) = caps[1].parse() {
                return port;
            }
        }
    }
    0
}

/// Scan the downstream application's log for a port mention
///
/// Most recent line containing "port" wins; its first token that parses as
/// a non-zero u16 is taken as the port.
pub(crate) fn recover_from_downstream_log(path: &Path) -> u16 {
    let Ok(text) = std::fs::read_to_string(path) else {
        return 0;
    };

    for line in text.lines().rev() {
        if !line.to_lowercase().contains("port") {
            continue;
        }
        for token in line.split_whitespace() {
            if let Ok(port) = token.parse::<u16>() {
                if port != 0 {
                    return port;
                }
            }
        }
    }
    0
}

/// Append a lease to the rolling log; this is the evidence future runs
/// recover from when the live request fails
fn append_lease_log(path: &Path, external_port: u16, internal_port: u16) {
    use std::io::Write;

    let result = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut file| {
            writeln!(
                file,
                "{} Port pair {} {}",
                Utc::now().to_rfc3339(),
                external_port,
                internal_port
            )
        });

    if let Err(e) = result {
        warn!("Failed to append lease to {}: {}", path.display(), e);
    }
}
