//! Connection session orchestration
//!
//! Sequences the tunnel controller, kill-switch, port forwarder, downstream
//! client and health monitor into the `connect` / `disconnect` / `status`
//! operations. Within connect, interface creation strictly precedes the
//! lockdown, which precedes lease acquisition, which precedes monitor
//! start; a stage failure aborts without rolling back completed stages (the
//! user runs `disconnect` to clean up). Teardown is the mirror order and
//! never propagates errors — its goal is the least-harmful reachable state.

use crate::config::Config;
use crate::killswitch::KillSwitch;
use crate::monitor::{self, MonitorConfig, Reconnector};
use crate::portforward::{PortForwarder, PortSink};
use crate::qbittorrent::QbClient;
use crate::runner::{CommandRunner, SystemRunner};
use crate::wireguard::WgController;
use crate::{Error, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Per-invocation overrides for `connect`; `None` falls back to config
/// defaults
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Explicit descriptor file (absolute, or relative to the wireguard dir)
    pub conf: Option<PathBuf>,
    /// Override the DNS default
    pub dns: Option<bool>,
    /// Override the kill-switch default
    pub killswitch: Option<bool>,
}

/// Options for `disconnect`
#[derive(Debug, Clone, Default)]
pub struct DisconnectOptions {
    /// Also lift the egress lockdown. Off by default: a manual disconnect
    /// must not silently drop leak protection unless asked.
    pub disable_killswitch: bool,
}

/// Outcome of a successful `connect`
pub struct ConnectReport {
    /// Name of the live tunnel interface
    pub iface: String,
    /// Forwarded external port (0 = port forwarding unavailable)
    pub forwarded_port: u16,
    /// Handle of the detached health monitor; awaiting it blocks until the
    /// monitor performs its cycle action
    pub monitor: JoinHandle<()>,
}

/// Read-only snapshot assembled by `status`
#[derive(Debug, Clone)]
pub struct StatusReport {
    /// Active wgward-owned interface, if any
    pub iface: Option<String>,
    /// Nameservers currently in effect
    pub dns_servers: Vec<String>,
    /// Whether the egress lockdown is active
    pub killswitch: bool,
    /// Currently mapped external port (0 = none)
    pub forwarded_port: u16,
    /// qBittorrent's listen port (0 = unknown)
    pub qb_port: u16,
}

/// Drives the lifecycle of one tunnel connection
pub struct Session {
    config: Config,
    runner: Arc<dyn CommandRunner>,
    wg: WgController,
    killswitch: KillSwitch,
    qb: Arc<QbClient>,
    forwarder: Arc<PortForwarder>,
    wireguard_dir: PathBuf,
    skip_privilege_check: bool,
}

impl Session {
    /// Create a session acting on the real host
    pub fn new(config: Config) -> Self {
        let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);
        let qb = Arc::new(QbClient::new(&config, runner.clone()));
        let forwarder = Arc::new(PortForwarder::new(
            runner.clone(),
            config.qb_port,
            qb.clone() as Arc<dyn PortSink>,
        ));

        Self {
            wg: WgController::new(runner.clone()),
            killswitch: KillSwitch::new(runner.clone()),
            qb,
            forwarder,
            wireguard_dir: Config::wireguard_dir(),
            skip_privilege_check: false,
            runner,
            config,
        }
    }

    /// Assemble a session from pre-built components (test seam: fake
    /// runner, tempdir-backed paths, no privilege requirement)
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn assembled(
        config: Config,
        runner: Arc<dyn CommandRunner>,
        wg: WgController,
        killswitch: KillSwitch,
        qb: Arc<QbClient>,
        forwarder: Arc<PortForwarder>,
        wireguard_dir: PathBuf,
    ) -> Self {
        Self {
            config,
            runner,
            wg,
            killswitch,
            qb,
            forwarder,
            wireguard_dir,
            skip_privilege_check: true,
        }
    }

    /// Establish the tunnel and its protections
    ///
    /// Fatal errors (`Config`, `Command`, `Privilege`) abort the sequence;
    /// a missing forwarded port is only a warning — the tunnel is usable
    /// without it.
    pub async fn connect(self: Arc<Self>, opts: &SessionOptions) -> Result<ConnectReport> {
        self.ensure_root()?;

        let conf = self.resolve_conf(opts.conf.as_deref())?;
        let use_dns = opts.dns.unwrap_or(self.config.dns_default);
        let use_killswitch = opts.killswitch.unwrap_or(self.config.killswitch_default);

        let iface = self.wg.bring_up(&conf, use_dns).await?;

        if use_killswitch {
            self.killswitch.enable(&iface).await?;
        }

        if self.config.qb_enable {
            self.qb.start_service().await;
        }

        let forwarded_port = self.forwarder.start(&iface).await;
        if forwarded_port != 0 {
            self.qb.update_port(forwarded_port).await;
        } else {
            warn!("Port forwarding unavailable; continuing without it");
        }

        let reconnector: Arc<dyn Reconnector> = Arc::new(CycleHandle {
            session: self.clone(),
            opts: opts.clone(),
        });
        let monitor = monitor::start_monitor(
            self.runner.clone(),
            iface.clone(),
            self.monitor_config(),
            reconnector,
        );

        info!(
            "Connected using {} on {}, forwarded port {}",
            conf.display(),
            iface,
            forwarded_port
        );

        Ok(ConnectReport {
            iface,
            forwarded_port,
            monitor,
        })
    }

    /// Tear the tunnel down
    ///
    /// Teardown steps run in order regardless of individual failures; only
    /// the privilege check can abort.
    pub async fn disconnect(&self, opts: &DisconnectOptions) -> Result<()> {
        self.ensure_root()?;

        if self.config.qb_enable {
            self.qb.stop_service().await;
        }

        if opts.disable_killswitch {
            self.killswitch.disable().await;
        }

        self.wg.bring_down().await;

        info!("Disconnected");
        Ok(())
    }

    /// Assemble the read-only status report; never mutates host state and
    /// needs no elevation
    pub async fn status(&self) -> StatusReport {
        let iface = self.wg.active_iface().await;
        let dns_servers = self.wg.dns_servers();
        let killswitch = self.killswitch.status().await;
        let forwarded_port = match &iface {
            Some(name) => self.forwarder.query(name).await,
            None => 0,
        };
        let qb_port = self.qb.listen_port().await;

        StatusReport {
            iface,
            dns_servers,
            killswitch,
            forwarded_port,
            qb_port,
        }
    }

    fn ensure_root(&self) -> Result<()> {
        if self.skip_privilege_check {
            return Ok(());
        }
        if nix::unistd::geteuid().is_root() {
            Ok(())
        } else {
            Err(Error::Privilege(
                "root privileges required; run as root or via sudo".to_string(),
            ))
        }
    }

    fn resolve_conf(&self, explicit: Option<&std::path::Path>) -> Result<PathBuf> {
        if let Some(path) = explicit {
            let path = if path.is_absolute() {
                path.to_path_buf()
            } else {
                self.wireguard_dir.join(path)
            };
            if !path.is_file() {
                return Err(Error::Config(format!(
                    "WireGuard descriptor {} not found",
                    path.display()
                )));
            }
            return Ok(path);
        }

        let entries = std::fs::read_dir(&self.wireguard_dir).map_err(|e| {
            Error::Config(format!(
                "WireGuard descriptor directory {} missing: {}",
                self.wireguard_dir.display(),
                e
            ))
        })?;

        let mut confs: Vec<PathBuf> = entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "conf"))
            .collect();
        confs.sort();

        confs.into_iter().next().ok_or_else(|| {
            Error::Config(format!(
                "no WireGuard descriptors found in {}",
                self.wireguard_dir.display()
            ))
        })
    }

    fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            interval: std::time::Duration::from_secs(self.config.monitor_interval_secs),
            failure_threshold: self.config.monitor_failure_threshold,
            latency_threshold_ms: self.config.monitor_latency_threshold_ms,
        }
    }
}

/// Cycles the connection on the monitor's behalf with the original
/// parameters, not re-derived user intent
struct CycleHandle {
    session: Arc<Session>,
    opts: SessionOptions,
}

#[async_trait]
impl Reconnector for CycleHandle {
    async fn cycle(&self) {
        if let Err(e) = self.session.disconnect(&DisconnectOptions::default()).await {
            error!("cycle: disconnect failed: {}", e);
        }
        if let Err(e) = self.session.clone().connect(&self.opts).await {
            error!("cycle: reconnect failed: {}", e);
        }
    }
}
