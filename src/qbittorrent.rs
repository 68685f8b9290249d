//! qBittorrent integration
//!
//! The downstream consumer of the forwarded port: after every mapping
//! change its WebUI is told the new listen port (with random-port and
//! NAT auto-mapping preferences forced off, or it would override the port
//! again on its own), and stalled transfers are resumed if nothing picks
//! back up within a bounded window after the change.

use crate::config::Config;
use crate::portforward::PortSink;
use crate::runner::CommandRunner;
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How long to wait for transfers to pick up before forcing a resume
const RESUME_WINDOW: Duration = Duration::from_secs(120);
/// Poll cadence while waiting
const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Per-request cap on WebUI calls
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// qBittorrent WebUI client and service control
pub struct QbClient {
    http: reqwest::Client,
    runner: Arc<dyn CommandRunner>,
    enabled: bool,
    base_url: String,
    username: String,
    password: String,
    fallback_port: u16,
    resume_window: Duration,
    poll_interval: Duration,
}

impl QbClient {
    /// Create a client from configuration
    pub fn new(config: &Config, runner: Arc<dyn CommandRunner>) -> Self {
        let http = reqwest::Client::builder()
            .cookie_store(true)
            .timeout(HTTP_TIMEOUT)
            .build()
            .expect("failed to construct HTTP client");

        Self {
            http,
            runner,
            enabled: config.qb_enable,
            base_url: config.qb_url.trim_end_matches('/').to_string(),
            username: config.qb_user.clone(),
            password: config.qb_pass.clone(),
            fallback_port: config.qb_port,
            resume_window: RESUME_WINDOW,
            poll_interval: POLL_INTERVAL,
        }
    }

    /// Override the resume window and poll cadence
    pub fn with_resume_timing(mut self, window: Duration, poll: Duration) -> Self {
        self.resume_window = window;
        self.poll_interval = poll;
        self
    }

    /// Push a new listen port to the WebUI
    ///
    /// Best-effort: failures are logged, never propagated — the tunnel is
    /// usable without the downstream app tracking the forwarded port.
    pub async fn update_port(&self, new_port: u16) {
        if !self.enabled {
            warn!("qBittorrent WebUI disabled; skipping port update");
            return;
        }
        if new_port == 0 {
            warn!("No forwarded port provided; skipping qBittorrent update");
            return;
        }

        info!("Updating qBittorrent listen port to {} via WebUI API", new_port);
        if let Err(e) = self.try_update_port(new_port).await {
            error!("WebUI API update failed: {}", e);
        }
    }

    async fn try_update_port(&self, new_port: u16) -> Result<()> {
        self.login().await?;

        let prefs = serde_json::json!({
            "listen_port": new_port,
            "random_port": false,
            "upnp": false,
            "use_natpmp": false,
        });
        self.http
            .post(format!("{}/api/v2/app/setPreferences", self.base_url))
            .form(&[("json", prefs.to_string())])
            .send()
            .await?
            .error_for_status()?;

        info!("WebUI API: listen_port set to {}", new_port);
        self.resume_stalled().await;
        Ok(())
    }

    async fn login(&self) -> Result<()> {
        let response = self
            .http
            .post(format!("{}/api/v2/auth/login", self.base_url))
            .form(&[("username", self.username.as_str()), ("password", self.password.as_str())])
            .send()
            .await?
            .error_for_status()?;

        let body = response.text().await?;
        if body.trim() != "Ok." {
            return Err(Error::Downstream("qBittorrent WebUI login rejected".to_string()));
        }
        Ok(())
    }

    /// Wait for transfers to pick up after a port change; if nothing is
    /// active or queued by the end of the window, send resumeAll
    async fn resume_stalled(&self) {
        info!("Watching for stalled transfers after port change");
        let deadline = tokio::time::Instant::now() + self.resume_window;

        while tokio::time::Instant::now() < deadline {
            tokio::time::sleep(self.poll_interval).await;

            match self.active_transfer_present().await {
                Ok(true) => {
                    info!("Active transfers detected; not resuming");
                    return;
                }
                Ok(false) => {}
                Err(e) => debug!("Error checking transfers: {}", e),
            }
        }

        match self
            .http
            .post(format!("{}/api/v2/torrents/resumeAll", self.base_url))
            .send()
            .await
            .and_then(|r| r.error_for_status())
        {
            Ok(_) => info!("Sent resumeAll to qBittorrent WebUI"),
            Err(e) => error!("Failed to resume transfers: {}", e),
        }
    }

    async fn active_transfer_present(&self) -> Result<bool> {
        let torrents: Vec<serde_json::Value> = self
            .http
            .get(format!("{}/api/v2/torrents/info", self.base_url))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(torrents.iter().any(|t| {
            matches!(
                t.get("state").and_then(|s| s.as_str()),
                Some("downloading") | Some("queued") | Some("queuedDL")
            )
        }))
    }

    /// Determine qBittorrent's current listen port
    ///
    /// Tries the WebUI, then open sockets via `ss`, then falls back to the
    /// configured port.
    pub async fn listen_port(&self) -> u16 {
        if self.enabled {
            match self.webui_listen_port().await {
                Ok(port) if port != 0 => return port,
                Ok(_) => {}
                Err(e) => debug!("WebUI port query failed: {}", e),
            }
        }

        if let Some(port) = self.socket_listen_port().await {
            return port;
        }

        warn!("Unable to determine qBittorrent listen port; using configured port");
        self.fallback_port
    }

    async fn webui_listen_port(&self) -> Result<u16> {
        self.login().await?;

        let prefs: serde_json::Value = self
            .http
            .get(format!("{}/api/v2/app/preferences", self.base_url))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(prefs
            .get("listen_port")
            .and_then(|p| p.as_u64())
            .and_then(|p| u16::try_from(p).ok())
            .unwrap_or(0))
    }

    async fn socket_listen_port(&self) -> Option<u16> {
        let output = self
            .runner
            .run_with_timeout("ss", &["-ltnp"], Duration::from_secs(5))
            .await
            .ok()?;
        if !output.success() {
            return None;
        }

        for line in output.stdout.lines() {
            if !line.contains("qbittorrent-nox") {
                continue;
            }
            // Local address is the 4th column, e.g. "0.0.0.0:6881"
            let local = line.split_whitespace().nth(3)?;
            if let Some((_, port)) = local.rsplit_once(':') {
                if let Ok(port) = port.parse::<u16>() {
                    if port != 0 {
                        return Some(port);
                    }
                }
            }
        }
        None
    }

    /// Start the qbittorrent-nox systemd service (best effort)
    pub async fn start_service(&self) {
        match self
            .runner
            .run_checked("systemctl", &["start", "qbittorrent-nox"])
            .await
        {
            Ok(_) => info!("Started qbittorrent-nox service"),
            Err(e) => error!("Failed to start qbittorrent-nox: {}", e),
        }
    }

    /// Stop the qbittorrent-nox systemd service (best effort)
    pub async fn stop_service(&self) {
        match self
            .runner
            .run_checked("systemctl", &["stop", "qbittorrent-nox"])
            .await
        {
            Ok(_) => info!("Stopped qbittorrent-nox service"),
            Err(e) => error!("Failed to stop qbittorrent-nox: {}", e),
        }
    }
}

#[async_trait]
impl PortSink for QbClient {
    async fn publish_port(&self, port: u16) {
        self.update_port(port).await;
    }
}
