//! Persistent configuration
//!
//! Settings are stored as JSON under the wgward config directory
//! (`~/.config/wgward/` on Linux). A missing or empty file yields the
//! defaults, so a fresh install works without an explicit setup step.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application configuration
///
/// # Example
/// ```rust,no_run
/// use wgward::config::Config;
///
/// let cfg = Config::load(Config::default_path()).expect("failed to load");
/// println!("qBittorrent WebUI: {}", cfg.qb_url);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Whether the qBittorrent WebUI integration is enabled
    pub qb_enable: bool,
    /// qBittorrent WebUI base URL
    pub qb_url: String,
    /// qBittorrent WebUI username
    pub qb_user: String,
    /// qBittorrent WebUI password
    pub qb_pass: String,
    /// qBittorrent's internal listen port (the port we request a mapping for)
    pub qb_port: u16,
    /// Enable the kill-switch on connect unless overridden per invocation
    pub killswitch_default: bool,
    /// Override the system resolver with the descriptor's DNS servers
    pub dns_default: bool,
    /// Seconds between health-monitor probes
    pub monitor_interval_secs: u64,
    /// Consecutive failed probes before the connection is cycled
    pub monitor_failure_threshold: u32,
    /// Ping round-trip above this many milliseconds counts as a failure
    pub monitor_latency_threshold_ms: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            qb_enable: true,
            qb_url: "http://127.0.0.1:8080".to_string(),
            qb_user: "admin".to_string(),
            qb_pass: String::new(),
            qb_port: 6881,
            killswitch_default: false,
            dns_default: true,
            monitor_interval_secs: 60,
            monitor_failure_threshold: 3,
            monitor_latency_threshold_ms: 500.0,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file
    ///
    /// Returns defaults if the file does not exist or is empty.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Ok(Self::default());
        }

        let data = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;

        if data.trim().is_empty() {
            return Ok(Self::default());
        }

        serde_json::from_str(&data)
            .map_err(|e| Error::Config(format!("failed to parse {}: {}", path.display(), e)))
    }

    /// Save configuration to a JSON file, creating parent directories
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Config(format!("failed to create {}: {}", parent.display(), e)))?;
        }

        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(path, data)
            .map_err(|e| Error::Config(format!("failed to write {}: {}", path.display(), e)))?;
        Ok(())
    }

    /// Base directory for wgward state and configuration
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("wgward")
    }

    /// Default location of the configuration file
    pub fn default_path() -> PathBuf {
        Self::config_dir().join("config.json")
    }

    /// Directory holding the WireGuard descriptor files (`*.conf`)
    pub fn wireguard_dir() -> PathBuf {
        Self::config_dir().join("wireguard")
    }

    /// Rolling log of successful port leases, scanned by lease recovery
    pub fn lease_log_path() -> PathBuf {
        Self::config_dir().join("wgward.log")
    }

    /// qBittorrent's own log file, the last-resort port recovery source
    pub fn qb_log_path() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("qBittorrent")
            .join("logs")
            .join("qbittorrent.log")
    }
}
