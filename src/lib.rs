//! wgward - headless WireGuard connection manager
//!
//! This library drives the lifecycle of a single outbound WireGuard tunnel:
//! bring-up from a plain `.conf` descriptor, an iptables kill-switch, a
//! NAT-PMP port-forward lease kept alive in the background, qBittorrent
//! WebUI integration for the forwarded port, and health monitoring with
//! automatic reconnect.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod killswitch;
pub mod monitor;
pub mod portforward;
pub mod qbittorrent;
pub mod runner;
pub mod session;
pub mod wireguard;

#[cfg(test)]
mod tests;

/// Result type alias for wgward operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for wgward operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed or missing descriptor/configuration fields. Never retried;
    /// aborts the calling operation.
    #[error("Config error: {0}")]
    Config(String),

    /// External tool failure: spawn error, non-zero exit, or timeout.
    #[error("Command error: {0}")]
    Command(String),

    /// Not running with the required elevation. Fatal before any mutation.
    #[error("Privilege error: {0}")]
    Privilege(String),

    /// The downstream application rejected a request (e.g. WebUI login)
    #[error("Downstream application error: {0}")]
    Downstream(String),

    /// General I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Initialize the wgward library with logging
pub fn init() {
    tracing_subscriber::fmt::init();
}
