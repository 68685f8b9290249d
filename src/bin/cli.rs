//! wgward command-line interface
//!
//! Thin shell over [`wgward::session::Session`]: `connect`, `disconnect`
//! and `status` subcommands, exit code 0 on success and non-zero on an
//! unrecoverable setup failure.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use wgward::config::Config;
use wgward::session::{DisconnectOptions, Session, SessionOptions, StatusReport};

#[derive(Parser, Debug)]
#[command(name = "wgward")]
#[command(
    version,
    about = "Headless WireGuard connection manager with kill-switch, port forwarding and qBittorrent integration"
)]
struct Cli {
    /// Logging verbosity (overridden by RUST_LOG)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Establish the VPN connection
    #[command(alias = "c")]
    Connect {
        /// Descriptor file (absolute, or relative to the wireguard config dir)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Override the resolver-switch default
        #[arg(long)]
        dns: Option<bool>,

        /// Override the kill-switch default
        #[arg(long)]
        ks: Option<bool>,
    },

    /// Tear down the VPN connection
    #[command(alias = "d")]
    Disconnect {
        /// Leave the kill-switch active? Pass false to also lift the lockdown
        #[arg(long)]
        ks: Option<bool>,
    },

    /// Show tunnel, kill-switch and qBittorrent status
    #[command(alias = "s")]
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| format!("wgward={}", cli.log_level)),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    check_dependencies();

    let config = Config::load(Config::default_path())?;
    let session = Arc::new(Session::new(config));

    match cli.command {
        Command::Connect { config, dns, ks } => {
            let opts = SessionOptions {
                conf: config,
                dns,
                killswitch: ks,
            };
            let report = session.connect(&opts).await?;

            let port_msg = if report.forwarded_port != 0 {
                report.forwarded_port.to_string()
            } else {
                "none".to_string()
            };
            println!("✅ Connected on {}, forwarded port {}", report.iface, port_msg);

            // Keep the foreground alive until the monitor cycles the
            // connection or the user interrupts.
            tokio::select! {
                _ = report.monitor => {}
                _ = tokio::signal::ctrl_c() => {}
            }
        }
        Command::Disconnect { ks } => {
            let opts = DisconnectOptions {
                disable_killswitch: ks == Some(false),
            };
            session.disconnect(&opts).await?;
            println!("✅ Disconnected");
        }
        Command::Status => {
            let report = session.status().await;
            print_status(&report);
        }
    }

    Ok(())
}

/// Warn (don't fail) when required system tools are missing
fn check_dependencies() {
    const REQUIRED: [&str; 5] = ["wg", "ip", "iptables", "natpmpc", "ping"];

    let missing: Vec<&str> = REQUIRED
        .iter()
        .copied()
        .filter(|tool| !tool_in_path(tool))
        .collect();

    if !missing.is_empty() {
        eprintln!(
            "Warning: missing system tools: {}. Some features may not work.",
            missing.join(", ")
        );
    }
}

fn tool_in_path(tool: &str) -> bool {
    let Some(path) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path).any(|dir| dir.join(tool).is_file())
}

fn print_status(report: &StatusReport) {
    const RESET: &str = "\x1b[0m";
    const GREEN: &str = "\x1b[92m";
    const RED: &str = "\x1b[91m";

    let line = |label: &str, ok: bool, value: String| {
        let (icon, color) = if ok { ("✔", GREEN) } else { ("✖", RED) };
        println!("{color}{icon}{RESET} {label:<16}: {color}{value}{RESET}");
    };

    line(
        "Interface",
        report.iface.is_some(),
        report.iface.clone().unwrap_or_else(|| "none".to_string()),
    );
    line(
        "DNS",
        !report.dns_servers.is_empty(),
        if report.dns_servers.is_empty() {
            "unknown".to_string()
        } else {
            report.dns_servers.join(", ")
        },
    );
    line(
        "Kill-switch",
        report.killswitch,
        if report.killswitch { "enabled" } else { "disabled" }.to_string(),
    );
    line(
        "Forwarded port",
        report.forwarded_port != 0,
        if report.forwarded_port != 0 {
            report.forwarded_port.to_string()
        } else {
            "none".to_string()
        },
    );
    line(
        "qBittorrent port",
        report.qb_port != 0,
        if report.qb_port != 0 {
            report.qb_port.to_string()
        } else {
            "unknown".to_string()
        },
    );
}
