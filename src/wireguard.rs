//! WireGuard interface lifecycle
//!
//! Brings a tunnel interface up from a descriptor file, tears wgward-owned
//! interfaces down, and manages the resolver override with backup/restore.
//!
//! Descriptor files are expected to carry the `wgw` prefix in their name
//! (e.g. `wgwnl42.conf`): the interface is named after the file stem, and
//! teardown and status only touch interfaces matching that convention so
//! unrelated tunnels on the host are left alone.

use crate::runner::CommandRunner;
use crate::{Error, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use tracing::{debug, error, info, warn};

/// System resolver file overridden while the tunnel's DNS is in effect
pub const RESOLV_CONF: &str = "/etc/resolv.conf";
/// Backup of the resolver file, consumed by restore
pub const RESOLV_BACKUP: &str = "/etc/resolv.conf.wgwbak";

/// Matches interface names owned by wgward in `ip -o link show` output
static OWNED_IFACE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d+:\s*(wgw[0-9a-z-]+)[@:]").expect("static regex is valid")
});

static ADDRESS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^#?\s*Address\s*=\s*(\S+)").expect("static regex is valid")
});

static DNS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^#?\s*DNS\s*=\s*(\S+)").expect("static regex is valid")
});

/// Parsed WireGuard descriptor
///
/// Only the keys wgward acts on are extracted; everything else in the file
/// (`PrivateKey`, `Endpoint`, ...) is left for `wg setconf` to consume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelDescriptor {
    /// Descriptor identity; becomes the interface name
    pub name: String,
    /// Local tunnel address with CIDR suffix (e.g. `10.2.0.2/32`)
    pub address: String,
    /// DNS servers to install while the tunnel is up (may be empty)
    pub dns_servers: Vec<String>,
}

impl TunnelDescriptor {
    /// Parse descriptor text
    ///
    /// Recognizes `Address = a.b.c.d/nn` (required) and any number of
    /// `DNS = x.x.x.x` lines, including commented variants (`#Address=`),
    /// which some providers ship for wg-quick compatibility. Unknown keys
    /// are ignored.
    pub fn parse(name: &str, text: &str) -> Result<Self> {
        let address = ADDRESS_RE
            .captures(text)
            .map(|c| c[1].to_string())
            .ok_or_else(|| Error::Config(format!("no Address found in descriptor {}", name)))?;

        let dns_servers = DNS_RE
            .captures_iter(text)
            .map(|c| c[1].to_string())
            .collect();

        Ok(Self {
            name: name.to_string(),
            address,
            dns_servers,
        })
    }

    /// Load and parse a descriptor file; the file stem is the identity
    pub fn load(path: &Path) -> Result<Self> {
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .ok_or_else(|| Error::Config(format!("invalid descriptor path {}", path.display())))?;

        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read descriptor {}: {}", path.display(), e)))?;

        Self::parse(&name, &text)
    }

    /// Derive the tunnel gateway by substituting the final octet with `1`
    ///
    /// Mirrors the provider's /24-style point-to-point convention
    /// (`10.2.0.2/32` peers with `10.2.0.1`).
    pub fn gateway(&self) -> Result<String> {
        let base = self
            .address
            .split('/')
            .next()
            .unwrap_or(&self.address);

        let (prefix, _) = base.rsplit_once('.').ok_or_else(|| {
            Error::Config(format!("cannot derive gateway from address '{}'", self.address))
        })?;

        Ok(format!("{}.1", prefix))
    }
}

/// Owns interface bring-up/teardown and the resolver override
pub struct WgController {
    runner: Arc<dyn CommandRunner>,
    resolv_conf: PathBuf,
    resolv_backup: PathBuf,
}

impl WgController {
    /// Create a controller acting on the system resolver paths
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self::with_resolver_paths(runner, RESOLV_CONF, RESOLV_BACKUP)
    }

    /// Create a controller with explicit resolver paths
    pub fn with_resolver_paths(
        runner: Arc<dyn CommandRunner>,
        resolv_conf: impl Into<PathBuf>,
        resolv_backup: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runner,
            resolv_conf: resolv_conf.into(),
            resolv_backup: resolv_backup.into(),
        }
    }

    /// Bring up a WireGuard interface from the given descriptor file
    ///
    /// Parses the descriptor before touching any host state, removes a
    /// stale interface of the same name (best effort), then creates,
    /// configures, addresses and activates the interface. The first failing
    /// step aborts with [`Error::Command`]; completed steps are not rolled
    /// back here — the caller runs `bring_down` to clean up.
    ///
    /// With `use_dns`, the resolver file is backed up and overwritten with
    /// exactly the descriptor's DNS servers; if that write fails the backup
    /// is restored immediately so the resolver is never left half-written.
    pub async fn bring_up(&self, conf_path: &Path, use_dns: bool) -> Result<String> {
        let descriptor = TunnelDescriptor::load(conf_path)?;
        let gateway = descriptor.gateway()?;
        let iface = descriptor.name.clone();

        if !iface.starts_with("wgw") {
            warn!(
                "descriptor name '{}' does not follow the wgw prefix convention; \
                 teardown will not recognize this interface",
                iface
            );
        }

        if use_dns {
            self.backup_resolver();
        }

        // A stale interface of the same name blocks `ip link add`; absence
        // is not an error.
        let _ = self
            .runner
            .run("ip", &["link", "del", "dev", iface.as_str()])
            .await;

        let conf = conf_path.to_string_lossy();
        self.runner
            .run_checked("ip", &["link", "add", "dev", iface.as_str(), "type", "wireguard"])
            .await?;
        self.runner
            .run_checked("wg", &["setconf", iface.as_str(), conf.as_ref()])
            .await?;
        self.runner
            .run_checked(
                "ip",
                &[
                    "address",
                    "add",
                    descriptor.address.as_str(),
                    "peer",
                    gateway.as_str(),
                    "dev",
                    iface.as_str(),
                ],
            )
            .await?;
        self.runner
            .run_checked("ip", &["link", "set", "up", "dev", iface.as_str()])
            .await?;
        info!("Brought up interface {} with address {}", iface, descriptor.address);

        if use_dns && !descriptor.dns_servers.is_empty() {
            if let Err(e) = self.write_resolver(&descriptor.dns_servers) {
                error!(
                    "Failed to write {}: {}; restoring previous resolver",
                    self.resolv_conf.display(),
                    e
                );
                self.restore_resolver();
            } else {
                info!("Resolver updated with tunnel DNS: {:?}", descriptor.dns_servers);
            }
        }

        Ok(iface)
    }

    /// Tear down every wgward-owned interface
    ///
    /// Best-effort and total: per-interface errors are logged and teardown
    /// continues. The resolver restore runs afterward regardless of whether
    /// any interface was found.
    pub async fn bring_down(&self) {
        match self.runner.run_checked("ip", &["-o", "link", "show"]).await {
            Ok(output) => {
                for iface in owned_ifaces(&output) {
                    if let Err(e) = self
                        .runner
                        .run_checked("ip", &["link", "set", "down", "dev", iface.as_str()])
                        .await
                    {
                        error!("Error deactivating {}: {}", iface, e);
                    }
                    match self
                        .runner
                        .run_checked("ip", &["link", "del", "dev", iface.as_str()])
                        .await
                    {
                        Ok(_) => info!("Tore down interface {}", iface),
                        Err(e) => error!("Error deleting {}: {}", iface, e),
                    }
                }
            }
            Err(e) => error!("Failed to list interfaces: {}", e),
        }

        self.restore_resolver();
    }

    /// First wgward-owned interface currently reporting UP, if any
    pub async fn active_iface(&self) -> Option<String> {
        let output = self
            .runner
            .run_checked("ip", &["-o", "link", "show"])
            .await
            .ok()?;

        for line in output.lines() {
            if let Some(caps) = OWNED_IFACE_RE.captures(line) {
                if line.contains("UP") {
                    return Some(caps[1].to_string());
                }
            }
        }
        None
    }

    /// Nameservers currently in effect, parsed from the live resolver file
    pub fn dns_servers(&self) -> Vec<String> {
        let Ok(text) = std::fs::read_to_string(&self.resolv_conf) else {
            return Vec::new();
        };

        text.lines()
            .filter_map(|line| {
                let mut tokens = line.split_whitespace();
                match tokens.next() {
                    Some("nameserver") => tokens.next().map(str::to_string),
                    _ => None,
                }
            })
            .collect()
    }

    /// Restore the resolver from its backup
    ///
    /// Idempotent: without a backup this is a no-op and the live resolver
    /// file is left untouched. The backup is removed once consumed.
    pub fn restore_resolver(&self) {
        if !self.resolv_backup.exists() {
            debug!("No resolver backup at {}; nothing to restore", self.resolv_backup.display());
            return;
        }

        match std::fs::copy(&self.resolv_backup, &self.resolv_conf) {
            Ok(_) => {
                if let Err(e) = std::fs::remove_file(&self.resolv_backup) {
                    warn!("Restored resolver but failed to remove backup: {}", e);
                } else {
                    info!("Restored resolver from {}", self.resolv_backup.display());
                }
            }
            Err(e) => warn!(
                "Failed to restore {} from {}: {}",
                self.resolv_conf.display(),
                self.resolv_backup.display(),
                e
            ),
        }
    }

    fn backup_resolver(&self) {
        match std::fs::copy(&self.resolv_conf, &self.resolv_backup) {
            Ok(_) => debug!("Backed up resolver to {}", self.resolv_backup.display()),
            Err(e) => warn!("Failed to back up {}: {}", self.resolv_conf.display(), e),
        }
    }

    fn write_resolver(&self, servers: &[String]) -> std::io::Result<()> {
        let mut contents = String::from("# wgward managed resolver\n");
        for server in servers {
            contents.push_str(&format!("nameserver {}\n", server));
        }
        std::fs::write(&self.resolv_conf, contents)
    }
}

/// Extract wgward-owned interface names from `ip -o link show` output
pub(crate) fn owned_ifaces(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| OWNED_IFACE_RE.captures(line).map(|c| c[1].to_string()))
        .collect()
}
