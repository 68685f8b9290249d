//! Egress traffic lockdown
//!
//! A strict iptables kill-switch: default-deny on OUTPUT with explicit
//! exceptions for the tunnel interface and loopback. The previous rule set
//! is snapshotted before any mutation and restored verbatim on disable.

use crate::runner::CommandRunner;
use crate::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Snapshot of the pre-lockdown iptables rules
pub const IPTABLES_BACKUP: &str = "/etc/wgward-iptables.bak";

/// Manages the default-deny egress policy
pub struct KillSwitch {
    runner: Arc<dyn CommandRunner>,
    backup_path: PathBuf,
}

impl KillSwitch {
    /// Create a kill-switch using the system backup location
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self::with_backup_path(runner, IPTABLES_BACKUP)
    }

    /// Create a kill-switch with an explicit backup location
    pub fn with_backup_path(runner: Arc<dyn CommandRunner>, backup_path: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            backup_path: backup_path.into(),
        }
    }

    /// Enable the lockdown scoped to `iface` and loopback
    ///
    /// The snapshot is taken before any mutation; the allow rules are
    /// appended after the deny policy so everything not explicitly excepted
    /// falls through to DROP. A failing step aborts and propagates, and
    /// already-applied steps are left in place — a partial lockdown fails
    /// toward deny, which is the safer direction.
    pub async fn enable(&self, iface: &str) -> Result<()> {
        let rules = self.runner.run_checked("iptables-save", &[]).await?;
        std::fs::write(&self.backup_path, rules)?;
        debug!("Snapshotted iptables rules to {}", self.backup_path.display());

        self.runner
            .run_checked("iptables", &["-P", "OUTPUT", "DROP"])
            .await?;
        self.runner
            .run_checked("iptables", &["-A", "OUTPUT", "-o", iface, "-j", "ACCEPT"])
            .await?;
        self.runner
            .run_checked("iptables", &["-A", "OUTPUT", "-o", "lo", "-j", "ACCEPT"])
            .await?;

        info!("Kill-switch enabled on {}", iface);
        Ok(())
    }

    /// Restore the pre-lockdown rules
    ///
    /// Without a snapshot this warns and does nothing: fabricating a
    /// permissive default would be worse than leaving the deny policy in
    /// place. Never returns an error; teardown is best-effort.
    pub async fn disable(&self) {
        if !self.backup_path.exists() {
            warn!("No iptables backup found; cannot disable kill-switch");
            return;
        }

        let path = self.backup_path.to_string_lossy();
        match self.runner.run_checked("iptables-restore", &[path.as_ref()]).await {
            Ok(_) => {
                if let Err(e) = std::fs::remove_file(&self.backup_path) {
                    warn!("Rules restored but backup removal failed: {}", e);
                }
                info!("Kill-switch disabled, iptables restored");
            }
            Err(e) => warn!("Failed to restore iptables: {}", e),
        }
    }

    /// Whether the lockdown appears active
    ///
    /// Requires both the deny policy and the snapshot file: a DROP policy
    /// alone could be someone else's firewall, not this lockdown.
    pub async fn status(&self) -> bool {
        if !self.backup_path.exists() {
            return false;
        }

        match self.runner.run_checked("iptables", &["-S", "OUTPUT"]).await {
            Ok(rules) => rules.lines().any(|l| l.trim() == "-P OUTPUT DROP"),
            Err(e) => {
                debug!("Failed to check egress policy: {}", e);
                false
            }
        }
    }
}
