//! External command execution
//!
//! Every interaction with the host's network tooling (`ip`, `wg`,
//! `iptables`, `natpmpc`, `ping`, `systemctl`, `ss`) goes through the
//! [`CommandRunner`] trait so that tests can substitute a scripted fake
//! instead of touching real host state.

use crate::{Error, Result};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Default cap on a single external command invocation
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Captured result of one external command invocation
#[derive(Debug, Clone)]
pub struct CmdOutput {
    /// Process exit status (-1 when terminated by a signal)
    pub status: i32,
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
}

impl CmdOutput {
    /// Whether the command exited with status zero
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Executes external commands with bounded runtime
///
/// Implementations must capture output rather than inheriting the parent's
/// stdio. The runner reports three distinguishable failure shapes: spawn
/// failure and timeout as `Err(Error::Command)`, non-zero exit as an `Ok`
/// output with a non-zero status.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args`, capped at `timeout`
    async fn run_with_timeout(
        &self,
        program: &str,
        args: &[&str],
        timeout: Duration,
    ) -> Result<CmdOutput>;

    /// Run with the default timeout
    async fn run(&self, program: &str, args: &[&str]) -> Result<CmdOutput> {
        self.run_with_timeout(program, args, DEFAULT_TIMEOUT).await
    }

    /// Run and treat non-zero exit as [`Error::Command`]
    ///
    /// Returns trimmed stdout on success.
    async fn run_checked(&self, program: &str, args: &[&str]) -> Result<String> {
        let output = self.run(program, args).await?;
        if !output.success() {
            return Err(Error::Command(format!(
                "{} {} exited with status {}: {}",
                program,
                args.join(" "),
                output.status,
                output.stderr.trim()
            )));
        }
        Ok(output.stdout.trim().to_string())
    }
}

/// Real command runner backed by `tokio::process`
#[derive(Debug, Clone, Default)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run_with_timeout(
        &self,
        program: &str,
        args: &[&str],
        timeout: Duration,
    ) -> Result<CmdOutput> {
        debug!("Executing: {} {}", program, args.join(" "));

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(timeout, child).await {
            Ok(result) => result
                .map_err(|e| Error::Command(format!("failed to spawn {}: {}", program, e)))?,
            Err(_) => {
                return Err(Error::Command(format!(
                    "{} timed out after {}s",
                    program,
                    timeout.as_secs()
                )));
            }
        };

        let result = CmdOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        debug!("{} exited with status {}", program, result.status);
        Ok(result)
    }
}
