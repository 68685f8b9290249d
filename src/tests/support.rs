//! Shared test doubles
//!
//! `FakeRunner` substitutes for [`SystemRunner`] so tests never touch real
//! host state: outputs are scripted per full command line, and every
//! invocation is recorded for order and count assertions.

use crate::portforward::PortSink;
use crate::runner::{CmdOutput, CommandRunner};
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub fn ok(stdout: &str) -> CmdOutput {
    CmdOutput {
        status: 0,
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

pub fn failed(status: i32, stderr: &str) -> CmdOutput {
    CmdOutput {
        status,
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

/// Scripted command runner
///
/// Outputs are keyed by the full command line ("program arg1 arg2 ...").
/// Scripting the same command several times produces a sequence: each call
/// consumes one entry until only the last remains, which then repeats.
/// Unscripted commands succeed with empty output, so tests only script the
/// commands they care about.
#[derive(Default)]
pub struct FakeRunner {
    scripted: Mutex<HashMap<String, VecDeque<CmdOutput>>>,
    errors: Mutex<HashMap<String, String>>,
    calls: Mutex<Vec<String>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, command: &str, output: CmdOutput) {
        self.scripted
            .lock()
            .unwrap()
            .entry(command.to_string())
            .or_default()
            .push_back(output);
    }

    /// Make a command fail at the runner level (spawn failure / timeout)
    pub fn script_error(&self, command: &str, message: &str) {
        self.errors
            .lock()
            .unwrap()
            .insert(command.to_string(), message.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count_calls(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run_with_timeout(
        &self,
        program: &str,
        args: &[&str],
        _timeout: Duration,
    ) -> Result<CmdOutput> {
        let key = if args.is_empty() {
            program.to_string()
        } else {
            format!("{} {}", program, args.join(" "))
        };
        self.calls.lock().unwrap().push(key.clone());

        if let Some(message) = self.errors.lock().unwrap().get(&key) {
            return Err(Error::Command(message.clone()));
        }

        let mut scripted = self.scripted.lock().unwrap();
        if let Some(queue) = scripted.get_mut(&key) {
            if queue.len() > 1 {
                if let Some(output) = queue.pop_front() {
                    return Ok(output);
                }
            }
            if let Some(output) = queue.front() {
                return Ok(output.clone());
            }
        }

        Ok(ok(""))
    }
}

/// Records every published port
#[derive(Default)]
pub struct FakeSink {
    ports: Mutex<Vec<u16>>,
}

impl FakeSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ports(&self) -> Vec<u16> {
        self.ports.lock().unwrap().clone()
    }
}

#[async_trait]
impl PortSink for FakeSink {
    async fn publish_port(&self, port: u16) {
        self.ports.lock().unwrap().push(port);
    }
}

/// Counts cycle requests from the monitor
#[derive(Default)]
pub struct FakeReconnector {
    cycles: AtomicU32,
}

impl FakeReconnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cycle_count(&self) -> u32 {
        self.cycles.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl crate::monitor::Reconnector for FakeReconnector {
    async fn cycle(&self) {
        self.cycles.fetch_add(1, Ordering::SeqCst);
    }
}

/// Poll `predicate` until it holds or the timeout elapses
pub async fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    predicate()
}
