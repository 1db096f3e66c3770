//! Starting, querying and stopping the in-guest companion through the
//! guest agent.

use super::{BeaconReader, LocatedDiscovery};
use crate::agent::GuestShell;
use crate::error::{HaywireError, Result};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_COMPANION_PATH: &str = "/usr/local/bin/haywire-companion";

/// Discovery retries after a single-shot request
pub const ONESHOT_ATTEMPTS: u32 = 20;
pub const ONESHOT_INTERVAL: Duration = Duration::from_millis(100);

const EXISTS_MARKER: &str = "BINARY_EXISTS";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompanionStatus {
    /// Guest PIDs of running companion processes
    pub pids: Vec<u32>,
    /// Session published in the backend, if any
    pub session_id: Option<u32>,
}

impl CompanionStatus {
    pub fn is_running(&self) -> bool {
        !self.pids.is_empty()
    }

    /// The published session belongs to one of the running processes.
    /// Single-shot sessions use a request id instead of a PID and never
    /// match.
    pub fn is_publishing(&self) -> bool {
        self.session_id.is_some_and(|s| self.pids.contains(&s))
    }
}

pub struct CompanionLauncher<'a, S: GuestShell + ?Sized> {
    shell: &'a S,
    path: String,
}

impl<'a, S: GuestShell + ?Sized> CompanionLauncher<'a, S> {
    pub fn new(shell: &'a S) -> Self {
        Self::with_path(shell, DEFAULT_COMPANION_PATH)
    }

    pub fn with_path(shell: &'a S, path: impl Into<String>) -> Self {
        Self {
            shell,
            path: path.into(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn binary_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    fn ensure_installed(&self) -> Result<()> {
        let out = self
            .shell
            .shell(&format!("[ -x {} ] && echo {EXISTS_MARKER}", self.path))?;
        if out.contains(EXISTS_MARKER) {
            Ok(())
        } else {
            Err(HaywireError::AgentUnavailable(format!(
                "companion not installed at {}",
                self.path
            )))
        }
    }

    /// Start a continuous companion, replacing any running one.
    /// Returns the guest PID of the new process.
    pub fn start(&self, target_pid: Option<u32>) -> Result<u32> {
        self.ensure_installed()?;
        self.shell
            .shell(&format!("killall -q {} 2>/dev/null; true", self.binary_name()))?;

        let target = target_pid
            .map(|pid| format!(" --target={pid}"))
            .unwrap_or_default();
        let out = self.shell.shell(&format!(
            "nohup {}{target} >/dev/null 2>&1 & echo $!",
            self.path
        ))?;
        let pid = out.trim().parse::<u32>().map_err(|_| {
            HaywireError::AgentUnavailable(format!("unexpected launch output: {:?}", out.trim()))
        })?;
        info!("Started companion in guest as PID {pid}");
        Ok(pid)
    }

    pub fn status(&self, reader: &BeaconReader) -> Result<CompanionStatus> {
        let out = self
            .shell
            .shell(&format!("pidof {} || true", self.binary_name()))?;
        let pids = out
            .split_whitespace()
            .filter_map(|p| p.parse().ok())
            .collect();
        let session_id = reader.discover().ok().map(|d| d.session_id());
        Ok(CompanionStatus { pids, session_id })
    }

    /// Stop `pid` if given, otherwise every companion process
    pub fn stop(&self, pid: Option<u32>) -> Result<()> {
        let command = match pid {
            Some(pid) => format!(
                "kill {pid} 2>/dev/null || killall -q {} 2>/dev/null; true",
                self.binary_name()
            ),
            None => format!("killall -q {} 2>/dev/null; true", self.binary_name()),
        };
        self.shell.shell(&command)?;
        info!("Stopped companion");
        Ok(())
    }

    /// Run one single-shot publishing cycle under `request_id`
    pub fn request_oneshot(&self, request_id: u32) -> Result<()> {
        self.ensure_installed()?;
        self.exec_oneshot(request_id)
    }

    fn exec_oneshot(&self, request_id: u32) -> Result<()> {
        let out = self
            .shell
            .shell(&format!("{} --once --request={request_id:#x}", self.path))?;
        debug!("Single-shot companion output: {}", out.trim());
        Ok(())
    }

    /// Discover the companion, requesting a single-shot run when nothing is
    /// published yet. The reader is refreshed on success.
    pub fn ensure_discovery(&self, reader: &BeaconReader, request_id: u32) -> Result<LocatedDiscovery> {
        self.ensure_discovery_with(reader, request_id, ONESHOT_ATTEMPTS, ONESHOT_INTERVAL)
    }

    pub fn ensure_discovery_with(
        &self,
        reader: &BeaconReader,
        request_id: u32,
        attempts: u32,
        interval: Duration,
    ) -> Result<LocatedDiscovery> {
        if let Ok(found) = reader.discover() {
            reader.refresh();
            return Ok(found);
        }

        info!("No beacon discovery page; requesting single-shot companion");
        self.ensure_installed()?;
        match self.exec_oneshot(request_id) {
            // The agent stops polling before a slow run exits; the arena
            // may still be published, so the discovery loop decides
            Err(HaywireError::AgentUnavailable(reason)) => {
                warn!("Single-shot companion did not report completion: {reason}");
            }
            other => other?,
        }

        for attempt in 1..=attempts {
            if let Ok(found) = reader.discover() {
                debug!("Discovery succeeded after {attempt} attempt(s)");
                reader.refresh();
                return Ok(found);
            }
            thread::sleep(interval);
        }
        warn!("Companion did not publish within {attempts} attempts");
        Err(HaywireError::DiscoveryMissing)
    }
}
