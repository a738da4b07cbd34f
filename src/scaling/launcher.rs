//! Worker process management.
//!
//! The controller only needs three things from the operating system: start a worker
//! under a consumer name, ask a worker to stop, and check whether it is still alive.
//! [`WorkerLauncher`] is that seam; [`ProcessLauncher`] implements it with child
//! processes and POSIX signals.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;

use crate::error::{Error, Result};

/// Result of asking a worker to stop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminateOutcome {
    /// The stop signal was delivered.
    Signalled,
    /// The process no longer exists.
    AlreadyDead,
    /// Delivering the signal failed for another reason.
    Failed(String),
}

/// Starts, stops and probes worker processes.
pub trait WorkerLauncher: Send {
    /// Start a worker for `consumer_name` and return its pid.
    fn spawn(&mut self, consumer_name: &str) -> Result<u32>;

    /// Ask the worker to shut down gracefully.
    fn terminate(&mut self, pid: u32) -> TerminateOutcome;

    /// Returns `true` if the worker process still runs.
    fn is_alive(&mut self, pid: u32) -> bool;
}

/// Launches `streamfold-worker` (or any compatible program) as child processes.
///
/// Each worker is started as `<program> <args..> --consumer <name>`. Exited children are
/// reaped when probed.
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<String>,
    children: HashMap<u32, tokio::process::Child>,
}

impl ProcessLauncher {
    /// Launcher for `program`, passing `args` before `--consumer <name>`.
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            children: HashMap::new(),
        }
    }

    /// Program started for each worker.
    pub fn program(&self) -> &std::path::Path {
        &self.program
    }
}

/// Send `signal` to `pid`.
fn send_signal(pid: u32, signal: libc::c_int) -> std::io::Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"))?;
    // SAFETY: kill(2) has no memory-safety preconditions; an invalid pid yields ESRCH.
    let rc = unsafe { libc::kill(pid, signal) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn spawn(&mut self, consumer_name: &str) -> Result<u32> {
        let child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .arg("--consumer")
            .arg(consumer_name)
            .stdin(Stdio::null())
            .spawn()?;
        let pid = child.id().ok_or_else(|| {
            Error::Io(std::io::Error::other(format!(
                "worker {consumer_name} exited before reporting a pid"
            )))
        })?;
        self.children.insert(pid, child);
        Ok(pid)
    }

    fn terminate(&mut self, pid: u32) -> TerminateOutcome {
        if !self.is_alive(pid) {
            return TerminateOutcome::AlreadyDead;
        }
        match send_signal(pid, libc::SIGTERM) {
            Ok(()) => TerminateOutcome::Signalled,
            Err(err) if err.raw_os_error() == Some(libc::ESRCH) => {
                self.children.remove(&pid);
                TerminateOutcome::AlreadyDead
            }
            Err(err) => TerminateOutcome::Failed(err.to_string()),
        }
    }

    fn is_alive(&mut self, pid: u32) -> bool {
        match self.children.get_mut(&pid) {
            Some(child) => match child.try_wait() {
                Ok(None) => true,
                Ok(Some(status)) => {
                    tracing::debug!(pid, %status, "worker exited");
                    self.children.remove(&pid);
                    false
                }
                Err(err) => {
                    tracing::warn!(pid, error = %err, "failed to poll worker");
                    false
                }
            },
            // Not our child: probe with signal 0.
            None => send_signal(pid, 0).is_ok(),
        }
    }
}
