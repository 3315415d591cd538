//! ACP agent process spawner.
//!
//! Spawns the external agent with:
//! - piped stdio so the bridge owns both protocol streams,
//! - `kill_on_drop(true)` so a dropped handle never leaks a process,
//! - the caller's environment overlay applied on top of the inherited
//!   environment.
//!
//! Unlike line-oriented CLIs, an ACP agent says nothing until it receives
//! `initialize`, so no ready signal is awaited here.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};

use crate::{AppError, Result};

/// Default delay between the graceful terminate signal and a hard kill.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(2);

// ── Configuration ────────────────────────────────────────────────────────────

/// Everything needed to start one agent process.
///
/// Produced by the configuration layer; the bridge never computes any of it.
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    /// Agent binary (e.g. `copilot`).
    pub command: String,
    /// Arguments, including any `--add-dir` entries for skill directories.
    pub args: Vec<String>,
    /// Working directory of the child.
    pub cwd: PathBuf,
    /// Variables set on top of the inherited environment.
    pub env: HashMap<String, String>,
    /// Grace period between terminate and kill.
    pub kill_grace: Duration,
}

impl SpawnConfig {
    /// Build a config with no environment overlay and the default grace.
    #[must_use]
    pub fn new(command: impl Into<String>, args: Vec<String>, cwd: PathBuf) -> Self {
        Self {
            command: command.into(),
            args,
            cwd,
            env: HashMap::new(),
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }

    /// Same command line in a different working directory.
    #[must_use]
    pub fn with_cwd(&self, cwd: PathBuf) -> Self {
        Self {
            cwd,
            ..self.clone()
        }
    }
}

// ── Process handle ───────────────────────────────────────────────────────────

/// A freshly spawned agent process with its protocol streams detached.
#[derive(Debug)]
pub struct AgentProcess {
    /// Child handle — kept alive so `kill_on_drop` works.
    pub child: Child,
    /// Agent's stdin, the client → agent direction.
    pub stdin: ChildStdin,
    /// Agent's stdout, the agent → client direction.
    pub stdout: ChildStdout,
}

/// Spawn the agent described by `config`.
///
/// Stderr is drained by a background task and logged at `DEBUG` so a chatty
/// agent can never block on a full pipe.
///
/// # Errors
///
/// - `AppError::Spawn("failed to spawn agent: …")` — OS spawn failure
///   (missing binary, bad cwd, permissions).
/// - `AppError::Spawn("failed to capture …")` — a stdio pipe was not created.
pub fn spawn_agent(config: &SpawnConfig) -> Result<AgentProcess> {
    let mut cmd = Command::new(&config.command);
    cmd.args(&config.args)
        .envs(&config.env)
        .current_dir(&config.cwd)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|err| {
        AppError::Spawn(format!(
            "failed to spawn agent '{}': {err}",
            config.command
        ))
    })?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| AppError::Spawn("failed to capture agent stdin".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::Spawn("failed to capture agent stdout".into()))?;

    if let Some(stderr) = child.stderr.take() {
        let pid = child.id();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(pid, line = %line, "agent stderr");
            }
        });
    }

    info!(
        command = %config.command,
        args = ?config.args,
        cwd = %config.cwd.display(),
        pid = child.id(),
        "agent process spawned"
    );

    Ok(AgentProcess {
        child,
        stdin,
        stdout,
    })
}

// ── Termination ──────────────────────────────────────────────────────────────

/// Stop `child`, politely first.
///
/// On unix a `SIGTERM` is sent and the process gets `grace` to exit; after
/// that (and immediately elsewhere) it is killed. The final wait is bounded
/// by `grace` as well, so a hung process never blocks the caller
/// indefinitely. Calling this on an already exited child is a no-op.
pub async fn terminate(child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    if let Ok(Some(status)) = child.try_wait() {
        return Some(status);
    }

    #[cfg(unix)]
    {
        if let Some(pid) = child.id().and_then(|id| i32::try_from(id).ok()) {
            let pid = nix::unistd::Pid::from_raw(pid);
            if let Err(err) = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGTERM) {
                debug!(%err, "SIGTERM delivery failed");
            } else if let Ok(Ok(status)) = tokio::time::timeout(grace, child.wait()).await {
                return Some(status);
            }
        }
    }

    if let Err(err) = child.start_kill() {
        debug!(%err, "kill failed; process likely already gone");
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => Some(status),
        Ok(Err(err)) => {
            warn!(%err, "error waiting for killed agent process");
            None
        }
        Err(_elapsed) => {
            warn!(?grace, "agent process did not exit after kill; abandoning wait");
            None
        }
    }
}

/// Human-readable description of an exit status.
#[must_use]
pub fn describe_exit(status: Option<ExitStatus>) -> String {
    match status.map(|s| s.code()) {
        Some(Some(code)) => format!("process exited with code {code}"),
        Some(None) => "process terminated by signal".to_owned(),
        None => "process exit status unknown".to_owned(),
    }
}
