//! Engine Launcher
//!
//! Lifecycle of the privileged engine process as seen from the unprivileged
//! side: spawn (directly or through an elevation helper), wait until the
//! engine answers on its socket, and stop it without leaving an orphan.
//!
//! # States
//!
//! ```text
//! NotStarted ──start()──► Starting ──wait_for_ready()──► Ready
//!                            │                             │
//!                            └──(exit/timeout)──┐       stop()
//!                                               ▼          ▼
//!                                            Stopped ◄── Stopping
//! ```
//!
//! # Stopping
//!
//! 1. `SHUTDOWN` over IPC, then wait `stop_grace`
//! 2. `SIGTERM`, then wait `term_grace`
//! 3. `SIGKILL` and reap
//!
//! The elevation helper is opaque: its exit status and the socket becoming
//! connectable are the only signals.

use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::{Child, Command as ProcessCommand};
use tracing::{debug, error, info, warn};

use crate::client::{ClientConfig, IpcClient};
use crate::protocol::{Command, Payload};
use crate::transport::ensure_socket_dir;

/// Default elevation helper
pub const DEFAULT_ELEVATION_HELPER: &str = "pkexec";

/// How the engine process is started
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LaunchMode {
    /// Run the engine binary as the current user (development)
    Direct,
    /// Run the engine through an elevation helper found on `PATH`
    Elevated {
        /// Helper program name or path
        helper: String,
    },
}

/// Launcher configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LauncherConfig {
    /// Engine executable
    pub engine_binary: PathBuf,
    /// Extra arguments passed to the engine
    pub engine_args: Vec<String>,
    /// Append `--socket <path>` to the engine arguments (default: true)
    pub pass_socket_arg: bool,
    /// Start through the elevation helper (default: true)
    pub elevate: bool,
    /// Elevation helper (default: pkexec)
    pub elevation_helper: String,
    /// Readiness poll interval, in milliseconds (default: 100)
    pub poll_interval_ms: u64,
    /// Wait after SHUTDOWN before SIGTERM, in milliseconds (default: 5000)
    pub stop_grace_ms: u64,
    /// Wait after SIGTERM before SIGKILL, in milliseconds (default: 2000)
    pub term_grace_ms: u64,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            engine_binary: PathBuf::from("engine-daemon"),
            engine_args: Vec::new(),
            pass_socket_arg: true,
            elevate: true,
            elevation_helper: DEFAULT_ELEVATION_HELPER.to_string(),
            poll_interval_ms: 100,
            stop_grace_ms: 5000,
            term_grace_ms: 2000,
        }
    }
}

impl LauncherConfig {
    /// Launch mode selected by this configuration
    #[must_use]
    pub fn mode(&self) -> LaunchMode {
        if self.elevate {
            LaunchMode::Elevated {
                helper: self.elevation_helper.clone(),
            }
        } else {
            LaunchMode::Direct
        }
    }
}

/// Lifecycle state of the managed process
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessState {
    /// `start()` not called yet
    NotStarted,
    /// Spawned, not yet answering
    Starting,
    /// Answering on the socket
    Ready,
    /// `stop()` in progress
    Stopping,
    /// Exited (or never came up)
    Stopped,
}

/// Launcher failures
#[derive(Debug, Error)]
pub enum LauncherError {
    /// The elevation helper is missing, was refused, or exited early
    #[error("elevation failed: {0}")]
    ElevationFailed(String),

    /// The engine exited before becoming ready (direct mode)
    #[error("engine exited before becoming ready: {status}")]
    ProcessExited {
        /// Exit status as reported by the OS
        status: String,
    },

    /// The engine did not answer within the startup timeout
    #[error("engine not ready after {0:?}")]
    StartupTimeout(Duration),

    /// The process could not be spawned
    #[error("failed to spawn engine: {0}")]
    Spawn(#[source] io::Error),

    /// Operation not valid in the current state
    #[error("invalid launcher state: {0:?}")]
    InvalidState(ProcessState),

    /// The engine survived SIGKILL (or could not be signalled) within the grace period
    #[error("engine still running {0:?} after SIGKILL")]
    StopTimeout(Duration),

    /// Socket directory preparation or process wait failed
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Owns the engine process and the client connected to it
pub struct Launcher {
    config: LauncherConfig,
    client_config: ClientConfig,
    child: Option<Child>,
    client: Option<IpcClient>,
    state: ProcessState,
    /// Socket directory created by `start()`, removed after `stop()`
    created_dir: Option<PathBuf>,
}

impl std::fmt::Debug for Launcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Launcher")
            .field("mode", &self.config.mode())
            .field("socket_path", &self.client_config.socket_path)
            .field("state", &self.state)
            .field("pid", &self.pid())
            .finish()
    }
}

/// Locate `program` on `PATH` (or check it directly if it contains a `/`)
#[must_use]
pub fn find_in_path(program: &str) -> Option<PathBuf> {
    let is_executable = |p: &Path| {
        p.metadata()
            .is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
    };

    if program.contains('/') {
        let path = PathBuf::from(program);
        return is_executable(path.as_path()).then_some(path);
    }

    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate.as_path()))
}

impl Launcher {
    /// Create a launcher; the engine is told to bind `client_config.socket_path`
    #[must_use]
    pub fn new(config: LauncherConfig, client_config: ClientConfig) -> Self {
        Self {
            config,
            client_config,
            child: None,
            client: None,
            state: ProcessState::NotStarted,
            created_dir: None,
        }
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// OS pid of the spawned process (the helper's, when elevated)
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    /// Client connected by `wait_for_ready`
    #[must_use]
    pub fn client(&self) -> Option<&IpcClient> {
        self.client.as_ref()
    }

    /// Socket path handed to the engine
    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.client_config.socket_path
    }

    /// Prepare the socket directory and spawn the engine
    ///
    /// # Errors
    ///
    /// - `ElevationFailed` if the helper is not on `PATH`
    /// - `Spawn` if the process cannot be started
    /// - `InvalidState` if a process is already running
    pub fn start(&mut self) -> Result<(), LauncherError> {
        if matches!(
            self.state,
            ProcessState::Starting | ProcessState::Ready | ProcessState::Stopping
        ) {
            return Err(LauncherError::InvalidState(self.state));
        }

        let socket_path = self.client_config.socket_path.clone();
        if let Some(dir) = socket_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            match ensure_socket_dir(dir) {
                Ok(true) => self.created_dir = Some(dir.to_path_buf()),
                Ok(false) => {}
                // The elevated engine creates privileged directories itself
                Err(e) if self.config.elevate => {
                    debug!(path = ?dir, error = %e, "Leaving socket directory to the engine");
                }
                Err(e) => return Err(e.into()),
            }
        }

        let mut engine_args: Vec<String> = self.config.engine_args.clone();
        if self.config.pass_socket_arg {
            engine_args.push("--socket".to_string());
            engine_args.push(socket_path.display().to_string());
        }

        let mut command = match self.config.mode() {
            LaunchMode::Direct => {
                let mut command = ProcessCommand::new(&self.config.engine_binary);
                command.args(&engine_args);
                command
            }
            LaunchMode::Elevated { helper } => {
                let helper_path = find_in_path(&helper).ok_or_else(|| {
                    LauncherError::ElevationFailed(format!(
                        "elevation helper {helper:?} not found on PATH"
                    ))
                })?;
                let mut command = ProcessCommand::new(helper_path);
                command.arg(&self.config.engine_binary).args(&engine_args);
                command
            }
        };

        command.stdin(Stdio::null()).kill_on_drop(true);

        let child = command.spawn().map_err(LauncherError::Spawn)?;
        info!(
            pid = ?child.id(),
            mode = ?self.config.mode(),
            engine = ?self.config.engine_binary,
            socket = ?socket_path,
            "Engine process spawned"
        );

        self.child = Some(child);
        self.state = ProcessState::Starting;
        Ok(())
    }

    /// Wait until the engine's socket answers `PING`
    ///
    /// # Errors
    ///
    /// - `ElevationFailed` (elevated) or `ProcessExited` (direct) if the
    ///   process exits first
    /// - `StartupTimeout` if `timeout` elapses
    pub async fn wait_for_ready(&mut self, timeout: Duration) -> Result<(), LauncherError> {
        if self.state != ProcessState::Starting {
            return Err(LauncherError::InvalidState(self.state));
        }

        let deadline = tokio::time::Instant::now() + timeout;
        let poll = Duration::from_millis(self.config.poll_interval_ms.max(1));

        loop {
            let exited = match self.child.as_mut() {
                Some(child) => child.try_wait()?,
                None => return Err(LauncherError::InvalidState(self.state)),
            };
            if let Some(status) = exited {
                self.child = None;
                self.state = ProcessState::Stopped;
                return Err(self.early_exit_error(status));
            }

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if self.client_config.socket_path.exists() && !remaining.is_zero() {
                if let Some(client) = self.try_connect(remaining).await {
                    info!(socket = ?self.client_config.socket_path, "Engine ready");
                    self.client = Some(client);
                    self.state = ProcessState::Ready;
                    return Ok(());
                }
            }

            if tokio::time::Instant::now() >= deadline {
                warn!(?timeout, "Engine did not become ready");
                return Err(LauncherError::StartupTimeout(timeout));
            }
            tokio::time::sleep_until(deadline.min(tokio::time::Instant::now() + poll)).await;
        }
    }

    /// Connect and ping once, spending at most `budget`
    async fn try_connect(&self, budget: Duration) -> Option<IpcClient> {
        let budget_ms = u64::try_from(budget.as_millis()).unwrap_or(u64::MAX).max(1);
        let mut config = self.client_config.clone();
        config.connect_timeout_ms = config.connect_timeout_ms.min(budget_ms);

        let started = tokio::time::Instant::now();
        let client = IpcClient::connect(config).await.ok()?;
        let ping_timeout = Duration::from_secs(1)
            .min(budget.saturating_sub(started.elapsed()))
            .max(Duration::from_millis(1));
        match client
            .send_command(Command::Ping, Payload::new(), Some(ping_timeout))
            .await
        {
            Ok(_) => Some(client),
            Err(e) => {
                debug!(error = %e, "Engine not answering yet");
                None
            }
        }
    }

    fn early_exit_error(&self, status: ExitStatus) -> LauncherError {
        match self.config.mode() {
            LaunchMode::Elevated { helper } => {
                warn!(%status, helper, "Elevation helper exited before the engine was ready");
                LauncherError::ElevationFailed(format!("{helper} exited with {status}"))
            }
            LaunchMode::Direct => {
                warn!(%status, "Engine exited before becoming ready");
                LauncherError::ProcessExited {
                    status: status.to_string(),
                }
            }
        }
    }

    /// Stop the engine: SHUTDOWN, then SIGTERM, then SIGKILL
    ///
    /// # Errors
    ///
    /// - `LauncherError::Io` if the process cannot be waited on
    /// - `LauncherError::StopTimeout` if it is still running after SIGKILL;
    ///   the launcher keeps the process and stays `Stopping`
    pub async fn stop(&mut self) -> Result<(), LauncherError> {
        let Some(mut child) = self.child.take() else {
            self.client = None;
            self.state = ProcessState::Stopped;
            self.remove_created_dir();
            return Ok(());
        };

        self.state = ProcessState::Stopping;
        let stop_grace = Duration::from_millis(self.config.stop_grace_ms);
        let term_grace = Duration::from_millis(self.config.term_grace_ms);

        if let Some(client) = self.client.take() {
            match client
                .send_command(Command::Shutdown, Payload::new(), Some(stop_grace))
                .await
            {
                Ok(_) => debug!("Engine acknowledged SHUTDOWN"),
                Err(e) => warn!(error = %e, "SHUTDOWN request failed"),
            }
            client.close();
        }

        let status = match wait_exit(&mut child, stop_grace).await? {
            Some(status) => status,
            None => {
                info!(?stop_grace, "Engine still running, sending SIGTERM");
                send_signal(&child, Signal::SIGTERM);

                match wait_exit(&mut child, term_grace).await? {
                    Some(status) => status,
                    None => {
                        warn!(?term_grace, "Engine ignored SIGTERM, sending SIGKILL");
                        if let Err(e) = child.start_kill() {
                            warn!(error = %e, "SIGKILL failed");
                        }
                        match wait_exit(&mut child, term_grace).await? {
                            Some(status) => status,
                            None => {
                                error!(pid = ?child.id(), "Engine still running after SIGKILL");
                                self.child = Some(child);
                                return Err(LauncherError::StopTimeout(term_grace));
                            }
                        }
                    }
                }
            }
        };

        info!(%status, "Engine stopped");
        self.state = ProcessState::Stopped;
        self.remove_created_dir();
        Ok(())
    }

    fn remove_created_dir(&mut self) {
        if let Some(dir) = self.created_dir.take() {
            // Only succeeds when empty
            if std::fs::remove_dir(&dir).is_ok() {
                debug!(path = ?dir, "Removed socket directory");
            }
        }
    }
}

async fn wait_exit(child: &mut Child, grace: Duration) -> io::Result<Option<ExitStatus>> {
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status.map(Some),
        Err(_) => Ok(None),
    }
}

fn send_signal(child: &Child, sig: Signal) {
    let Some(pid) = child.id() else {
        return;
    };
    #[allow(clippy::cast_possible_wrap)]
    let pid = Pid::from_raw(pid as i32);
    match signal::kill(pid, sig) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
        Err(e) => warn!(%pid, signal = ?sig, error = ?e, "Failed to signal engine"),
    }
}
