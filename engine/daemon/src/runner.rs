//! Job Runner
//!
//! Command handlers for the installer engine and the job loop behind
//! `START_INSTALLATION`. Jobs are simulated: each one is a fixed number of
//! timed steps that report progress to every connected surface.
//!
//! # Events
//!
//! ```text
//! START_INSTALLATION
//!   ├─► JOB_STARTED        { job, index, total }
//!   ├─► JOB_PROGRESS       { job, step, steps, percent }   (per step)
//!   ├─► JOB_COMPLETED      { job, index }
//!   │   ... next job ...
//!   ├─► ERROR_OCCURRED     { job, message }                (failure or cancel)
//!   └─► INSTALLATION_COMPLETE { success, cancelled, completed_jobs }
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use engine_core::{
    payload, resolve_path, Command, Dispatcher, Event, HandlerError, HandlerResult, Payload,
    ServerHandle,
};

/// Message reported by GET_STATUS when idle
pub const IDLE_MESSAGE: &str = "no installation in progress";

/// Product strings returned by GET_BRANDING
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Branding {
    /// Product name
    pub product_name: String,
    /// Product version
    pub version: String,
    /// Welcome text
    pub welcome: String,
}

impl Default for Branding {
    fn default() -> Self {
        Self {
            product_name: "Installer".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            welcome: "Welcome to the installer.".to_string(),
        }
    }
}

/// `[runner]` section of the engine configuration file
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Jobs to run, in order
    pub jobs: Vec<String>,
    /// Steps per job (default: 4)
    pub steps_per_job: u32,
    /// Delay between steps, in milliseconds (default: 250)
    pub step_delay_ms: u64,
    /// Job that fails on purpose, for exercising error reporting
    pub fail_job: Option<String>,
    /// Branding strings
    pub branding: Branding,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            jobs: ["partition", "unpackfs", "bootloader", "users"]
                .into_iter()
                .map(String::from)
                .collect(),
            steps_per_job: 4,
            step_delay_ms: 250,
            fail_job: None,
            branding: Branding::default(),
        }
    }
}

#[derive(Deserialize, Default)]
struct RunnerSection {
    #[serde(default)]
    runner: RunnerConfig,
}

impl RunnerConfig {
    /// Read the `[runner]` section from configuration TOML (other sections are ignored)
    ///
    /// # Errors
    ///
    /// Returns the TOML error for malformed input.
    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str::<RunnerSection>(content).map(|s| s.runner)
    }
}

/// Installation progress
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunState {
    /// Nothing started yet
    Idle,
    /// Jobs are running
    Running {
        /// Job currently executing
        current: String,
        /// Jobs finished so far
        completed: usize,
    },
    /// All jobs finished
    Completed,
    /// A job failed
    Failed {
        /// Failing job
        job: String,
    },
    /// Stopped by CANCEL_INSTALLATION or SHUTDOWN
    Cancelled,
}

impl RunState {
    fn label(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running { .. } => "running",
            Self::Completed => "completed",
            Self::Failed { .. } => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

struct Inner {
    config: RunnerConfig,
    server: ServerHandle,
    state: Mutex<RunState>,
    cancel: AtomicBool,
}

/// Owns the installation state and registers the engine's handlers
#[derive(Clone)]
pub struct JobRunner {
    inner: Arc<Inner>,
}

impl JobRunner {
    /// Create a runner broadcasting through `server`
    pub fn new(config: RunnerConfig, server: ServerHandle) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                server,
                state: Mutex::new(RunState::Idle),
                cancel: AtomicBool::new(false),
            }),
        }
    }

    /// Current state
    pub fn state(&self) -> RunState {
        self.inner.state.lock().clone()
    }

    /// Register every engine command on `dispatcher`
    pub fn register(&self, dispatcher: &mut Dispatcher) {
        let runner = self.clone();
        dispatcher.register_fn(Command::GetStatus, move |_| Ok(runner.status()));

        let runner = self.clone();
        dispatcher.register_fn(Command::GetBranding, move |_| {
            let branding = &runner.inner.config.branding;
            Ok(payload(json!({
                "product_name": branding.product_name,
                "version": branding.version,
                "welcome": branding.welcome,
            })))
        });

        let runner = self.clone();
        dispatcher.register_fn(Command::GetJobNames, move |_| {
            Ok(payload(json!({ "jobs": runner.inner.config.jobs })))
        });

        let runner = self.clone();
        dispatcher.register_fn(Command::StartInstallation, move |_| runner.start());

        let runner = self.clone();
        dispatcher.register_fn(Command::CancelInstallation, move |_| runner.cancel());

        let runner = self.clone();
        dispatcher.register_fn(Command::ValidateConfig, move |args| {
            validate_config(args, &runner.inner.server.security().allowed_roots)
        });

        let runner = self.clone();
        dispatcher.register_fn(Command::Shutdown, move |_| {
            // Stop running jobs at the next step boundary
            runner.inner.cancel.store(true, Ordering::SeqCst);
            Ok(payload(json!({ "shutting_down": true })))
        });
    }

    fn status(&self) -> Payload {
        let state = self.inner.state.lock().clone();
        let total = self.inner.config.jobs.len();
        let mut status = json!({
            "state": state.label(),
            "total_jobs": total,
        });
        match state {
            RunState::Idle => {
                status["message"] = json!(IDLE_MESSAGE);
            }
            RunState::Running { current, completed } => {
                status["current_job"] = json!(current);
                status["completed_jobs"] = json!(completed);
            }
            RunState::Completed => {
                status["completed_jobs"] = json!(total);
            }
            RunState::Failed { job } => {
                status["failed_job"] = json!(job);
            }
            RunState::Cancelled => {}
        }
        payload(status)
    }

    fn start(&self) -> HandlerResult {
        let jobs = &self.inner.config.jobs;
        {
            let mut state = self.inner.state.lock();
            if matches!(*state, RunState::Running { .. }) {
                return Err(HandlerError::InvalidState(
                    "installation already in progress".into(),
                ));
            }
            let Some(first) = jobs.first() else {
                return Err(HandlerError::InvalidState("no jobs configured".into()));
            };
            *state = RunState::Running {
                current: first.clone(),
                completed: 0,
            };
        }
        self.inner.cancel.store(false, Ordering::SeqCst);

        info!(jobs = jobs.len(), "Installation started");
        let runner = self.clone();
        tokio::spawn(async move { runner.run().await });

        Ok(payload(json!({ "started": true, "total_jobs": jobs.len() })))
    }

    fn cancel(&self) -> HandlerResult {
        if !matches!(*self.inner.state.lock(), RunState::Running { .. }) {
            return Err(HandlerError::InvalidState(IDLE_MESSAGE.into()));
        }
        self.inner.cancel.store(true, Ordering::SeqCst);
        info!("Installation cancel requested");
        Ok(payload(json!({ "cancelling": true })))
    }

    fn cancelled(&self) -> bool {
        self.inner.cancel.load(Ordering::SeqCst)
    }

    async fn broadcast(&self, event: Event, data: Value) {
        let result = self.inner.server.broadcast_event(event, payload(data)).await;
        if !result.all_succeeded() {
            warn!(%event, failed = result.failed, "Event not delivered to every surface");
        }
    }

    async fn run(&self) {
        let config = &self.inner.config;
        let total = config.jobs.len();
        let steps = config.steps_per_job.max(1);
        let delay = Duration::from_millis(config.step_delay_ms);

        for (index, job) in config.jobs.iter().enumerate() {
            *self.inner.state.lock() = RunState::Running {
                current: job.clone(),
                completed: index,
            };
            self.broadcast(
                Event::JobStarted,
                json!({ "job": job, "index": index, "total": total }),
            )
            .await;

            for step in 1..=steps {
                tokio::time::sleep(delay).await;
                if self.cancelled() {
                    self.finish_cancelled(job, index).await;
                    return;
                }
                self.broadcast(
                    Event::JobProgress,
                    json!({
                        "job": job,
                        "step": step,
                        "steps": steps,
                        "percent": step * 100 / steps,
                    }),
                )
                .await;
            }

            if config.fail_job.as_deref() == Some(job.as_str()) {
                warn!(job, "Job failed");
                *self.inner.state.lock() = RunState::Failed { job: job.clone() };
                self.broadcast(
                    Event::ErrorOccurred,
                    json!({ "job": job, "message": format!("job {job} failed") }),
                )
                .await;
                self.broadcast(
                    Event::InstallationComplete,
                    json!({ "success": false, "cancelled": false, "completed_jobs": index }),
                )
                .await;
                return;
            }

            self.broadcast(Event::JobCompleted, json!({ "job": job, "index": index }))
                .await;
            info!(job, "Job completed");
        }

        *self.inner.state.lock() = RunState::Completed;
        self.broadcast(
            Event::InstallationComplete,
            json!({ "success": true, "cancelled": false, "completed_jobs": total }),
        )
        .await;
        info!("Installation complete");
    }

    async fn finish_cancelled(&self, job: &str, completed: usize) {
        info!(job, "Installation cancelled");
        *self.inner.state.lock() = RunState::Cancelled;
        self.broadcast(
            Event::ErrorOccurred,
            json!({ "job": job, "message": "installation cancelled" }),
        )
        .await;
        self.broadcast(
            Event::InstallationComplete,
            json!({ "success": false, "cancelled": true, "completed_jobs": completed }),
        )
        .await;
    }
}

/// VALIDATE_CONFIG: the file must exist and parse as TOML
fn validate_config(args: Payload, roots: &[PathBuf]) -> HandlerResult {
    let raw = args
        .get("path")
        .and_then(Value::as_str)
        .ok_or_else(|| HandlerError::InvalidArgument("missing string argument `path`".into()))?;

    // The request passed the lexical root check; symlinks are only visible on disk
    let path = resolve_path("path", raw, roots).map_err(|e| {
        warn!(path = raw, error = %e, "Refusing to read configuration");
        HandlerError::InvalidArgument(e.to_string())
    })?;

    let content = std::fs::read_to_string(&path)
        .map_err(|e| HandlerError::Failed(format!("cannot read {raw}: {}", e.kind())))?;

    Ok(match content.parse::<toml::Table>() {
        Ok(_) => payload(json!({ "valid": true, "path": raw })),
        // Only the position: the parser's own message quotes the offending line
        Err(e) => {
            let (line, column) = e
                .span()
                .map_or((1, 1), |span| line_column(&content, span.start));
            payload(json!({
                "valid": false,
                "path": raw,
                "error": format!("invalid TOML at line {line}, column {column}"),
                "line": line,
                "column": column,
            }))
        }
    })
}

/// One-based line and column of byte `offset` in `text`
fn line_column(text: &str, offset: usize) -> (usize, usize) {
    let before = text.get(..offset).unwrap_or(text);
    let line = before.matches('\n').count() + 1;
    let column = before.rsplit('\n').next().map_or(0, |l| l.chars().count()) + 1;
    (line, column)
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine_core::{Message, Server, ServerConfig};
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        runner: JobRunner,
        dispatcher: Dispatcher,
    }

    fn fixture(config: RunnerConfig) -> Fixture {
        let dir = TempDir::new().unwrap();
        let mut server_config = ServerConfig::new(dir.path().join("engine.sock"));
        server_config.security.allowed_roots = vec![dir.path().to_path_buf()];
        let server = Server::bind(server_config).unwrap();
        let runner = JobRunner::new(config, server.handle());
        let mut dispatcher = Dispatcher::with_builtins();
        runner.register(&mut dispatcher);
        Fixture {
            dir,
            runner,
            dispatcher,
        }
    }

    fn quick(jobs: &[&str]) -> RunnerConfig {
        RunnerConfig {
            jobs: jobs.iter().map(ToString::to_string).collect(),
            steps_per_job: 2,
            step_delay_ms: 10,
            ..RunnerConfig::default()
        }
    }

    async fn call(dispatcher: &Dispatcher, command: Command, args: Value) -> Message {
        dispatcher
            .dispatch(&Message::request(command, payload(args)))
            .await
    }

    fn result(message: &Message) -> &Payload {
        match &message.body {
            engine_core::Body::Response { result, error, .. } => {
                assert!(error.is_none(), "unexpected error: {error:?}");
                result
            }
            other => panic!("not a response: {other:?}"),
        }
    }

    fn error_message(message: &Message) -> String {
        match &message.body {
            engine_core::Body::Response {
                error: Some(error), ..
            } => error.message.clone(),
            other => panic!("expected an error response: {other:?}"),
        }
    }

    async fn wait_for(runner: &JobRunner, pred: impl Fn(&RunState) -> bool) {
        for _ in 0..200 {
            if pred(&runner.state()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("state never reached, last: {:?}", runner.state());
    }

    #[test]
    fn test_runner_section_parsing() {
        let config = RunnerConfig::from_toml_str(
            r#"
            [server]
            max_connections = 4

            [runner]
            jobs = ["a", "b"]
            fail_job = "b"

            [runner.branding]
            product_name = "Acme OS"
            "#,
        )
        .unwrap();
        assert_eq!(config.jobs, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(config.fail_job.as_deref(), Some("b"));
        assert_eq!(config.branding.product_name, "Acme OS");
        assert_eq!(config.steps_per_job, 4);

        assert_eq!(RunnerConfig::from_toml_str("").unwrap(), RunnerConfig::default());
    }

    #[tokio::test]
    async fn test_every_command_has_a_handler() {
        let f = fixture(RunnerConfig::default());
        for command in Command::ALL {
            assert!(f.dispatcher.has_handler(*command), "{command}");
        }
    }

    #[tokio::test]
    async fn test_idle_status_and_metadata() {
        let f = fixture(quick(&["partition", "users"]));

        let status = call(&f.dispatcher, Command::GetStatus, json!({})).await;
        assert_eq!(result(&status)["state"], "idle");
        assert_eq!(result(&status)["message"], IDLE_MESSAGE);

        let names = call(&f.dispatcher, Command::GetJobNames, json!({})).await;
        assert_eq!(result(&names)["jobs"], json!(["partition", "users"]));

        let branding = call(&f.dispatcher, Command::GetBranding, json!({})).await;
        assert_eq!(result(&branding)["product_name"], "Installer");
    }

    #[tokio::test]
    async fn test_installation_runs_to_completion() {
        let f = fixture(quick(&["partition", "users"]));

        let started = call(&f.dispatcher, Command::StartInstallation, json!({})).await;
        assert_eq!(result(&started)["started"], true);

        let again = call(&f.dispatcher, Command::StartInstallation, json!({})).await;
        assert!(error_message(&again).contains("already in progress"));

        wait_for(&f.runner, |s| *s == RunState::Completed).await;
        let status = call(&f.dispatcher, Command::GetStatus, json!({})).await;
        assert_eq!(result(&status)["state"], "completed");
        assert_eq!(result(&status)["completed_jobs"], 2);
    }

    #[tokio::test]
    async fn test_failing_job() {
        let mut config = quick(&["partition", "bootloader", "users"]);
        config.fail_job = Some("bootloader".into());
        let f = fixture(config);

        call(&f.dispatcher, Command::StartInstallation, json!({})).await;
        wait_for(&f.runner, |s| matches!(s, RunState::Failed { .. })).await;
        assert_eq!(
            f.runner.state(),
            RunState::Failed {
                job: "bootloader".into()
            }
        );
    }

    #[tokio::test]
    async fn test_cancel() {
        let mut config = quick(&["partition", "unpackfs"]);
        config.step_delay_ms = 50;
        config.steps_per_job = 20;
        let f = fixture(config);

        let idle_cancel = call(&f.dispatcher, Command::CancelInstallation, json!({})).await;
        assert_eq!(error_message(&idle_cancel), format!("invalid state: {IDLE_MESSAGE}"));

        call(&f.dispatcher, Command::StartInstallation, json!({})).await;
        let cancel = call(&f.dispatcher, Command::CancelInstallation, json!({})).await;
        assert_eq!(result(&cancel)["cancelling"], true);

        wait_for(&f.runner, |s| *s == RunState::Cancelled).await;

        // A new run can start after a cancelled one
        let restarted = call(&f.dispatcher, Command::StartInstallation, json!({})).await;
        assert_eq!(result(&restarted)["started"], true);
    }

    #[tokio::test]
    async fn test_validate_config() {
        let f = fixture(RunnerConfig::default());
        let dir = f.dir.path();

        let good = dir.join("good.toml");
        std::fs::write(&good, "[server]\nmax_connections = 4\n").unwrap();
        let response = call(&f.dispatcher, Command::ValidateConfig, json!({ "path": good })).await;
        assert_eq!(result(&response)["valid"], true);

        let bad = dir.join("bad.toml");
        std::fs::write(&bad, "a = 1\n[server\n").unwrap();
        let response = call(&f.dispatcher, Command::ValidateConfig, json!({ "path": bad })).await;
        let outcome = result(&response);
        assert_eq!(outcome["valid"], false);
        assert_eq!(outcome["line"], 2);
        assert!(outcome["error"].as_str().unwrap().starts_with("invalid TOML at line 2"));

        let missing = dir.join("missing.toml");
        let response =
            call(&f.dispatcher, Command::ValidateConfig, json!({ "path": missing })).await;
        assert!(error_message(&response).contains("does not name an existing file"));

        let response = call(&f.dispatcher, Command::ValidateConfig, json!({})).await;
        assert!(error_message(&response).contains("path"));
    }

    #[tokio::test]
    async fn test_validate_config_does_not_follow_symlink_out_of_roots() {
        let f = fixture(RunnerConfig::default());
        let outside = TempDir::new().unwrap();
        let secret = outside.path().join("shadow");
        std::fs::write(&secret, "root:$6$SECRETHASH:19000:0:99999:7:::\n").unwrap();
        let link = f.dir.path().join("cfg.toml");
        std::os::unix::fs::symlink(&secret, &link).unwrap();

        let response = call(&f.dispatcher, Command::ValidateConfig, json!({ "path": link })).await;
        let text = serde_json::to_string(&response).unwrap();
        assert!(error_message(&response).contains("outside the allowed roots"));
        assert!(!text.contains("SECRETHASH"));
    }

    #[tokio::test]
    async fn test_validate_config_error_omits_file_content() {
        let f = fixture(RunnerConfig::default());
        let bad = f.dir.path().join("secret.toml");
        std::fs::write(&bad, "token:SECRETVALUE\n").unwrap();

        let response = call(&f.dispatcher, Command::ValidateConfig, json!({ "path": bad })).await;
        let text = serde_json::to_string(&response).unwrap();
        assert_eq!(result(&response)["valid"], false);
        assert!(!text.contains("SECRETVALUE"));
    }

    #[test]
    fn test_line_column() {
        assert_eq!(line_column("abc", 0), (1, 1));
        assert_eq!(line_column("a = 1\n[server\n", 13), (2, 8));
        assert_eq!(line_column("é\nx", 4), (2, 2));
    }
}
