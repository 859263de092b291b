//! Engine Control
//!
//! Command-line surface for the installer engine: sends one command and
//! prints the result as JSON. With `--launch` it also starts the engine
//! (through pkexec unless `--dev`) and stops it afterwards.
//!
//! # Usage
//!
//! ```bash
//! # Talk to a running engine
//! engine-ctl ping
//! engine-ctl validate /mnt/etc/installer/settings.toml
//!
//! # Start a development engine, run the installation, stop it
//! engine-ctl --launch --dev --engine-bin target/debug/engine-daemon install
//! ```

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use engine_core::transport::PRODUCTION_SOCKET_PATH;
use engine_core::{
    default_socket_path, payload, ClientState, Command, EngineConfig, Event, IpcClient, Launcher,
    Message, Payload,
};

/// Installer engine control
#[derive(Debug, Parser)]
#[command(name = "engine-ctl", version, about)]
struct Cli {
    /// Engine socket path
    #[arg(long, env = "ENGINE_SOCKET", global = true)]
    socket: Option<PathBuf>,

    /// Configuration file (TOML)
    #[arg(long, env = "ENGINE_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Start the engine first and stop it afterwards
    #[arg(long, global = true)]
    launch: bool,

    /// Engine executable used with --launch
    #[arg(long, env = "ENGINE_BINARY", global = true)]
    engine_bin: Option<PathBuf>,

    /// Development mode: per-user socket, no elevation
    #[arg(long, global = true)]
    dev: bool,

    /// Request timeout in milliseconds
    #[arg(long, global = true)]
    timeout_ms: Option<u64>,

    #[command(subcommand)]
    action: Action,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
enum Action {
    /// Check that the engine answers
    Ping,
    /// Show installation status
    Status,
    /// Show branding strings
    Branding,
    /// List the configured jobs
    Jobs,
    /// Run the installation and follow its progress
    Install,
    /// Cancel a running installation
    Cancel,
    /// Check that a configuration file parses
    Validate {
        /// File to check
        path: PathBuf,
    },
    /// Stop the engine
    Shutdown,
}

impl Action {
    /// Request sent for this action
    fn request(&self) -> (Command, Payload) {
        let command = match self {
            Self::Ping => Command::Ping,
            Self::Status => Command::GetStatus,
            Self::Branding => Command::GetBranding,
            Self::Jobs => Command::GetJobNames,
            Self::Install => Command::StartInstallation,
            Self::Cancel => Command::CancelInstallation,
            Self::Validate { path } => {
                return (
                    Command::ValidateConfig,
                    payload(json!({ "path": path })),
                );
            }
            Self::Shutdown => Command::Shutdown,
        };
        (command, Payload::new())
    }
}

/// Events followed by `install`
const INSTALL_EVENTS: &[Event] = &[
    Event::JobStarted,
    Event::JobProgress,
    Event::JobCompleted,
    Event::ErrorOccurred,
    Event::InstallationComplete,
];

fn print_json(out: &mut impl Write, value: &serde_json::Value) -> Result<()> {
    writeln!(out, "{}", serde_json::to_string_pretty(value)?)?;
    Ok(())
}

/// Run `action` on a connected client
///
/// Returns whether the action succeeded from the user's point of view
/// (an installation that failed or was cancelled is `false`).
async fn execute(
    client: &IpcClient,
    action: &Action,
    timeout: Option<Duration>,
    out: &mut impl Write,
) -> Result<bool> {
    let (command, args) = action.request();

    if *action != Action::Install {
        let result = client
            .send_command(command, args, timeout)
            .await
            .with_context(|| format!("{command} failed"))?;
        print_json(out, &serde_json::Value::Object(result))?;
        return Ok(true);
    }

    let (tx, rx) = mpsc::unbounded_channel::<Message>();
    let subscriptions: Vec<_> = INSTALL_EVENTS
        .iter()
        .chain([&Event::EngineShutdown])
        .map(|event| {
            let tx = tx.clone();
            client.subscribe_event(*event, move |msg| {
                let _ = tx.send(msg.clone());
            })
        })
        .collect();
    drop(tx);

    let outcome = run_installation(client, args, timeout, rx, out).await;

    for id in subscriptions {
        client.unsubscribe(id);
    }
    outcome
}

/// Start the installation and print its events until INSTALLATION_COMPLETE
///
/// Fails if the engine shuts down or the connection is lost for good first.
async fn run_installation(
    client: &IpcClient,
    args: Payload,
    timeout: Option<Duration>,
    mut rx: mpsc::UnboundedReceiver<Message>,
    out: &mut impl Write,
) -> Result<bool> {
    let mut state = client.state_changes();

    let command = Command::StartInstallation;
    let started = client
        .send_command(command, args, timeout)
        .await
        .with_context(|| format!("{command} failed"))?;
    print_json(out, &serde_json::Value::Object(started))?;

    loop {
        let msg = tokio::select! {
            biased;
            received = rx.recv() => match received {
                Some(msg) => msg,
                None => bail!("event stream closed before the installation finished"),
            },
            lost = async {
                state
                    .wait_for(|s| matches!(s, ClientState::Failed | ClientState::Disconnected))
                    .await
                    .map(|s| *s)
            } => {
                bail!("connection to the engine lost during installation ({lost:?})");
            }
        };

        let Some(event) = msg.event_kind() else {
            continue;
        };
        let data = msg.event_payload().cloned().unwrap_or_default();
        print_json(out, &json!({ "event": event.as_str(), "payload": data }))?;

        match event {
            Event::InstallationComplete => {
                return Ok(data.get("success").and_then(serde_json::Value::as_bool) == Some(true));
            }
            Event::EngineShutdown => bail!("engine shut down before the installation finished"),
            _ => {}
        }
    }
}

async fn run(cli: Cli) -> Result<bool> {
    let mut config = EngineConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    let socket = cli
        .socket
        .clone()
        .or_else(|| config.socket_path.clone())
        .unwrap_or_else(|| {
            if cli.dev {
                default_socket_path()
            } else {
                PathBuf::from(PRODUCTION_SOCKET_PATH)
            }
        });
    config.socket_path = Some(socket);

    let mut client_config = config.client_config();
    if let Some(ms) = cli.timeout_ms {
        client_config.request_timeout_ms = ms;
    }
    let timeout = cli.timeout_ms.map(Duration::from_millis);
    let mut out = std::io::stdout().lock();

    if !cli.launch {
        let client = IpcClient::connect(client_config)
            .await
            .context("Engine not reachable (is it running? try --launch)")?;
        let success = execute(&client, &cli.action, timeout, &mut out).await?;
        client.close();
        return Ok(success);
    }

    let mut launcher_config = config.launcher.clone();
    if let Some(bin) = cli.engine_bin.clone() {
        launcher_config.engine_binary = bin;
    }
    if cli.dev {
        launcher_config.elevate = false;
        launcher_config.engine_args.push("--dev".to_string());
    }

    let mut launcher = Launcher::new(launcher_config, client_config.clone());
    launcher.start().context("Failed to start engine")?;
    launcher
        .wait_for_ready(client_config.connect_timeout() * 6)
        .await
        .context("Engine did not come up")?;

    let outcome = match launcher.client() {
        Some(client) => execute(client, &cli.action, timeout, &mut out).await,
        None => Err(anyhow::anyhow!("launcher has no client")),
    };

    if let Err(e) = launcher.stop().await {
        warn!(error = %e, "Failed to stop engine cleanly");
    }
    debug!(state = ?launcher.state(), "Launcher finished");
    outcome
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("engine_ctl=warn".parse()?)
                .add_directive("engine_core=warn".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if !run(cli).await? {
        bail!("installation did not complete successfully");
    }
    Ok(())
}
