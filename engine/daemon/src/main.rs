//! Engine Daemon
//!
//! The privileged installer engine. Serves the IPC protocol on a Unix
//! socket until SHUTDOWN, SIGTERM or Ctrl+C.
//!
//! # Usage
//!
//! ```bash
//! # Production, started by the launcher through pkexec
//! pkexec engine-daemon --socket /run/installer-engine/engine.sock
//!
//! # Development, as the current user
//! engine-daemon --dev
//!
//! # With verbose logging
//! RUST_LOG=debug engine-daemon --dev
//! ```
//!
//! # Environment Variables
//!
//! - `ENGINE_SOCKET`: Socket path
//! - `ENGINE_CONFIG`: Configuration file
//! - `PKEXEC_UID` / `SUDO_UID`: Invoking user, allowed to connect
//! - `RUST_LOG`: Log level (trace, debug, info, warn, error)
//!
//! # Signals
//!
//! - SIGTERM/SIGINT: Graceful shutdown (ENGINE_SHUTDOWN broadcast, socket removed)

mod runner;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};

use engine_core::transport::PRODUCTION_SOCKET_PATH;
use engine_core::{
    default_socket_path, resolve_config_path, Dispatcher, EngineConfig, Server, ServerHandle,
};

use crate::runner::{JobRunner, RunnerConfig};

/// Privileged installer engine
#[derive(Debug, Parser)]
#[command(name = "engine-daemon", version, about)]
struct Args {
    /// Socket path to listen on
    #[arg(long, env = "ENGINE_SOCKET")]
    socket: Option<PathBuf>,

    /// Configuration file (TOML)
    #[arg(long, env = "ENGINE_CONFIG")]
    config: Option<PathBuf>,

    /// Uid allowed to connect besides root (default: PKEXEC_UID or SUDO_UID)
    #[arg(long)]
    owner_uid: Option<u32>,

    /// Development mode: per-user socket, no root check
    #[arg(long)]
    dev: bool,
}

/// Uid of the user who invoked the elevation helper
fn invoking_uid() -> Option<u32> {
    ["PKEXEC_UID", "SUDO_UID"]
        .iter()
        .find_map(|key| std::env::var(key).ok()?.parse().ok())
}

/// Socket path: flag or env, then config file, then the mode's default
fn resolve_socket(args: &Args, config: &EngineConfig) -> PathBuf {
    args.socket
        .clone()
        .or_else(|| config.socket_path.clone())
        .unwrap_or_else(|| {
            if args.dev {
                default_socket_path()
            } else {
                PathBuf::from(PRODUCTION_SOCKET_PATH)
            }
        })
}

fn load_runner_config(path: Option<&Path>) -> Result<RunnerConfig> {
    let Some(path) = path else {
        return Ok(RunnerConfig::default());
    };
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read configuration {}", path.display()))?;
    RunnerConfig::from_toml_str(&content)
        .with_context(|| format!("Invalid [runner] section in {}", path.display()))
}

/// Trigger shutdown on Ctrl+C or SIGTERM
fn spawn_signal_handler(handle: ServerHandle) {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                error!(error = %e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        };

        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    error!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        tokio::select! {
            () = ctrl_c => info!("Received Ctrl+C, shutting down"),
            () = terminate => info!("Received SIGTERM, shutting down"),
        }

        handle.shutdown();
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("engine_daemon=info".parse()?)
                .add_directive("engine_core=info".parse()?),
        )
        .with_target(true)
        .init();

    let args = Args::parse();

    info!("Starting engine daemon");
    info!("PID: {}", std::process::id());

    if !args.dev && !nix::unistd::geteuid().is_root() {
        warn!("Not running as root; privileged jobs will fail (use --dev for development)");
    }

    // Both sections come from the same file, including the default one
    let config_path = resolve_config_path(args.config.as_deref());
    let mut config =
        EngineConfig::load(config_path.as_deref()).context("Failed to load configuration")?;
    let runner_config = load_runner_config(config_path.as_deref())?;

    config.socket_path = Some(resolve_socket(&args, &config));
    let mut server_config = config.server_config();
    server_config.owner_uid = args.owner_uid.or_else(invoking_uid).or(server_config.owner_uid);

    info!(
        path = ?server_config.socket_path,
        owner_uid = ?server_config.owner_uid,
        roots = ?server_config.security.allowed_roots,
        "Configuration loaded"
    );

    let server = Server::bind(server_config).map_err(|e| {
        error!(error = %e, "Failed to bind socket");
        anyhow::anyhow!(
            "Failed to listen: {e}. Check if another engine is running or if you have permission to create the socket."
        )
    })?;
    let handle = server.handle();

    let runner = JobRunner::new(runner_config, handle.clone());
    let mut dispatcher = Dispatcher::with_builtins();
    runner.register(&mut dispatcher);
    info!(commands = ?dispatcher.commands(), "Handlers registered");

    spawn_signal_handler(handle);

    info!("Ready to accept connections");
    server.serve(dispatcher).await;

    info!("Engine daemon stopped cleanly");
    Ok(())
}
