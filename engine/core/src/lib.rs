//! Engine Core - IPC between the installer UI and its privileged engine
//!
//! The installer is split into an unprivileged surface (the UI) and a
//! privileged engine that does the actual work. This crate is everything in
//! between: the wire protocol, the socket transport, request validation,
//! command dispatch, the server and client, and the launcher that starts the
//! engine with elevated rights.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────── unprivileged ────────────────────────────┐
//! │   UI / ctl                                                            │
//! │  ┌──────────┐    start/stop    ┌──────────────────────────────────┐  │
//! │  │ Launcher │ ───────────────► │ pkexec engine-daemon --socket …  │  │
//! │  └────┬─────┘                  └──────────────────────────────────┘  │
//! │       │ owns                                                          │
//! │  ┌────┴──────┐  request ──►                                           │
//! │  │ IpcClient │  ◄── response / event                                  │
//! │  └────┬──────┘                                                        │
//! └───────┼───────────────────────────────────────────────────────────────┘
//!         │  Unix socket, 4-byte length + JSON frames
//! ┌───────┼──────────────────────────── privileged ───────────────────────┐
//! │  ┌────┴─────┐   ┌───────────────────┐   ┌────────────┐   ┌──────────┐ │
//! │  │  Server  │──►│ security::validate│──►│ Dispatcher │──►│ handlers │ │
//! │  └────┬─────┘   └───────────────────┘   └────────────┘   └──────────┘ │
//! │       │ ServerHandle::broadcast_event (progress, completion)          │
//! └───────┴───────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`Message`]: Request, response, or event on the wire
//! - [`Server`] / [`ServerHandle`]: Accept loop and broadcast/shutdown handle
//! - [`Dispatcher`]: Command to handler table, owned by the server
//! - [`IpcClient`]: Correlating client with event subscriptions and reconnect
//! - [`Launcher`]: Engine process lifecycle
//! - [`EngineConfig`]: TOML + environment configuration
//!
//! # Quick Start
//!
//! ```ignore
//! use engine_core::{Command, Dispatcher, IpcClient, ClientConfig, Server, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let server = Server::bind(ServerConfig::new("/tmp/engine.sock"))?;
//!     tokio::spawn(server.serve(Dispatcher::with_builtins()));
//!
//!     let client = IpcClient::connect(ClientConfig::new("/tmp/engine.sock")).await?;
//!     let pong = client.send_command(Command::Ping, Default::default(), None).await?;
//!     assert_eq!(pong["pong"], true);
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`protocol`]: Message model and JSON encoding
//! - [`transport`]: Framing and Unix socket setup
//! - [`security`]: Request validation at the trust boundary
//! - [`dispatcher`]: Command handlers
//! - [`server`]: Engine-side socket server
//! - [`client`]: Surface-side client
//! - [`launcher`]: Privileged process lifecycle
//! - [`config`]: Configuration file and environment overrides

#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod client;
pub mod config;
pub mod dispatcher;
pub mod launcher;
pub mod protocol;
pub mod security;
pub mod server;
pub mod transport;

// Re-exports for convenience
pub use client::{
    ClientConfig, ClientState, EventCallback, IpcClient, IpcError, ReconnectPolicy,
    ResponseCallback, SubscriptionId,
};
pub use config::{
    default_config_path, load_config_from_path, resolve_config_path, ConfigError, EngineConfig,
};
pub use dispatcher::{
    async_handler_fn, handler_fn, CommandHandler, Dispatcher, HandlerError, HandlerResult,
};
pub use launcher::{LaunchMode, Launcher, LauncherConfig, LauncherError, ProcessState};
pub use protocol::{
    payload, Body, Command, ErrorBody, ErrorCode, Event, Message, MessageType, Payload,
    ProtocolError, PROTOCOL_VERSION,
};
pub use security::{resolve_path, validate_request, SecurityConfig, SecurityError};
pub use server::{
    BroadcastResult, ConnectionId, ConnectionStats, Server, ServerConfig, ServerHandle,
};
pub use transport::{default_socket_path, TransportError, MAX_FRAME_SIZE};
