//! Engine Server
//!
//! Accepts surface connections on the engine's Unix socket, validates and
//! dispatches their requests, and broadcasts events to every connection.
//!
//! # Multi-Connection Architecture
//!
//! ```text
//!                        Server (accept loop)
//!                               │
//!          ┌────────────────────┼────────────────────┐
//!          │                    │                    │
//!      conn-1               conn-2               conn-3
//!   ┌──────────────┐    ┌──────────────┐    ┌──────────────┐
//!   │ read         │    │ read         │    │ read         │
//!   │  → validate  │    │  → validate  │    │  → validate  │
//!   │  → dispatch  │    │  → dispatch  │    │  → dispatch  │
//!   │  → queue ────┼─┐  │  → queue     │    │  → queue     │
//!   │ write ◄──────┘ │  │ write        │    │ write        │
//!   └──────────────┘    └──────────────┘    └──────────────┘
//!          ▲                    ▲                    ▲
//!          └────── ServerHandle::broadcast_event ────┘
//! ```
//!
//! Each connection reads one request at a time and awaits its dispatch
//! before reading the next, so responses leave in request order. Responses
//! and events share the connection's bounded queue; a single writer drains
//! it, so frames never interleave.
//!
//! # Shutdown
//!
//! 1. Listener dropped (no new connections)
//! 2. `ENGINE_SHUTDOWN` broadcast
//! 3. Connections drain: in-flight dispatch finishes, queued frames flush
//! 4. After `shutdown_grace`, remaining connections are aborted
//! 5. Socket file unlinked

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinSet};
use tracing::{debug, error, info, warn, Instrument};

use crate::dispatcher::Dispatcher;
use crate::protocol::{payload, Command, Event, Message, Payload, PROTOCOL_VERSION};
use crate::security::{self, SecurityConfig};
use crate::transport::socket::peer_allowed;
use crate::transport::{
    bind_socket, default_socket_path, read_message, write_message, SocketGuard, TransportError,
};

/// Server configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Socket path to bind
    pub socket_path: PathBuf,
    /// Maximum number of concurrent connections (default: 64)
    pub max_connections: usize,
    /// Per-connection outbound queue capacity (default: 256)
    pub connection_channel_capacity: usize,
    /// Per-recipient bound on a broadcast enqueue, in milliseconds (default: 500)
    pub broadcast_timeout_ms: u64,
    /// How long connections may drain on shutdown, in milliseconds (default: 5000)
    pub shutdown_grace_ms: u64,
    /// Uid allowed to connect besides our own and root; the socket is chowned to it
    pub owner_uid: Option<u32>,
    /// Request validation settings (the `[security]` section)
    #[serde(skip)]
    pub security: SecurityConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            max_connections: 64,
            connection_channel_capacity: 256,
            broadcast_timeout_ms: 500,
            shutdown_grace_ms: 5000,
            owner_uid: None,
            security: SecurityConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Configuration for `socket_path` with default settings
    #[must_use]
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            ..Self::default()
        }
    }

    /// Broadcast bound as a `Duration`
    #[must_use]
    pub fn broadcast_timeout(&self) -> Duration {
        Duration::from_millis(self.broadcast_timeout_ms)
    }

    /// Shutdown grace as a `Duration`
    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Unique identifier for a client connection
///
/// Stable for the lifetime of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Registry entry for one live connection
struct ConnectionEntry {
    /// Outbound queue drained by the connection's writer
    tx: mpsc::Sender<Message>,
    /// Peer uid from `SO_PEERCRED`
    peer_uid: u32,
    /// When the connection was accepted
    connected_at: Instant,
    /// Set once the connection task is spawned
    abort_handle: Option<AbortHandle>,
}

/// Result of a broadcast operation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastResult {
    /// Number of connections that accepted the event
    pub successful: usize,
    /// Number of connections that were closed or too slow
    pub failed: usize,
    /// IDs of connections that failed
    pub failed_ids: Vec<ConnectionId>,
}

impl BroadcastResult {
    /// Check if all recipients received the event
    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }

    /// Check if no recipient received the event
    #[must_use]
    pub fn all_failed(&self) -> bool {
        self.successful == 0
    }
}

/// Snapshot of one connection
#[derive(Debug, Clone)]
pub struct ConnectionStats {
    /// Connection id
    pub id: ConnectionId,
    /// Peer uid
    pub peer_uid: u32,
    /// Connection uptime in seconds
    pub uptime_secs: u64,
}

/// State shared between the accept loop, connections and handles
struct Shared {
    config: ServerConfig,
    connections: DashMap<ConnectionId, ConnectionEntry>,
    /// Set once shutdown is requested; stops the accept loop
    shutdown_tx: watch::Sender<bool>,
    /// Set after `ENGINE_SHUTDOWN` went out; tells connections to drain
    drain_tx: watch::Sender<bool>,
}

impl Shared {
    fn request_shutdown(&self) {
        if !self.shutdown_tx.send_replace(true) {
            info!("Shutdown requested");
        }
    }

    async fn broadcast(&self, message: Message) -> BroadcastResult {
        // Clone the senders so no map shard is locked across .await
        let targets: Vec<(ConnectionId, mpsc::Sender<Message>)> = self
            .connections
            .iter()
            .map(|entry| (*entry.key(), entry.tx.clone()))
            .collect();

        let timeout = self.config.broadcast_timeout();
        let sends = targets.into_iter().map(|(id, tx)| {
            let message = message.clone();
            async move {
                let delivered = matches!(
                    tokio::time::timeout(timeout, tx.send(message)).await,
                    Ok(Ok(()))
                );
                (id, delivered)
            }
        });

        let mut result = BroadcastResult::default();
        for (id, delivered) in join_all(sends).await {
            if delivered {
                result.successful += 1;
            } else {
                debug!(conn_id = %id, "Skipping closed or slow recipient");
                result.failed += 1;
                result.failed_ids.push(id);
            }
        }
        result
    }
}

/// Cloneable handle for interacting with a running server
///
/// This is the job runner's way to push events and the daemon's way to
/// request shutdown.
#[derive(Clone)]
pub struct ServerHandle {
    shared: Arc<Shared>,
}

impl fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerHandle")
            .field("socket_path", &self.shared.config.socket_path)
            .field("connection_count", &self.shared.connections.len())
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}

impl ServerHandle {
    /// Send one event to every connection
    ///
    /// Each recipient gets up to `broadcast_timeout` to accept the event;
    /// closed or slow recipients are skipped and reported.
    pub async fn broadcast_event(&self, event: Event, payload: Payload) -> BroadcastResult {
        let result = self.shared.broadcast(Message::event(event, payload)).await;
        debug!(
            %event,
            successful = result.successful,
            failed = result.failed,
            "Event broadcast"
        );
        result
    }

    /// Begin graceful shutdown
    ///
    /// Returns immediately; `Server::serve` completes once draining ends.
    pub fn shutdown(&self) {
        self.shared.request_shutdown();
    }

    /// Whether shutdown has been requested
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        *self.shared.shutdown_tx.borrow()
    }

    /// Number of live connections
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.shared.connections.len()
    }

    /// Per-connection statistics
    #[must_use]
    pub fn connection_stats(&self) -> Vec<ConnectionStats> {
        let mut stats: Vec<ConnectionStats> = self
            .shared
            .connections
            .iter()
            .map(|entry| ConnectionStats {
                id: *entry.key(),
                peer_uid: entry.peer_uid,
                uptime_secs: entry.connected_at.elapsed().as_secs(),
            })
            .collect();
        stats.sort_by_key(|s| s.id);
        stats
    }

    /// Forcibly close every connection without sending events
    ///
    /// Returns the number of connections closed.
    pub fn disconnect_all(&self) -> usize {
        let ids: Vec<ConnectionId> = self.shared.connections.iter().map(|e| *e.key()).collect();
        let mut closed = 0;
        for id in ids {
            if let Some((_, entry)) = self.shared.connections.remove(&id) {
                if let Some(handle) = entry.abort_handle {
                    handle.abort();
                }
                info!(conn_id = %id, "Connection forcibly closed");
                closed += 1;
            }
        }
        closed
    }

    /// Socket path the server is bound to
    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.shared.config.socket_path
    }

    /// Validation settings applied to every request
    #[must_use]
    pub fn security(&self) -> &SecurityConfig {
        &self.shared.config.security
    }
}

/// A bound, not yet serving, engine server
pub struct Server {
    listener: UnixListener,
    guard: SocketGuard,
    shared: Arc<Shared>,
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("socket_path", &self.shared.config.socket_path)
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Prepare the socket endpoint and bind
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::AddressInUse` if a live server owns the path,
    /// or another `TransportError` if the endpoint cannot be prepared.
    pub fn bind(config: ServerConfig) -> Result<Self, TransportError> {
        let (listener, guard) = bind_socket(&config.socket_path, config.owner_uid)?;

        let (shutdown_tx, _) = watch::channel(false);
        let (drain_tx, _) = watch::channel(false);

        Ok(Self {
            listener,
            guard,
            shared: Arc::new(Shared {
                config,
                connections: DashMap::new(),
                shutdown_tx,
                drain_tx,
            }),
        })
    }

    /// Get a handle for broadcasting and shutdown
    #[must_use]
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Socket path this server is bound to
    #[must_use]
    pub fn socket_path(&self) -> &Path {
        self.guard.path()
    }

    /// Serve connections until shutdown, then drain and release the socket
    ///
    /// The dispatcher is shared immutably by every connection.
    pub async fn serve(self, dispatcher: Dispatcher) {
        let Self {
            listener,
            guard,
            shared,
        } = self;
        let dispatcher = Arc::new(dispatcher);
        let mut shutdown_rx = shared.shutdown_tx.subscribe();
        let mut tasks = JoinSet::new();

        info!(
            path = ?guard.path(),
            max_connections = shared.config.max_connections,
            commands = ?dispatcher.commands(),
            "Engine server accepting connections"
        );

        loop {
            tokio::select! {
                // The watch guard must not live across the awaits below
                () = async { let _ = shutdown_rx.wait_for(|requested| *requested).await; } => {
                    info!("Shutdown requested, stopping accept loop");
                    break;
                }

                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        admit(stream, &shared, &dispatcher, &mut tasks);
                    }
                    Err(e) => {
                        error!(error = %e, "Accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },

                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!(error = %e, "Connection task panicked");
                        }
                    }
                }
            }
        }

        drop(listener);
        shutdown_connections(&shared, &mut tasks).await;
        drop(guard);

        info!("Engine server stopped");
    }
}

/// Check limits and credentials, register, and spawn a connection task
fn admit(
    stream: UnixStream,
    shared: &Arc<Shared>,
    dispatcher: &Arc<Dispatcher>,
    tasks: &mut JoinSet<()>,
) {
    if shared.connections.len() >= shared.config.max_connections {
        warn!(
            max_connections = shared.config.max_connections,
            "Connection limit reached, rejecting new connection"
        );
        return;
    }

    let peer_uid = match stream.peer_cred() {
        Ok(cred) => cred.uid(),
        Err(e) => {
            warn!(error = %e, "Failed to read peer credentials, rejecting connection");
            return;
        }
    };

    if !peer_allowed(peer_uid, shared.config.owner_uid) {
        warn!(
            peer_uid,
            owner_uid = ?shared.config.owner_uid,
            "Rejecting connection from different user"
        );
        return;
    }

    let conn_id = ConnectionId::next();
    let (tx, rx) = mpsc::channel(shared.config.connection_channel_capacity.max(1));

    // The queue is empty, so this cannot fail for lack of capacity
    let ready = Message::event(
        Event::EngineReady,
        payload(json!({ "version": PROTOCOL_VERSION })),
    );
    let _ = tx.try_send(ready);

    shared.connections.insert(
        conn_id,
        ConnectionEntry {
            tx: tx.clone(),
            peer_uid,
            connected_at: Instant::now(),
            abort_handle: None,
        },
    );

    info!(
        conn_id = %conn_id,
        peer_uid,
        active_connections = shared.connections.len(),
        "New connection accepted"
    );

    let connection = Connection {
        id: conn_id,
        shared: Arc::clone(shared),
        dispatcher: Arc::clone(dispatcher),
        violations: 0,
    };
    let abort_handle = tasks.spawn(
        connection
            .run(stream, tx, rx)
            .instrument(tracing::info_span!("connection", %conn_id)),
    );

    if let Some(mut entry) = shared.connections.get_mut(&conn_id) {
        entry.abort_handle = Some(abort_handle);
    }
}

/// Graceful part of shutdown, after the listener is gone
async fn shutdown_connections(shared: &Shared, tasks: &mut JoinSet<()>) {
    info!(
        active_connections = shared.connections.len(),
        "Initiating graceful shutdown"
    );

    let result = shared
        .broadcast(Message::event(
            Event::EngineShutdown,
            payload(json!({ "reason": "engine shutting down" })),
        ))
        .await;
    debug!(
        successful = result.successful,
        failed = result.failed,
        "Shutdown event broadcast"
    );

    shared.drain_tx.send_replace(true);

    let grace = shared.config.shutdown_grace();
    let drained = tokio::time::timeout(grace, async {
        while tasks.join_next().await.is_some() {}
    })
    .await;

    if drained.is_err() {
        warn!(
            remaining = tasks.len(),
            grace_ms = shared.config.shutdown_grace_ms,
            "Grace period elapsed, aborting remaining connections"
        );
        tasks.shutdown().await;
    }

    shared.connections.clear();
}

/// Per-connection state owned by its task
struct Connection {
    id: ConnectionId,
    shared: Arc<Shared>,
    dispatcher: Arc<Dispatcher>,
    /// Security rejections so far
    violations: u32,
}

impl Connection {
    async fn run(
        mut self,
        stream: UnixStream,
        tx: mpsc::Sender<Message>,
        mut rx: mpsc::Receiver<Message>,
    ) {
        debug!("Connection handler started");

        let (mut reader, mut writer) = stream.into_split();
        let mut drain_rx = self.shared.drain_tx.subscribe();

        let read_loop = async {
            loop {
                let received = tokio::select! {
                    biased;
                    () = async { let _ = drain_rx.wait_for(|drain| *drain).await; } => {
                        debug!("Draining connection");
                        break;
                    }
                    received = read_message(&mut reader) => received,
                };

                let request = match received {
                    Ok(message) => message,
                    Err(TransportError::ConnectionClosed) => {
                        info!("Client disconnected");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "Receive failed, closing connection");
                        break;
                    }
                };

                let (response, next) = self.process(&request).await;
                if tx.send(response).await.is_err() {
                    debug!("Writer gone, closing connection");
                    break;
                }
                match next {
                    Next::Continue => {}
                    Next::Close => break,
                    // Queued after the response, so the caller sees it first
                    Next::Shutdown => self.shared.request_shutdown(),
                }
            }

            // Our registry sender goes with the entry; the writer stops once
            // every queued frame is flushed
            self.shared.connections.remove(&self.id);
            drop(tx);
        };

        let write_loop = async {
            while let Some(message) = rx.recv().await {
                match write_message(&mut writer, &message).await {
                    Ok(()) => {}
                    Err(TransportError::Protocol(e)) => {
                        warn!(error = %e, id = %message.id, "Dropping unencodable frame");
                    }
                    Err(TransportError::ConnectionClosed) => {
                        debug!("Peer closed while writing");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "Write failed");
                        break;
                    }
                }
            }
        };

        tokio::join!(read_loop, write_loop);

        info!(
            active_connections = self.shared.connections.len(),
            "Connection handler finished"
        );
    }

    /// Validate and dispatch one request
    async fn process(&mut self, request: &Message) -> (Message, Next) {
        let security = &self.shared.config.security;

        match security::validate_request(request, security) {
            Ok(command) => {
                let response = self.dispatcher.dispatch(request).await;
                if command == Command::Shutdown {
                    info!("SHUTDOWN command received");
                    (response, Next::Shutdown)
                } else {
                    (response, Next::Continue)
                }
            }
            Err(e) => {
                self.violations += 1;
                warn!(
                    command = request.command_name().unwrap_or_default(),
                    id = %request.id,
                    code = %e.code(),
                    reason = %e,
                    violations = self.violations,
                    "Request rejected"
                );

                let response = Message::response_error(request, e.code(), e.to_string());
                let limit = security.max_violations;
                if limit > 0 && self.violations >= limit {
                    warn!(violations = self.violations, "Too many rejected requests, disconnecting");
                    (response, Next::Close)
                } else {
                    (response, Next::Continue)
                }
            }
        }
    }
}

/// What a connection does after sending a response
enum Next {
    Continue,
    Close,
    Shutdown,
}
