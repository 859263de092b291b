//! IPC Client
//!
//! Surface-side connection to the engine: request/response correlation,
//! asynchronous requests with callbacks, event subscriptions, and automatic
//! reconnection.
//!
//! # Tasks
//!
//! ```text
//!   caller ──send_command──► pending table ──┐
//!          ──────────────► outbound queue ───┼──► writer ──► socket
//!                                            │
//!   socket ──► reader ──► RESPONSE: pending table (waiter or callback)
//!                     └─► EVENT:    subscriptions
//! ```
//!
//! One supervisor task owns the socket. It runs the reader and writer for
//! the current session and, when the session ends unexpectedly, fails every
//! pending call and reconnects with exponential backoff. Callbacks run on
//! the supervisor task and should return quickly.
//!
//! The client does not reconnect after the engine announced
//! `ENGINE_SHUTDOWN`, or after [`IpcClient::close`].

use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::protocol::{Body, Command, ErrorCode, Event, Message, Payload, ProtocolError};
use crate::transport::{default_socket_path, write_message, FrameDecoder, TransportError};

/// Reconnection backoff schedule
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Delay before the first attempt, in milliseconds (default: 200)
    pub initial_delay_ms: u64,
    /// Factor applied to the delay after each failed attempt (default: 2)
    pub multiplier: u32,
    /// Upper bound on the delay, in milliseconds (default: 2000)
    pub max_delay_ms: u64,
    /// Attempts before giving up (default: 5, 0 = never reconnect)
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 200,
            multiplier: 2,
            max_delay_ms: 2000,
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before attempt number `attempt` (0-based)
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = u64::from(self.multiplier.max(1)).saturating_pow(attempt);
        let ms = self
            .initial_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }
}

/// Client configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Engine socket path
    pub socket_path: PathBuf,
    /// Bound on each connection attempt, in milliseconds (default: 5000)
    pub connect_timeout_ms: u64,
    /// Default request timeout, in milliseconds (default: 30000)
    pub request_timeout_ms: u64,
    /// Reconnect after an unexpected loss (default: true)
    pub auto_reconnect: bool,
    /// Outbound queue capacity (default: 256)
    pub channel_capacity: usize,
    /// Backoff schedule
    pub reconnect: ReconnectPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            connect_timeout_ms: 5000,
            request_timeout_ms: 30_000,
            auto_reconnect: true,
            channel_capacity: 256,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl ClientConfig {
    /// Configuration for `socket_path` with default settings
    #[must_use]
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            ..Self::default()
        }
    }

    /// Connect timeout as a `Duration`
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Request timeout as a `Duration`
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Client-side failures
#[derive(Debug, Error)]
pub enum IpcError {
    /// No response within the timeout
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Not connected, or the connection was lost before the response
    #[error("connection error: {0}")]
    Connection(String),

    /// The engine answered with an error response
    #[error("{code}: {message}")]
    Remote {
        /// Error code from the response
        code: ErrorCode,
        /// Reason from the response
        message: String,
    },

    /// Transport failure while connecting
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Connectivity as seen by the client
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientState {
    /// A session is established
    Connected,
    /// The session was lost; the supervisor is retrying
    Reconnecting,
    /// Closed by the caller or by the engine's shutdown notice
    Disconnected,
    /// Reconnection attempts are exhausted
    Failed,
}

/// Callback for an asynchronous request
pub type ResponseCallback = Box<dyn FnOnce(Result<Payload, IpcError>) + Send + 'static>;

/// Callback for a subscribed event
pub type EventCallback = Arc<dyn Fn(&Message) + Send + Sync + 'static>;

/// Handle for removing a subscription
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Someone waiting for a response
enum Pending {
    Waiter(oneshot::Sender<Result<Payload, IpcError>>),
    Callback(ResponseCallback),
}

impl Pending {
    fn complete(self, outcome: Result<Payload, IpcError>) {
        match self {
            Self::Waiter(tx) => {
                let _ = tx.send(outcome);
            }
            Self::Callback(callback) => {
                if std::panic::catch_unwind(AssertUnwindSafe(|| callback(outcome))).is_err() {
                    warn!("Response callback panicked");
                }
            }
        }
    }
}

/// State shared between the caller-facing API and the supervisor
struct Inner {
    config: ClientConfig,
    pending: Mutex<HashMap<String, Pending>>,
    subscriptions: Mutex<HashMap<Event, Vec<(SubscriptionId, EventCallback)>>>,
    /// Queue into the current session's writer
    outbound: Mutex<Option<mpsc::Sender<Message>>>,
    state: watch::Sender<ClientState>,
    next_subscription: AtomicU64,
    sessions: AtomicU64,
    closing: AtomicBool,
    engine_shutdown: AtomicBool,
}

impl Inner {
    /// Open a fresh outbound queue for a new session
    fn install_session(&self) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        *self.outbound.lock() = Some(tx);
        self.sessions.fetch_add(1, Ordering::Relaxed);
        rx
    }

    fn set_state(&self, state: ClientState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(?previous, current = ?state, "Client state changed");
        }
    }

    async fn enqueue(&self, message: Message) -> Result<(), IpcError> {
        let tx = self
            .outbound
            .lock()
            .clone()
            .ok_or_else(|| IpcError::Connection("not connected".into()))?;
        tx.send(message)
            .await
            .map_err(|_| IpcError::Connection("connection lost".into()))
    }

    /// Fail every outstanding call
    fn fail_pending(&self, reason: &str) {
        let drained: Vec<(String, Pending)> = self.pending.lock().drain().collect();
        if !drained.is_empty() {
            debug!(count = drained.len(), reason, "Failing pending requests");
        }
        for (_, pending) in drained {
            pending.complete(Err(IpcError::Connection(reason.to_string())));
        }
    }

    fn route(&self, message: Message) {
        match &message.body {
            Body::Response { result, error, .. } => {
                let Some(pending) = self.pending.lock().remove(&message.id) else {
                    debug!(id = %message.id, "Response for unknown or expired request");
                    return;
                };
                let outcome = match error {
                    Some(e) => Err(IpcError::Remote {
                        code: e.code,
                        message: e.message.clone(),
                    }),
                    None => Ok(result.clone()),
                };
                pending.complete(outcome);
            }
            Body::Event { event, .. } => {
                let Some(kind) = message.event_kind() else {
                    debug!(event = %event, "Ignoring unknown event");
                    return;
                };
                if kind == Event::EngineShutdown {
                    info!("Engine announced shutdown");
                    self.engine_shutdown.store(true, Ordering::SeqCst);
                }

                // Snapshot so callbacks may (un)subscribe without deadlocking
                let callbacks: Vec<EventCallback> = self
                    .subscriptions
                    .lock()
                    .get(&kind)
                    .map(|subs| subs.iter().map(|(_, cb)| Arc::clone(cb)).collect())
                    .unwrap_or_default();
                for callback in callbacks {
                    if std::panic::catch_unwind(AssertUnwindSafe(|| callback(&message))).is_err() {
                        warn!(event = %kind, "Event callback panicked");
                    }
                }
            }
            Body::Request { command, .. } => {
                warn!(command = %command, "Ignoring request sent by the engine");
            }
        }
    }

    async fn connect_stream(&self) -> Result<UnixStream, IpcError> {
        let path = &self.config.socket_path;
        let timeout = self.config.connect_timeout();
        match tokio::time::timeout(timeout, UnixStream::connect(path)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(TransportError::ConnectionFailed(format!(
                "Failed to connect to {path:?}: {e}"
            ))
            .into()),
            Err(_) => Err(TransportError::ConnectionFailed(format!(
                "Connecting to {path:?} timed out after {timeout:?}"
            ))
            .into()),
        }
    }
}

/// Connection to the engine
///
/// Dropping the client aborts its background task and closes the socket.
pub struct IpcClient {
    inner: Arc<Inner>,
    supervisor: JoinHandle<()>,
}

impl fmt::Debug for IpcClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IpcClient")
            .field("socket_path", &self.inner.config.socket_path)
            .field("state", &self.state())
            .field("pending", &self.inner.pending.lock().len())
            .finish()
    }
}

impl IpcClient {
    /// Connect to the engine
    ///
    /// # Errors
    ///
    /// Returns `IpcError::Transport` if the socket cannot be reached within
    /// `connect_timeout`.
    pub async fn connect(config: ClientConfig) -> Result<Self, IpcError> {
        let (state, _) = watch::channel(ClientState::Connected);
        let inner = Arc::new(Inner {
            config,
            pending: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
            outbound: Mutex::new(None),
            state,
            next_subscription: AtomicU64::new(1),
            sessions: AtomicU64::new(0),
            closing: AtomicBool::new(false),
            engine_shutdown: AtomicBool::new(false),
        });

        let stream = inner.connect_stream().await?;
        let rx = inner.install_session();
        info!(path = ?inner.config.socket_path, "Connected to engine");

        let supervisor = tokio::spawn(supervise(Arc::clone(&inner), stream, rx));
        Ok(Self { inner, supervisor })
    }

    /// Send a request and wait for its response
    ///
    /// `timeout` defaults to the configured request timeout.
    ///
    /// # Errors
    ///
    /// - `IpcError::Timeout` if no response arrives in time
    /// - `IpcError::Remote` if the engine answered with an error
    /// - `IpcError::Connection` if not connected or the connection is lost
    pub async fn send_command(
        &self,
        command: Command,
        args: Payload,
        timeout: Option<Duration>,
    ) -> Result<Payload, IpcError> {
        let timeout = timeout.unwrap_or_else(|| self.inner.config.request_timeout());
        let request = Message::request(command, args);
        let id = request.id.clone();

        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(id.clone(), Pending::Waiter(tx));

        // One deadline covers both a full outbound queue and the reply
        let exchange = async {
            self.inner.enqueue(request).await?;
            debug!(%command, %id, "Request sent");
            rx.await
                .map_err(|_| IpcError::Connection("client shut down".into()))?
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => {
                self.inner.pending.lock().remove(&id);
                Err(e)
            }
            Err(_) => {
                self.inner.pending.lock().remove(&id);
                warn!(%command, %id, ?timeout, "Request timed out");
                Err(IpcError::Timeout(timeout))
            }
        }
    }

    /// Send a request without waiting
    ///
    /// `callback` runs on the client's reader task with the outcome, or with
    /// `IpcError::Connection` if the connection is lost first. Returns the
    /// request's correlation id.
    ///
    /// # Errors
    ///
    /// Returns `IpcError::Connection` if the request cannot be queued; the
    /// callback is not invoked in that case.
    pub async fn send_command_async<F>(
        &self,
        command: Command,
        args: Payload,
        callback: F,
    ) -> Result<String, IpcError>
    where
        F: FnOnce(Result<Payload, IpcError>) + Send + 'static,
    {
        let request = Message::request(command, args);
        let id = request.id.clone();

        self.inner
            .pending
            .lock()
            .insert(id.clone(), Pending::Callback(Box::new(callback)));

        if let Err(e) = self.inner.enqueue(request).await {
            self.inner.pending.lock().remove(&id);
            return Err(e);
        }
        debug!(%command, %id, "Async request sent");
        Ok(id)
    }

    /// Invoke `callback` for every `event` the engine broadcasts
    ///
    /// Subscriptions survive reconnection.
    pub fn subscribe_event<F>(&self, event: Event, callback: F) -> SubscriptionId
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.inner.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.inner
            .subscriptions
            .lock()
            .entry(event)
            .or_default()
            .push((id, Arc::new(callback)));
        debug!(%event, subscription = %id, "Subscribed");
        id
    }

    /// Remove a subscription
    ///
    /// Returns `false` if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscriptions = self.inner.subscriptions.lock();
        for subs in subscriptions.values_mut() {
            if let Some(pos) = subs.iter().position(|(sub, _)| *sub == id) {
                subs.remove(pos);
                return true;
            }
        }
        false
    }

    /// Current connectivity
    #[must_use]
    pub fn state(&self) -> ClientState {
        *self.inner.state.borrow()
    }

    /// Number of sessions established so far (1 + successful reconnections)
    #[must_use]
    pub fn sessions(&self) -> u64 {
        self.inner.sessions.load(Ordering::Relaxed)
    }

    /// Wait until a session is established
    ///
    /// Returns `false` on timeout, or once the client is closed or failed.
    pub async fn wait_until_connected(&self, timeout: Duration) -> bool {
        let mut rx = self.inner.state.subscribe();
        let wait = rx.wait_for(|s| {
            matches!(
                s,
                ClientState::Connected | ClientState::Disconnected | ClientState::Failed
            )
        });
        let connected = match tokio::time::timeout(timeout, wait).await {
            Ok(Ok(state)) => *state == ClientState::Connected,
            _ => false,
        };
        connected
    }

    /// Receiver that observes every connectivity change
    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<ClientState> {
        self.inner.state.subscribe()
    }

    /// Close the connection
    ///
    /// Pending calls fail with `IpcError::Connection`; no reconnection is
    /// attempted.
    pub fn close(&self) {
        if self.inner.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.supervisor.abort();
        self.inner.outbound.lock().take();
        self.inner.fail_pending("client closed");
        self.inner.set_state(ClientState::Disconnected);
        info!("Client closed");
    }
}

impl Drop for IpcClient {
    fn drop(&mut self) {
        self.supervisor.abort();
        self.inner.outbound.lock().take();
        self.inner.fail_pending("client dropped");
    }
}

/// Own the socket: run sessions and reconnect after unexpected loss
async fn supervise(inner: Arc<Inner>, mut stream: UnixStream, mut rx: mpsc::Receiver<Message>) {
    loop {
        run_session(&inner, stream, rx).await;
        inner.outbound.lock().take();

        let next = if inner.closing.load(Ordering::SeqCst) {
            ClientState::Disconnected
        } else if inner.engine_shutdown.load(Ordering::SeqCst) {
            info!("Engine shut down, not reconnecting");
            ClientState::Disconnected
        } else if !inner.config.auto_reconnect || inner.config.reconnect.max_attempts == 0 {
            info!("Connection lost, reconnection disabled");
            ClientState::Failed
        } else {
            ClientState::Reconnecting
        };

        // State first, so a caller woken by the failure observes it
        inner.set_state(next);
        inner.fail_pending("connection lost");
        if next != ClientState::Reconnecting {
            return;
        }

        match reconnect(&inner).await {
            Some(s) => {
                stream = s;
                rx = inner.install_session();
                inner.set_state(ClientState::Connected);
            }
            None => {
                inner.set_state(ClientState::Failed);
                return;
            }
        }
    }
}

async fn reconnect(inner: &Inner) -> Option<UnixStream> {
    let policy = &inner.config.reconnect;

    for attempt in 0..policy.max_attempts {
        let delay = policy.delay(attempt);
        debug!(attempt = attempt + 1, ?delay, "Waiting before reconnect");
        tokio::time::sleep(delay).await;

        match inner.connect_stream().await {
            Ok(stream) => {
                info!(attempt = attempt + 1, "Reconnected to engine");
                return Some(stream);
            }
            Err(e) => {
                warn!(attempt = attempt + 1, error = %e, "Reconnect attempt failed");
            }
        }
    }

    warn!(
        attempts = policy.max_attempts,
        "Giving up on reconnecting to engine"
    );
    None
}

/// Run one session until either direction fails
async fn run_session(inner: &Inner, stream: UnixStream, rx: mpsc::Receiver<Message>) {
    let (reader, writer) = stream.into_split();

    tokio::select! {
        () = read_loop(inner, reader) => {}
        () = write_loop(writer, rx) => {}
    }
}

async fn read_loop(inner: &Inner, mut reader: OwnedReadHalf) {
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; 8192];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                info!("Connection closed by engine");
                return;
            }
            Ok(n) => {
                decoder.push(&buf[..n]);

                loop {
                    match decoder.decode() {
                        Ok(Some(message)) => inner.route(message),
                        Ok(None) => break,
                        Err(TransportError::Protocol(e @ ProtocolError::FrameTooLarge { .. })) => {
                            warn!(error = %e, "Oversized frame from engine, dropping session");
                            return;
                        }
                        Err(e) => {
                            warn!(error = %e, "Skipping undecodable frame");
                        }
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "Read error");
                return;
            }
        }
    }
}

async fn write_loop(mut writer: OwnedWriteHalf, mut rx: mpsc::Receiver<Message>) {
    while let Some(message) = rx.recv().await {
        if let Err(e) = write_message(&mut writer, &message).await {
            warn!(error = %e, id = %message.id, "Write failed");
            return;
        }
    }
    // Queue closed: the client is closing. Keep the session alive until the
    // reader sees the engine hang up or the supervisor is aborted.
    std::future::pending::<()>().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::{async_handler_fn, Dispatcher, HandlerError};
    use crate::protocol::payload;
    use crate::server::{Server, ServerConfig, ServerHandle};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::path::Path;
    use tempfile::TempDir;

    fn quick_config(path: &Path) -> ClientConfig {
        ClientConfig {
            socket_path: path.to_path_buf(),
            connect_timeout_ms: 1000,
            request_timeout_ms: 2000,
            reconnect: ReconnectPolicy {
                initial_delay_ms: 20,
                multiplier: 2,
                max_delay_ms: 100,
                max_attempts: 3,
            },
            ..ClientConfig::default()
        }
    }

    fn test_dispatcher() -> Dispatcher {
        let mut dispatcher = Dispatcher::with_builtins();
        dispatcher.register_fn(Command::GetStatus, |_| {
            Ok(payload(json!({"status": "idle"})))
        });
        dispatcher.register_fn(Command::StartInstallation, |_| {
            Err(HandlerError::InvalidState("nothing to install".into()))
        });
        dispatcher.register(
            Command::GetJobNames,
            async_handler_fn(|_| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<_, HandlerError>(Payload::new())
            }),
        );
        dispatcher
    }

    fn start_server(dir: &TempDir) -> (PathBuf, ServerHandle, JoinHandle<()>) {
        let path = dir.path().join("engine.sock");
        let server = Server::bind(ServerConfig::new(&path)).unwrap();
        let handle = server.handle();
        let task = tokio::spawn(server.serve(test_dispatcher()));
        (path, handle, task)
    }

    #[test]
    fn test_reconnect_policy_schedule() {
        let policy = ReconnectPolicy::default();
        let delays: Vec<u64> = (0..5)
            .map(|n| policy.delay(n).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![200, 400, 800, 1600, 2000]);
    }

    #[test]
    fn test_client_config_default() {
        let config = ClientConfig::default();
        assert_eq!(config.connect_timeout(), Duration::from_secs(5));
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert!(config.auto_reconnect);
    }

    #[tokio::test]
    async fn test_connect_missing_socket_fails() {
        let temp_dir = TempDir::new().unwrap();
        let result = IpcClient::connect(quick_config(&temp_dir.path().join("nope.sock"))).await;
        assert!(matches!(
            result,
            Err(IpcError::Transport(TransportError::ConnectionFailed(_)))
        ));
    }

    #[tokio::test]
    async fn test_send_command_ok_and_remote_error() {
        let temp_dir = TempDir::new().unwrap();
        let (path, handle, task) = start_server(&temp_dir);
        let client = IpcClient::connect(quick_config(&path)).await.unwrap();

        let status = client
            .send_command(Command::GetStatus, Payload::new(), None)
            .await
            .unwrap();
        assert_eq!(status["status"], json!("idle"));

        let err = client
            .send_command(Command::StartInstallation, Payload::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            IpcError::Remote { code: ErrorCode::HandlerError, .. }
        ));

        let err = client
            .send_command(Command::GetBranding, Payload::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            IpcError::Remote { code: ErrorCode::UnknownCommand, .. }
        ));

        handle.shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_timeout_removes_pending_entry() {
        let temp_dir = TempDir::new().unwrap();
        let (path, handle, task) = start_server(&temp_dir);
        let client = IpcClient::connect(quick_config(&path)).await.unwrap();

        let err = client
            .send_command(
                Command::GetJobNames,
                Payload::new(),
                Some(Duration::from_millis(50)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, IpcError::Timeout(_)));
        assert!(client.inner.pending.lock().is_empty());

        drop(client);
        handle.disconnect_all();
        handle.shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_timeout_covers_full_outbound_queue() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("stalled.sock");
        // Accepts but never reads, so the socket buffer and then the queue fill up
        let listener = tokio::net::UnixListener::bind(&path).unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.map(|(stream, _)| stream) });

        let config = ClientConfig {
            channel_capacity: 1,
            auto_reconnect: false,
            ..quick_config(&path)
        };
        let client = IpcClient::connect(config).await.unwrap();
        let _stream = accept.await.unwrap().unwrap();

        let blob = "x".repeat(1024 * 1024);
        let mut queued = 0;
        loop {
            let send = client.send_command_async(
                Command::Ping,
                payload(json!({ "blob": blob })),
                |_| {},
            );
            match tokio::time::timeout(Duration::from_millis(200), send).await {
                Ok(result) => {
                    result.unwrap();
                    queued += 1;
                    assert!(queued < 64, "outbound queue never filled");
                }
                Err(_) => break,
            }
        }

        let started = std::time::Instant::now();
        let err = client
            .send_command(Command::Ping, Payload::new(), Some(Duration::from_millis(200)))
            .await
            .unwrap_err();
        assert!(matches!(err, IpcError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_zero_channel_capacity_still_sends() {
        let temp_dir = TempDir::new().unwrap();
        let (path, handle, task) = start_server(&temp_dir);
        let config = ClientConfig {
            channel_capacity: 0,
            ..quick_config(&path)
        };
        let client = IpcClient::connect(config).await.unwrap();
        assert!(client.wait_until_connected(Duration::from_secs(1)).await);

        let pong = client
            .send_command(Command::Ping, Payload::new(), None)
            .await
            .unwrap();
        assert_eq!(pong["pong"], json!(true));

        client.close();
        handle.shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_state_changes_reports_failure() {
        let temp_dir = TempDir::new().unwrap();
        let (path, handle, task) = start_server(&temp_dir);
        let config = ClientConfig {
            auto_reconnect: false,
            ..quick_config(&path)
        };
        let client = IpcClient::connect(config).await.unwrap();
        let mut changes = client.state_changes();
        assert_eq!(*changes.borrow(), ClientState::Connected);

        handle.disconnect_all();
        let failed = tokio::time::timeout(
            Duration::from_secs(5),
            changes.wait_for(|s| *s == ClientState::Failed),
        )
        .await;
        assert!(matches!(failed, Ok(Ok(_))));

        handle.shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_async_request_callback() {
        let temp_dir = TempDir::new().unwrap();
        let (path, handle, task) = start_server(&temp_dir);
        let client = IpcClient::connect(quick_config(&path)).await.unwrap();

        let (tx, rx) = oneshot::channel();
        let id = client
            .send_command_async(Command::Ping, Payload::new(), move |outcome| {
                let _ = tx.send(outcome);
            })
            .await
            .unwrap();
        assert!(!id.is_empty());

        let outcome = tokio::time::timeout(Duration::from_secs(2), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.unwrap()["pong"], json!(true));

        handle.shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_event_subscription_and_unsubscribe() {
        let temp_dir = TempDir::new().unwrap();
        let (path, handle, task) = start_server(&temp_dir);
        let client = IpcClient::connect(quick_config(&path)).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let tx_a = tx.clone();
        let first = client.subscribe_event(Event::JobProgress, move |msg| {
            let _ = tx_a.send(("a", msg.id.clone()));
        });
        let _second = client.subscribe_event(Event::JobProgress, move |msg| {
            let _ = tx.send(("b", msg.id.clone()));
        });

        // Round trip so the server has registered this connection
        client.send_command(Command::Ping, Payload::new(), None).await.unwrap();
        handle
            .broadcast_event(Event::JobProgress, payload(json!({"progress": 0.1})))
            .await;

        let (who_a, id_a) = rx.recv().await.unwrap();
        let (who_b, id_b) = rx.recv().await.unwrap();
        assert_eq!((who_a, who_b), ("a", "b"));
        assert_eq!(id_a, id_b);

        assert!(client.unsubscribe(first));
        assert!(!client.unsubscribe(first));

        handle
            .broadcast_event(Event::JobProgress, payload(json!({"progress": 0.2})))
            .await;
        let (who, _) = rx.recv().await.unwrap();
        assert_eq!(who, "b");

        handle.shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_pending_fails_on_connection_loss() {
        let temp_dir = TempDir::new().unwrap();
        let (path, handle, task) = start_server(&temp_dir);
        let mut config = quick_config(&path);
        config.auto_reconnect = false;
        let client = IpcClient::connect(config).await.unwrap();

        let slow = client.send_command(Command::GetJobNames, Payload::new(), None);
        let drop_all = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            handle.disconnect_all();
        };
        let (outcome, ()) = tokio::join!(slow, drop_all);

        assert!(matches!(outcome, Err(IpcError::Connection(_))));
        assert!(!client.wait_until_connected(Duration::from_millis(200)).await);
        assert_eq!(client.state(), ClientState::Failed);

        handle.shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_reconnects_after_server_side_drop() {
        let temp_dir = TempDir::new().unwrap();
        let (path, handle, task) = start_server(&temp_dir);
        let client = IpcClient::connect(quick_config(&path)).await.unwrap();
        client.send_command(Command::Ping, Payload::new(), None).await.unwrap();

        handle.disconnect_all();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if client.sessions() > 1
                && client
                    .send_command(Command::Ping, Payload::new(), None)
                    .await
                    .is_ok()
            {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "client never reconnected");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(client.state(), ClientState::Connected);

        handle.shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_no_reconnect_after_engine_shutdown() {
        let temp_dir = TempDir::new().unwrap();
        let (path, handle, task) = start_server(&temp_dir);
        let client = IpcClient::connect(quick_config(&path)).await.unwrap();

        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        client.subscribe_event(Event::EngineShutdown, move |_| {
            if let Some(tx) = tx.lock().take() {
                let _ = tx.send(());
            }
        });
        client.send_command(Command::Ping, Payload::new(), None).await.unwrap();

        handle.shutdown();
        task.await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), rx).await.unwrap().unwrap();

        let mut state = client.inner.state.subscribe();
        tokio::time::timeout(
            Duration::from_secs(2),
            state.wait_for(|s| *s == ClientState::Disconnected),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(client.sessions(), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let temp_dir = TempDir::new().unwrap();
        let (path, handle, task) = start_server(&temp_dir);
        let client = IpcClient::connect(quick_config(&path)).await.unwrap();
        client.send_command(Command::Ping, Payload::new(), None).await.unwrap();

        // Kill the server without the shutdown notice: socket goes away
        task.abort();
        let _ = task.await;
        drop(handle);

        let mut state = client.inner.state.subscribe();
        tokio::time::timeout(
            Duration::from_secs(3),
            state.wait_for(|s| *s == ClientState::Failed),
        )
        .await
        .unwrap()
        .unwrap();

        let err = client
            .send_command(Command::Ping, Payload::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, IpcError::Connection(_)));
    }

    #[tokio::test]
    async fn test_close_fails_pending_and_disconnects() {
        let temp_dir = TempDir::new().unwrap();
        let (path, handle, task) = start_server(&temp_dir);
        let client = IpcClient::connect(quick_config(&path)).await.unwrap();

        client.close();
        assert_eq!(client.state(), ClientState::Disconnected);
        assert!(matches!(
            client.send_command(Command::Ping, Payload::new(), None).await,
            Err(IpcError::Connection(_))
        ));

        handle.shutdown();
        task.await.unwrap();
    }
}
