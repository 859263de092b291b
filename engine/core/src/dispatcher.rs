//! Command Dispatcher
//!
//! Routes a validated request to the handler registered for its command and
//! turns the outcome into exactly one response.
//!
//! # Handler Contract
//!
//! - A handler receives the request's argument map and returns a result map
//! - Handler errors and panics become `HANDLER_ERROR` responses; they never
//!   take the connection or the engine down
//! - The dispatcher is an explicit value owned by the server: there is no
//!   process-wide handler table
//!
//! `PING` is answered by a built-in handler (see [`Dispatcher::with_builtins`]).

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::json;
use thiserror::Error;

use crate::protocol::{payload, Command, ErrorCode, Message, Payload};

/// Failure reported by a command handler
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// An argument was missing or had the wrong shape
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation was attempted and failed
    #[error("{0}")]
    Failed(String),

    /// The command is not valid right now (e.g. install already running)
    #[error("invalid state: {0}")]
    InvalidState(String),
}

/// Outcome of a command handler
pub type HandlerResult = Result<Payload, HandlerError>;

/// A function that serves one command
///
/// Implementations must be `Send + Sync`: connections dispatch concurrently
/// against the same handler.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Handle one request
    async fn handle(&self, args: Payload) -> HandlerResult;
}

/// Adapter for synchronous closures, see [`handler_fn`]
pub struct FnHandler<F>(F);

/// Wrap a synchronous closure as a [`CommandHandler`]
pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: Fn(Payload) -> HandlerResult + Send + Sync,
{
    FnHandler(f)
}

#[async_trait]
impl<F> CommandHandler for FnHandler<F>
where
    F: Fn(Payload) -> HandlerResult + Send + Sync,
{
    async fn handle(&self, args: Payload) -> HandlerResult {
        (self.0)(args)
    }
}

/// Adapter for closures returning futures, see [`async_handler_fn`]
pub struct AsyncFnHandler<F>(F);

/// Wrap an async closure as a [`CommandHandler`]
pub fn async_handler_fn<F, Fut>(f: F) -> AsyncFnHandler<F>
where
    F: Fn(Payload) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    AsyncFnHandler(f)
}

#[async_trait]
impl<F, Fut> CommandHandler for AsyncFnHandler<F>
where
    F: Fn(Payload) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, args: Payload) -> HandlerResult {
        (self.0)(args).await
    }
}

/// Built-in liveness handler
struct PingHandler;

#[async_trait]
impl CommandHandler for PingHandler {
    async fn handle(&self, _args: Payload) -> HandlerResult {
        Ok(payload(json!({ "pong": true })))
    }
}

/// Command to handler mapping
#[derive(Clone, Default)]
pub struct Dispatcher {
    handlers: HashMap<Command, Arc<dyn CommandHandler>>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("commands", &self.commands())
            .finish()
    }
}

impl Dispatcher {
    /// Create an empty dispatcher
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a dispatcher with the built-in `PING` handler
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut dispatcher = Self::new();
        dispatcher.register(Command::Ping, PingHandler);
        dispatcher
    }

    /// Register `handler` for `command`
    ///
    /// Registering a command twice replaces the earlier handler, which is
    /// returned.
    pub fn register<H>(&mut self, command: Command, handler: H) -> Option<Arc<dyn CommandHandler>>
    where
        H: CommandHandler + 'static,
    {
        let previous = self.handlers.insert(command, Arc::new(handler));
        if previous.is_some() {
            tracing::warn!(%command, "Replacing existing command handler");
        } else {
            tracing::debug!(%command, "Command handler registered");
        }
        previous
    }

    /// Register a synchronous closure for `command`
    pub fn register_fn<F>(&mut self, command: Command, f: F) -> Option<Arc<dyn CommandHandler>>
    where
        F: Fn(Payload) -> HandlerResult + Send + Sync + 'static,
    {
        self.register(command, handler_fn(f))
    }

    /// Whether a handler is registered for `command`
    #[must_use]
    pub fn has_handler(&self, command: Command) -> bool {
        self.handlers.contains_key(&command)
    }

    /// Commands with a registered handler, in wire order
    #[must_use]
    pub fn commands(&self) -> Vec<Command> {
        Command::ALL
            .iter()
            .copied()
            .filter(|c| self.handlers.contains_key(c))
            .collect()
    }

    /// Run the handler for `request` and build its response
    ///
    /// Always returns a response carrying the request's id.
    pub async fn dispatch(&self, request: &Message) -> Message {
        let Some(args) = request.args() else {
            return Message::response_error(
                request,
                ErrorCode::InvalidRequest,
                format!("cannot dispatch a {:?} message", request.kind()),
            );
        };

        let name = request.command_name().unwrap_or_default();
        let Some((command, handler)) = request
            .command()
            .and_then(|c| self.handlers.get(&c).map(|h| (c, Arc::clone(h))))
        else {
            tracing::warn!(command = name, "No handler registered");
            return Message::response_error(
                request,
                ErrorCode::UnknownCommand,
                format!("no handler registered for {name}"),
            );
        };

        let outcome = AssertUnwindSafe(handler.handle(args.clone()))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(result)) => {
                tracing::debug!(%command, id = %request.id, "Command handled");
                Message::response_ok(request, result)
            }
            Ok(Err(e)) => {
                tracing::warn!(%command, id = %request.id, error = %e, "Command handler failed");
                Message::response_error(request, ErrorCode::HandlerError, e.to_string())
            }
            Err(panic) => {
                let reason = panic_message(panic.as_ref());
                tracing::error!(%command, id = %request.id, reason, "Command handler panicked");
                Message::response_error(
                    request,
                    ErrorCode::HandlerError,
                    format!("handler panicked: {reason}"),
                )
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}
