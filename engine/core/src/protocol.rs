//! Protocol Envelope
//!
//! Message envelope exchanged between the unprivileged surface and the
//! privileged engine, plus the closed command/event vocabulary.
//!
//! # Wire Shape
//!
//! ```text
//! {
//!   "version":   "1.0",
//!   "type":      "REQUEST" | "RESPONSE" | "EVENT",
//!   "id":        "<uuid>",
//!   "timestamp": "<RFC 3339, UTC>",
//!
//!   REQUEST:  "command": "PING",        "args":    { ... }
//!   RESPONSE: "command": "PING",        "result":  { ... }, "error": { "code", "message" }?
//!   EVENT:    "event":   "JOB_PROGRESS", "payload": { ... }
//! }
//! ```
//!
//! Command and event identifiers stay strings on the wire. An identifier
//! outside the closed sets still decodes, so it can be rejected by the
//! security validator (`PERMISSION_DENIED`) or the dispatcher
//! (`UNKNOWN_COMMAND`) instead of failing as a malformed frame.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Protocol version stamped on every outgoing message
pub const PROTOCOL_VERSION: &str = "1.0";

/// Major version accepted on decode
const SUPPORTED_MAJOR: u32 = 1;

/// Argument / result / payload mapping
pub type Payload = serde_json::Map<String, Value>;

/// Convert a JSON value into a payload map
///
/// Objects are taken as-is, `null` becomes an empty map, and any other value
/// is wrapped under a `"value"` key.
#[must_use]
pub fn payload(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        Value::Null => Payload::new(),
        other => {
            let mut map = Payload::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}

/// Protocol-level failures
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Payload is not valid JSON or does not match the envelope
    #[error("malformed message: {0}")]
    Malformed(String),

    /// Required envelope field is absent or empty
    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    /// Version field has a different major version
    #[error("unsupported protocol version {found:?} (supported: {PROTOCOL_VERSION})")]
    UnsupportedVersion {
        /// Version string received
        found: String,
    },

    /// Command identifier outside the closed set
    #[error("unknown command {0:?}")]
    UnknownCommand(String),

    /// Event identifier outside the closed set
    #[error("unknown event {0:?}")]
    UnknownEvent(String),

    /// Frame length exceeds the transport maximum
    #[error("frame size {size} exceeds maximum {max}")]
    FrameTooLarge {
        /// Declared or encoded size in bytes
        size: usize,
        /// Maximum allowed size in bytes
        max: usize,
    },
}

/// Declares a closed, string-backed identifier enum with `as_str`,
/// `Display`, `FromStr` and an `ALL` table.
macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        $name:ident, $err:ident {
            $( $(#[$vmeta:meta])* $variant:ident => $wire:literal, )+
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(
                $(#[$vmeta])*
                #[serde(rename = $wire)]
                $variant,
            )+
        }

        impl $name {
            /// Every member of the closed set
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// Wire identifier
            #[must_use]
            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $wire,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ProtocolError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($wire => Ok($name::$variant),)+
                    other => Err(ProtocolError::$err(other.to_string())),
                }
            }
        }
    };
}

wire_enum! {
    /// Requests the surface may issue to the engine
    Command, UnknownCommand {
        /// Liveness check
        Ping => "PING",
        /// Current installation status
        GetStatus => "GET_STATUS",
        /// Branding strings for the surface
        GetBranding => "GET_BRANDING",
        /// Names of the configured jobs
        GetJobNames => "GET_JOB_NAMES",
        /// Begin running the installation jobs
        StartInstallation => "START_INSTALLATION",
        /// Ask the running installation to stop
        CancelInstallation => "CANCEL_INSTALLATION",
        /// Check a configuration file
        ValidateConfig => "VALIDATE_CONFIG",
        /// Stop the engine
        Shutdown => "SHUTDOWN",
    }
}

wire_enum! {
    /// Notifications the engine pushes to every surface
    Event, UnknownEvent {
        /// A job began
        JobStarted => "JOB_STARTED",
        /// A job reported progress
        JobProgress => "JOB_PROGRESS",
        /// A job finished
        JobCompleted => "JOB_COMPLETED",
        /// Something failed
        ErrorOccurred => "ERROR_OCCURRED",
        /// All jobs finished (successfully or not)
        InstallationComplete => "INSTALLATION_COMPLETE",
        /// Engine is accepting requests
        EngineReady => "ENGINE_READY",
        /// Engine is going away
        EngineShutdown => "ENGINE_SHUTDOWN",
    }
}

wire_enum! {
    /// Error codes carried in error responses
    ErrorCode, Malformed {
        /// Command is not whitelisted
        PermissionDenied => "PERMISSION_DENIED",
        /// Arguments failed path, pattern or limit checks
        ValidationFailed => "VALIDATION_FAILED",
        /// No handler is registered for the command
        UnknownCommand => "UNKNOWN_COMMAND",
        /// The handler failed
        HandlerError => "HANDLER_ERROR",
        /// The message was not a request
        InvalidRequest => "INVALID_REQUEST",
    }
}

/// Envelope type
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    /// Surface to engine, expects one response
    Request,
    /// Engine to surface, answers one request
    Response,
    /// Engine to surface, unsolicited
    Event,
}

/// Error detail in a failed response
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Machine-readable code
    pub code: ErrorCode,
    /// Human-readable reason
    pub message: String,
}

/// Type-specific part of a message
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Body {
    /// A command invocation
    Request {
        /// Command identifier
        command: String,
        /// Command arguments
        #[serde(default)]
        args: Payload,
    },
    /// The outcome of a request
    Response {
        /// Command identifier echoed from the request
        command: String,
        /// Handler result (empty on error)
        #[serde(default)]
        result: Payload,
        /// Present when the request failed
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorBody>,
    },
    /// A broadcast notification
    Event {
        /// Event identifier
        event: String,
        /// Event data
        #[serde(default)]
        payload: Payload,
    },
}

/// A single protocol message
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Protocol version
    pub version: String,
    /// Correlation token (requests/responses) or message id (events)
    #[serde(default)]
    pub id: String,
    /// Creation time
    pub timestamp: DateTime<Utc>,
    /// Type-specific fields
    #[serde(flatten)]
    pub body: Body,
}

/// Generate a new correlation id
#[must_use]
pub fn new_correlation_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl Message {
    /// Create a request for a command
    #[must_use]
    pub fn request(command: Command, args: Payload) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            id: new_correlation_id(),
            timestamp: Utc::now(),
            body: Body::Request {
                command: command.as_str().to_string(),
                args,
            },
        }
    }

    /// Create a successful response to `request`
    #[must_use]
    pub fn response_ok(request: &Message, result: Payload) -> Self {
        Self::response(request, result, None)
    }

    /// Create a failed response to `request`
    #[must_use]
    pub fn response_error(request: &Message, code: ErrorCode, message: impl Into<String>) -> Self {
        Self::response(
            request,
            Payload::new(),
            Some(ErrorBody {
                code,
                message: message.into(),
            }),
        )
    }

    fn response(request: &Message, result: Payload, error: Option<ErrorBody>) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            id: request.id.clone(),
            timestamp: Utc::now(),
            body: Body::Response {
                command: request.command_name().unwrap_or_default().to_string(),
                result,
                error,
            },
        }
    }

    /// Create an event
    #[must_use]
    pub fn event(event: Event, payload: Payload) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            id: new_correlation_id(),
            timestamp: Utc::now(),
            body: Body::Event {
                event: event.as_str().to_string(),
                payload,
            },
        }
    }

    /// Envelope type
    #[must_use]
    pub fn kind(&self) -> MessageType {
        match self.body {
            Body::Request { .. } => MessageType::Request,
            Body::Response { .. } => MessageType::Response,
            Body::Event { .. } => MessageType::Event,
        }
    }

    /// Raw command identifier (requests and responses)
    #[must_use]
    pub fn command_name(&self) -> Option<&str> {
        match &self.body {
            Body::Request { command, .. } | Body::Response { command, .. } => Some(command),
            Body::Event { .. } => None,
        }
    }

    /// Parsed command, if the identifier is in the closed set
    #[must_use]
    pub fn command(&self) -> Option<Command> {
        self.command_name().and_then(|c| c.parse().ok())
    }

    /// Parsed event, if this is an event in the closed set
    #[must_use]
    pub fn event_kind(&self) -> Option<Event> {
        match &self.body {
            Body::Event { event, .. } => event.parse().ok(),
            _ => None,
        }
    }

    /// Request arguments
    #[must_use]
    pub fn args(&self) -> Option<&Payload> {
        match &self.body {
            Body::Request { args, .. } => Some(args),
            _ => None,
        }
    }

    /// Event payload
    #[must_use]
    pub fn event_payload(&self) -> Option<&Payload> {
        match &self.body {
            Body::Event { payload, .. } => Some(payload),
            _ => None,
        }
    }
}

/// Check that `version` has the supported major version
fn check_version(version: &str) -> Result<(), ProtocolError> {
    if version.is_empty() {
        return Err(ProtocolError::MissingField("version"));
    }
    let major = version
        .split('.')
        .next()
        .and_then(|m| m.parse::<u32>().ok());
    if major == Some(SUPPORTED_MAJOR) {
        Ok(())
    } else {
        Err(ProtocolError::UnsupportedVersion {
            found: version.to_string(),
        })
    }
}

/// Serialize a message to canonical UTF-8 JSON
///
/// # Errors
///
/// Returns `ProtocolError` if the version or id is missing, or if a request's
/// command or an event's identifier is outside its closed set.
pub fn encode(message: &Message) -> Result<Vec<u8>, ProtocolError> {
    check_version(&message.version)?;

    match &message.body {
        Body::Request { command, .. } => {
            if message.id.is_empty() {
                return Err(ProtocolError::MissingField("id"));
            }
            command.parse::<Command>()?;
        }
        // Responses echo whatever the peer sent, including rejected names
        Body::Response { .. } => {
            if message.id.is_empty() {
                return Err(ProtocolError::MissingField("id"));
            }
        }
        Body::Event { event, .. } => {
            event.parse::<Event>()?;
        }
    }

    serde_json::to_vec(message).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

/// Parse and validate a message
///
/// # Errors
///
/// Returns `ProtocolError` on malformed JSON, an unsupported version, or a
/// missing field.
pub fn decode(bytes: &[u8]) -> Result<Message, ProtocolError> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

    // Version is checked before the body so a newer peer fails fast
    match value.get("version") {
        Some(Value::String(v)) => check_version(v)?,
        Some(_) => return Err(ProtocolError::Malformed("version is not a string".into())),
        None => return Err(ProtocolError::MissingField("version")),
    }

    let message: Message =
        serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

    if message.kind() != MessageType::Event && message.id.is_empty() {
        return Err(ProtocolError::MissingField("id"));
    }

    Ok(message)
}
