//! Transport Layer for Engine-Surface IPC
//!
//! Reliable framing of discrete [`Message`](crate::protocol::Message)s over a
//! Unix domain socket, plus preparation of the socket endpoint.
//!
//! # Security
//!
//! - Socket directory is created with 0700 permissions
//! - Socket files are created with 0600 permissions before accepting
//! - Unix sockets expose peer credentials, checked by the server
//! - No network exposure

use std::path::PathBuf;

use thiserror::Error;

use crate::protocol::ProtocolError;

pub mod frame;
pub mod socket;

// Re-exports for convenience
pub use frame::{read_message, write_message, FrameDecoder, MAX_FRAME_SIZE};
pub use socket::{
    bind_socket, default_socket_path, ensure_socket_dir, SocketGuard, PRODUCTION_SOCKET_PATH,
};

/// Transport-level failures
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer closed or reset the connection
    #[error("connection closed")]
    ConnectionClosed,

    /// The frame or its payload violated the protocol
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Another live server owns the socket path
    #[error("socket {0:?} is already in use by a live server")]
    AddressInUse(PathBuf),

    /// Connecting to the socket failed
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Peer credentials were rejected
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Operation not valid in the current state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
