//! Frame Protocol
//!
//! Wire format for engine-surface messages using length-prefixed JSON.
//!
//! # Frame Format
//!
//! ```text
//! +----------------+------------------------------------------+
//! | Length (4)     | JSON Payload (variable)                  |
//! | big-endian u32 | protocol::Message                        |
//! +----------------+------------------------------------------+
//! ```
//!
//! # Security
//!
//! - Maximum frame size is enforced to prevent memory exhaustion
//! - Length field is validated before allocating or reading the body

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::TransportError;
use crate::protocol::{self, Message, ProtocolError};

/// Maximum frame size (10 MiB)
///
/// This prevents memory exhaustion from malicious or corrupted frames.
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Minimum buffer capacity for decoder
const MIN_BUFFER_CAPACITY: usize = 4096;

/// Frame header size: 4 bytes length
pub const HEADER_SIZE: usize = 4;

/// Encode a message to a length-prefixed frame
///
/// # Errors
///
/// Returns `TransportError::Protocol` if the message fails protocol
/// validation or the payload exceeds `MAX_FRAME_SIZE`.
pub fn encode(msg: &Message) -> Result<Vec<u8>, TransportError> {
    let json = protocol::encode(msg)?;

    if json.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: json.len(),
            max: MAX_FRAME_SIZE,
        }
        .into());
    }

    #[allow(clippy::cast_possible_truncation)]
    let len = json.len() as u32;

    let mut buf = Vec::with_capacity(HEADER_SIZE + json.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&json);
    Ok(buf)
}

/// Validate a declared frame length
fn check_len(len: usize) -> Result<(), ProtocolError> {
    if len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(())
}

/// Map read/write failures that mean "peer went away" onto `ConnectionClosed`
fn io_to_transport(e: std::io::Error) -> TransportError {
    use std::io::ErrorKind;
    match e.kind() {
        ErrorKind::UnexpectedEof
        | ErrorKind::BrokenPipe
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted => TransportError::ConnectionClosed,
        _ => TransportError::Io(e),
    }
}

/// Read exactly one frame and decode it
///
/// Suspends until a complete frame is available. The length prefix is
/// checked against `MAX_FRAME_SIZE` before any of the body is read.
///
/// # Errors
///
/// - `TransportError::ConnectionClosed` if the peer disconnects mid-frame
///   (or before a frame starts)
/// - `TransportError::Protocol` for oversized frames or invalid payloads
pub async fn read_message<R>(reader: &mut R) -> Result<Message, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_SIZE];
    reader
        .read_exact(&mut header)
        .await
        .map_err(io_to_transport)?;

    let len = u32::from_be_bytes(header) as usize;
    check_len(len)?;

    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(io_to_transport)?;

    Ok(protocol::decode(&payload)?)
}

/// Encode and write one frame
///
/// The prefix and payload are written as a single buffer. Callers must hold
/// exclusive access to `writer` so frames from one sender never interleave.
///
/// # Errors
///
/// Returns `TransportError::ConnectionClosed` if the peer has gone away.
pub async fn write_message<W>(writer: &mut W, msg: &Message) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode(msg)?;
    writer.write_all(&frame).await.map_err(io_to_transport)?;
    writer.flush().await.map_err(io_to_transport)?;
    Ok(())
}

/// Decoder state machine for streaming frame parsing
///
/// Buffers incoming bytes and yields complete messages. Useful when the
/// caller reads arbitrary chunks (e.g. `read()` inside a `select!`).
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    /// Position where we've consumed up to
    read_pos: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    /// Create a new decoder with default buffer capacity
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(MIN_BUFFER_CAPACITY),
            read_pos: 0,
        }
    }

    /// Append bytes to the buffer
    pub fn push(&mut self, data: &[u8]) {
        // Compact buffer if we've consumed a lot
        if self.read_pos > self.buffer.len() / 2 && self.read_pos > MIN_BUFFER_CAPACITY {
            self.buffer.drain(..self.read_pos);
            self.read_pos = 0;
        }
        self.buffer.extend_from_slice(data);
    }

    /// Get the number of bytes available in the buffer
    #[must_use]
    pub fn available(&self) -> usize {
        self.buffer.len() - self.read_pos
    }

    /// Try to decode the next frame
    ///
    /// Returns:
    /// - `Ok(Some(msg))` if a complete frame was decoded
    /// - `Ok(None)` if more data is needed
    /// - `Err(...)` if the frame is oversized or invalid
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Protocol` on oversized or undecodable frames.
    pub fn decode(&mut self) -> Result<Option<Message>, TransportError> {
        let available = self.available();

        if available < HEADER_SIZE {
            return Ok(None);
        }

        let len_bytes = &self.buffer[self.read_pos..self.read_pos + HEADER_SIZE];
        let len =
            u32::from_be_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]) as usize;

        check_len(len)?;

        if available < HEADER_SIZE + len {
            return Ok(None);
        }

        let payload_start = self.read_pos + HEADER_SIZE;
        let payload_end = payload_start + len;

        // Advance before decoding so one bad frame does not wedge the stream
        self.read_pos = payload_end;

        let msg = protocol::decode(&self.buffer[payload_start..payload_end])?;
        Ok(Some(msg))
    }

    /// Clear the buffer
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.read_pos = 0;
    }
}
