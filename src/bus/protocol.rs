//! Wire protocol spoken over the daemon socket.
//!
//! Every frame is a 4-byte big-endian length followed by a MessagePack encoded
//! [`FramedMessage`]. A request connection carries `Call` frames answered one at
//! a time; a subscription connection sends one `Subscribe` frame and then only
//! receives `Signal` frames.

use serde::{Deserialize, Serialize};

use super::{BusValue, Signal};

/// Protocol version for compatibility checks.
pub const PROTOCOL_VERSION: u32 = 1;

/// Largest frame either side accepts.
pub const MAX_FRAME_LEN: usize = 100 * 1024 * 1024;

/// Default socket path for the current user.
pub fn default_socket_path() -> std::path::PathBuf {
    let user = std::env::var("USER").unwrap_or_else(|_| "unknown".into());
    // Sanitize: keep only alphanumeric, dash, underscore to prevent path traversal
    let safe_user: String = user
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '-' || *c == '_')
        .take(64)
        .collect();
    let safe_user = if safe_user.is_empty() {
        "unknown".to_string()
    } else {
        safe_user
    };
    std::path::PathBuf::from(format!("/tmp/ai-daemon-{}.sock", safe_user))
}

/// Request types sent by clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// Invoke a method on a daemon object.
    Call {
        path: String,
        method: String,
        args: Vec<BusValue>,
    },

    /// Turn this connection into a signal feed for one object.
    Subscribe { path: String },
}

/// Frames sent by the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    /// Method return value.
    Reply(BusValue),

    /// Subscription acknowledged; signals follow.
    Subscribed,

    /// Asynchronous notification.
    Signal(Signal),

    /// Error response.
    Error(ErrorResponse),
}

/// Error response from daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error code for programmatic handling.
    pub code: ErrorCode,
    /// Human-readable error message.
    pub message: String,
}

/// Transport error codes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCode {
    /// Unknown or internal error.
    Internal,
    /// No object at the requested path (e.g. a destroyed session).
    UnknownObject,
    /// The object has no such method.
    UnknownMethod,
    /// Arguments did not match the method signature.
    InvalidArgs,
    /// The daemon gave up waiting on its backend.
    Timeout,
    /// Protocol version mismatch.
    VersionMismatch,
}

/// Framed message wrapper for length-prefixed protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FramedMessage<T> {
    /// Protocol version.
    pub version: u32,
    /// Request ID for correlation.
    pub request_id: String,
    /// Payload.
    pub payload: T,
}

impl<T> FramedMessage<T> {
    pub fn new(request_id: impl Into<String>, payload: T) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            request_id: request_id.into(),
            payload,
        }
    }
}

/// Encode a message to MessagePack bytes with length prefix.
pub fn encode_message<T: Serialize>(msg: &FramedMessage<T>) -> Result<Vec<u8>, EncodeError> {
    let payload = rmp_serde::to_vec(msg).map_err(|e| EncodeError(e.to_string()))?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(EncodeError(format!(
            "frame too large: {} bytes",
            payload.len()
        )));
    }
    let len = payload.len() as u32;
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Decode a message from MessagePack bytes (without length prefix).
pub fn decode_message<T: for<'de> Deserialize<'de>>(
    data: &[u8],
) -> Result<FramedMessage<T>, DecodeError> {
    rmp_serde::from_slice(data).map_err(|e| DecodeError(e.to_string()))
}

#[derive(Debug, Clone)]
pub struct EncodeError(pub String);

impl std::fmt::Display for EncodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "encode error: {}", self.0)
    }
}

impl std::error::Error for EncodeError {}

#[derive(Debug, Clone)]
pub struct DecodeError(pub String);

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "decode error: {}", self.0)
    }
}

impl std::error::Error for DecodeError {}
