//! Error taxonomy shared by every capability client.
//!
//! Every public operation returns `Result<T, AiError>`. Each client also keeps
//! a [`LastError`] mirror of its most recent outcome, readable through
//! `last_error()`, for callers that want a `(code, message)` pair.

use thiserror::Error;

use crate::bus::BusError;

/// Numeric codes reported through [`LastError`] and [`AiError::code`].
///
/// Codes returned by the daemon itself are opaque and passed through as-is;
/// only these sentinels are produced locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    NoError = 0,
    /// The session manager is unreachable or handed out no session.
    ApiServerNotAvailable = 1,
    /// Input rejected locally before any remote call.
    InvalidParameter = 2,
    /// The daemon reply was not the JSON shape we expected.
    ParseError = 3,
    /// Another operation or stream is already in flight on this client.
    Busy = 4,
}

impl ErrorCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

impl From<ErrorCode> for i32 {
    fn from(code: ErrorCode) -> Self {
        code.as_i32()
    }
}

/// Failure of a client operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AiError {
    #[error("AI daemon unavailable: {0}")]
    DaemonUnavailable(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("failed to parse daemon reply: {0}")]
    Parse(String),

    #[error("daemon error {code}: {message}")]
    Daemon { code: i32, message: String },

    #[error("operation already in progress")]
    Busy,
}

impl AiError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        AiError::DaemonUnavailable(message.into())
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        AiError::InvalidParameter(message.into())
    }

    pub fn parse(message: impl Into<String>) -> Self {
        AiError::Parse(message.into())
    }

    /// Numeric code for this error. Daemon codes are returned verbatim.
    pub fn code(&self) -> i32 {
        match self {
            AiError::DaemonUnavailable(_) => ErrorCode::ApiServerNotAvailable.as_i32(),
            AiError::InvalidParameter(_) => ErrorCode::InvalidParameter.as_i32(),
            AiError::Parse(_) => ErrorCode::ParseError.as_i32(),
            AiError::Daemon { code, .. } => *code,
            AiError::Busy => ErrorCode::Busy.as_i32(),
        }
    }

    /// The bare message without the kind prefix added by `Display`.
    pub fn message(&self) -> &str {
        match self {
            AiError::DaemonUnavailable(m) | AiError::InvalidParameter(m) | AiError::Parse(m) => m,
            AiError::Daemon { message, .. } => message,
            AiError::Busy => "operation already in progress",
        }
    }

    /// Whether calling again later could succeed without changing the input.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AiError::DaemonUnavailable(_) | AiError::Busy)
    }
}

impl From<BusError> for AiError {
    fn from(e: BusError) -> Self {
        // Transport failures, timeouts included, all look the same to callers.
        AiError::DaemonUnavailable(e.to_string())
    }
}

/// `(code, message)` snapshot of a client's most recent outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LastError {
    pub code: i32,
    pub message: String,
}

impl LastError {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_error(&self) -> bool {
        self.code != ErrorCode::NoError.as_i32()
    }
}

impl From<&AiError> for LastError {
    fn from(e: &AiError) -> Self {
        Self {
            code: e.code(),
            message: e.message().to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, AiError>;
