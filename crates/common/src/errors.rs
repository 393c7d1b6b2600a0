//! Error taxonomy for the agentwire substrate.
//!
//! Errors fall into four classes, and the class decides what the pool does
//! with a failed attempt:
//!
//! - **transport** (refused, reset, connect timeout): retried up to the
//!   configured budget, then surfaced unchanged
//! - **protocol** (malformed frame, unsupported version, oversized message):
//!   fatal to the one connection, never retried
//! - **application** (a handler failed the call): passed through verbatim,
//!   never retried
//! - **lifecycle** (timeout, abort, pool or endpoint shutdown): terminal
//!
//! `RpcError` is `Clone` so a single recorded outcome can be handed to every
//! observer of a call.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Error type for every agentwire operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("IO error ({kind:?}): {message}")]
    Io { kind: io::ErrorKind, message: String },

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Invalid message format: {0}")]
    InvalidMessage(String),

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Unsupported protocol version {0}")]
    UnsupportedVersion(u32),

    #[error("Protocol version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u32, actual: u32 },

    #[error("Failed to decode payload: {0}")]
    Decode(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Failure reported by the remote handler, carried verbatim.
    #[error("Remote error {code}: {message}")]
    Remote { code: u16, message: String },

    #[error("Call timed out")]
    Timeout,

    #[error("Call aborted")]
    Aborted,

    #[error("Disconnected")]
    Disconnected,

    #[error("Call abandoned")]
    Abandoned,

    #[error("Shutting down")]
    ShuttingDown,

    #[error("Invalid agent name: {0}")]
    InvalidAgentName(String),

    #[error("Invalid peer name: {0}")]
    InvalidPeerName(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result alias used throughout agentwire.
pub type RpcResult<T> = Result<T, RpcError>;

/// Wire codes carried in error-status responses.
pub mod codes {
    pub const TIMEOUT: u16 = 1;
    pub const ABORTED: u16 = 2;
    pub const DISCONNECTED: u16 = 3;
    pub const ABANDONED: u16 = 4;
    pub const SHUTTING_DOWN: u16 = 5;
    pub const CONNECTION_FAILED: u16 = 10;
    pub const CONNECT_TIMEOUT: u16 = 11;
    pub const IO: u16 = 12;
    pub const CONNECTION_CLOSED: u16 = 13;
    pub const INVALID_MESSAGE: u16 = 20;
    pub const MESSAGE_TOO_LARGE: u16 = 21;
    pub const UNSUPPORTED_VERSION: u16 = 22;
    pub const VERSION_MISMATCH: u16 = 23;
    pub const DECODE: u16 = 24;
    pub const SERIALIZATION: u16 = 30;
    pub const INVALID_ARGUMENT: u16 = 40;
    /// First code available to applications.
    pub const APPLICATION_BASE: u16 = 1000;
}

impl RpcError {
    /// Build an application error with a caller-chosen code.
    pub fn application(code: u16, message: impl Into<String>) -> Self {
        RpcError::Remote {
            code,
            message: message.into(),
        }
    }

    /// Refused, reset, timed-out or otherwise broken transport.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            RpcError::ConnectionFailed(_)
                | RpcError::ConnectTimeout(_)
                | RpcError::Io { .. }
                | RpcError::ConnectionClosed
        )
    }

    /// The peer spoke something we cannot parse or accept.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            RpcError::InvalidMessage(_)
                | RpcError::MessageTooLarge { .. }
                | RpcError::UnsupportedVersion(_)
                | RpcError::VersionMismatch { .. }
        )
    }

    /// The agent refused the connection's interface version, locally
    /// detected or reported in an error-status response.
    ///
    /// Every call on that connection would meet the same answer, so the
    /// pool treats it like a protocol error rather than a per-call failure.
    pub fn is_version_rejection(&self) -> bool {
        match self {
            RpcError::UnsupportedVersion(_) | RpcError::VersionMismatch { .. } => true,
            RpcError::Remote { code, .. } => {
                *code == codes::UNSUPPORTED_VERSION || *code == codes::VERSION_MISMATCH
            }
            _ => false,
        }
    }

    /// Code used when this error is sent in an error-status response.
    pub fn wire_code(&self) -> u16 {
        match self {
            RpcError::Timeout => codes::TIMEOUT,
            RpcError::Aborted => codes::ABORTED,
            RpcError::Disconnected => codes::DISCONNECTED,
            RpcError::Abandoned => codes::ABANDONED,
            RpcError::ShuttingDown => codes::SHUTTING_DOWN,
            RpcError::ConnectionFailed(_) => codes::CONNECTION_FAILED,
            RpcError::ConnectTimeout(_) => codes::CONNECT_TIMEOUT,
            RpcError::Io { .. } => codes::IO,
            RpcError::ConnectionClosed => codes::CONNECTION_CLOSED,
            RpcError::InvalidMessage(_) => codes::INVALID_MESSAGE,
            RpcError::MessageTooLarge { .. } => codes::MESSAGE_TOO_LARGE,
            RpcError::UnsupportedVersion(_) => codes::UNSUPPORTED_VERSION,
            RpcError::VersionMismatch { .. } => codes::VERSION_MISMATCH,
            RpcError::Decode(_) => codes::DECODE,
            RpcError::Serialization(_) => codes::SERIALIZATION,
            RpcError::InvalidAgentName(_)
            | RpcError::InvalidPeerName(_)
            | RpcError::InvalidConfig(_) => codes::INVALID_ARGUMENT,
            RpcError::Remote { code, .. } => *code,
        }
    }

    /// Message text used when this error is sent in an error-status response.
    pub fn wire_message(&self) -> String {
        match self {
            RpcError::Remote { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    /// Rebuild an error received in an error-status response.
    ///
    /// Every remote failure surfaces as [`RpcError::Remote`] so callers can
    /// tell a handler's verdict apart from a local failure of the same kind.
    pub fn from_wire(code: u16, message: impl Into<String>) -> Self {
        RpcError::Remote {
            code,
            message: message.into(),
        }
    }
}

impl From<io::Error> for RpcError {
    fn from(error: io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::UnexpectedEof => RpcError::ConnectionClosed,
            kind => RpcError::Io {
                kind,
                message: error.to_string(),
            },
        }
    }
}
