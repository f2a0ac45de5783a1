//! Error types for the async KCP layer.
//!
//! [`KcpError`] extends [`ukcp_core::KcpCoreError`] with I/O, timeout,
//! config, and connection variants needed by the runtime layer.

use std::fmt;
use thiserror::Error;
use ukcp_core::KcpCoreError;

pub type Result<T> = std::result::Result<T, KcpError>;

// ── Error types ─────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum KcpError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Connection error: {kind}")]
    Connection { kind: ConnectionError },

    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Buffer error: {message}")]
    Buffer { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionError {
    Closed,
    Lost,
    InvalidConv,
    Timeout,
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "connection closed"),
            Self::Lost => write!(f, "connection lost"),
            Self::InvalidConv => write!(f, "invalid conversation ID"),
            Self::Timeout => write!(f, "connection idle timeout"),
        }
    }
}

// ── Bridge: core errors → KcpError ──────────────────────────────────────

impl From<KcpCoreError> for KcpError {
    fn from(e: KcpCoreError) -> Self {
        match e {
            KcpCoreError::InvalidArgument { message } => Self::InvalidInput { message },
            KcpCoreError::MalformedSegment { message } => Self::Protocol { message },
            e @ (KcpCoreError::WindowExceeded { .. }
            | KcpCoreError::WouldBlock
            | KcpCoreError::BufferTooSmall { .. }) => Self::Buffer {
                message: e.to_string(),
            },
            KcpCoreError::ConvMismatch { .. } | KcpCoreError::UnknownConversation { .. } => {
                Self::Connection {
                    kind: ConnectionError::InvalidConv,
                }
            }
            KcpCoreError::ConnectionLost => Self::Connection {
                kind: ConnectionError::Lost,
            },
        }
    }
}

// ── Constructors ────────────────────────────────────────────────────────

impl KcpError {
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol { message: message.into() }
    }

    pub fn connection(kind: ConnectionError) -> Self {
        Self::Connection { kind }
    }

    pub fn timeout(timeout_ms: u64) -> Self {
        Self::Timeout { timeout_ms }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }
}

// ── Predicates ──────────────────────────────────────────────────────────

impl KcpError {
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
            ),
            Self::Timeout { .. } | Self::Buffer { .. } => true,
            _ => false,
        }
    }

    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Connection {
                kind: ConnectionError::Lost | ConnectionError::Closed | ConnectionError::Timeout
            } | Self::Internal { .. }
        )
    }

    pub fn is_closed(&self) -> bool {
        match self {
            Self::Connection { kind } => {
                matches!(kind, ConnectionError::Closed | ConnectionError::Timeout)
            }
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}
