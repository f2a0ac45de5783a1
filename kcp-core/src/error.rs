//! Error types for the KCP core protocol engine

use thiserror::Error;

/// Result type for KCP core operations
pub type KcpCoreResult<T> = std::result::Result<T, KcpCoreError>;

/// Errors produced by the protocol engine and the conversation table.
///
/// None of these leave the engine in a corrupted state: caller misuse and
/// malformed datagrams are rejected before any state is touched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KcpCoreError {
    /// Caller passed an argument the engine cannot accept
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    /// Message needs more fragments than the receive window could ever hold
    #[error("Window exceeded: message needs {fragments} fragments, limit is {limit}")]
    WindowExceeded { fragments: usize, limit: usize },

    /// Datagram could not be parsed (truncated, over-length, unknown command)
    #[error("Malformed segment: {message}")]
    MalformedSegment { message: String },

    /// Datagram belongs to another conversation
    #[error("Conversation mismatch: expected {expected}, got {actual}")]
    ConvMismatch { expected: u32, actual: u32 },

    /// No complete message is available yet
    #[error("Operation would block")]
    WouldBlock,

    /// Caller buffer cannot hold the next message
    #[error("Buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },

    /// Conversation id not present in the table
    #[error("Unknown conversation {conv}")]
    UnknownConversation { conv: u32 },

    /// A segment exceeded the dead-link retransmission threshold
    #[error("Connection lost")]
    ConnectionLost,
}

impl KcpCoreError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedSegment {
            message: message.into(),
        }
    }

    /// Check if this is a fatal error that should stop the conversation
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ConnectionLost)
    }

    /// Backpressure conditions: the caller should retry later
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::WouldBlock | Self::WindowExceeded { .. })
    }

    /// Errors caused by network input rather than by the caller
    pub fn is_network_input(&self) -> bool {
        matches!(self, Self::MalformedSegment { .. } | Self::ConvMismatch { .. })
    }
}
