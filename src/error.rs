//! Error types for the TCP transport

use crate::ConnectionState;
use std::io;
use thiserror::Error;

/// Result type alias for transport operations
pub type Result<T> = std::result::Result<T, TransportError>;

/// Main error type for transport operations.
///
/// Every failure that ends a connection converges on the same hard-disconnect
/// path inside the worker; the variant only tells the caller (and the log)
/// which way it got there.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection establishment failed.
    #[error("Connection establishment failed: {0}")]
    ConnectFailed(String),

    /// The connect attempt did not finish within the configured timeout.
    #[error("Operation timed out")]
    Timeout,

    /// The operation is not valid for the current connection state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Zero-length payloads are never queued.
    #[error("Refusing to queue an empty payload")]
    EmptyPayload,

    /// The outbound queue is bounded and this push would overflow it.
    #[error("Send queue full: {queued} bytes queued, limit is {limit}")]
    SendQueueFull { queued: usize, limit: usize },

    /// A bounded buffer (the inbound buffer) would grow past its hard limit.
    #[error("Buffer limit exceeded: {attempted} bytes requested, limit is {limit}")]
    BufferLimitExceeded { limit: usize, attempted: usize },

    /// Writing queued data to the socket failed.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Reading from the socket failed.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// The remote end closed the connection.
    #[error("Connection closed by peer")]
    PeerClosed,

    /// The protocol layer rejected the inbound data or failed a hook.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A worker loop already owns this connection.
    #[error("Worker loop is already running")]
    LoopAlreadyRunning,

    /// The operation was cancelled by a hard disconnect.
    #[error("Connection aborted")]
    Aborted,

    /// Configuration values that cannot drive a connection.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// An underlying I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    pub(crate) fn invalid_state(operation: &str, state: ConnectionState) -> Self {
        TransportError::InvalidState(format!("cannot {operation} while {state}"))
    }
}
