//! Core data types and enumerations for the TCP transport

use crate::{Result, TransportError};
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use uuid::Uuid;

/// Time between two worker cycles.
pub const DEFAULT_LOOP_GRANULARITY: Duration = Duration::from_millis(10);
/// Hard ceiling for received-but-unconsumed bytes.
pub const DEFAULT_RECV_BUFFER_LIMIT: usize = 1024 * 1024;
/// Size of a single read from the socket.
pub const DEFAULT_READ_CHUNK_SIZE: usize = 4096;
/// Upper bound for an establishment attempt.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No connection; initial state, reusable for another connect.
    Disconnected,
    /// Connect attempt in flight.
    Connecting,
    /// Connection established, transferring data.
    Connected,
    /// Disconnect pending, waiting for the send queue to drain.
    Disconnecting,
}

impl ConnectionState {
    /// Whether moving from `self` to `next` is one of the edges of the state
    /// machine. Any state may fall back to `Disconnected`.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connected, Disconnecting)
                | (Connecting | Connected | Disconnecting, Disconnected)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
        };
        f.write_str(name)
    }
}

/// Why a connection ended up in [`ConnectionState::Disconnected`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Send queue drained after a caller-initiated disconnect.
    Graceful,
    /// The remote end closed the stream.
    PeerClosed,
    /// Hard disconnect requested locally (abort, drop, disconnect while connecting).
    Aborted,
    /// The protocol's liveness hook asked to stop processing.
    LivenessStopped,
    /// I/O failure, inbound-limit violation or protocol failure.
    Error(String),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Graceful => f.write_str("graceful disconnect"),
            DisconnectReason::PeerClosed => f.write_str("closed by peer"),
            DisconnectReason::Aborted => f.write_str("aborted"),
            DisconnectReason::LivenessStopped => f.write_str("processing stopped"),
            DisconnectReason::Error(msg) => write!(f, "error: {msg}"),
        }
    }
}

impl From<&TransportError> for DisconnectReason {
    fn from(err: &TransportError) -> Self {
        match err {
            TransportError::PeerClosed => DisconnectReason::PeerClosed,
            TransportError::Aborted => DisconnectReason::Aborted,
            other => DisconnectReason::Error(other.to_string()),
        }
    }
}

/// Event types that can be emitted by connections
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The connection entered `Connected`.
    Connected { remote: SocketAddr },
    /// An establishment attempt failed; the connection is `Disconnected` again.
    ConnectFailed(String),
    /// A graceful disconnect started draining the send queue.
    Disconnecting,
    /// The connection entered `Disconnected`.
    Disconnected(DisconnectReason),
}

/// Unique identifier for a connection, used to correlate log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Create a new unique connection ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Tunables for a single connection
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Period of the worker cycle.
    pub loop_granularity: Duration,
    /// Hard limit on received-but-unconsumed bytes; exceeding it is fatal.
    pub recv_buffer_limit: usize,
    /// Bytes requested from the socket per read.
    pub read_chunk_size: usize,
    /// Optional bound on queued outbound bytes. `None` means unbounded.
    pub send_queue_limit: Option<usize>,
    /// Upper bound on a single connect attempt. `None` waits for the OS.
    pub connect_timeout: Option<Duration>,
    /// Disable Nagle's algorithm on the socket.
    pub nodelay: bool,
    /// Idle time before TCP keepalive probes start. `None` leaves the OS default.
    pub keepalive: Option<Duration>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            loop_granularity: DEFAULT_LOOP_GRANULARITY,
            recv_buffer_limit: DEFAULT_RECV_BUFFER_LIMIT,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            send_queue_limit: None,
            connect_timeout: Some(DEFAULT_CONNECT_TIMEOUT),
            nodelay: true,
            keepalive: None,
        }
    }
}

impl ConnectionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_loop_granularity(mut self, granularity: Duration) -> Self {
        self.loop_granularity = granularity;
        self
    }

    pub fn with_recv_buffer_limit(mut self, limit: usize) -> Self {
        self.recv_buffer_limit = limit;
        self
    }

    pub fn with_read_chunk_size(mut self, size: usize) -> Self {
        self.read_chunk_size = size;
        self
    }

    pub fn with_send_queue_limit(mut self, limit: usize) -> Self {
        self.send_queue_limit = Some(limit);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    pub fn with_keepalive(mut self, idle: Duration) -> Self {
        self.keepalive = Some(idle);
        self
    }

    /// Reject values that would stall or break the worker loop
    pub fn validate(&self) -> Result<()> {
        if self.loop_granularity.is_zero() {
            return Err(TransportError::InvalidConfig(
                "loop granularity must be non-zero".to_string(),
            ));
        }
        if self.recv_buffer_limit == 0 {
            return Err(TransportError::InvalidConfig(
                "receive buffer limit must be non-zero".to_string(),
            ));
        }
        if self.read_chunk_size == 0 {
            return Err(TransportError::InvalidConfig(
                "read chunk size must be non-zero".to_string(),
            ));
        }
        if self.send_queue_limit == Some(0) {
            return Err(TransportError::InvalidConfig(
                "send queue limit must be non-zero when set".to_string(),
            ));
        }
        Ok(())
    }
}
