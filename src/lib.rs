//! # TCP Transport
//!
//! The transport layer of a game-server emulator: it turns a raw TCP socket
//! into a queued, thread-safe connection object that protocol code can build
//! on.
//!
//! A [`TcpConnection`] moves through `Disconnected -> Connecting ->
//! Connected -> Disconnecting -> Disconnected`. Callers queue outbound bytes
//! with [`TcpConnection::send`]; a per-connection worker task flushes the
//! queue, reads inbound data into a bounded [`ByteBuffer`] and hands it to
//! the connection's [`Protocol`]. Any I/O or protocol failure forces a hard
//! disconnect that discards queued data; [`TcpConnection::disconnect`] drains
//! the queue before closing.
//!
//! ```no_run
//! use tcp_transport::{ConnectionConfig, LengthPrefixProtocol, TcpConnection};
//!
//! # async fn demo() -> tcp_transport::Result<()> {
//! let (protocol, mut frames) = LengthPrefixProtocol::new();
//! let conn = TcpConnection::new(protocol, ConnectionConfig::default())?;
//! conn.connect("127.0.0.1:26000".parse().unwrap()).await?;
//!
//! let payload = b"hello";
//! conn.send_framed(&LengthPrefixProtocol::frame_header(payload.len())?, payload)?;
//! if let Some(reply) = frames.recv().await {
//!     println!("got {} bytes", reply.len());
//! }
//! conn.close().await;
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod connection;
pub mod error;
pub mod listener;
pub mod protocol;
pub mod send_queue;
pub mod types;
mod worker;

#[cfg(test)]
mod tests;

pub use buffer::ByteBuffer;
pub use connection::TcpConnection;
pub use error::{Result, TransportError};
pub use listener::{Listener, ListenerEvent};
pub use protocol::{Context, LengthPrefixProtocol, Protocol};
pub use send_queue::{Pop, SendQueue};
pub use types::*;
