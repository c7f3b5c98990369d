//! Protocol layer plugged into a connection
//!
//! The worker hands inbound bytes to a [`Protocol`] and lets it inject
//! outbound data through a [`Context`].

use crate::{ByteBuffer, ConnectionId, Result, SendQueue, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use tokio::sync::mpsc;

/// What a protocol hook can see of the connection it runs on
pub struct Context<'a> {
    id: ConnectionId,
    remote: Option<SocketAddr>,
    queue: &'a SendQueue,
}

impl<'a> Context<'a> {
    pub(crate) fn new(id: ConnectionId, remote: Option<SocketAddr>, queue: &'a SendQueue) -> Self {
        Self { id, remote, queue }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    /// The connection's outbound queue
    pub fn queue(&self) -> &SendQueue {
        self.queue
    }

    /// Queue a reply behind everything already queued
    pub fn send(&self, data: &[u8]) -> Result<()> {
        self.queue.push_back(data)
    }

    /// Queue bytes ahead of everything not yet handed to the socket
    pub fn send_urgent(&self, data: &[u8]) -> Result<()> {
        self.queue.push_front(data)
    }
}

/// Protocol layer plugged into a [`TcpConnection`](crate::TcpConnection).
///
/// Only [`process_received`](Protocol::process_received) is mandatory. The
/// worker calls the hooks from its own task, one at a time, with no
/// connection lock held.
#[async_trait]
pub trait Protocol: Send + Sync + 'static {
    /// Consume as many complete messages from `inbound` as are available.
    ///
    /// Bytes left in the buffer stay there for the next call. Returning an
    /// error forces a hard disconnect.
    async fn process_received(&self, inbound: &mut ByteBuffer, ctx: &Context<'_>) -> Result<()>;

    /// Called once per worker cycle after I/O. Returning `false` stops the
    /// connection.
    async fn process(&self, _ctx: &Context<'_>) -> bool {
        true
    }

    /// Transform a chunk popped from the send queue before it hits the socket
    async fn encode_outbound(&self, chunk: Bytes) -> Result<Bytes> {
        Ok(chunk)
    }

    /// Move freshly received bytes into the inbound buffer
    async fn decode_inbound(&self, received: &[u8], inbound: &mut ByteBuffer) -> Result<()> {
        inbound.extend_from_slice(received)
    }

    /// Drop any protocol-side state tied to the connection's buffers
    fn clear_buffers(&self) {}

    /// Get the name of this protocol for identification
    fn name(&self) -> &str {
        "raw"
    }
}

/// Length-prefix protocol
///
/// Every message carries a 4-byte big-endian length prefix. Complete frames
/// are handed to the receiver returned by [`LengthPrefixProtocol::new`].
pub struct LengthPrefixProtocol {
    frames: mpsc::UnboundedSender<Bytes>,
    max_frame_size: usize,
}

impl LengthPrefixProtocol {
    /// Frames above this size are treated as a protocol violation.
    pub const DEFAULT_MAX_FRAME_SIZE: usize = 512 * 1024;

    pub fn new() -> (Self, mpsc::UnboundedReceiver<Bytes>) {
        let (frames, receiver) = mpsc::unbounded_channel();
        (
            Self {
                frames,
                max_frame_size: Self::DEFAULT_MAX_FRAME_SIZE,
            },
            receiver,
        )
    }

    /// A frame can only arrive whole if `max_frame_size + 4` fits in the
    /// connection's receive buffer limit.
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    /// Header to pass as the first half of
    /// [`TcpConnection::send_framed`](crate::TcpConnection::send_framed)
    pub fn frame_header(payload_len: usize) -> Result<[u8; 4]> {
        let len = u32::try_from(payload_len).map_err(|_| {
            TransportError::Protocol(format!("frame of {payload_len} bytes is too large"))
        })?;
        Ok(len.to_be_bytes())
    }
}

#[async_trait]
impl Protocol for LengthPrefixProtocol {
    async fn process_received(&self, inbound: &mut ByteBuffer, _ctx: &Context<'_>) -> Result<()> {
        while let Some(len) = inbound.peek_u32_be(0) {
            let len = len as usize;
            if len > self.max_frame_size {
                return Err(TransportError::Protocol(format!(
                    "frame of {len} bytes exceeds maximum of {}",
                    self.max_frame_size
                )));
            }
            if inbound.len() < 4 + len {
                break;
            }

            inbound.advance(4);
            let frame = inbound.consume(len);
            if self.frames.send(frame).is_err() {
                return Err(TransportError::Protocol(
                    "frame receiver dropped".to_string(),
                ));
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "length-prefix"
    }
}
