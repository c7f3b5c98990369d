//! Per-connection worker task
//!
//! One worker runs while a connection is connected or disconnecting. Every
//! cycle it flushes the send queue, reads and processes inbound data, then
//! asks the protocol whether to keep going. It takes the socket mutex and the
//! queue mutex one at a time, never both.

use crate::connection::{configure_stream, Shared};
use crate::{
    ByteBuffer, ConnectionState, Context, DisconnectReason, Pop, Protocol, Result, TransportError,
};
use bytes::{Buf, Bytes};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::OwnedMutexGuard;
use tokio::time::{interval, timeout, MissedTickBehavior};

/// Open a TCP stream to `addr`, honouring the configured timeout and socket options
pub(crate) async fn establish(shared: &Shared, addr: SocketAddr) -> Result<TcpStream> {
    log::debug!("connection {}: connecting to {}", shared.id, addr);
    let connecting = TcpStream::connect(addr);
    let stream = match shared.config.connect_timeout {
        Some(limit) => timeout(limit, connecting)
            .await
            .map_err(|_| TransportError::Timeout)?,
        None => connecting.await,
    }
    .map_err(|e| TransportError::ConnectFailed(format!("{addr}: {e}")))?;

    configure_stream(&stream, &shared.config)?;
    Ok(stream)
}

/// Worker entry point.
///
/// `guard` is the loop-running lock; when the caller could not take it
/// without waiting (a previous worker is still tearing down) the worker
/// waits for it here. With `connect_to` set the worker first performs the
/// connect on behalf of an asynchronous connect.
pub(crate) async fn run<P: Protocol>(
    shared: Arc<Shared>,
    protocol: Arc<P>,
    guard: Option<OwnedMutexGuard<()>>,
    connect_to: Option<(SocketAddr, u64)>,
) {
    let _running = match guard {
        Some(guard) => guard,
        None => shared.loop_running.clone().lock_owned().await,
    };

    if let Some((addr, attempt)) = connect_to {
        match establish(&shared, addr).await {
            Ok(stream) => {
                if shared.finish_connect(attempt, stream).is_err() {
                    return;
                }
            }
            Err(err) => {
                if shared.fail_connect(attempt, &err) {
                    protocol.clear_buffers();
                }
                return;
            }
        }
    }

    let mut worker = Worker::new(shared, protocol);
    worker.run().await;
}

struct Worker<P: Protocol> {
    shared: Arc<Shared>,
    protocol: Arc<P>,
    remote: Option<SocketAddr>,
    inbound: ByteBuffer,
    /// Chunk popped from the queue and partially written; always goes out
    /// before anything still queued.
    in_flight: Option<Bytes>,
    scratch: Vec<u8>,
}

impl<P: Protocol> Worker<P> {
    fn new(shared: Arc<Shared>, protocol: Arc<P>) -> Self {
        let remote = shared.remote();
        let inbound = ByteBuffer::with_limit(shared.config.recv_buffer_limit);
        let scratch = vec![0; shared.config.read_chunk_size];
        Self {
            shared,
            protocol,
            remote,
            inbound,
            in_flight: None,
            scratch,
        }
    }

    async fn run(&mut self) {
        log::debug!(
            "connection {}: worker started ({} protocol)",
            self.shared.id,
            self.protocol.name()
        );
        let mut ticker = interval(self.shared.config.loop_granularity);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            match self.cycle().await {
                Ok(true) => {}
                Ok(false) => break,
                Err(err) => {
                    self.shared.drop_link(DisconnectReason::from(&err));
                    break;
                }
            }
        }

        self.teardown();
    }

    /// One send/receive/process round. `Ok(false)` ends the loop.
    async fn cycle(&mut self) -> Result<bool> {
        match self.shared.state() {
            ConnectionState::Connected => {
                self.send_step(false).await?;
                self.recv_step().await?;
            }
            ConnectionState::Disconnecting => {
                let drained = self.send_step(true).await?;
                self.recv_step().await?;
                if drained {
                    self.shared.close_graceful();
                    return Ok(false);
                }
            }
            ConnectionState::Connecting | ConnectionState::Disconnected => return Ok(false),
        }

        let ctx = Context::new(self.shared.id, self.remote, &self.shared.queue);
        if !self.protocol.process(&ctx).await {
            log::debug!("connection {}: protocol stopped processing", self.shared.id);
            self.shared.drop_link(DisconnectReason::LivenessStopped);
            return Ok(false);
        }
        Ok(true)
    }

    /// Write queued data until the socket would block or the queue is empty.
    ///
    /// `drain` uses the blocking pop so a graceful disconnect can never skip
    /// a cycle. Returns whether everything queued has been written (only
    /// computed when draining); a drained queue is left closed.
    async fn send_step(&mut self, drain: bool) -> Result<bool> {
        let mut written = 0usize;
        loop {
            if self.in_flight.is_none() {
                let chunk = if drain {
                    self.shared.queue.pop_force()
                } else {
                    match self.shared.queue.try_pop() {
                        Pop::Chunk(chunk) => Some(chunk),
                        Pop::Empty => None,
                        Pop::Contended => {
                            log::trace!("connection {}: send queue busy, skipping", self.shared.id);
                            None
                        }
                    }
                };
                match chunk {
                    Some(chunk) => {
                        self.in_flight = Some(self.protocol.encode_outbound(chunk).await?);
                    }
                    None => break,
                }
            }

            let Some(chunk) = self.in_flight.as_mut() else {
                break;
            };
            if chunk.is_empty() {
                self.in_flight = None;
                continue;
            }

            match self.shared.with_stream(|stream| stream.try_write(&chunk[..]))? {
                Ok(0) => {
                    return Err(TransportError::SendFailed(
                        "socket accepted zero bytes".to_string(),
                    ))
                }
                Ok(n) => {
                    written += n;
                    chunk.advance(n);
                    if chunk.is_empty() {
                        self.in_flight = None;
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    log::warn!("connection {}: send failed: {}", self.shared.id, e);
                    return Err(TransportError::SendFailed(e.to_string()));
                }
            }
        }

        if written > 0 {
            log::trace!("connection {}: sent {} bytes", self.shared.id, written);
        }
        Ok(drain && self.in_flight.is_none() && self.shared.queue.close_if_empty())
    }

    /// Read whatever the socket has, feeding the protocol after every read
    async fn recv_step(&mut self) -> Result<()> {
        loop {
            let read = self
                .shared
                .with_stream(|stream| stream.try_read(&mut self.scratch))?;
            let n = match read {
                Ok(0) => {
                    log::info!("connection {}: closed by peer", self.shared.id);
                    return Err(TransportError::PeerClosed);
                }
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("connection {}: receive failed: {}", self.shared.id, e);
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
            };
            log::trace!("connection {}: received {} bytes", self.shared.id, n);

            if let Err(err) = self
                .protocol
                .decode_inbound(&self.scratch[..n], &mut self.inbound)
                .await
            {
                if let TransportError::BufferLimitExceeded { limit, attempted } = &err {
                    log::warn!(
                        "connection {}: inbound buffer limit exceeded ({} > {})",
                        self.shared.id,
                        attempted,
                        limit
                    );
                }
                return Err(err);
            }

            let ctx = Context::new(self.shared.id, self.remote, &self.shared.queue);
            self.protocol
                .process_received(&mut self.inbound, &ctx)
                .await?;

            if n < self.scratch.len() {
                return Ok(());
            }
        }
    }

    fn teardown(&mut self) {
        // Normally already disconnected; covers a worker that exits while
        // still owning the link.
        self.shared.drop_link(DisconnectReason::Aborted);
        self.in_flight = None;
        self.inbound.release();
        self.shared.queue.close_and_clear();
        self.protocol.clear_buffers();
        log::debug!("connection {}: worker exited", self.shared.id);
    }
}
