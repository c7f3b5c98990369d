//! Connection implementation for the TCP transport
//!
//! A [`TcpConnection`] owns a socket, an outbound [`SendQueue`] and, while
//! connected, one worker task that moves bytes between the two. Shared state
//! is split across three independent locks and no code path holds more than
//! one of them at a time:
//!
//! 1. the socket mutex: socket handle, state and remote address;
//! 2. the loop-running mutex: held by the worker for its whole lifetime;
//! 3. the send-queue mutex, inside [`SendQueue`].

use crate::worker;
use crate::{
    ConnectionConfig, ConnectionEvent, ConnectionId, ConnectionState, DisconnectReason, Protocol,
    Result, SendQueue, TransportError,
};
use bytes::Bytes;
use std::net::{IpAddr, Shutdown, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, OwnedMutexGuard};

/// Everything guarded by the socket mutex.
///
/// `stream` is present exactly while the state is `Connected` or
/// `Disconnecting`. During `Connecting` the half-open socket belongs to the
/// pending connect future, which installs it on success and drops it on
/// failure or abort, so it never outlives the attempt.
struct SocketState {
    stream: Option<TcpStream>,
    state: ConnectionState,
    remote: Option<SocketAddr>,
    /// Bumped on every connect attempt so a stale attempt cannot roll back a newer one.
    attempt: u64,
}

/// State shared between the connection handle and its worker task
pub(crate) struct Shared {
    pub(crate) id: ConnectionId,
    pub(crate) config: ConnectionConfig,
    socket: Mutex<SocketState>,
    pub(crate) loop_running: Arc<tokio::sync::Mutex<()>>,
    pub(crate) queue: SendQueue,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

impl Shared {
    fn new(config: ConnectionConfig, events: mpsc::UnboundedSender<ConnectionEvent>) -> Self {
        Self {
            id: ConnectionId::new(),
            queue: SendQueue::new(config.send_queue_limit),
            config,
            socket: Mutex::new(SocketState {
                stream: None,
                state: ConnectionState::Disconnected,
                remote: None,
                attempt: 0,
            }),
            loop_running: Arc::new(tokio::sync::Mutex::new(())),
            events,
        }
    }

    fn lock_socket(&self) -> MutexGuard<'_, SocketState> {
        self.socket.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: ConnectionEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    fn transition(&self, socket: &mut SocketState, next: ConnectionState) {
        debug_assert!(
            socket.state.can_transition_to(next),
            "illegal transition {} -> {}",
            socket.state,
            next
        );
        log::debug!("connection {}: {} -> {}", self.id, socket.state, next);
        socket.state = next;
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.lock_socket().state
    }

    pub(crate) fn remote(&self) -> Option<SocketAddr> {
        self.lock_socket().remote
    }

    /// Disconnected -> Connecting, recording the target address. Returns the
    /// attempt number.
    fn begin_connect(&self, addr: SocketAddr) -> Result<u64> {
        let mut socket = self.lock_socket();
        if socket.state != ConnectionState::Disconnected {
            return Err(TransportError::invalid_state("connect", socket.state));
        }
        socket.remote = Some(addr);
        socket.attempt = socket.attempt.wrapping_add(1);
        self.transition(&mut socket, ConnectionState::Connecting);
        Ok(socket.attempt)
    }

    /// Connecting -> Connected with the freshly established stream.
    ///
    /// Fails with [`TransportError::Aborted`] (dropping the stream) when a
    /// hard disconnect won the race against the connect, or when `attempt`
    /// is no longer the attempt in progress. A stale attempt leaves the queue
    /// of the current session alone.
    pub(crate) fn finish_connect(&self, attempt: u64, stream: TcpStream) -> Result<SocketAddr> {
        if !self.is_current_attempt(attempt) {
            log::debug!(
                "connection {}: stale connect attempt {} completed, dropping socket",
                self.id,
                attempt
            );
            return Err(TransportError::Aborted);
        }
        // Leftovers from an earlier session must not leak into this one.
        self.queue.reopen();
        let installed = {
            let mut socket = self.lock_socket();
            if socket.state == ConnectionState::Connecting && socket.attempt == attempt {
                let remote = match socket.remote {
                    Some(remote) => Ok(remote),
                    None => stream.peer_addr().map_err(TransportError::from),
                };
                remote.map(|remote| {
                    socket.stream = Some(stream);
                    socket.remote = Some(remote);
                    self.transition(&mut socket, ConnectionState::Connected);
                    remote
                })
            } else {
                Err(TransportError::Aborted)
            }
        };
        let remote = match installed {
            Ok(remote) => remote,
            Err(err) => {
                // The reopen above must not outlive a failed attempt.
                self.queue.close_and_clear();
                match err {
                    TransportError::Aborted => log::debug!(
                        "connection {}: connect completed after abort, dropping socket",
                        self.id
                    ),
                    _ => {
                        self.fail_connect(attempt, &err);
                    }
                }
                return Err(err);
            }
        };
        log::info!("connection {}: connected to {}", self.id, remote);
        self.emit(ConnectionEvent::Connected { remote });
        Ok(remote)
    }

    fn is_current_attempt(&self, attempt: u64) -> bool {
        let socket = self.lock_socket();
        socket.state == ConnectionState::Connecting && socket.attempt == attempt
    }

    /// Connecting -> Disconnected after attempt `attempt` failed.
    ///
    /// Returns whether the state was rolled back; a stale attempt changes
    /// nothing.
    pub(crate) fn fail_connect(&self, attempt: u64, err: &TransportError) -> bool {
        {
            let mut socket = self.lock_socket();
            if socket.state != ConnectionState::Connecting || socket.attempt != attempt {
                return false;
            }
            socket.remote = None;
            self.transition(&mut socket, ConnectionState::Disconnected);
        }
        log::info!("connection {}: connect failed: {}", self.id, err);
        self.emit(ConnectionEvent::ConnectFailed(err.to_string()));
        true
    }

    /// Hard disconnect from any of `from`: closes the socket, forgets the
    /// remote address and discards queued data. Returns whether a
    /// transition happened.
    pub(crate) fn hard_disconnect(
        &self,
        from: &[ConnectionState],
        reason: DisconnectReason,
    ) -> bool {
        let stream = {
            let mut socket = self.lock_socket();
            if !from.contains(&socket.state) {
                return false;
            }
            socket.remote = None;
            self.transition(&mut socket, ConnectionState::Disconnected);
            socket.stream.take()
        };
        drop(stream);

        let discarded = self.queue.close_and_clear();
        match &reason {
            DisconnectReason::Error(_) => log::warn!(
                "connection {}: hard disconnect ({}), discarded {} queued bytes",
                self.id,
                reason,
                discarded
            ),
            _ => log::info!(
                "connection {}: hard disconnect ({}), discarded {} queued bytes",
                self.id,
                reason,
                discarded
            ),
        }
        self.emit(ConnectionEvent::Disconnected(reason));
        true
    }

    /// Hard disconnect initiated by the worker; only touches the states a
    /// running worker owns, never a newer connect attempt.
    pub(crate) fn drop_link(&self, reason: DisconnectReason) -> bool {
        self.hard_disconnect(
            &[ConnectionState::Connected, ConnectionState::Disconnecting],
            reason,
        )
    }

    /// Connected -> Disconnecting; Connecting is aborted outright.
    ///
    /// The queue is closed before the state changes, so every byte a caller
    /// managed to queue is already there when the worker starts draining.
    fn begin_disconnect(&self) {
        self.queue.close();
        let state = {
            let mut socket = self.lock_socket();
            if socket.state == ConnectionState::Connected {
                self.transition(&mut socket, ConnectionState::Disconnecting);
            }
            socket.state
        };
        match state {
            ConnectionState::Disconnecting => {
                // A connect that completed while this request was in flight
                // reopens the queue; close it again now that the state is
                // settled.
                self.queue.close();
                log::info!("connection {}: disconnect requested, draining send queue", self.id);
                self.emit(ConnectionEvent::Disconnecting);
            }
            ConnectionState::Connecting => {
                self.hard_disconnect(&[ConnectionState::Connecting], DisconnectReason::Aborted);
            }
            _ => {}
        }
    }

    /// Disconnecting -> Disconnected once the send queue has drained
    pub(crate) fn close_graceful(&self) -> bool {
        let stream = {
            let mut socket = self.lock_socket();
            if socket.state != ConnectionState::Disconnecting {
                return false;
            }
            socket.remote = None;
            self.transition(&mut socket, ConnectionState::Disconnected);
            socket.stream.take()
        };
        if let Some(stream) = stream {
            if let Err(e) = socket2::SockRef::from(&stream).shutdown(Shutdown::Write) {
                log::debug!("connection {}: shutdown failed: {}", self.id, e);
            }
        }
        log::info!("connection {}: disconnected gracefully", self.id);
        self.emit(ConnectionEvent::Disconnected(DisconnectReason::Graceful));
        true
    }

    /// Install an already-connected stream (server side)
    fn adopt(&self, stream: TcpStream, remote: SocketAddr) {
        {
            let mut socket = self.lock_socket();
            socket.stream = Some(stream);
            socket.remote = Some(remote);
            socket.state = ConnectionState::Connected;
        }
        log::info!("connection {}: accepted from {}", self.id, remote);
        self.emit(ConnectionEvent::Connected { remote });
    }

    /// Run a non-blocking socket call under the socket mutex.
    ///
    /// Fails with [`TransportError::Aborted`] if the socket has already been
    /// closed by another thread.
    pub(crate) fn with_stream<R>(
        &self,
        f: impl FnOnce(&TcpStream) -> std::io::Result<R>,
    ) -> Result<std::io::Result<R>> {
        let socket = self.lock_socket();
        match socket.stream.as_ref() {
            Some(stream) => Ok(f(stream)),
            None => Err(TransportError::Aborted),
        }
    }

    /// Reject application data unless the connection is `Connected`
    fn ensure_connected(&self, operation: &str) -> Result<()> {
        let state = self.state();
        if state != ConnectionState::Connected {
            return Err(TransportError::invalid_state(operation, state));
        }
        Ok(())
    }
}

/// Rolls a connect attempt back to `Disconnected` if the future driving it is
/// dropped before the outcome is recorded
struct PendingConnect<'a> {
    shared: &'a Shared,
    attempt: u64,
    armed: bool,
}

impl<'a> PendingConnect<'a> {
    fn new(shared: &'a Shared, attempt: u64) -> Self {
        Self {
            shared,
            attempt,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingConnect<'_> {
    fn drop(&mut self) {
        if self.armed {
            log::debug!("connection {}: connect cancelled", self.shared.id);
            self.shared.fail_connect(self.attempt, &TransportError::Aborted);
        }
    }
}

/// Apply the configured socket options to a connected stream
pub(crate) fn configure_stream(stream: &TcpStream, config: &ConnectionConfig) -> Result<()> {
    stream.set_nodelay(config.nodelay)?;
    if let Some(idle) = config.keepalive {
        let keepalive = socket2::TcpKeepalive::new().with_time(idle);
        socket2::SockRef::from(stream).set_tcp_keepalive(&keepalive)?;
    }
    Ok(())
}

/// A queued, thread-safe TCP connection driven by a background worker.
///
/// All methods take `&self`; wrap the connection in an `Arc` to share it
/// between tasks or threads. `send` never touches the socket, it only
/// queues bytes for the worker.
///
/// Dropping a connection that is still connected or connecting aborts it.
/// A connection dropped while `Disconnecting` keeps draining in the
/// background. Use [`close`](Self::close) to disconnect gracefully and wait
/// for the worker to exit.
pub struct TcpConnection<P: Protocol> {
    shared: Arc<Shared>,
    protocol: Arc<P>,
    events: tokio::sync::Mutex<mpsc::UnboundedReceiver<ConnectionEvent>>,
}

impl<P: Protocol> TcpConnection<P> {
    /// Create a new client connection in `Disconnected`
    pub fn new(protocol: P, config: ConnectionConfig) -> Result<Self> {
        config.validate()?;
        let (event_sender, event_receiver) = mpsc::unbounded_channel();
        Ok(Self {
            shared: Arc::new(Shared::new(config, event_sender)),
            protocol: Arc::new(protocol),
            events: tokio::sync::Mutex::new(event_receiver),
        })
    }

    /// Create a connection from an accepted socket.
    ///
    /// The connection starts `Connected` with its worker already running.
    /// Must be called from within a tokio runtime.
    pub fn from_accepted(stream: TcpStream, protocol: P, config: ConnectionConfig) -> Result<Self> {
        let runtime = current_runtime()?;
        let remote = stream.peer_addr()?;
        configure_stream(&stream, &config)?;

        let conn = Self::new(protocol, config)?;
        let guard = conn.acquire_loop()?;
        conn.shared.adopt(stream, remote);
        conn.start_loop(&runtime, guard);
        Ok(conn)
    }

    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.shared.config
    }

    /// The protocol driving this connection
    pub fn protocol(&self) -> &Arc<P> {
        &self.protocol
    }

    /// Get the current state of the connection
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Remote address, if a connection attempt is active
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.shared.remote()
    }

    pub fn remote_ip(&self) -> Option<IpAddr> {
        self.remote_addr().map(|addr| addr.ip())
    }

    pub fn remote_port(&self) -> Option<u16> {
        self.remote_addr().map(|addr| addr.port())
    }

    /// Remote address as `"address:port"`; `"0.0.0.0:0"` when there is none
    pub fn address(&self) -> String {
        match self.remote_addr() {
            Some(addr) => addr.to_string(),
            None => "0.0.0.0:0".to_string(),
        }
    }

    /// Connect and wait for the outcome.
    ///
    /// On success the connection is `Connected` and its worker is running.
    /// On failure, or when the future is dropped before it completes, it is
    /// back in `Disconnected`. A [`disconnect`](Self::disconnect)
    /// or [`abort`](Self::abort) issued meanwhile makes this return
    /// [`TransportError::Aborted`].
    pub async fn connect(&self, addr: SocketAddr) -> Result<()> {
        let runtime = current_runtime()?;
        let attempt = self.shared.begin_connect(addr)?;
        let pending = PendingConnect::new(&self.shared, attempt);

        // A previous worker may still be finishing its teardown.
        let guard = match self.acquire_loop() {
            Ok(guard) => guard,
            Err(_) => self.shared.loop_running.clone().lock_owned().await,
        };

        let established = worker::establish(&self.shared, addr).await;
        pending.disarm();
        let stream = match established {
            Ok(stream) => stream,
            Err(err) => {
                self.shared.fail_connect(attempt, &err);
                return Err(err);
            }
        };
        self.shared.finish_connect(attempt, stream)?;
        self.start_loop(&runtime, guard);
        Ok(())
    }

    /// Start connecting in the background and return immediately.
    ///
    /// Only precondition failures are reported here; the outcome of the
    /// connect itself shows up as a state change and a
    /// [`ConnectionEvent::Connected`] or [`ConnectionEvent::ConnectFailed`].
    pub fn async_connect(&self, addr: SocketAddr) -> Result<()> {
        let runtime = current_runtime()?;
        let attempt = self.shared.begin_connect(addr)?;

        let guard = self.acquire_loop().ok();
        self.spawn_worker(&runtime, guard, Some((addr, attempt)));
        Ok(())
    }

    /// Schedule a graceful disconnect.
    ///
    /// A connected connection moves to `Disconnecting`; the worker sends
    /// everything still queued and then closes the socket. A connect in
    /// progress is aborted. Otherwise this does nothing.
    pub fn disconnect(&self) {
        self.shared.begin_disconnect();
    }

    /// Hard disconnect: close the socket now and discard queued data
    pub fn abort(&self) {
        self.shared.hard_disconnect(
            &[
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Disconnecting,
            ],
            DisconnectReason::Aborted,
        );
    }

    /// Disconnect gracefully and wait until the worker has exited
    pub async fn close(&self) {
        self.disconnect();
        self.wait_loop().await;
    }

    /// Queue data to be sent.
    ///
    /// Fails unless the connection is `Connected`, the payload is non-empty
    /// and, with a queue limit configured, there is room for it.
    pub fn send(&self, data: &[u8]) -> Result<()> {
        self.shared.ensure_connected("send")?;
        self.shared.queue.push_back(data)
    }

    /// Queue an owned chunk to be sent
    pub fn send_bytes(&self, data: Bytes) -> Result<()> {
        self.shared.ensure_connected("send")?;
        self.shared.queue.push_back_bytes(data)
    }

    /// Queue a header and payload as one unit, e.g. a length prefix and its message
    pub fn send_framed(&self, head: &[u8], payload: &[u8]) -> Result<()> {
        self.shared.ensure_connected("send")?;
        self.shared.queue.push_back_framed(head, payload)
    }

    /// Queue data ahead of everything not yet handed to the socket
    pub fn send_urgent(&self, data: &[u8]) -> Result<()> {
        self.shared.ensure_connected("send")?;
        self.shared.queue.push_front(data)
    }

    /// Bytes waiting in the send queue
    pub fn queued_len(&self) -> usize {
        self.shared.queue.len()
    }

    /// `(used, allocated)` size of the send queue
    pub fn queue_usage(&self) -> (usize, usize) {
        self.shared.queue.usage()
    }

    /// Get the next event from the connection
    pub async fn next_event(&self) -> Option<ConnectionEvent> {
        let mut receiver = self.events.lock().await;
        receiver.recv().await
    }

    /// Whether a worker currently owns this connection
    pub fn is_loop_running(&self) -> bool {
        self.shared.loop_running.try_lock().is_err()
    }

    /// Wait until the worker (if any) has exited and torn down
    pub async fn wait_loop(&self) {
        let _running = self.shared.loop_running.lock().await;
    }

    #[cfg(test)]
    pub(crate) fn send_queue(&self) -> &SendQueue {
        &self.shared.queue
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Shared {
        &self.shared
    }

    pub(crate) fn acquire_loop(&self) -> Result<OwnedMutexGuard<()>> {
        self.shared
            .loop_running
            .clone()
            .try_lock_owned()
            .map_err(|_| TransportError::LoopAlreadyRunning)
    }

    /// Start the worker for an established connection. `guard` proves no
    /// other worker is running.
    fn start_loop(&self, runtime: &Handle, guard: OwnedMutexGuard<()>) {
        self.spawn_worker(runtime, Some(guard), None);
    }

    fn spawn_worker(
        &self,
        runtime: &Handle,
        guard: Option<OwnedMutexGuard<()>>,
        connect_to: Option<(SocketAddr, u64)>,
    ) {
        runtime.spawn(worker::run(
            Arc::clone(&self.shared),
            Arc::clone(&self.protocol),
            guard,
            connect_to,
        ));
    }
}

impl<P: Protocol> Drop for TcpConnection<P> {
    fn drop(&mut self) {
        let aborted = self.shared.hard_disconnect(
            &[ConnectionState::Connecting, ConnectionState::Connected],
            DisconnectReason::Aborted,
        );
        if aborted {
            log::debug!("connection {}: dropped while active", self.shared.id);
        }
    }
}

impl<P: Protocol> std::fmt::Debug for TcpConnection<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnection")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .field("remote", &self.remote_addr())
            .field("protocol", &self.protocol.name())
            .finish()
    }
}

fn current_runtime() -> Result<Handle> {
    Handle::try_current().map_err(|e| {
        TransportError::InvalidState(format!("no tokio runtime available: {e}"))
    })
}
