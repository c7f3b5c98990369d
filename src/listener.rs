//! Listener implementation for the TCP transport
//!
//! Accepts inbound sockets and turns each into a [`TcpConnection`] that
//! starts out `Connected` with its worker already running.

use crate::{ConnectionConfig, Protocol, Result, TcpConnection, TransportError};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};

/// Event types that can be emitted by listeners
pub enum ListenerEvent<P: Protocol> {
    /// A new connection was received
    ConnectionReceived(TcpConnection<P>),
    /// Listener stopped
    Stopped,
    /// Error occurred
    Error(String),
}

impl<P: Protocol> std::fmt::Debug for ListenerEvent<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListenerEvent::ConnectionReceived(conn) => {
                f.debug_tuple("ConnectionReceived").field(conn).finish()
            }
            ListenerEvent::Stopped => f.write_str("Stopped"),
            ListenerEvent::Error(e) => f.debug_tuple("Error").field(e).finish(),
        }
    }
}

/// A Listener waits for incoming connections and wraps each accepted socket
/// with a fresh protocol instance from its factory
pub struct Listener<P: Protocol> {
    event_receiver: mpsc::UnboundedReceiver<ListenerEvent<P>>,
    stop_sender: broadcast::Sender<()>,
    active: Arc<AtomicBool>,
    connection_limit: Arc<AtomicUsize>,
    local_addr: SocketAddr,
}

impl<P: Protocol> Listener<P> {
    /// Bind to `addr` and start accepting.
    ///
    /// Every accepted socket gets `config` and a protocol built by `factory`.
    pub async fn bind<F>(addr: SocketAddr, config: ConnectionConfig, factory: F) -> Result<Self>
    where
        F: Fn() -> P + Send + Sync + 'static,
    {
        config.validate()?;
        let tcp_listener = TcpListener::bind(addr).await?;
        let local_addr = tcp_listener.local_addr()?;

        let (event_sender, event_receiver) = mpsc::unbounded_channel();
        let (stop_sender, _) = broadcast::channel(1);
        let active = Arc::new(AtomicBool::new(true));
        let connection_limit = Arc::new(AtomicUsize::new(usize::MAX));

        // Create a channel to signal when the accept loop is ready
        let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();

        let loop_active = Arc::clone(&active);
        let loop_limit = Arc::clone(&connection_limit);
        let mut stop_receiver = stop_sender.subscribe();

        tokio::spawn(async move {
            let _ = ready_tx.send(());
            log::info!("listening on {}", local_addr);

            loop {
                if !loop_active.load(Ordering::Relaxed) {
                    break;
                }

                tokio::select! {
                    _ = stop_receiver.recv() => {
                        break;
                    }
                    result = tcp_listener.accept() => {
                        match result {
                            Ok((stream, peer_addr)) => {
                                let current = loop_limit.load(Ordering::Relaxed);
                                if current == 0 {
                                    log::debug!("connection limit reached, dropping {}", peer_addr);
                                    drop(stream);
                                    continue;
                                }
                                if current != usize::MAX {
                                    loop_limit.fetch_sub(1, Ordering::Relaxed);
                                }

                                let accepted = TcpConnection::from_accepted(
                                    stream,
                                    factory(),
                                    config.clone(),
                                );
                                let event = match accepted {
                                    Ok(conn) => ListenerEvent::ConnectionReceived(conn),
                                    Err(e) => ListenerEvent::Error(format!("{peer_addr}: {e}")),
                                };
                                if event_sender.send(event).is_err() {
                                    // Listener handle is gone.
                                    break;
                                }
                            }
                            Err(e) => {
                                let _ = event_sender.send(ListenerEvent::Error(e.to_string()));
                            }
                        }
                    }
                }
            }

            loop_active.store(false, Ordering::Relaxed);
            log::info!("listener on {} stopped", local_addr);
            let _ = event_sender.send(ListenerEvent::Stopped);
        });

        // Wait for the accept loop to be ready
        let _ = ready_rx.await;

        Ok(Self {
            event_receiver,
            stop_sender,
            active,
            connection_limit,
            local_addr,
        })
    }

    /// Accept the next incoming connection
    pub async fn accept(&mut self) -> Result<TcpConnection<P>> {
        loop {
            match self.event_receiver.recv().await {
                Some(ListenerEvent::ConnectionReceived(connection)) => return Ok(connection),
                Some(ListenerEvent::Stopped) => {
                    return Err(TransportError::InvalidState(
                        "Listener stopped".to_string(),
                    ))
                }
                Some(ListenerEvent::Error(e)) => {
                    // Continue listening after non-fatal errors
                    log::warn!("listener on {}: {}", self.local_addr, e);
                }
                None => {
                    return Err(TransportError::InvalidState(
                        "Listener closed".to_string(),
                    ))
                }
            }
        }
    }

    /// Get the next event, including errors that `accept` would skip
    pub async fn next_event(&mut self) -> Option<ListenerEvent<P>> {
        self.event_receiver.recv().await
    }

    /// Stop listening for new connections
    pub fn stop(&self) {
        if self.active.swap(false, Ordering::Relaxed) {
            let _ = self.stop_sender.send(());
        }
    }

    /// Check if the listener is still active
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    /// Accept at most `limit` further connections
    pub fn set_new_connection_limit(&self, limit: usize) {
        self.connection_limit.store(limit, Ordering::Relaxed);
    }

    /// Get the local address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl<P: Protocol> Drop for Listener<P> {
    fn drop(&mut self) {
        self.stop();
    }
}

impl<P: Protocol> std::fmt::Debug for Listener<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("local_addr", &self.local_addr)
            .field("active", &self.active.load(Ordering::Relaxed))
            .field(
                "connection_limit",
                &self.connection_limit.load(Ordering::Relaxed),
            )
            .finish()
    }
}
