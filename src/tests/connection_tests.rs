//! Data transfer tests for TcpConnection

use crate::tests::test_utils::*;
use crate::{ConnectionEvent, ConnectionState, DisconnectReason, TcpConnection, TransportError};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_test::assert_pending;

#[tokio::test]
async fn test_ping_reaches_peer() {
    init_logging();

    let (conn, mut peer) = connected_pair(Recorder::default(), fast_config()).await;
    conn.send(b"PING").unwrap();
    assert_eq!(read_exactly(&mut peer, 4).await, b"PING");

    conn.disconnect();
    assert!(read_until_eof(&mut peer).await.is_empty());
    wait_for_state(&conn, ConnectionState::Disconnected).await;
}

#[tokio::test]
async fn test_sends_arrive_in_order() {
    init_logging();

    let (conn, mut peer) = connected_pair(Recorder::default(), fast_config()).await;
    let mut expected = Vec::new();
    for i in 0u32..1000 {
        let record = i.to_be_bytes();
        conn.send(&record).unwrap();
        expected.extend_from_slice(&record);
        if i % 100 == 0 {
            tokio::task::yield_now().await;
        }
    }

    assert_eq!(read_exactly(&mut peer, expected.len()).await, expected);
}

#[tokio::test]
async fn test_send_bytes_and_framed() {
    init_logging();

    let (conn, mut peer) = connected_pair(Recorder::default(), fast_config()).await;
    conn.send_bytes(bytes::Bytes::from_static(b"owned|")).unwrap();
    conn.send_framed(b"HEAD:", b"body").unwrap();

    assert_eq!(read_exactly(&mut peer, 15).await, b"owned|HEAD:body");
}

#[tokio::test]
async fn test_urgent_send_jumps_queue() {
    init_logging();

    let (conn, mut peer) = connected_pair(Recorder::default(), fast_config()).await;

    // No await in between, so the worker has not popped anything yet
    conn.send(b"AAAA").unwrap();
    conn.send(b"BBBB").unwrap();
    conn.send_urgent(b"UU").unwrap();

    assert_eq!(read_exactly(&mut peer, 10).await, b"UUAAAABBBB");
}

#[tokio::test]
async fn test_empty_send_rejected() {
    init_logging();

    let (conn, _peer) = connected_pair(Recorder::default(), fast_config()).await;
    assert!(matches!(conn.send(b""), Err(TransportError::EmptyPayload)));
    assert!(matches!(
        conn.send_urgent(b""),
        Err(TransportError::EmptyPayload)
    ));
    assert_eq!(conn.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_send_queue_limit_rejects_overflow() {
    init_logging();

    let config = fast_config().with_send_queue_limit(8);
    let (conn, mut peer) = connected_pair(Recorder::default(), config).await;

    conn.send(b"12345678").unwrap();
    assert!(matches!(
        conn.send(b"9"),
        Err(TransportError::SendQueueFull { queued: 8, limit: 8 })
    ));
    assert_eq!(conn.queued_len(), 8);

    // The worker drains the queue and frees room again
    assert_eq!(read_exactly(&mut peer, 8).await, b"12345678");
    wait_until(|| conn.queued_len() == 0).await;
    conn.send(b"9").unwrap();
    assert_eq!(read_exactly(&mut peer, 1).await, b"9");
}

#[tokio::test]
async fn test_graceful_disconnect_drains_queue() {
    init_logging();

    let (conn, mut peer) = connected_pair(Recorder::default(), fast_config()).await;
    let payload: Vec<u8> = (0..4 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
    for chunk in payload.chunks(64 * 1024) {
        conn.send(chunk).unwrap();
    }
    conn.disconnect();

    assert_eq!(conn.state(), ConnectionState::Disconnecting);
    assert!(matches!(
        conn.send(b"late"),
        Err(TransportError::InvalidState(_))
    ));

    let received = read_until_eof(&mut peer).await;
    assert_eq!(received.len(), payload.len());
    assert!(received == payload);

    assert_eq!(next_disconnect(&conn).await, DisconnectReason::Graceful);
    conn.wait_loop().await;
    assert_eq!(conn.queued_len(), 0);
}

#[tokio::test]
async fn test_abort_discards_queued_data() {
    init_logging();

    let (conn, mut peer) = connected_pair(Recorder::default(), fast_config()).await;

    // Queued but never handed to the socket
    conn.send(&[7u8; 64 * 1024]).unwrap();
    assert_eq!(conn.queued_len(), 64 * 1024);
    conn.abort();

    assert_eq!(conn.queued_len(), 0);
    assert_eq!(conn.state(), ConnectionState::Disconnected);
    assert!(read_until_eof(&mut peer).await.is_empty());
    assert_eq!(next_disconnect(&conn).await, DisconnectReason::Aborted);
}

#[tokio::test]
async fn test_peer_reset_while_draining_discards_queue() {
    init_logging();

    let (conn, peer) = connected_pair(Recorder::default(), fast_config()).await;
    let backlog = stall_with_backlog(&conn, 32 * 1024 * 1024).await;
    conn.disconnect();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(conn.state(), ConnectionState::Disconnecting);
    assert_eq!(conn.queued_len(), backlog);

    reset_peer(peer);

    match next_disconnect(&conn).await {
        DisconnectReason::PeerClosed | DisconnectReason::Error(_) => {}
        other => panic!("Expected a peer failure, got {other:?}"),
    }
    assert_eq!(conn.state(), ConnectionState::Disconnected);
    assert_eq!(conn.queued_len(), 0);
    conn.wait_loop().await;
}

#[tokio::test]
async fn test_abort_while_draining_discards_queue() {
    init_logging();

    let (conn, _peer) = connected_pair(Recorder::default(), fast_config()).await;
    let backlog = stall_with_backlog(&conn, 32 * 1024 * 1024).await;
    conn.disconnect();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(conn.state(), ConnectionState::Disconnecting);
    assert_eq!(conn.queued_len(), backlog);

    conn.abort();

    assert_eq!(next_disconnect(&conn).await, DisconnectReason::Aborted);
    assert_eq!(conn.state(), ConnectionState::Disconnected);
    assert_eq!(conn.queued_len(), 0);
    crate::test_timeout!(5, conn.wait_loop());
}

#[tokio::test]
async fn test_drain_delivers_bytes_queued_after_reopen() {
    init_logging();

    let (conn, mut peer) = connected_pair(Recorder::default(), fast_config()).await;
    conn.send(b"first|").unwrap();
    conn.disconnect();

    // A connect completing concurrently reopens the queue during
    // Disconnecting, discarding what was queued before it
    conn.send_queue().reopen();
    conn.send_queue().push_back(b"second").unwrap();

    assert_eq!(read_until_eof(&mut peer).await, b"second");
    conn.wait_loop().await;
    assert!(!conn.send_queue().is_open());
    assert!(conn.send_queue().push_back(b"third").is_err());
}

#[tokio::test]
async fn test_receive_path_feeds_protocol() {
    init_logging();

    let config = fast_config().with_read_chunk_size(16);
    let (conn, mut peer) = connected_pair(Recorder::default(), config).await;

    let mut expected = Vec::new();
    for i in 0u8..50 {
        let line = format!("message {i};");
        peer.write_all(line.as_bytes()).await.unwrap();
        expected.extend_from_slice(line.as_bytes());
    }

    let recorder = Arc::clone(conn.protocol());
    wait_until(|| recorder.received().len() == expected.len()).await;
    assert_eq!(recorder.received(), expected);
    assert_eq!(conn.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_peer_close_forces_disconnect() {
    init_logging();

    let (conn, peer) = connected_pair(Recorder::default(), fast_config()).await;
    drop(peer);

    assert_eq!(next_disconnect(&conn).await, DisconnectReason::PeerClosed);
    assert_eq!(conn.state(), ConnectionState::Disconnected);
    assert_eq!(conn.remote_addr(), None);

    conn.wait_loop().await;
    assert!(conn.protocol().was_cleared());
    assert!(matches!(
        conn.send(b"after"),
        Err(TransportError::InvalidState(_))
    ));
}

#[tokio::test]
async fn test_inbound_limit_is_fatal() {
    init_logging();

    let config = fast_config()
        .with_recv_buffer_limit(1024)
        .with_read_chunk_size(256);
    let (conn, mut peer) = connected_pair(Hoarder::default(), config).await;

    peer.write_all(&[1u8; 4096]).await.unwrap();

    match next_disconnect(&conn).await {
        DisconnectReason::Error(msg) => assert!(msg.contains("limit"), "{msg}"),
        other => panic!("Expected an error disconnect, got {other:?}"),
    }
    assert!(conn.protocol().high_water() <= 1024);
    assert_eq!(conn.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_protocol_failure_forces_disconnect() {
    init_logging();

    let (conn, mut peer) = connected_pair(Rejecting, fast_config()).await;
    conn.send(&[0u8; 1024]).unwrap();
    peer.write_all(b"garbage").await.unwrap();

    match next_disconnect(&conn).await {
        DisconnectReason::Error(msg) => assert!(msg.contains("unexpected data"), "{msg}"),
        other => panic!("Expected an error disconnect, got {other:?}"),
    }
    assert_eq!(conn.state(), ConnectionState::Disconnected);
    assert_eq!(conn.queued_len(), 0);
}

#[tokio::test]
async fn test_liveness_hook_stops_connection() {
    init_logging();

    let (conn, mut peer) = connected_pair(StopAfter::new(3), fast_config()).await;

    assert_eq!(next_disconnect(&conn).await, DisconnectReason::LivenessStopped);
    assert_eq!(conn.state(), ConnectionState::Disconnected);
    assert!(read_until_eof(&mut peer).await.is_empty());
}

#[tokio::test]
async fn test_wait_loop_blocks_until_worker_exits() {
    init_logging();

    let (conn, _peer) = connected_pair(Recorder::default(), fast_config()).await;
    assert!(conn.is_loop_running());

    {
        let mut wait = tokio_test::task::spawn(conn.wait_loop());
        assert_pending!(wait.poll());
    }

    conn.abort();
    crate::test_timeout!(5, conn.wait_loop());
    assert!(!conn.is_loop_running());
}

#[tokio::test]
async fn test_from_accepted_starts_connected() {
    init_logging();

    let (listener, addr) = bind_peer().await;
    let (client, accepted) = tokio::join!(tokio::net::TcpStream::connect(addr), listener.accept());
    let mut client = client.unwrap();
    let (stream, remote) = accepted.unwrap();

    let conn = TcpConnection::from_accepted(stream, Recorder::default(), fast_config()).unwrap();
    assert_eq!(conn.state(), ConnectionState::Connected);
    assert_eq!(conn.remote_addr(), Some(remote));
    assert!(conn.is_loop_running());
    assert_eq!(
        conn.next_event().await,
        Some(ConnectionEvent::Connected { remote })
    );

    conn.send(b"welcome").unwrap();
    assert_eq!(read_exactly(&mut client, 7).await, b"welcome");

    client.write_all(b"hello").await.unwrap();
    let recorder = Arc::clone(conn.protocol());
    wait_until(|| recorder.received() == b"hello").await;

    crate::test_timeout!(5, conn.close());
    assert!(read_until_eof(&mut client).await.is_empty());
}
