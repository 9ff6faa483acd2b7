#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity

//! Integration tests for the bridge listener.
//!
//! Drives the real tunnel manager over loopback sockets with the scripted
//! transport standing in for SSH; sub-channels are in-memory duplex pipes.

use std::net::SocketAddr;
use std::time::Duration;

use stockgate_tunnel::testing::MockTransport;
use stockgate_tunnel::{Credential, ReconnectPolicy, TunnelConfig, TunnelManager, TunnelState};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

fn free_local_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

fn test_config() -> TunnelConfig {
    let mut config = TunnelConfig::new("bastion.test", "deploy", Credential::new("test-key"));
    config.local_addr = free_local_addr();
    config.destination_host = "10.0.0.5".to_string();
    config.destination_port = 5432;
    config.reconnect = ReconnectPolicy {
        initial_delay: Duration::from_millis(300),
        max_delay: Duration::from_secs(2),
        multiplier: 2.0,
        max_attempts: None,
    };
    config
}

async fn ready_tunnel() -> (TunnelManager<MockTransport>, MockTransport, SocketAddr) {
    let transport = MockTransport::new();
    let manager = TunnelManager::new(transport.clone());
    let config = test_config();
    let addr = config.local_addr;
    assert_eq!(manager.establish(config).await, Ok(1));
    (manager, transport, addr)
}

/// Read until EOF or error; returns the bytes read before it.
async fn read_to_close(stream: &mut TcpStream) -> Vec<u8> {
    let mut received = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        match tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
            .await
            .unwrap()
        {
            Ok(0) | Err(_) => return received,
            Ok(n) => received.extend_from_slice(&buf[..n]),
        }
    }
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(check(), "condition not reached in time");
}

// =========================================================================
// Forwarding
// =========================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bytes_cross_the_bridge_in_both_directions() {
    let transport = MockTransport::new();
    let mut channels = transport.channels();
    let manager = TunnelManager::new(transport.clone());
    let config = test_config();
    let addr = config.local_addr;
    assert_eq!(manager.establish(config).await, Ok(1));

    let mut client = TcpStream::connect(addr).await.unwrap();
    let mut remote = channels.recv().await.unwrap();
    assert_eq!(remote.host, "10.0.0.5");
    assert_eq!(remote.port, 5432);
    assert_eq!(remote.origin, client.local_addr().unwrap());

    let upstream: Vec<u8> = (0..64 * 1024u32)
        .map(|i| u8::try_from(i % 251).unwrap())
        .collect();
    client.write_all(&upstream).await.unwrap();
    let mut seen = vec![0u8; upstream.len()];
    remote.stream.read_exact(&mut seen).await.unwrap();
    assert_eq!(seen, upstream);

    remote.stream.write_all(b"SELECT 1 -> 1").await.unwrap();
    let mut reply = [0u8; 13];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"SELECT 1 -> 1");

    // Half-close from the client reaches the remote as end-of-stream.
    client.shutdown().await.unwrap();
    let mut rest = Vec::new();
    remote.stream.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
    drop(remote);
    read_to_close(&mut client).await;

    let expected = upstream.len() as u64;
    eventually(|| manager.status().bridge.bytes_to_remote == expected).await;
    let bridge = manager.status().bridge;
    assert_eq!(bridge.bytes_from_remote, 13);
    assert_eq!(bridge.sessions_total, 1);
    assert_eq!(bridge.active_sessions, 0);

    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_sessions_stay_separate() {
    let (manager, transport, addr) = ready_tunnel().await;
    transport.serve_echo();

    let clients: Vec<_> = (0..8u8)
        .map(|id| {
            tokio::spawn(async move {
                let mut client = TcpStream::connect(addr).await.unwrap();
                let payload = vec![id; 4096];
                client.write_all(&payload).await.unwrap();
                let mut echoed = vec![0u8; payload.len()];
                client.read_exact(&mut echoed).await.unwrap();
                assert_eq!(echoed, payload);
            })
        })
        .collect();
    for client in clients {
        client.await.unwrap();
    }

    assert_eq!(manager.status().bridge.sessions_total, 8);
    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn refused_sub_channel_closes_only_that_session() {
    let (manager, transport, addr) = ready_tunnel().await;
    transport.fail_channels(true);

    let mut client = TcpStream::connect(addr).await.unwrap();
    assert!(read_to_close(&mut client).await.is_empty());

    let status = manager.status();
    assert_eq!(status.state, TunnelState::Ready);
    assert_eq!(status.bridge.channel_failures, 1);

    transport.fail_channels(false);
    transport.serve_echo();
    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    manager.shutdown().await;
}

// =========================================================================
// Teardown
// =========================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transport_loss_closes_live_sessions() {
    let (manager, transport, addr) = ready_tunnel().await;
    transport.serve_echo();

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    client.read_exact(&mut buf).await.unwrap();

    transport.fail_active("connection reset");
    read_to_close(&mut client).await;

    let mut rx = manager.subscribe();
    let degraded = tokio::time::timeout(
        Duration::from_secs(2),
        rx.wait_for(|s| s.state == TunnelState::Degraded),
    )
    .await
    .unwrap()
    .unwrap()
    .clone();
    assert_eq!(degraded.bridge.active_sessions, 0);
    // Bytes of a session cut off by the loss are still counted.
    assert_eq!(degraded.bridge.bytes_to_remote, 4);
    assert_eq!(degraded.bridge.bytes_from_remote, 4);
    assert!(TcpStream::connect(addr).await.is_err());

    // Next epoch serves the same endpoint again.
    assert_eq!(
        manager.wait_until_ready(Some(Duration::from_secs(5))).await,
        Ok(2)
    );
    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"pong").await.unwrap();
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"pong");

    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_releases_the_port_and_sessions() {
    let (manager, transport, addr) = ready_tunnel().await;
    transport.serve_echo();

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    client.read_exact(&mut buf).await.unwrap();

    manager.shutdown().await;

    read_to_close(&mut client).await;
    assert_eq!(manager.status().state, TunnelState::Closed);
    let bridge = manager.status().bridge;
    assert_eq!(bridge.active_sessions, 0);
    assert_eq!(bridge.bytes_to_remote, 4);
    assert_eq!(bridge.bytes_from_remote, 4);
    drop(TcpListener::bind(addr).await.unwrap());
}
