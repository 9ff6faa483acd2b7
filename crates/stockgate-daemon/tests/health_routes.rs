#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity

//! Health endpoint behaviour against a tunnel driven by the scripted transport.

use std::net::SocketAddr;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::Value;
use tower::ServiceExt;

use stockgate_daemon::health::build_router;
use stockgate_tunnel::testing::{MockOutcome, MockTransport};
use stockgate_tunnel::{Credential, TunnelConfig, TunnelManager};

fn tunnel_config() -> TunnelConfig {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    drop(listener);

    let mut config = TunnelConfig::new("bastion.test", "deploy", Credential::new("test-key"));
    config.local_addr = addr;
    config.reconnect.initial_delay = Duration::from_secs(30);
    config
}

/// Send a GET to the router and return (status, JSON body).
async fn get(manager: &TunnelManager<MockTransport>, uri: &str) -> (StatusCode, Value) {
    let resp = build_router(manager.readiness())
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = resp.status();
    let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn idle_tunnel_is_unavailable() {
    let manager = TunnelManager::new(MockTransport::new());
    let (status, body) = get(&manager, "/health").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["state"], "idle");
    assert_eq!(body["epoch"], 0);
}

#[tokio::test]
async fn ready_tunnel_is_healthy() {
    let manager = TunnelManager::new(MockTransport::new());
    let config = tunnel_config();
    let addr = config.local_addr;
    assert_eq!(manager.establish(config).await, Ok(1));

    let (status, body) = get(&manager, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "ready");
    assert_eq!(body["epoch"], 1);
    assert_eq!(body["local_addr"], addr.to_string());
    assert!(body["last_error"].is_null());
    assert_eq!(body["bridge"]["active_sessions"], 0);

    manager.shutdown().await;
}

#[tokio::test]
async fn degraded_tunnel_reports_last_error() {
    let transport = MockTransport::new();
    transport.script([MockOutcome::Reject("permission denied (publickey)".into())]);
    let manager = TunnelManager::new(transport);
    assert!(manager.establish(tunnel_config()).await.is_err());

    let (status, body) = get(&manager, "/health").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["state"], "degraded");
    assert_eq!(body["consecutive_failures"], 1);
    assert_eq!(body["retry_in_ms"], 30_000);
    assert_eq!(body["last_error"]["kind"], "authentication");
    assert!(
        body["last_error"]["message"]
            .as_str()
            .unwrap()
            .contains("publickey")
    );

    manager.shutdown().await;
}

#[tokio::test]
async fn closed_tunnel_is_unavailable() {
    let manager = TunnelManager::new(MockTransport::new());
    assert_eq!(manager.establish(tunnel_config()).await, Ok(1));
    manager.shutdown().await;

    let (status, body) = get(&manager, "/health").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["state"], "closed");
}

#[tokio::test]
async fn liveness_does_not_depend_on_the_tunnel() {
    let manager = TunnelManager::new(MockTransport::new());
    manager.close();

    let (status, body) = get(&manager, "/health/live").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}
