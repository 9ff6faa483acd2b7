//! HTTP health endpoint.
//!
//! `GET /health` reports the tunnel status; it answers `200` only while the
//! tunnel is `Ready` so load balancers and orchestrators can gate traffic on
//! it. `GET /health/live` reports that the process is serving at all.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{Value, json};
use stockgate_tunnel::{TunnelReadiness, TunnelStatus};

/// Build the health router over a tunnel readiness handle.
pub fn build_router(readiness: TunnelReadiness) -> Router {
    Router::new()
        .route("/health", get(tunnel_health))
        .route("/health/live", get(liveness))
        .with_state(readiness)
}

async fn tunnel_health(State(readiness): State<TunnelReadiness>) -> (StatusCode, Json<TunnelStatus>) {
    let status = readiness.status();
    let code = if status.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(status))
}

async fn liveness() -> Json<Value> {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}
