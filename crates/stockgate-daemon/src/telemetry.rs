//! Records tunnel status changes as `OpenTelemetry` instruments.

use stockgate_core::metrics::TunnelMetrics;
use stockgate_tunnel::{TunnelReadiness, TunnelState, TunnelStatus};
use tokio::task::JoinHandle;

/// Follow the tunnel's status until it closes, recording each change.
pub fn spawn_recorder(readiness: &TunnelReadiness) -> JoinHandle<()> {
    let mut rx = readiness.subscribe();
    tokio::spawn(async move {
        let metrics = TunnelMetrics::new();
        let mut last = rx.borrow_and_update().clone();
        while rx.changed().await.is_ok() {
            let status = rx.borrow_and_update().clone();
            record_change(&metrics, &last, &status);
            if status.state == TunnelState::Closed {
                break;
            }
            last = status;
        }
    })
}

fn record_change(metrics: &TunnelMetrics, previous: &TunnelStatus, current: &TunnelStatus) {
    if previous.state != current.state {
        metrics.record_transition(current.state.as_str(), current.epoch);
    }
    if current.consecutive_failures > previous.consecutive_failures
        && let Some(error) = &current.last_error
    {
        metrics.record_failure(error.kind());
    }
    metrics.record_bridge(
        current.bridge.active_sessions,
        current
            .bridge
            .bytes_to_remote
            .saturating_sub(previous.bridge.bytes_to_remote),
        current
            .bridge
            .bytes_from_remote
            .saturating_sub(previous.bridge.bytes_from_remote),
    );
}
