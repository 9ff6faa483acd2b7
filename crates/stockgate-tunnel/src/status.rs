//! Tunnel state and status snapshots.

use std::fmt;
use std::net::SocketAddr;

use serde::Serialize;

use crate::bridge::BridgeSnapshot;
use crate::error::TunnelError;

/// Lifecycle state of a tunnel.
///
/// `Idle → Connecting → Ready → Degraded → Connecting → …`, with `Closed`
/// reachable from anywhere and terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelState {
    /// No transport, no listener.
    Idle,
    /// Authentication in flight.
    Connecting,
    /// Transport up, listener bound, readiness signalled.
    Ready,
    /// Transport lost or attempt failed; reconnection loop active.
    Degraded,
    /// Shut down. No further transitions.
    Closed,
}

impl TunnelState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Ready => "ready",
            Self::Degraded => "degraded",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of a tunnel, suitable for health checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TunnelStatus {
    pub state: TunnelState,
    /// Number of the latest `Ready` epoch (0 before the first).
    pub epoch: u64,
    pub last_error: Option<TunnelError>,
    /// Failed attempts since the last success.
    pub consecutive_failures: u32,
    /// Backoff before the next attempt, while one is scheduled.
    pub retry_in_ms: Option<u64>,
    /// Bridge endpoint dependents connect to.
    pub local_addr: Option<SocketAddr>,
    pub bridge: BridgeSnapshot,
}

impl TunnelStatus {
    pub(crate) fn idle(local_addr: Option<SocketAddr>) -> Self {
        Self {
            state: TunnelState::Idle,
            epoch: 0,
            last_error: None,
            consecutive_failures: 0,
            retry_in_ms: None,
            local_addr,
            bridge: BridgeSnapshot::default(),
        }
    }

    pub const fn is_ready(&self) -> bool {
        matches!(self.state, TunnelState::Ready)
    }
}
