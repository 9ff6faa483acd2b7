//! `Stockgate` Tunnel
//!
//! Keeps an authenticated SSH forwarding tunnel to a private database alive
//! and tells dependents when it is safe to connect:
//! - Tunnel state machine with coalesced establishment and reconnection
//! - Per-epoch readiness gate
//! - Local bridge listener splicing connections into forwarding channels
//! - Exponential reconnect backoff

pub mod backoff;
pub mod bridge;
pub mod config;
pub mod error;
pub mod gate;
pub mod manager;
pub mod ssh;
pub mod status;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
pub mod transport;

pub use backoff::ReconnectPolicy;
pub use bridge::BridgeSnapshot;
pub use config::{Credential, TunnelConfig};
pub use error::{TransportError, TunnelError, WaitError};
pub use gate::{GateOutcome, ReadinessGate};
pub use manager::{TunnelManager, TunnelReadiness};
pub use ssh::SshTransport;
pub use status::{TunnelState, TunnelStatus};
pub use transport::{Connection, Transport, TransportTarget};
