//! Tunnel error types.

use serde::Serialize;

/// Errors reported by the tunnel manager.
///
/// `Clone` so that one connection attempt's outcome can be handed to every
/// caller coalesced onto it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum TunnelError {
    /// Required configuration is missing or invalid. Never retried.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The transport could not be opened or rejected the credentials.
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// The local bridge endpoint could not be bound.
    #[error("Bind error: {0}")]
    Bind(String),

    /// An established transport failed.
    #[error("Transport lost: {0}")]
    TransportLost(String),

    /// The tunnel was closed.
    #[error("Tunnel closed")]
    Closed,
}

impl TunnelError {
    /// Short label for logs and metrics.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::Authentication(_) => "authentication",
            Self::Bind(_) => "bind",
            Self::TransportLost(_) => "transport_lost",
            Self::Closed => "closed",
        }
    }
}

/// Errors produced by a [`Transport`](crate::transport::Transport) implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    Connect(String),

    #[error("Credentials rejected: {0}")]
    Rejected(String),

    #[error("Channel open failed: {0}")]
    Channel(String),

    #[error("Connection lost: {0}")]
    Lost(String),
}

/// Why [`wait_until_ready`](crate::TunnelManager::wait_until_ready) returned
/// without a ready tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WaitError {
    #[error("Timed out waiting for the tunnel")]
    Timeout,

    #[error("Tunnel closed before it became ready")]
    Closed,
}
