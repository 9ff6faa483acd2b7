//! Tunnel configuration.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use zeroize::Zeroizing;

use crate::backoff::ReconnectPolicy;
use crate::error::TunnelError;

/// Private key material, held in memory only.
///
/// Redacted in `Debug` and zeroed on drop. The tunnel never persists it.
#[derive(Clone)]
pub struct Credential(Zeroizing<String>);

impl Credential {
    pub fn new(key: impl Into<String>) -> Self {
        Self(Zeroizing::new(key.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.as_str()
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl From<Zeroizing<String>> for Credential {
    fn from(value: Zeroizing<String>) -> Self {
        Self(value)
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

/// Configuration for one tunnel: where to authenticate, where to listen
/// locally, and where the remote end forwards to.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// SSH host (the bastion).
    pub host: String,
    pub port: u16,
    pub username: String,
    pub credential: Credential,

    /// Interval between transport keepalives.
    pub keepalive_interval: Duration,
    /// Missed keepalives before the transport is considered dead.
    pub keepalive_max: usize,
    /// Upper bound on connect + authentication.
    pub connect_timeout: Duration,

    /// Local bridge endpoint dependents connect to.
    pub local_addr: SocketAddr,

    /// Destination as seen from the SSH host.
    pub destination_host: String,
    pub destination_port: u16,

    pub reconnect: ReconnectPolicy,

    /// Expected `SHA256:` host key fingerprint; any key is accepted when `None`.
    pub host_key_fingerprint: Option<String>,
}

impl TunnelConfig {
    /// Create a tunnel config with required fields and defaults.
    ///
    /// Defaults: port 22, keepalive 10s / 3 missed, 20s connect timeout,
    /// local endpoint `127.0.0.1:5433`, destination `127.0.0.1:5432`.
    pub fn new(host: impl Into<String>, username: impl Into<String>, credential: Credential) -> Self {
        Self {
            host: host.into(),
            port: 22,
            username: username.into(),
            credential,
            keepalive_interval: Duration::from_secs(10),
            keepalive_max: 3,
            connect_timeout: Duration::from_secs(20),
            local_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 5433),
            destination_host: "127.0.0.1".to_string(),
            destination_port: 5432,
            reconnect: ReconnectPolicy::default(),
            host_key_fingerprint: None,
        }
    }

    /// Check required fields before any network activity.
    pub fn validate(&self) -> Result<(), TunnelError> {
        let mut missing = Vec::new();
        if self.host.trim().is_empty() {
            missing.push("host");
        }
        if self.username.trim().is_empty() {
            missing.push("username");
        }
        if self.credential.is_empty() {
            missing.push("credential");
        }
        if self.destination_host.trim().is_empty() {
            missing.push("destination host");
        }
        if !missing.is_empty() {
            return Err(TunnelError::Configuration(format!(
                "missing {}",
                missing.join(", ")
            )));
        }

        if self.port == 0 || self.destination_port == 0 {
            return Err(TunnelError::Configuration(
                "ssh and destination ports must be non-zero".into(),
            ));
        }
        // Dependents already know the endpoint; an ephemeral port would move
        // between epochs.
        if self.local_addr.port() == 0 {
            return Err(TunnelError::Configuration(
                "local bind port must be fixed (non-zero)".into(),
            ));
        }
        if self.connect_timeout.is_zero() || self.keepalive_interval.is_zero() {
            return Err(TunnelError::Configuration(
                "connect timeout and keepalive interval must be non-zero".into(),
            ));
        }
        Ok(())
    }
}
