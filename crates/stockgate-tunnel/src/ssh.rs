//! SSH transport built on `russh`.
//!
//! Public-key authentication with an in-memory key, transport keepalives,
//! `direct-tcpip` sub-channels.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use russh::client::{self, Handle, Msg};
use russh::keys::decode_secret_key;
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::ssh_key::{HashAlg, PublicKey};
use russh::{ChannelStream, Disconnect};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::transport::{Connection, Transport, TransportTarget};

/// Opens SSH connections to the bastion host.
#[derive(Debug, Clone, Copy, Default)]
pub struct SshTransport;

impl SshTransport {
    pub const fn new() -> Self {
        Self
    }
}

impl Transport for SshTransport {
    type Connection = SshConnection;

    async fn connect(&self, target: TransportTarget<'_>) -> Result<SshConnection, TransportError> {
        let key = decode_secret_key(target.credential.expose(), None)
            .map_err(|e| TransportError::Rejected(format!("invalid private key: {e}")))?;

        let config = Arc::new(client::Config {
            keepalive_interval: Some(target.keepalive_interval),
            keepalive_max: target.keepalive_max,
            inactivity_timeout: None,
            ..Default::default()
        });

        let (alive_tx, alive_rx) = watch::channel(());
        let handler = SshHandler {
            host: target.host.to_string(),
            expected_fingerprint: target.host_key_fingerprint.map(str::to_string),
            _alive: alive_tx,
        };

        let mut handle = client::connect(config, (target.host, target.port), handler)
            .await
            .map_err(|e| match e {
                russh::Error::UnknownKey => {
                    TransportError::Rejected("host key verification failed".into())
                }
                other => TransportError::Connect(other.to_string()),
            })?;

        let rsa_hash = handle
            .best_supported_rsa_hash()
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?
            .flatten();

        let auth = handle
            .authenticate_publickey(
                target.username,
                PrivateKeyWithHashAlg::new(Arc::new(key), rsa_hash),
            )
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        if !auth.success() {
            let _ = handle
                .disconnect(Disconnect::ByApplication, "authentication failed", "en")
                .await;
            return Err(TransportError::Rejected(format!(
                "public key rejected for user {}",
                target.username
            )));
        }

        info!(host = target.host, port = target.port, user = target.username, "SSH session authenticated");

        Ok(SshConnection {
            handle,
            alive: alive_rx,
            poll_interval: target.keepalive_interval,
        })
    }
}

struct SshHandler {
    host: String,
    expected_fingerprint: Option<String>,
    /// Dropped together with the session task; receivers see the close.
    _alive: watch::Sender<()>,
}

impl client::Handler for SshHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        let Some(expected) = self.expected_fingerprint.as_deref() else {
            return Ok(true);
        };
        let actual = server_public_key.fingerprint(HashAlg::Sha256).to_string();
        if actual == expected.trim() {
            Ok(true)
        } else {
            warn!(host = %self.host, expected, actual = %actual, "SSH host key mismatch");
            Ok(false)
        }
    }
}

/// An authenticated SSH session.
pub struct SshConnection {
    handle: Handle<SshHandler>,
    alive: watch::Receiver<()>,
    poll_interval: Duration,
}

impl Connection for SshConnection {
    type Stream = ChannelStream<Msg>;

    async fn open_channel(
        &self,
        origin: SocketAddr,
        dst_host: &str,
        dst_port: u16,
    ) -> Result<Self::Stream, TransportError> {
        let channel = self
            .handle
            .channel_open_direct_tcpip(
                dst_host,
                u32::from(dst_port),
                origin.ip().to_string(),
                u32::from(origin.port()),
            )
            .await
            .map_err(|e| TransportError::Channel(e.to_string()))?;
        debug!(%origin, dst_host, dst_port, "direct-tcpip channel opened");
        Ok(channel.into_stream())
    }

    async fn lost(&self) -> TransportError {
        let mut alive = self.alive.clone();
        let mut poll = tokio::time::interval(self.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = alive.changed() => {
                    if changed.is_err() {
                        return TransportError::Lost("SSH session ended".into());
                    }
                }
                _ = poll.tick() => {
                    if self.handle.is_closed() {
                        return TransportError::Lost("SSH session closed".into());
                    }
                }
            }
        }
    }

    async fn close(&self) {
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "tunnel closed", "en")
            .await
        {
            debug!(error = %e, "SSH disconnect on a dead session");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Credential, TunnelConfig};

    #[tokio::test]
    async fn undecodable_key_is_rejected_before_connecting() {
        // TEST-NET-3 address; never dialled because key decoding fails first.
        let config = TunnelConfig::new("203.0.113.1", "deploy", Credential::new("not a key"));
        let result = SshTransport::new()
            .connect(TransportTarget::from(&config))
            .await;
        assert!(matches!(
            result,
            Err(TransportError::Rejected(msg)) if msg.contains("invalid private key")
        ));
    }
}
