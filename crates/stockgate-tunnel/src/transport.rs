//! The transport seam.
//!
//! The tunnel needs exactly two things from an authenticated transport:
//! open a connection to a host, and open forwarding sub-channels over it.
//! [`SshTransport`](crate::ssh::SshTransport) is the production
//! implementation.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::{Credential, TunnelConfig};
use crate::error::TransportError;

/// Everything a transport needs to open an authenticated connection.
#[derive(Debug, Clone, Copy)]
pub struct TransportTarget<'a> {
    pub host: &'a str,
    pub port: u16,
    pub username: &'a str,
    pub credential: &'a Credential,
    pub keepalive_interval: Duration,
    pub keepalive_max: usize,
    pub host_key_fingerprint: Option<&'a str>,
}

impl<'a> From<&'a TunnelConfig> for TransportTarget<'a> {
    fn from(config: &'a TunnelConfig) -> Self {
        Self {
            host: &config.host,
            port: config.port,
            username: &config.username,
            credential: &config.credential,
            keepalive_interval: config.keepalive_interval,
            keepalive_max: config.keepalive_max,
            host_key_fingerprint: config.host_key_fingerprint.as_deref(),
        }
    }
}

/// Opens authenticated connections.
pub trait Transport: Send + Sync + 'static {
    type Connection: Connection;

    fn connect(
        &self,
        target: TransportTarget<'_>,
    ) -> impl Future<Output = Result<Self::Connection, TransportError>> + Send;
}

/// One authenticated connection.
pub trait Connection: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Open a sub-channel forwarding to `dst_host:dst_port`. `origin` is the
    /// local peer that the channel is opened on behalf of.
    fn open_channel(
        &self,
        origin: SocketAddr,
        dst_host: &str,
        dst_port: u16,
    ) -> impl Future<Output = Result<Self::Stream, TransportError>> + Send;

    /// Resolves once the connection is dead. Errors, end-of-stream and a
    /// remote close are reported alike.
    fn lost(&self) -> impl Future<Output = TransportError> + Send;

    /// Terminate the connection. Errors from an already-dead connection are
    /// swallowed.
    fn close(&self) -> impl Future<Output = ()> + Send;
}
