//! Scripted in-memory transport.
//!
//! Stands in for SSH so the state machine and bridge can be driven over real
//! loopback sockets without a remote host.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;
use crate::transport::{Connection, Transport, TransportTarget};

const DUPLEX_BUFFER: usize = 64 * 1024;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// What the next `connect` does.
#[derive(Debug, Clone)]
pub enum MockOutcome {
    Accept,
    /// Refuse the credentials.
    Reject(String),
    /// Never complete; exercises the connect timeout.
    Hang,
}

/// Remote end of one opened sub-channel.
#[derive(Debug)]
pub struct MockChannel {
    pub origin: SocketAddr,
    pub host: String,
    pub port: u16,
    pub stream: DuplexStream,
}

#[derive(Default)]
struct MockState {
    script: Mutex<VecDeque<MockOutcome>>,
    connect_delay: Mutex<Duration>,
    close_delay: Mutex<Duration>,
    connects: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    closes: AtomicUsize,
    refuse_channels: AtomicBool,
    live: Mutex<Vec<(CancellationToken, Arc<Mutex<Option<String>>>)>>,
    channels_tx: Mutex<Option<mpsc::UnboundedSender<MockChannel>>>,
    usernames: Mutex<Vec<String>>,
}

/// Scripted transport. Clones share state.
///
/// Connect outcomes are taken from the script in order; once it is empty
/// every connect succeeds.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<MockState>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue outcomes for the next connects.
    pub fn script(&self, outcomes: impl IntoIterator<Item = MockOutcome>) {
        lock(&self.state.script).extend(outcomes);
    }

    /// Delay every connect by `delay` before it resolves.
    pub fn set_connect_delay(&self, delay: Duration) {
        *lock(&self.state.connect_delay) = delay;
    }

    /// Make every connection's `close` take `delay` before it completes.
    pub fn set_close_delay(&self, delay: Duration) {
        *lock(&self.state.close_delay) = delay;
    }

    /// Total connect attempts so far.
    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Highest number of connects that were in flight at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.state.max_in_flight.load(Ordering::SeqCst)
    }

    /// Number of completed `close` calls on connections this transport produced.
    pub fn closes(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }

    /// Usernames presented by every connect, in order.
    pub fn usernames(&self) -> Vec<String> {
        lock(&self.state.usernames).clone()
    }

    /// Fire the loss observer of every live connection. Returns how many
    /// were failed.
    pub fn fail_active(&self, reason: &str) -> usize {
        let live: Vec<_> = lock(&self.state.live).drain(..).collect();
        for (lost, cause) in &live {
            *lock(cause) = Some(reason.to_string());
            lost.cancel();
        }
        live.len()
    }

    /// Refuse (or accept again) sub-channel opens.
    pub fn fail_channels(&self, refuse: bool) {
        self.state.refuse_channels.store(refuse, Ordering::SeqCst);
    }

    /// Receive the remote half of every sub-channel opened from now on.
    pub fn channels(&self) -> mpsc::UnboundedReceiver<MockChannel> {
        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.state.channels_tx) = Some(tx);
        rx
    }

    /// Echo every byte written into a sub-channel back to the local side.
    pub fn serve_echo(&self) {
        let mut channels = self.channels();
        tokio::spawn(async move {
            while let Some(channel) = channels.recv().await {
                tokio::spawn(async move {
                    let (mut reader, mut writer) = tokio::io::split(channel.stream);
                    let _ = tokio::io::copy(&mut reader, &mut writer).await;
                    let _ = writer.shutdown().await;
                });
            }
        });
    }
}

/// Counts a connect as in flight for as long as it lives.
struct InFlight<'a>(&'a MockState);

impl<'a> InFlight<'a> {
    fn enter(state: &'a MockState) -> Self {
        let now = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        state.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(state)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Transport for MockTransport {
    type Connection = MockConnection;

    async fn connect(&self, target: TransportTarget<'_>) -> Result<MockConnection, TransportError> {
        let state = &*self.state;
        state.connects.fetch_add(1, Ordering::SeqCst);
        lock(&state.usernames).push(target.username.to_string());
        let _in_flight = InFlight::enter(state);

        let delay = *lock(&state.connect_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let outcome = lock(&state.script)
            .pop_front()
            .unwrap_or(MockOutcome::Accept);
        match outcome {
            MockOutcome::Accept => {
                let lost = CancellationToken::new();
                let cause = Arc::new(Mutex::new(None));
                lock(&state.live).push((lost.clone(), Arc::clone(&cause)));
                Ok(MockConnection {
                    state: Arc::clone(&self.state),
                    lost,
                    cause,
                })
            }
            MockOutcome::Reject(reason) => Err(TransportError::Rejected(reason)),
            MockOutcome::Hang => std::future::pending().await,
        }
    }
}

/// Connection produced by [`MockTransport`].
pub struct MockConnection {
    state: Arc<MockState>,
    lost: CancellationToken,
    cause: Arc<Mutex<Option<String>>>,
}

impl Connection for MockConnection {
    type Stream = DuplexStream;

    async fn open_channel(
        &self,
        origin: SocketAddr,
        dst_host: &str,
        dst_port: u16,
    ) -> Result<DuplexStream, TransportError> {
        if self.lost.is_cancelled() {
            return Err(TransportError::Channel("connection lost".into()));
        }
        if self.state.refuse_channels.load(Ordering::SeqCst) {
            return Err(TransportError::Channel("administratively prohibited".into()));
        }

        let (local, remote) = tokio::io::duplex(DUPLEX_BUFFER);
        if let Some(tx) = lock(&self.state.channels_tx).as_ref() {
            let _ = tx.send(MockChannel {
                origin,
                host: dst_host.to_string(),
                port: dst_port,
                stream: remote,
            });
        }
        Ok(local)
    }

    async fn lost(&self) -> TransportError {
        self.lost.cancelled().await;
        let cause = lock(&self.cause)
            .clone()
            .unwrap_or_else(|| "connection closed".to_string());
        TransportError::Lost(cause)
    }

    async fn close(&self) {
        let delay = *lock(&self.state.close_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.state.closes.fetch_add(1, Ordering::SeqCst);
        self.lost.cancel();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::config::{Credential, TunnelConfig};

    fn config() -> TunnelConfig {
        TunnelConfig::new("bastion.test", "deploy", Credential::new("KEY"))
    }

    #[tokio::test]
    async fn script_runs_in_order_then_accepts() {
        let transport = MockTransport::new();
        transport.script([MockOutcome::Reject("nope".into())]);
        let config = config();

        let first = transport.connect(TransportTarget::from(&config)).await;
        assert!(matches!(first, Err(TransportError::Rejected(_))));
        assert!(transport.connect(TransportTarget::from(&config)).await.is_ok());
        assert_eq!(transport.connects(), 2);
        assert_eq!(transport.max_in_flight(), 1);
        assert_eq!(transport.usernames(), vec!["deploy", "deploy"]);
    }

    #[tokio::test]
    async fn fail_active_resolves_lost_with_reason() {
        let transport = MockTransport::new();
        let config = config();
        let connection = transport.connect(TransportTarget::from(&config)).await.unwrap();

        assert_eq!(transport.fail_active("keepalive timeout"), 1);
        assert_eq!(
            connection.lost().await,
            TransportError::Lost("keepalive timeout".into())
        );
        assert_eq!(transport.fail_active("again"), 0);
    }

    #[tokio::test]
    async fn channels_hand_out_the_remote_half() {
        let transport = MockTransport::new();
        let mut channels = transport.channels();
        let config = config();
        let connection = transport.connect(TransportTarget::from(&config)).await.unwrap();

        let origin: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        let mut local = connection.open_channel(origin, "db.internal", 5432).await.unwrap();
        let mut remote = channels.recv().await.unwrap();
        assert_eq!(remote.origin, origin);
        assert_eq!(remote.host, "db.internal");
        assert_eq!(remote.port, 5432);

        local.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        remote.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        transport.fail_channels(true);
        assert!(matches!(
            connection.open_channel(origin, "db.internal", 5432).await,
            Err(TransportError::Channel(_))
        ));
    }
}
