//! Local bridge listener.
//!
//! Accepts local TCP connections and splices each one, full-duplex, into a
//! sub-channel opened over the active transport connection.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf, copy_bidirectional};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::error::TunnelError;
use crate::transport::Connection;

/// Pause after a failed `accept` (e.g. file descriptor exhaustion).
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Where sub-channels forward to, as seen from the remote host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub host: String,
    pub port: u16,
}

/// Cumulative bridge counters, shared across epochs.
#[derive(Debug, Default)]
pub struct BridgeStats {
    sessions_total: AtomicU64,
    active_sessions: AtomicU64,
    channel_failures: AtomicU64,
    bytes_to_remote: AtomicU64,
    bytes_from_remote: AtomicU64,
}

/// Serializable copy of [`BridgeStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BridgeSnapshot {
    pub sessions_total: u64,
    pub active_sessions: u64,
    pub channel_failures: u64,
    pub bytes_to_remote: u64,
    pub bytes_from_remote: u64,
}

impl BridgeStats {
    pub fn snapshot(&self) -> BridgeSnapshot {
        BridgeSnapshot {
            sessions_total: self.sessions_total.load(Ordering::Relaxed),
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
            channel_failures: self.channel_failures.load(Ordering::Relaxed),
            bytes_to_remote: self.bytes_to_remote.load(Ordering::Relaxed),
            bytes_from_remote: self.bytes_from_remote.load(Ordering::Relaxed),
        }
    }
}

/// One accepted local connection. Keeps the live-session count honest on
/// every exit path.
struct BridgeSession {
    id: u64,
    peer: SocketAddr,
    stats: Arc<BridgeStats>,
}

impl BridgeSession {
    fn start(peer: SocketAddr, stats: Arc<BridgeStats>) -> Self {
        let id = stats.sessions_total.fetch_add(1, Ordering::Relaxed) + 1;
        stats.active_sessions.fetch_add(1, Ordering::Relaxed);
        Self { id, peer, stats }
    }
}

/// Adds every byte written through it to `written`, so sessions that end
/// in teardown or an I/O error are still counted.
struct Metered<'a, S> {
    inner: S,
    written: &'a AtomicU64,
}

impl<'a, S> Metered<'a, S> {
    const fn new(inner: S, written: &'a AtomicU64) -> Self {
        Self { inner, written }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Metered<'_, S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Metered<'_, S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = polled {
            this.written
                .fetch_add(u64::try_from(n).unwrap_or(u64::MAX), Ordering::Relaxed);
        }
        polled
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

impl Drop for BridgeSession {
    fn drop(&mut self) {
        self.stats.active_sessions.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Bind the bridge endpoint.
///
/// "Address in use" is reported as [`TunnelError::Bind`]; no other port is
/// tried.
pub async fn bind(addr: SocketAddr) -> Result<TcpListener, TunnelError> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| TunnelError::Bind(format!("{addr}: {e}")))
}

/// A running accept loop and its sessions, owned by one `Ready` epoch.
pub struct BridgeListener {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl BridgeListener {
    /// Start accepting on `listener`, forwarding through `connection`.
    pub fn spawn<C: Connection>(
        listener: TcpListener,
        local_addr: SocketAddr,
        connection: Arc<C>,
        destination: Destination,
        stats: Arc<BridgeStats>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        tracker.spawn(accept_loop(
            listener,
            connection,
            Arc::new(destination),
            stats,
            cancel.clone(),
            tracker.clone(),
        ));

        info!(addr = %local_addr, "Bridge listener started");
        Self {
            local_addr,
            cancel,
            tracker,
        }
    }

    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting, force-close every live session, and wait until the
    /// port is released.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!(addr = %self.local_addr, "Bridge listener stopped");
    }
}

async fn accept_loop<C: Connection>(
    listener: TcpListener,
    connection: Arc<C>,
    destination: Arc<Destination>,
    stats: Arc<BridgeStats>,
    cancel: CancellationToken,
    tracker: TaskTracker,
) {
    loop {
        let accepted = tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                let session = BridgeSession::start(peer, Arc::clone(&stats));
                tracker.spawn(run_session(
                    session,
                    stream,
                    Arc::clone(&connection),
                    Arc::clone(&destination),
                    cancel.child_token(),
                ));
            }
            Err(e) => {
                warn!(error = %e, "Bridge accept failed");
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => {}
                }
            }
        }
    }
    // Listener is dropped here, releasing the port.
}

async fn run_session<C: Connection>(
    session: BridgeSession,
    local: TcpStream,
    connection: Arc<C>,
    destination: Arc<Destination>,
    cancel: CancellationToken,
) {
    let _ = local.set_nodelay(true);

    let opened = tokio::select! {
        () = cancel.cancelled() => return,
        opened = connection.open_channel(session.peer, &destination.host, destination.port) => opened,
    };

    let remote = match opened {
        Ok(stream) => stream,
        Err(e) => {
            session
                .stats
                .channel_failures
                .fetch_add(1, Ordering::Relaxed);
            warn!(
                session = session.id,
                peer = %session.peer,
                destination = %format!("{}:{}", destination.host, destination.port),
                error = %e,
                "Sub-channel open failed, closing local connection"
            );
            return;
        }
    };

    debug!(session = session.id, peer = %session.peer, "Bridge session open");

    let stats = &session.stats;
    let mut local = Metered::new(local, &stats.bytes_from_remote);
    let mut remote = Metered::new(remote, &stats.bytes_to_remote);
    tokio::select! {
        () = cancel.cancelled() => {
            debug!(session = session.id, "Bridge session torn down");
        }
        copied = copy_bidirectional(&mut local, &mut remote) => match copied {
            Ok((to_remote, from_remote)) => {
                debug!(
                    session = session.id,
                    to_remote,
                    from_remote,
                    "Bridge session closed"
                );
            }
            Err(e) => {
                debug!(session = session.id, error = %e, "Bridge session ended with I/O error");
            }
        },
    }
}
