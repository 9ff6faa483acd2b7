//! Tunnel manager: the supervised state machine.
//!
//! A single supervisor task owns the transport connection and the bridge
//! listener and is the only writer of the tunnel state. Callers talk to it
//! through cheap handles: `establish` coalesces onto the in-flight attempt,
//! `wait_until_ready` waits on the current epoch's [`ReadinessGate`],
//! `status` reads the latest published snapshot, `close` cancels.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::bridge::{self, BridgeListener, BridgeStats, Destination};
use crate::config::TunnelConfig;
use crate::error::{TunnelError, WaitError};
use crate::gate::{GateOutcome, ReadinessGate};
use crate::status::{TunnelState, TunnelStatus};
use crate::transport::{Connection, Transport, TransportTarget};

/// Upper bound on closing a transport during teardown.
const TRANSPORT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of the most recent connection attempt: the epoch on success.
type AttemptOutcome = Option<Result<u64, TunnelError>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared between the supervisor and every handle.
struct Signals {
    status: watch::Sender<TunnelStatus>,
    gate: Mutex<Arc<ReadinessGate>>,
    cancel: CancellationToken,
    stats: Arc<BridgeStats>,
}

impl Signals {
    fn new() -> Self {
        let (status, _rx) = watch::channel(TunnelStatus::idle(None));
        Self {
            status,
            gate: Mutex::new(Arc::new(ReadinessGate::new(1))),
            cancel: CancellationToken::new(),
            stats: Arc::new(BridgeStats::default()),
        }
    }

    fn current_gate(&self) -> Arc<ReadinessGate> {
        Arc::clone(&lock(&self.gate))
    }

    /// Install a fresh, unfired gate for `epoch`.
    fn replace_gate(&self, epoch: u64) {
        *lock(&self.gate) = Arc::new(ReadinessGate::new(epoch));
    }

    fn publish(&self, update: impl FnOnce(&mut TunnelStatus)) {
        let bridge = self.stats.snapshot();
        self.status.send_modify(|status| {
            update(status);
            status.bridge = bridge;
        });
    }

    fn status(&self) -> TunnelStatus {
        let mut status = self.status.borrow().clone();
        status.bridge = self.stats.snapshot();
        if self.cancel.is_cancelled() {
            status.state = TunnelState::Closed;
            status.retry_in_ms = None;
        }
        status
    }

    async fn wait_until_ready(&self, deadline: Option<Duration>) -> Result<u64, WaitError> {
        let wait = async {
            if self.cancel.is_cancelled() {
                return Err(WaitError::Closed);
            }
            let gate = self.current_gate();
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => Err(WaitError::Closed),
                outcome = gate.wait() => match outcome {
                    GateOutcome::Ready => Ok(gate.epoch()),
                    GateOutcome::Closed => Err(WaitError::Closed),
                },
            }
        };

        match deadline {
            Some(deadline) => tokio::time::timeout(deadline, wait)
                .await
                .unwrap_or(Err(WaitError::Timeout)),
            None => wait.await,
        }
    }
}

enum Control {
    Idle,
    Running {
        attempts: watch::Receiver<AttemptOutcome>,
    },
    Closed,
}

struct Inner<T> {
    transport: Arc<T>,
    signals: Arc<Signals>,
    control: Mutex<Control>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        self.signals.cancel.cancel();
    }
}

/// Handle to one logical tunnel.
///
/// Clones share the same tunnel. Construct once at startup and pass it (or a
/// [`TunnelReadiness`]) to whatever depends on the bridge.
pub struct TunnelManager<T: Transport> {
    inner: Arc<Inner<T>>,
}

impl<T: Transport> Clone for TunnelManager<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport> TunnelManager<T> {
    pub fn new(transport: T) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport: Arc::new(transport),
                signals: Arc::new(Signals::new()),
                control: Mutex::new(Control::Idle),
                supervisor: Mutex::new(None),
            }),
        }
    }

    /// Bring the tunnel up and return the epoch it became ready in.
    ///
    /// The first call validates `config` and starts the supervisor; calls
    /// made while an attempt is in flight (or while reconnecting) wait for
    /// that attempt's outcome instead of starting another handshake. Once
    /// `Ready`, returns the current epoch immediately; later configs are
    /// ignored. A failed attempt is reported here and retried in the
    /// background.
    pub async fn establish(&self, config: TunnelConfig) -> Result<u64, TunnelError> {
        let mut attempts = {
            let mut control = lock(&self.inner.control);
            match &*control {
                Control::Closed => return Err(TunnelError::Closed),
                Control::Running { attempts } => attempts.clone(),
                Control::Idle => {
                    config.validate()?;
                    let (tx, rx) = watch::channel(None);
                    let handle = tokio::spawn(supervise(
                        Arc::clone(&self.inner.transport),
                        config,
                        Arc::clone(&self.inner.signals),
                        tx,
                    ));
                    *lock(&self.inner.supervisor) = Some(handle);
                    *control = Control::Running {
                        attempts: rx.clone(),
                    };
                    rx
                }
            }
        };

        attempts.borrow_and_update();
        let status = self.inner.signals.status();
        if status.is_ready() {
            return Ok(status.epoch);
        }

        loop {
            tokio::select! {
                () = self.inner.signals.cancel.cancelled() => return Err(TunnelError::Closed),
                changed = attempts.changed() => {
                    if changed.is_err() {
                        return Err(TunnelError::Closed);
                    }
                    if let Some(outcome) = attempts.borrow_and_update().clone() {
                        return outcome;
                    }
                }
            }
        }
    }

    /// Wait until the tunnel is `Ready`, returning the epoch.
    ///
    /// Resolves immediately when the current epoch is ready. A deadline
    /// expiring affects only this caller.
    pub async fn wait_until_ready(&self, deadline: Option<Duration>) -> Result<u64, WaitError> {
        self.inner.signals.wait_until_ready(deadline).await
    }

    /// Non-blocking status snapshot.
    pub fn status(&self) -> TunnelStatus {
        self.inner.signals.status()
    }

    /// Receive every published status change.
    pub fn subscribe(&self) -> watch::Receiver<TunnelStatus> {
        self.inner.signals.status.subscribe()
    }

    /// Readiness handle for dependents that should not own the tunnel.
    pub fn readiness(&self) -> TunnelReadiness {
        TunnelReadiness {
            signals: Arc::clone(&self.inner.signals),
        }
    }

    /// Close the tunnel. Terminal and idempotent; never suspends.
    ///
    /// Pending `wait_until_ready` calls resolve as closed immediately; the
    /// supervisor tears down the listener and transport in the background.
    /// Use [`shutdown`](Self::shutdown) to wait for that to finish.
    pub fn close(&self) {
        let previous = std::mem::replace(&mut *lock(&self.inner.control), Control::Closed);
        let signals = &self.inner.signals;
        match previous {
            Control::Closed => {}
            Control::Idle => {
                signals.cancel.cancel();
                signals.current_gate().close();
                signals.publish(|status| status.state = TunnelState::Closed);
                info!("Tunnel closed before it was established");
            }
            Control::Running { .. } => {
                info!("Closing tunnel");
                signals.cancel.cancel();
            }
        }
    }

    /// Close the tunnel and wait until the bridge port and transport have
    /// been released.
    pub async fn shutdown(&self) {
        self.close();

        let handle = lock(&self.inner.supervisor).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Tunnel supervisor ended abnormally");
            }
            let signals = &self.inner.signals;
            if signals.status.borrow().state != TunnelState::Closed {
                signals.current_gate().close();
                signals.publish(|status| status.state = TunnelState::Closed);
            }
        }

        let mut rx = self.inner.signals.status.subscribe();
        let _ = rx.wait_for(|status| status.state == TunnelState::Closed).await;
    }
}

/// Read-only view of a tunnel for dependents (database pools, health checks).
#[derive(Clone)]
pub struct TunnelReadiness {
    signals: Arc<Signals>,
}

impl TunnelReadiness {
    pub async fn wait_until_ready(&self, deadline: Option<Duration>) -> Result<u64, WaitError> {
        self.signals.wait_until_ready(deadline).await
    }

    pub fn status(&self) -> TunnelStatus {
        self.signals.status()
    }

    pub fn subscribe(&self) -> watch::Receiver<TunnelStatus> {
        self.signals.status.subscribe()
    }

    /// The local bridge endpoint, once a tunnel has been configured.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.signals.status.borrow().local_addr
    }
}

/// Transport and listener of one `Ready` epoch.
struct ActiveTunnel<C> {
    connection: Arc<C>,
    bridge: BridgeListener,
}

impl<C: Connection> ActiveTunnel<C> {
    /// Listener (and its sessions) first, then the transport.
    async fn teardown(self) {
        self.bridge.shutdown().await;
        close_quietly(&*self.connection).await;
    }
}

async fn close_quietly<C: Connection>(connection: &C) {
    if tokio::time::timeout(TRANSPORT_CLOSE_TIMEOUT, connection.close())
        .await
        .is_err()
    {
        warn!("Transport close timed out");
    }
}

/// Authenticate, then bind the bridge.
async fn connect_once<T: Transport>(
    transport: &T,
    config: &TunnelConfig,
    stats: &Arc<BridgeStats>,
) -> Result<ActiveTunnel<T::Connection>, TunnelError> {
    let connection = tokio::time::timeout(
        config.connect_timeout,
        transport.connect(TransportTarget::from(config)),
    )
    .await
    .map_err(|_| {
        TunnelError::Authentication(format!(
            "timed out after {}s",
            config.connect_timeout.as_secs_f64()
        ))
    })?
    .map_err(|e| TunnelError::Authentication(e.to_string()))?;

    let listener = match bridge::bind(config.local_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            close_quietly(&connection).await;
            return Err(e);
        }
    };

    let connection = Arc::new(connection);
    let bridge = BridgeListener::spawn(
        listener,
        config.local_addr,
        Arc::clone(&connection),
        Destination {
            host: config.destination_host.clone(),
            port: config.destination_port,
        },
        Arc::clone(stats),
    );
    Ok(ActiveTunnel { connection, bridge })
}

/// Supervisor loop. Runs until closed or until the reconnect policy gives up.
async fn supervise<T: Transport>(
    transport: Arc<T>,
    config: TunnelConfig,
    signals: Arc<Signals>,
    attempts: watch::Sender<AttemptOutcome>,
) {
    let cancel = signals.cancel.clone();
    let mut failures: u32 = 0;

    info!(
        host = %config.host,
        port = config.port,
        local = %config.local_addr,
        destination = %format!("{}:{}", config.destination_host, config.destination_port),
        "Tunnel supervisor started"
    );

    loop {
        signals.publish(|status| {
            status.state = TunnelState::Connecting;
            status.local_addr = Some(config.local_addr);
            status.retry_in_ms = None;
        });

        let attempt = tokio::select! {
            () = cancel.cancelled() => break,
            attempt = connect_once(&*transport, &config, &signals.stats) => attempt,
        };

        let (cause, from_attempt, dead) = match attempt {
            Ok(active) => {
                if cancel.is_cancelled() {
                    // Closed while authenticating: discard the new epoch.
                    active.teardown().await;
                    break;
                }

                let gate = signals.current_gate();
                let epoch = gate.epoch();
                failures = 0;
                signals.publish(|status| {
                    status.state = TunnelState::Ready;
                    status.epoch = epoch;
                    status.consecutive_failures = 0;
                });
                gate.open();
                let _ = attempts.send(Some(Ok(epoch)));
                info!(epoch, addr = %active.bridge.local_addr(), "Tunnel ready");

                let lost = tokio::select! {
                    () = cancel.cancelled() => {
                        active.teardown().await;
                        break;
                    }
                    lost = active.connection.lost() => lost,
                };

                warn!(epoch, error = %lost, "Tunnel transport lost");
                signals.replace_gate(epoch + 1);
                // The dead transport is closed after `Degraded` is published.
                let ActiveTunnel { connection, bridge } = active;
                bridge.shutdown().await;
                (TunnelError::TransportLost(lost.to_string()), false, Some(connection))
            }
            Err(e) => (e, true, None),
        };

        failures = failures.saturating_add(1);
        let retry = config.reconnect.should_retry(failures);
        let delay = retry.then(|| config.reconnect.delay_for_failure(failures));

        signals.publish(|status| {
            status.state = if retry {
                TunnelState::Degraded
            } else {
                TunnelState::Closed
            };
            status.last_error = Some(cause.clone());
            status.consecutive_failures = failures;
            status.retry_in_ms = delay.map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
        });
        if from_attempt {
            let _ = attempts.send(Some(Err(cause.clone())));
        }
        if let Some(connection) = dead {
            close_quietly(&*connection).await;
        }

        let Some(delay) = delay else {
            error!(failures, error = %cause, "Reconnect attempts exhausted, closing tunnel");
            break;
        };

        warn!(
            error = %cause,
            kind = cause.kind(),
            failures,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Tunnel degraded, reconnecting"
        );

        tokio::select! {
            () = cancel.cancelled() => break,
            () = sleep(delay) => {}
        }
    }

    cancel.cancel();
    signals.current_gate().close();
    signals.publish(|status| {
        status.state = TunnelState::Closed;
        status.retry_in_ms = None;
    });
    info!("Tunnel closed");
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::significant_drop_tightening,
    clippy::items_after_statements
)]
#[path = "manager_tests.rs"]
mod tests;
