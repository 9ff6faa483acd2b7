//! Per-epoch readiness gate.
//!
//! A gate fires at most once. Every waiter, whether it arrived before or
//! after the fire, observes the same outcome. A gate that is closed without
//! firing releases its waiters as [`GateOutcome::Closed`].

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    Pending,
    Ready,
    Closed,
}

/// Resolution of a gate wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    Ready,
    Closed,
}

/// Multi-waiter one-shot signal scoped to one epoch.
#[derive(Debug)]
pub struct ReadinessGate {
    epoch: u64,
    tx: watch::Sender<Signal>,
}

impl ReadinessGate {
    /// Create an unfired gate for `epoch`.
    pub fn new(epoch: u64) -> Self {
        let (tx, _rx) = watch::channel(Signal::Pending);
        Self { epoch, tx }
    }

    pub const fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Fire the gate. Returns `false` if it had already fired or closed.
    pub fn open(&self) -> bool {
        self.resolve(Signal::Ready)
    }

    /// Release pending waiters as closed. No-op once the gate has fired.
    pub fn close(&self) -> bool {
        self.resolve(Signal::Closed)
    }

    pub fn is_open(&self) -> bool {
        *self.tx.borrow() == Signal::Ready
    }

    fn resolve(&self, outcome: Signal) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == Signal::Pending {
                *current = outcome;
                true
            } else {
                false
            }
        })
    }

    /// Wait for the gate to resolve.
    ///
    /// Cancel-safe: dropping the future leaves the gate and other waiters
    /// untouched.
    pub async fn wait(&self) -> GateOutcome {
        let mut rx = self.tx.subscribe();
        let resolved = rx.wait_for(|signal| *signal != Signal::Pending).await;
        match resolved.map(|signal| *signal) {
            Ok(Signal::Ready) => GateOutcome::Ready,
            _ => GateOutcome::Closed,
        }
    }
}
