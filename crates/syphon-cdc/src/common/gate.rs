//! Handoff gates and the run lifecycle signals
//!
//! The snapshot and streaming phases coordinate through two one-shot
//! broadcast [`Gate`]s: `coordinates_ready` (a starting coordinate is fixed)
//! and `snapshot_done` (all snapshot data has been transmitted). The
//! streaming-setup task blocks on them so live delivery can neither start
//! before the copy is acknowledged nor leave a gap after it.
//!
//! [`Shutdown`] is the same primitive broadcast exactly once across every
//! task; all blocking waits select on it.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

use crate::common::ExtractError;

/// A one-shot broadcast signal.
///
/// `open()` is idempotent; `wait()` returns immediately once opened and
/// never misses an open that races with it.
#[derive(Debug, Default)]
pub struct Gate {
    opened: AtomicBool,
    notify: Notify,
}

impl Gate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Open the gate, waking every current and future waiter.
    pub fn open(&self) {
        self.opened.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_open(&self) -> bool {
        self.opened.load(Ordering::SeqCst)
    }

    /// Wait until the gate opens.
    pub async fn wait(&self) {
        loop {
            // Register interest before re-checking, so an open() between the
            // check and the await cannot be lost.
            let notified = self.notify.notified();
            if self.is_open() {
                return;
            }
            notified.await;
        }
    }
}

/// The run-wide cancellation signal.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    gate: Arc<Gate>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Broadcast shutdown. Idempotent.
    pub fn trigger(&self) {
        self.gate.open();
    }

    pub fn is_triggered(&self) -> bool {
        self.gate.is_open()
    }

    pub async fn wait(&self) {
        self.gate.wait().await
    }

    /// Run `fut` unless shutdown fires first.
    pub async fn guard<F, T>(&self, fut: F) -> crate::common::Result<T>
    where
        F: std::future::Future<Output = T>,
    {
        tokio::select! {
            _ = self.wait() => Err(ExtractError::Shutdown),
            out = fut => Ok(out),
        }
    }
}

/// Terminal state of a run, consumed exactly once by the host supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Fatal error or graceful stop; relaunch from persisted state
    Dead,
    /// Applier-requested restart carrying a replacement replication set
    Restart,
}

/// One-shot exit signal of a run.
pub struct ExitResult {
    pub state: TaskState,
    pub signal: i32,
    pub oom_killed: bool,
    /// `None` on graceful stop
    pub error: Option<ExtractError>,
}

impl ExitResult {
    pub fn dead(error: ExtractError) -> Self {
        Self {
            state: TaskState::Dead,
            signal: 0,
            oom_killed: false,
            error: Some(error),
        }
    }

    pub fn restart(error: ExtractError) -> Self {
        Self {
            state: TaskState::Restart,
            signal: 0,
            oom_killed: false,
            error: Some(error),
        }
    }
}

impl fmt::Debug for ExitResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExitResult")
            .field("state", &self.state)
            .field("signal", &self.signal)
            .field("oom_killed", &self.oom_killed)
            .field("error", &self.error.as_ref().map(|e| e.to_string()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_gate_wakes_waiter() {
        let gate = Gate::new();
        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.wait().await })
        };

        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        gate.open();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should finish")
            .unwrap();
    }

    #[tokio::test]
    async fn test_gate_open_before_wait() {
        let gate = Gate::new();
        gate.open();
        gate.open(); // idempotent
        gate.wait().await; // returns immediately
        assert!(gate.is_open());
    }

    #[tokio::test]
    async fn test_gate_wakes_multiple_waiters() {
        let gate = Gate::new();
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let gate = gate.clone();
                tokio::spawn(async move { gate.wait().await })
            })
            .collect();

        tokio::task::yield_now().await;
        gate.open();
        for waiter in waiters {
            tokio::time::timeout(Duration::from_secs(1), waiter)
                .await
                .expect("waiter should finish")
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_shutdown_guard() {
        let shutdown = Shutdown::new();

        let ok = shutdown.guard(async { 5 }).await;
        assert!(matches!(ok, Ok(5)));

        shutdown.trigger();
        let cancelled = shutdown.guard(std::future::pending::<()>()).await;
        assert!(matches!(cancelled, Err(ExtractError::Shutdown)));
    }
}
