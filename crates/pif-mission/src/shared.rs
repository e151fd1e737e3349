//! State shared between the orchestrator and the monitor tasks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;

/// "Autonomous control is currently granted."
///
/// Written only by the control-authority monitor; every other holder reads.
/// SeqCst so a write is visible to the next poll tick of any reader.
#[derive(Debug, Clone, Default)]
pub struct AuthorityFlag(Arc<AtomicBool>);

impl AuthorityFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_granted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Returns the previous value.
    pub(crate) fn store(&self, granted: bool) -> bool {
        self.0.swap(granted, Ordering::SeqCst)
    }
}

/// One-shot flag: only the first `trigger` wins.
#[derive(Debug, Clone, Default)]
pub struct Latch(Arc<AtomicBool>);

impl Latch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) -> bool {
        self.0.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_ok()
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Receiving half of the mission teardown signal.
#[derive(Debug, Clone)]
pub struct ShutdownSignal(watch::Receiver<bool>);

pub fn shutdown_channel() -> (watch::Sender<bool>, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (tx, ShutdownSignal(rx))
}

impl ShutdownSignal {
    /// Resolves once shutdown is requested or the sender is gone.
    pub async fn cancelled(&mut self) {
        let _ = self.0.wait_for(|stop| *stop).await;
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }
}
