//! One-shot rendezvous signal.
//!
//! A `Rendezvous` is a single-slot handoff used to suspend a worker until
//! some other task releases it: an approval arriving, a stream starting.
//! It is built on a bounded `mpsc` channel of capacity one rather than a
//! condition variable, so every wait variant composes with `select!` and
//! cancellation comes for free.
//!
//! `open()` may be called any number of times from any task; only the first
//! call has effect and later calls race benignly. Once open, every past and
//! future wait completes immediately.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// A one-shot, cancellable handshake primitive.
///
/// Cloning shares the same underlying slot, so any clone can open the signal
/// or wait on it.
#[derive(Clone)]
pub struct Rendezvous {
    /// Sender half of the single-slot handoff
    tx: mpsc::Sender<()>,
    /// Receiver half, shared between waiters (serialized by the mutex)
    rx: Arc<Mutex<mpsc::Receiver<()>>>,
    /// Set by the first effective `open()`; never cleared
    fired: Arc<AtomicBool>,
}

impl std::fmt::Debug for Rendezvous {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rendezvous")
            .field("open", &self.is_open())
            .finish()
    }
}

impl Rendezvous {
    /// Create a new, un-opened rendezvous.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
            fired: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Create a rendezvous that is already open.
    ///
    /// Used when replaying a decision that was made in a previous run:
    /// waiters must not suspend at all.
    pub fn opened() -> Self {
        let signal = Self::new();
        signal.open();
        signal
    }

    /// Open the signal, releasing all current and future waiters.
    ///
    /// Returns `true` if this call was the effective open, `false` if the
    /// signal was already open.
    pub fn open(&self) -> bool {
        if self.fired.swap(true, Ordering::AcqRel) {
            return false;
        }
        // The slot is empty here (nothing sends but this path), so the
        // try_send only fails if every receiver handle is gone, in which
        // case there is nobody left to wake.
        let _ = self.tx.try_send(());
        true
    }

    /// Whether the signal has been opened.
    pub fn is_open(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Wait until the signal opens.
    pub async fn wait(&self) {
        if self.is_open() {
            return;
        }
        let mut rx = self.rx.lock().await;
        // A concurrent waiter may have consumed the slot while we were
        // queued on the lock; the flag is authoritative.
        if self.is_open() {
            return;
        }
        let _ = rx.recv().await;
    }

    /// Wait until the signal opens or the token is cancelled.
    ///
    /// Returns `true` if the signal opened, `false` on cancellation.
    pub async fn wait_cancellable(&self, cancel: &CancellationToken) -> bool {
        if self.is_open() {
            return true;
        }
        tokio::select! {
            _ = cancel.cancelled() => self.is_open(),
            _ = self.wait() => true,
        }
    }

    /// Wait until the signal opens, giving up after `timeout`.
    ///
    /// Returns `true` if the signal opened, `false` on timeout.
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.is_open() {
            return true;
        }
        tokio::time::timeout(timeout, self.wait()).await.is_ok()
    }
}

impl Default for Rendezvous {
    fn default() -> Self {
        Self::new()
    }
}
