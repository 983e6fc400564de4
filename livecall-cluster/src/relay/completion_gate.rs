//! Single-fire completion signal
//!
//! Any number of parties may try to fire the gate; the first one wins and
//! its value is delivered to the single waiter. Later attempts return
//! `false` and do nothing.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::oneshot;

/// Outcome delivered through a gate that also has a timeout firer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion<T> {
    Resolved(T),
    TimedOut,
}

pub struct CompletionGate<T> {
    fired: AtomicBool,
    tx: Mutex<Option<oneshot::Sender<T>>>,
}

impl<T> CompletionGate<T> {
    /// A fresh gate and the receiver its winner will deliver to.
    pub fn new() -> (Self, oneshot::Receiver<T>) {
        let (tx, rx) = oneshot::channel();
        let gate = Self {
            fired: AtomicBool::new(false),
            tx: Mutex::new(Some(tx)),
        };
        (gate, rx)
    }

    /// Returns `true` only for the call that fired the gate.
    pub fn fire(&self, value: T) -> bool {
        if self
            .fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        if let Some(tx) = self.tx.lock().take() {
            // waiter may already be gone
            let _ = tx.send(value);
        }
        true
    }

    #[must_use]
    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}
