//! Request/response correlation for cross-node subscribes
//!
//! The requesting node registers a pending entry under the subscriber key,
//! publishes its request, then waits. A matching response and the timeout
//! both fire the same [`CompletionGate`]; whichever lands first decides the
//! outcome. Responses without a pending entry are dropped.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

use livecall_core::models::subscriber_key;
use livecall_core::{Error, Result};

use super::completion_gate::{Completion, CompletionGate};
use super::events::ResponseSubscribe;

type Gate = Arc<CompletionGate<Completion<ResponseSubscribe>>>;

/// Handle to one outstanding request, consumed by [`SubscribeCorrelator::wait`].
pub struct PendingSubscribe {
    key: String,
    gate: Gate,
    rx: oneshot::Receiver<Completion<ResponseSubscribe>>,
}

impl PendingSubscribe {
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }
}

#[derive(Default)]
pub struct SubscribeCorrelator {
    pending: DashMap<String, Gate>,
}

impl SubscribeCorrelator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in the answer for `(stream_key, u_id)`.
    ///
    /// A newer registration for the same pair replaces the older one, which
    /// then runs into its timeout.
    pub fn register(&self, stream_key: &str, u_id: i64) -> PendingSubscribe {
        let key = subscriber_key(stream_key, u_id);
        let (gate, rx) = CompletionGate::new();
        let gate = Arc::new(gate);
        self.pending.insert(key.clone(), gate.clone());
        PendingSubscribe { key, gate, rx }
    }

    /// Deliver a response. Returns `false` when nothing was waiting for it
    /// or the wait had already completed.
    pub fn resolve(&self, response: ResponseSubscribe) -> bool {
        let key = subscriber_key(&response.stream_key, response.u_id);
        let Some(gate) = self.pending.get(&key).map(|entry| entry.value().clone()) else {
            debug!(key = %key, "No pending subscribe for response");
            return false;
        };
        gate.fire(Completion::Resolved(response))
    }

    /// Wait for the response, failing with [`Error::Timeout`] after `timeout`.
    pub async fn wait(&self, pending: PendingSubscribe, timeout: Duration) -> Result<ResponseSubscribe> {
        let PendingSubscribe { key, gate, mut rx } = pending;

        let outcome = tokio::select! {
            received = &mut rx => received.ok(),
            () = tokio::time::sleep(timeout) => {
                // lost the race: the response already fired the gate
                if gate.fire(Completion::TimedOut) {
                    Some(Completion::TimedOut)
                } else {
                    rx.await.ok()
                }
            }
        };

        self.pending.remove_if(&key, |_, current| Arc::ptr_eq(current, &gate));

        match outcome {
            Some(Completion::Resolved(response)) => Ok(response),
            Some(Completion::TimedOut) | None => {
                Err(Error::Timeout(format!("no subscribe response for {key} within {timeout:?}")))
            }
        }
    }

    /// Drop a registration whose request could not be sent.
    pub fn abandon(&self, pending: PendingSubscribe) {
        let PendingSubscribe { key, gate, .. } = pending;
        self.pending.remove_if(&key, |_, current| Arc::ptr_eq(current, &gate));
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
