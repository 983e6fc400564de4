//! Typed publish/subscribe over the shared cache's pub/sub primitive
//!
//! Messages are wrapped in an [`Envelope`] carrying the sender's node id.
//! Delivery includes the sending node itself; receivers filter on payload
//! identity, never on the node id.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use livecall_core::service::RoomEvents;
use livecall_core::{KeyBuilder, Result, SharedCache};

use super::events::{RelayMessage, RoomDestroyed};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope<M> {
    pub node_id: String,
    pub event: M,
}

#[derive(Serialize)]
struct OutgoingEnvelope<'a, M> {
    node_id: &'a str,
    event: &'a M,
}

pub struct RelayBus {
    cache: Arc<dyn SharedCache>,
    keys: KeyBuilder,
    node_id: String,
}

impl RelayBus {
    pub fn new(cache: Arc<dyn SharedCache>, keys: KeyBuilder, node_id: impl Into<String>) -> Self {
        Self {
            cache,
            keys,
            node_id: node_id.into(),
        }
    }

    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Broadcast `event` to every node, this one included.
    pub async fn publish<M: RelayMessage>(&self, event: &M) -> Result<()> {
        let payload = serde_json::to_string(&OutgoingEnvelope {
            node_id: &self.node_id,
            event,
        })?;
        self.cache.publish(&self.keys.channel(M::CHANNEL), &payload).await?;
        debug!(channel = M::CHANNEL, "Relay event published");
        Ok(())
    }

    pub async fn subscribe<M: RelayMessage>(&self) -> Result<RelaySubscription<M>> {
        let rx = self.cache.subscribe(&self.keys.channel(M::CHANNEL)).await?;
        Ok(RelaySubscription {
            rx,
            _marker: PhantomData,
        })
    }
}

#[async_trait]
impl RoomEvents for RelayBus {
    async fn room_destroyed(&self, room_id: &str) -> Result<()> {
        self.publish(&RoomDestroyed {
            room_id: room_id.to_string(),
        })
        .await
    }
}

/// Receiving half of one channel.
pub struct RelaySubscription<M> {
    rx: broadcast::Receiver<String>,
    _marker: PhantomData<fn() -> M>,
}

impl<M: RelayMessage> RelaySubscription<M> {
    /// Next well-formed message; `None` once the channel is closed.
    ///
    /// Undecodable payloads and lag gaps are logged and skipped.
    pub async fn recv(&mut self) -> Option<Envelope<M>> {
        loop {
            match self.rx.recv().await {
                Ok(payload) => match serde_json::from_str::<Envelope<M>>(&payload) {
                    Ok(envelope) => return Some(envelope),
                    Err(e) => {
                        warn!(channel = M::CHANNEL, error = %e, "Dropping malformed relay event");
                    }
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(channel = M::CHANNEL, skipped = skipped, "Relay subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
