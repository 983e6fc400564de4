//! RTC service
//!
//! Entry point for publish and play requests on one node, and the handler
//! of every relay bus channel:
//! - subscribe requests are answered by the node owning the Pusher
//! - stream announcements fan out to local Pushers over their default channel
//! - data channel events are replayed into every other local Pusher in the room
//! - room teardown closes every local session of the room

use async_trait::async_trait;
use dashmap::DashMap;
use livecall_cluster::{
    DataChannelRelay, NewStream, RelayBus, RelayMessage, RelaySubscription, RemoveStream, RequestSubscribe,
    ResponseSubscribe, RoomDestroyed, StreamAnnouncement, SubscribeCorrelator,
};
use livecall_core::models::publish_key;
use livecall_core::service::{RoomDirectory, StatCollector};
use livecall_core::{Error, Result};
use std::future::Future;
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SessionConfig;
use crate::notify;
use crate::pusher::{Pusher, PusherHooks, SessionContext};
use crate::reconcile::joined_between;
use crate::registry::SessionRegistry;
use crate::transport::TransportFactory;
use crate::types::{Played, Published, SessionState};

pub struct RtcService<T: TransportFactory> {
    this: Weak<Self>,
    directory: Arc<RoomDirectory>,
    bus: Arc<RelayBus>,
    ctx: SessionContext<T>,
    /// Connected Pushers
    registry: SessionRegistry<Pusher<T>>,
    /// Pushers still negotiating, keyed by stream key
    negotiating: DashMap<String, Arc<Pusher<T>>>,
    correlator: SubscribeCorrelator,
    cancel: CancellationToken,
}

impl<T: TransportFactory> RtcService<T> {
    pub fn new(
        factory: Arc<T>,
        directory: Arc<RoomDirectory>,
        bus: Arc<RelayBus>,
        stats: StatCollector,
        config: SessionConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            directory,
            bus,
            ctx: SessionContext {
                factory,
                stats,
                config,
            },
            registry: SessionRegistry::new(),
            negotiating: DashMap::new(),
            correlator: SubscribeCorrelator::new(),
            cancel: CancellationToken::new(),
        })
    }

    pub fn node_id(&self) -> &str {
        self.bus.node_id()
    }

    pub const fn registry(&self) -> &SessionRegistry<Pusher<T>> {
        &self.registry
    }

    /// Subscribe to every relay channel and start handling them.
    pub async fn start(&self) -> Result<()> {
        let requests = self.bus.subscribe::<RequestSubscribe>().await?;
        let responses = self.bus.subscribe::<ResponseSubscribe>().await?;
        let new_streams = self.bus.subscribe::<NewStream>().await?;
        let removed_streams = self.bus.subscribe::<RemoveStream>().await?;
        let channel_events = self.bus.subscribe::<DataChannelRelay>().await?;
        let destroyed = self.bus.subscribe::<RoomDestroyed>().await?;

        self.listen(requests, |service, request| async move {
            // negotiation may take a while; keep the channel moving
            tokio::spawn(async move { service.answer_subscribe(request).await });
        });
        self.listen(responses, |service, response| async move {
            if !service.correlator.resolve(response) {
                debug!("Subscribe response not for this node");
            }
        });
        self.listen(new_streams, |service, NewStream(announcement)| async move {
            service.fan_out_announcement(&announcement, notify::new_stream).await;
        });
        self.listen(removed_streams, |service, RemoveStream(announcement)| async move {
            service.fan_out_announcement(&announcement, notify::remove_stream).await;
        });
        self.listen(channel_events, |service, event| async move {
            service.replay_channel_event(&event).await;
        });
        self.listen(destroyed, |service, RoomDestroyed { room_id }| async move {
            service.close_room(&room_id).await;
        });

        info!(node_id = %self.node_id(), "RTC service started");
        Ok(())
    }

    fn listen<M, F, Fut>(&self, mut subscription: RelaySubscription<M>, handler: F)
    where
        M: RelayMessage,
        F: Fn(Arc<Self>, M) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let this = self.this.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                let envelope = tokio::select! {
                    () = cancel.cancelled() => break,
                    envelope = subscription.recv() => envelope,
                };
                let (Some(envelope), Some(service)) = (envelope, this.upgrade()) else {
                    break;
                };
                handler(service, envelope.event).await;
            }
            debug!(channel = M::CHANNEL, "Relay listener stopped");
        });
    }

    /// Accept a publish offer for `uid` in `room_id`.
    pub async fn request_publish(&self, room_id: &str, uid: i64, offer: &str) -> Result<Published> {
        let room = self
            .directory
            .find_room_by_id(room_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("room {room_id}")))?;

        let negotiated = self.ctx.factory.negotiate_publish(room.mode, offer).await?;
        let key = publish_key(room_id, uid);
        let hooks: Weak<dyn PusherHooks<T>> = self.this.clone();
        let pusher = Pusher::new(
            room_id,
            room.mode,
            uid,
            key.clone(),
            negotiated.session,
            hooks,
            self.ctx.clone(),
        );
        self.negotiating.insert(key.clone(), pusher.clone());
        pusher.start(negotiated.events);

        info!(room_id = %room_id, uid = uid, stream_key = %key, mode = %room.mode, "Publish accepted");
        Ok(Published {
            answer: negotiated.answer,
            stream_key: key,
        })
    }

    /// Subscribe `uid` to `stream_key`, wherever its Pusher lives.
    pub async fn request_play(&self, room_id: &str, uid: i64, stream_key: &str, offer: &str) -> Result<Played> {
        let room = self
            .directory
            .find_room_by_id(room_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("room {room_id}")))?;
        if !room.mode.allows_play() {
            return Err(Error::UnsupportedMode("no stream pull".to_string()));
        }

        if let Some(pusher) = self.registry.get(room_id, stream_key).await {
            debug!(stream_key = %stream_key, uid = uid, "Pusher is local");
            return pusher.subscribe(uid, offer).await;
        }

        let pending = self.correlator.register(stream_key, uid);
        let request = RequestSubscribe {
            room_id: room_id.to_string(),
            u_id: uid,
            stream_key: stream_key.to_string(),
            offer: offer.to_string(),
        };
        if let Err(e) = self.bus.publish(&request).await {
            self.correlator.abandon(pending);
            return Err(e);
        }

        let mut response = self
            .correlator
            .wait(pending, self.ctx.config.subscribe_timeout)
            .await?;
        if let Some(reason) = response.error.take() {
            return Err(Error::Transport(reason));
        }
        Ok(Played {
            answer: response.answer_sdp()?,
            subscriber_key: response.subscriber_key,
        })
    }

    async fn answer_subscribe(&self, request: RequestSubscribe) {
        let Some(pusher) = self.registry.get(&request.room_id, &request.stream_key).await else {
            return;
        };
        let response = match pusher.subscribe(request.u_id, &request.offer).await {
            Ok(played) => ResponseSubscribe::answered(
                &request.stream_key,
                request.u_id,
                &played.subscriber_key,
                &played.answer,
            ),
            Err(e) => {
                warn!(stream_key = %request.stream_key, uid = request.u_id, error = %e, "Relayed subscribe failed");
                ResponseSubscribe::failed(&request.stream_key, request.u_id, e.to_string())
            }
        };
        if let Err(e) = self.bus.publish(&response).await {
            error!(stream_key = %request.stream_key, error = %e, "Failed to publish subscribe response");
        }
    }

    async fn fan_out_announcement(
        &self,
        announcement: &StreamAnnouncement,
        frame: fn(&StreamAnnouncement) -> Result<String>,
    ) {
        let text = match frame(announcement) {
            Ok(text) => text,
            Err(e) => {
                error!(stream_key = %announcement.stream_key, error = %e, "Failed to encode notification");
                return;
            }
        };
        for pusher in self.registry.room_pushers(&announcement.room_id).await {
            if pusher.uid() == announcement.u_id {
                continue;
            }
            if let Err(e) = pusher.send_notify(&text).await {
                debug!(stream_key = %pusher.key(), error = %e, "Notification not delivered");
            }
        }
    }

    async fn replay_channel_event(&self, event: &DataChannelRelay) {
        for pusher in self.registry.room_pushers(&event.room_id).await {
            if pusher.key() == event.stream_key {
                continue;
            }
            if let Err(e) = pusher.receive_relay(event).await {
                debug!(stream_key = %pusher.key(), label = %event.label, error = %e, "Data channel relay failed");
            }
        }
    }

    async fn close_room(&self, room_id: &str) {
        let mut pushers = self.registry.room_pushers(room_id).await;
        pushers.extend(
            self.negotiating
                .iter()
                .filter(|entry| entry.room_id() == room_id)
                .map(|entry| entry.value().clone())
                .collect::<Vec<_>>(),
        );
        if pushers.is_empty() {
            return;
        }
        info!(room_id = %room_id, sessions = pushers.len(), "Closing sessions of destroyed room");
        for pusher in pushers {
            pusher.close().await;
        }
    }

    async fn reconcile(&self, pusher: &Pusher<T>) -> Result<()> {
        let since = self
            .directory
            .get_request_join_room_time(pusher.room_id(), pusher.uid())
            .await?;
        let Some(room) = self.directory.find_room_by_id(pusher.room_id()).await? else {
            return Ok(());
        };
        let missed = joined_between(
            pusher.room_id(),
            &room.participants,
            since,
            pusher.join_time(),
            pusher.key(),
        );
        // media rooms may connect before the client opened its default channel
        for announcement in &missed {
            debug!(stream_key = %pusher.key(), missed = %announcement.stream_key, "Re-announcing stream");
            if let Err(e) = pusher.send_notify_when_open(notify::new_stream(announcement)?).await {
                warn!(stream_key = %pusher.key(), error = %e, "Failed to re-announce stream");
            }
        }
        Ok(())
    }

    /// Stop every local session and the relay listeners.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let mut pushers = self.registry.all().await;
        pushers.extend(self.negotiating.iter().map(|entry| entry.value().clone()).collect::<Vec<_>>());
        info!(sessions = pushers.len(), "Stopping RTC sessions");
        for pusher in pushers {
            pusher.close().await;
        }
    }
}

#[async_trait]
impl<T: TransportFactory> PusherHooks<T> for RtcService<T> {
    async fn on_pusher_connected(&self, pusher: Arc<Pusher<T>>) {
        if pusher.state() == SessionState::Closed {
            self.negotiating.remove(pusher.key());
            return;
        }

        // stays in `negotiating` until the participant is recorded, so room
        // teardown and shutdown can still reach it
        let announcement = pusher.announcement();
        match self
            .directory
            .on_participant_join(
                pusher.room_id(),
                pusher.key(),
                pusher.join_time(),
                announcement.role,
                pusher.uid(),
            )
            .await
        {
            Ok(()) => {}
            Err(Error::NotFound(what)) => {
                warn!(stream_key = %pusher.key(), what = %what, "Room vanished before the pusher connected");
                self.negotiating.remove(pusher.key());
                pusher.close().await;
                return;
            }
            Err(e) => error!(stream_key = %pusher.key(), error = %e, "Failed to record participant"),
        }

        self.registry
            .insert(pusher.room_id(), pusher.key(), pusher.clone())
            .await;
        self.negotiating.remove(pusher.key());
        if pusher.state() == SessionState::Closed {
            // closed while joining; its close found no registry entry to clean up
            if self.registry.remove(pusher.room_id(), pusher.key()).await.is_some() {
                info!(stream_key = %pusher.key(), "Pusher closed while joining, removing participant");
                if let Err(e) = self
                    .directory
                    .on_participant_leave(pusher.room_id(), pusher.key(), pusher.uid())
                    .await
                {
                    error!(stream_key = %pusher.key(), error = %e, "Failed to remove participant");
                }
            }
            return;
        }

        if let Err(e) = self.bus.publish(&NewStream(announcement)).await {
            error!(stream_key = %pusher.key(), error = %e, "Failed to announce stream");
        }
        if let Err(e) = self.reconcile(&pusher).await {
            warn!(stream_key = %pusher.key(), error = %e, "Join reconciliation failed");
        }
    }

    async fn on_pusher_closed(&self, pusher: &Pusher<T>) {
        self.negotiating.remove(pusher.key());
        if self.registry.remove(pusher.room_id(), pusher.key()).await.is_none() {
            return;
        }
        if let Err(e) = self.bus.publish(&RemoveStream(pusher.announcement())).await {
            error!(stream_key = %pusher.key(), error = %e, "Failed to announce stream removal");
        }
        if let Err(e) = self
            .directory
            .on_participant_leave(pusher.room_id(), pusher.key(), pusher.uid())
            .await
        {
            error!(stream_key = %pusher.key(), error = %e, "Failed to remove participant");
        }
    }

    async fn on_data_channel_event(&self, event: DataChannelRelay) {
        if let Err(e) = self.bus.publish(&event).await {
            error!(stream_key = %event.stream_key, label = %event.label, error = %e, "Failed to relay data channel event");
        }
    }
}
