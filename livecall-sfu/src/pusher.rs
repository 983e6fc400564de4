//! Inbound publish session
//!
//! A Pusher receives a client's media and data channels. Each received track
//! is bridged into a local relay track by its own forwarding worker, which
//! Pullers on this node then send from. Data channel activity is reported to
//! [`PusherHooks`] so it can be replayed into every other Pusher in the room.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use livecall_cluster::{DataChannelEventKind, DataChannelParams, DataChannelRelay, RelayedMessage, StreamAnnouncement};
use livecall_core::models::{now_millis, subscriber_key, Role, RoomMode};
use livecall_core::service::{StatCollector, StatRecord};
use livecall_core::{Error, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::notify::{self, DEFAULT_LABEL};
use crate::puller::Puller;
use crate::track::{connects_on, TrackKind};
use crate::transport::{
    ChannelMessage, DataChannel, LocalTrack, MediaSession, RemoteTrack, StreamCounters, StreamSnapshot,
    TransportEvent, TransportFactory,
};
use crate::types::{Played, SessionState};

/// Callbacks a Pusher raises towards the service that owns it.
#[async_trait]
pub trait PusherHooks<T: TransportFactory>: Send + Sync {
    /// The Pusher reached `Connected`.
    async fn on_pusher_connected(&self, pusher: Arc<Pusher<T>>);

    /// The Pusher closed; raised once.
    async fn on_pusher_closed(&self, pusher: &Pusher<T>);

    /// The client opened, wrote to, or closed a data channel.
    async fn on_data_channel_event(&self, event: DataChannelRelay);
}

/// Node-wide pieces every session needs.
pub(crate) struct SessionContext<T> {
    pub factory: Arc<T>,
    pub stats: StatCollector,
    pub config: SessionConfig,
}

impl<T> Clone for SessionContext<T> {
    fn clone(&self) -> Self {
        Self {
            factory: self.factory.clone(),
            stats: self.stats.clone(),
            config: self.config,
        }
    }
}

struct RelayedTrack<L> {
    remote_id: String,
    ssrc: u32,
    kind: TrackKind,
    local: Arc<L>,
    counters: Arc<StreamCounters>,
}

pub struct Pusher<T: TransportFactory> {
    room_id: String,
    mode: RoomMode,
    uid: i64,
    key: String,
    create_time: i64,
    join_time: AtomicI64,
    session: Arc<dyn MediaSession>,
    state: Mutex<SessionState>,
    cancel: CancellationToken,
    /// Keyed by local track id
    tracks: DashMap<String, RelayedTrack<T::Track>>,
    channels: DashMap<String, Arc<dyn DataChannel>>,
    /// Notifications held until the default channel opens
    deferred: Mutex<Vec<String>>,
    pullers: DashMap<String, Arc<Puller<T>>>,
    hooks: Weak<dyn PusherHooks<T>>,
    ctx: SessionContext<T>,
}

impl<T: TransportFactory> Pusher<T> {
    pub(crate) fn new(
        room_id: &str,
        mode: RoomMode,
        uid: i64,
        key: String,
        session: Arc<dyn MediaSession>,
        hooks: Weak<dyn PusherHooks<T>>,
        ctx: SessionContext<T>,
    ) -> Arc<Self> {
        Arc::new(Self {
            room_id: room_id.to_string(),
            mode,
            uid,
            key,
            create_time: now_millis(),
            join_time: AtomicI64::new(0),
            session,
            state: Mutex::new(SessionState::Negotiating),
            cancel: CancellationToken::new(),
            tracks: DashMap::new(),
            channels: DashMap::new(),
            deferred: Mutex::new(Vec::new()),
            pullers: DashMap::new(),
            hooks,
            ctx,
        })
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub const fn mode(&self) -> RoomMode {
        self.mode
    }

    pub const fn uid(&self) -> i64 {
        self.uid
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub const fn create_time(&self) -> i64 {
        self.create_time
    }

    /// Milliseconds since epoch at which the Pusher connected, 0 before.
    pub fn join_time(&self) -> i64 {
        self.join_time.load(Ordering::Acquire)
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn has_tracks(&self) -> bool {
        !self.tracks.is_empty()
    }

    /// Broadcast if the client sends media, audience otherwise.
    pub fn role(&self) -> Role {
        if self.has_tracks() {
            Role::Broadcast
        } else {
            Role::Audience
        }
    }

    pub fn announcement(&self) -> StreamAnnouncement {
        StreamAnnouncement {
            room_id: self.room_id.clone(),
            u_id: self.uid,
            stream_key: self.key.clone(),
            role: self.role(),
        }
    }

    pub fn local_tracks(&self) -> Vec<Arc<T::Track>> {
        self.tracks.iter().map(|entry| entry.local.clone()).collect()
    }

    /// Inbound totals of the track relayed as `local_track_id`.
    pub fn track_snapshot(&self, local_track_id: &str) -> Option<StreamSnapshot> {
        self.tracks.get(local_track_id).map(|entry| entry.counters.snapshot())
    }

    pub fn puller_count(&self) -> usize {
        self.pullers.len()
    }

    /// Consume transport events until the session ends.
    pub(crate) fn start(self: &Arc<Self>, events: mpsc::UnboundedReceiver<TransportEvent>) {
        let this = Arc::clone(self);
        tokio::spawn(this.run(events));
    }

    async fn run(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
        loop {
            let event = tokio::select! {
                () = self.cancel.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Some(event) => self.handle_event(event).await,
                None => {
                    self.close().await;
                    break;
                }
            }
        }
        debug!(stream_key = %self.key, "Pusher event loop stopped");
    }

    async fn handle_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::Track(remote) => self.on_track(remote).await,
            TransportEvent::ChannelOpen {
                channel,
                locally_created,
            } => self.on_channel_open(channel, locally_created).await,
            TransportEvent::ChannelMessage { label, message } => {
                let message = match &message {
                    ChannelMessage::Text(text) => RelayedMessage::text(text),
                    ChannelMessage::Binary(data) => RelayedMessage::binary(data),
                };
                self.raise_channel_event(label, DataChannelEventKind::Msg, Some(message), None)
                    .await;
            }
            TransportEvent::ChannelClosed { label } => {
                if self.channels.remove(&label).is_some() {
                    self.raise_channel_event(label, DataChannelEventKind::Close, None, None)
                        .await;
                }
            }
            TransportEvent::State(state) => {
                debug!(stream_key = %self.key, state = ?state, "Pusher transport state");
                if state.is_terminal() {
                    self.close().await;
                }
            }
        }
    }

    async fn on_track(self: &Arc<Self>, remote: Arc<dyn RemoteTrack>) {
        if self.state() == SessionState::Closed {
            return;
        }
        let kind = remote.kind();
        let local_id = format!("{kind}/id/{}", self.uid);
        let stream_id = format!("{kind}/stream/{}", self.uid);
        let local = match self.ctx.factory.relay_track(remote.as_ref(), &local_id, &stream_id) {
            Ok(local) => local,
            Err(e) => {
                warn!(stream_key = %self.key, kind = %kind, error = %e, "Failed to create relay track");
                return;
            }
        };

        let counters = Arc::new(StreamCounters::new(remote.codec().clock_rate));
        self.tracks.insert(local_id.clone(), RelayedTrack {
            remote_id: remote.id(),
            ssrc: remote.ssrc(),
            kind,
            local: local.clone(),
            counters: counters.clone(),
        });
        info!(stream_key = %self.key, kind = %kind, ssrc = remote.ssrc(), track_id = %local_id, "Track received");

        tokio::spawn(forward(remote.clone(), local, counters.clone(), self.cancel.clone()));
        self.spawn_sampler(remote.id(), kind, counters);

        if connects_on(self.mode, kind) {
            self.connect().await;
        }
    }

    async fn on_channel_open(self: &Arc<Self>, channel: Arc<dyn DataChannel>, locally_created: bool) {
        let label = channel.label();
        let params = channel.params();
        self.channels.insert(label.clone(), channel);
        debug!(stream_key = %self.key, label = %label, locally_created, "Data channel open");
        if label == DEFAULT_LABEL {
            self.flush_deferred().await;
        }

        // channels opened on behalf of other participants are not relayed back
        if locally_created {
            return;
        }
        self.raise_channel_event(label, DataChannelEventKind::New, None, Some(params))
            .await;
        if self.mode == RoomMode::Chat {
            self.connect().await;
        }
    }

    async fn raise_channel_event(
        &self,
        label: String,
        kind: DataChannelEventKind,
        message: Option<RelayedMessage>,
        channel_params: Option<DataChannelParams>,
    ) {
        let Some(hooks) = self.hooks.upgrade() else {
            return;
        };
        hooks
            .on_data_channel_event(DataChannelRelay {
                room_id: self.room_id.clone(),
                u_id: self.uid,
                stream_key: self.key.clone(),
                label,
                kind,
                message,
                channel_params,
            })
            .await;
    }

    async fn connect(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if *state != SessionState::Negotiating {
                return;
            }
            *state = SessionState::Connected;
        }
        self.join_time.store(now_millis(), Ordering::Release);
        info!(room_id = %self.room_id, uid = self.uid, stream_key = %self.key, "Pusher connected");

        if let Some(hooks) = self.hooks.upgrade() {
            hooks.on_pusher_connected(Arc::clone(self)).await;
        }
        if self.state() == SessionState::Connected {
            self.spawn_keyframe_loop();
        }
    }

    fn spawn_keyframe_loop(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.ctx.config.keyframe_interval);
            loop {
                tokio::select! {
                    () = this.cancel.cancelled() => break,
                    _ = ticker.tick() => this.request_keyframes().await,
                }
            }
        });
    }

    fn spawn_sampler(&self, stream_id: String, kind: TrackKind, counters: Arc<StreamCounters>) {
        let cancel = self.cancel.clone();
        let stats = self.ctx.stats.clone();
        let interval = self.ctx.config.stat_interval;
        let (room_id, uid, key) = (self.room_id.clone(), self.uid, self.key.clone());
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            let mut last_lost = 0;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let snapshot = counters.snapshot();
                if snapshot.lost > last_lost {
                    debug!(stream_key = %key, stream_id = %stream_id, lost = snapshot.lost - last_lost, "Inbound loss");
                }
                last_lost = snapshot.lost;
                stats.collect(StatRecord {
                    room_id: room_id.clone(),
                    uid: uid.to_string(),
                    stream_id: stream_id.clone(),
                    stream_key: key.clone(),
                    sfu_stream_key: key.clone(),
                    stream_type: kind.stream_type(),
                    c_time: now_millis(),
                    p_size: snapshot.bytes,
                    h_size: snapshot.header_bytes,
                    p_count: snapshot.packets,
                    p_lost_count: snapshot.lost,
                    jitter: snapshot.jitter,
                });
            }
        });
    }

    /// Ask the publisher for a keyframe on every video track.
    pub async fn request_keyframes(&self) {
        let ssrcs: Vec<u32> = self
            .tracks
            .iter()
            .filter(|entry| entry.kind == TrackKind::Video)
            .map(|entry| entry.ssrc)
            .collect();
        for ssrc in ssrcs {
            if let Err(e) = self.session.request_keyframe(ssrc).await {
                debug!(stream_key = %self.key, ssrc = ssrc, error = %e, "Keyframe request failed");
            }
        }
    }

    /// Send a notification to the client on the default channel.
    pub async fn send_notify(&self, text: &str) -> Result<()> {
        let channel = self
            .channels
            .get(DEFAULT_LABEL)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::NotFound(format!("default data channel of {}", self.key)))?;
        channel.send_text(text).await
    }

    /// Send on the default channel, or hold `text` until it opens.
    pub async fn send_notify_when_open(&self, text: String) -> Result<()> {
        let channel = {
            let mut deferred = self.deferred.lock();
            match self.channels.get(DEFAULT_LABEL).map(|entry| entry.value().clone()) {
                Some(channel) => channel,
                None => {
                    debug!(stream_key = %self.key, "Default channel not open yet, holding notification");
                    deferred.push(text);
                    return Ok(());
                }
            }
        };
        channel.send_text(&text).await
    }

    pub fn deferred_count(&self) -> usize {
        self.deferred.lock().len()
    }

    async fn flush_deferred(&self) {
        let pending = std::mem::take(&mut *self.deferred.lock());
        for text in pending {
            if let Err(e) = self.send_notify(&text).await {
                warn!(stream_key = %self.key, error = %e, "Failed to deliver held notification");
            }
        }
    }

    /// Replay another participant's data channel activity into this session.
    pub async fn receive_relay(&self, event: &DataChannelRelay) -> Result<()> {
        match event.kind {
            DataChannelEventKind::New => {
                if self.channels.contains_key(&event.label) {
                    return Ok(());
                }
                let params = event.channel_params.clone().unwrap_or_default();
                self.session.create_data_channel(&event.label, &params).await
            }
            DataChannelEventKind::Msg => {
                let Some(message) = &event.message else {
                    return Ok(());
                };
                let Some(channel) = self.channels.get(&event.label).map(|entry| entry.value().clone()) else {
                    debug!(stream_key = %self.key, label = %event.label, "No channel for relayed message");
                    return Ok(());
                };
                let data = message.bytes()?;
                if message.is_string {
                    let text = String::from_utf8(data)
                        .map_err(|e| Error::InvalidInput(format!("relayed text is not utf-8: {e}")))?;
                    channel.send_text(&notify::data_channel_msg(&text)?).await
                } else {
                    channel.send_binary(&Bytes::from(data)).await
                }
            }
            DataChannelEventKind::Close => {
                if event.label == DEFAULT_LABEL {
                    return Ok(());
                }
                match self.channels.remove(&event.label) {
                    Some((_, channel)) => channel.close().await,
                    None => Ok(()),
                }
            }
        }
    }

    /// Build a Puller for `uid` fed from this Pusher's relay tracks.
    pub async fn subscribe(self: &Arc<Self>, uid: i64, offer: &str) -> Result<Played> {
        if self.state() == SessionState::Closed {
            return Err(Error::NotFound(format!("stream {}", self.key)));
        }
        let negotiated = self
            .ctx
            .factory
            .negotiate_subscribe(&self.local_tracks(), offer)
            .await?;

        let key = subscriber_key(&self.key, uid);
        let puller = Puller::new(self, uid, key.clone(), negotiated.session, self.ctx.clone());
        if let Some(previous) = self.pullers.insert(key.clone(), puller.clone()) {
            previous.close().await;
        }
        // the Pusher may have closed while negotiating
        if self.state() == SessionState::Closed {
            puller.close().await;
            return Err(Error::NotFound(format!("stream {}", self.key)));
        }
        puller.start(negotiated.events);
        info!(stream_key = %self.key, subscriber_key = %key, "Puller created");

        Ok(Played {
            answer: negotiated.answer,
            subscriber_key: key,
        })
    }

    pub(crate) fn remove_puller(&self, puller: &Puller<T>) {
        self.pullers
            .remove_if(puller.key(), |_, current| std::ptr::eq(current.as_ref(), puller));
    }

    /// Tear the session down. Later calls are no-ops.
    pub async fn close(&self) {
        {
            let mut state = self.state.lock();
            if *state == SessionState::Closed {
                return;
            }
            *state = SessionState::Closed;
        }
        self.cancel.cancel();

        let channels: Vec<_> = self.channels.iter().map(|entry| entry.value().clone()).collect();
        self.channels.clear();
        for channel in channels {
            if let Err(e) = channel.close().await {
                debug!(stream_key = %self.key, error = %e, "Failed to close data channel");
            }
        }
        if let Err(e) = self.session.close().await {
            warn!(stream_key = %self.key, error = %e, "Failed to close publish session");
        }

        let pullers: Vec<_> = self.pullers.iter().map(|entry| entry.value().clone()).collect();
        for puller in pullers {
            puller.close().await;
        }
        self.pullers.clear();

        for entry in &self.tracks {
            debug!(stream_key = %self.key, remote_track = %entry.remote_id, "Relay track released");
        }
        info!(room_id = %self.room_id, uid = self.uid, stream_key = %self.key, "Pusher closed");

        if let Some(hooks) = self.hooks.upgrade() {
            hooks.on_pusher_closed(self).await;
        }
    }
}

async fn forward<L: LocalTrack>(
    remote: Arc<dyn RemoteTrack>,
    local: Arc<L>,
    counters: Arc<StreamCounters>,
    cancel: CancellationToken,
) {
    loop {
        let packet = tokio::select! {
            () = cancel.cancelled() => break,
            packet = remote.read_rtp() => packet,
        };
        let Some(packet) = packet else {
            debug!(ssrc = remote.ssrc(), "Remote track ended");
            break;
        };
        counters.record(&packet);
        if let Err(e) = local.write_packet(&packet).await {
            debug!(ssrc = remote.ssrc(), error = %e, "Relay write failed");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::transport::memory::{MemorySession, MemoryTransport};
    use crate::transport::ConnectionState;
    use std::time::Duration;
    use webrtc::rtp::header::Header;
    use webrtc::rtp::packet::Packet;

    #[derive(Default)]
    pub(crate) struct RecordingHooks {
        pub connected: Mutex<Vec<String>>,
        pub closed: Mutex<Vec<String>>,
        pub channel_events: Mutex<Vec<DataChannelRelay>>,
    }

    #[async_trait]
    impl PusherHooks<MemoryTransport> for RecordingHooks {
        async fn on_pusher_connected(&self, pusher: Arc<Pusher<MemoryTransport>>) {
            self.connected.lock().push(pusher.key().to_string());
        }

        async fn on_pusher_closed(&self, pusher: &Pusher<MemoryTransport>) {
            self.closed.lock().push(pusher.key().to_string());
        }

        async fn on_data_channel_event(&self, event: DataChannelRelay) {
            self.channel_events.lock().push(event);
        }
    }

    pub(crate) async fn eventually(what: &str, check: impl Fn() -> bool) {
        for _ in 0..400 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {what}");
    }

    pub(crate) fn packet(seq: u16) -> Packet {
        Packet {
            header: Header {
                version: 2,
                sequence_number: seq,
                timestamp: u32::from(seq) * 3000,
                ..Header::default()
            },
            payload: Bytes::from_static(&[1, 2, 3, 4]),
        }
    }

    struct Fixture {
        transport: Arc<MemoryTransport>,
        hooks: Arc<RecordingHooks>,
        pusher: Arc<Pusher<MemoryTransport>>,
        session: Arc<MemorySession>,
    }

    async fn publish(mode: RoomMode) -> Fixture {
        let transport = Arc::new(MemoryTransport::new());
        let hooks = Arc::new(RecordingHooks::default());
        let negotiated = transport.negotiate_publish(mode, "offer").await.unwrap();
        let weak = Arc::downgrade(&hooks);
        let weak: Weak<dyn PusherHooks<MemoryTransport>> = weak;
        let ctx = SessionContext {
            factory: transport.clone(),
            stats: StatCollector::disabled(),
            config: SessionConfig::default(),
        };
        let pusher = Pusher::new("r1", mode, 7, "/stream/r1/7/k".to_string(), negotiated.session, weak, ctx);
        pusher.start(negotiated.events);
        let session = transport.last_publish().unwrap();
        Fixture {
            transport,
            hooks,
            pusher,
            session,
        }
    }

    #[tokio::test]
    async fn test_video_pusher_connects_on_video_track() {
        let f = publish(RoomMode::Video).await;
        f.session.open_channel(DEFAULT_LABEL);
        let _audio = f.session.add_track(TrackKind::Audio);
        eventually("audio relay track", || f.pusher.local_tracks().len() == 1).await;
        assert_eq!(f.pusher.state(), SessionState::Negotiating);

        let _video = f.session.add_track(TrackKind::Video);
        eventually("connect", || f.pusher.state() == SessionState::Connected).await;
        assert_eq!(*f.hooks.connected.lock(), vec!["/stream/r1/7/k".to_string()]);
        assert!(f.pusher.join_time() > 0);
        assert_eq!(f.pusher.role(), Role::Broadcast);

        let mut ids: Vec<String> = f.pusher.local_tracks().iter().map(|t| t.track_id()).collect();
        ids.sort();
        assert_eq!(ids, vec!["audio/id/7".to_string(), "video/id/7".to_string()]);
    }

    #[tokio::test]
    async fn test_chat_pusher_connects_on_channel_open() {
        let f = publish(RoomMode::Chat).await;
        f.session.open_channel(DEFAULT_LABEL);
        eventually("connect", || f.pusher.state() == SessionState::Connected).await;
        assert_eq!(f.pusher.role(), Role::Audience);
        assert_eq!(
            f.pusher.announcement(),
            StreamAnnouncement {
                room_id: "r1".to_string(),
                u_id: 7,
                stream_key: "/stream/r1/7/k".to_string(),
                role: Role::Audience,
            }
        );
    }

    #[tokio::test]
    async fn test_forwarding_copies_packets_and_counts() {
        let f = publish(RoomMode::Audio).await;
        let feed = f.session.add_track(TrackKind::Audio);
        eventually("relay track", || f.pusher.has_tracks()).await;

        for seq in [1, 2, 4] {
            feed.send(packet(seq));
        }
        let local = f.pusher.local_tracks().remove(0);
        eventually("forwarded packets", || local.written().len() == 3).await;
        assert_eq!(local.written()[2].header.ssrc, feed.ssrc());
        assert_eq!(local.stream_id(), "audio/stream/7");

        let snapshot = f.pusher.track_snapshot("audio/id/7").unwrap();
        assert_eq!(snapshot.packets, 3);
        assert_eq!(snapshot.lost, 1);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let f = publish(RoomMode::Audio).await;
        let channel = f.session.open_channel(DEFAULT_LABEL);
        let _feed = f.session.add_track(TrackKind::Audio);
        eventually("connect", || f.pusher.state() == SessionState::Connected).await;

        f.pusher.close().await;
        f.pusher.close().await;
        assert_eq!(f.hooks.closed.lock().len(), 1);
        assert!(f.session.is_closed());
        assert!(channel.is_closed());
        assert_eq!(f.pusher.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_transport_failure_closes() {
        let f = publish(RoomMode::Video).await;
        f.session.set_state(ConnectionState::Connecting);
        f.session.set_state(ConnectionState::Failed);
        eventually("close", || f.pusher.state() == SessionState::Closed).await;
        assert_eq!(f.hooks.closed.lock().len(), 1);
        assert!(f.hooks.connected.lock().is_empty());
    }

    #[tokio::test]
    async fn test_channel_activity_is_reported() {
        let f = publish(RoomMode::Chat).await;
        f.session.open_channel("chat");
        f.session.client_send("chat", ChannelMessage::Text("hello".to_string()));
        f.session.client_close("chat");
        eventually("three events", || f.hooks.channel_events.lock().len() == 3).await;

        let events = f.hooks.channel_events.lock().clone();
        assert_eq!(events[0].kind, DataChannelEventKind::New);
        assert!(events[0].channel_params.as_ref().unwrap().ordered);
        assert_eq!(events[1].kind, DataChannelEventKind::Msg);
        assert_eq!(events[1].message, Some(RelayedMessage::text("hello")));
        assert_eq!(events[2].kind, DataChannelEventKind::Close);
        assert!(events.iter().all(|e| e.label == "chat" && e.stream_key == "/stream/r1/7/k"));
    }

    fn relay(label: &str, kind: DataChannelEventKind, message: Option<RelayedMessage>) -> DataChannelRelay {
        DataChannelRelay {
            room_id: "r1".to_string(),
            u_id: 8,
            stream_key: "/stream/r1/8/other".to_string(),
            label: label.to_string(),
            kind,
            message,
            channel_params: None,
        }
    }

    #[tokio::test]
    async fn test_receive_relay() {
        let f = publish(RoomMode::Chat).await;
        let default = f.session.open_channel(DEFAULT_LABEL);
        eventually("connect", || f.pusher.state() == SessionState::Connected).await;

        f.pusher
            .receive_relay(&relay("game", DataChannelEventKind::New, None))
            .await
            .unwrap();
        eventually("server channel", || f.session.channel("game").is_some()).await;
        let game = f.session.channel("game").unwrap();
        // a server-created channel is not announced again
        eventually("channel registered", || f.pusher.channels.contains_key("game")).await;
        assert_eq!(f.hooks.channel_events.lock().len(), 1);

        f.pusher
            .receive_relay(&relay("game", DataChannelEventKind::Msg, Some(RelayedMessage::text("move"))))
            .await
            .unwrap();
        f.pusher
            .receive_relay(&relay("game", DataChannelEventKind::Msg, Some(RelayedMessage::binary(&[9, 9]))))
            .await
            .unwrap();
        assert_eq!(game.sent_texts(), vec![notify::data_channel_msg("move").unwrap()]);
        assert_eq!(game.sent_binaries(), vec![Bytes::from_static(&[9, 9])]);

        f.pusher
            .receive_relay(&relay(DEFAULT_LABEL, DataChannelEventKind::Close, None))
            .await
            .unwrap();
        assert!(!default.is_closed());
        f.pusher
            .receive_relay(&relay("game", DataChannelEventKind::Close, None))
            .await
            .unwrap();
        assert!(game.is_closed());
    }

    #[tokio::test]
    async fn test_notify_without_default_channel_fails() {
        let f = publish(RoomMode::Audio).await;
        let err = f.pusher.send_notify("x").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_held_notifications_flush_when_default_channel_opens() {
        let f = publish(RoomMode::Video).await;
        let _video = f.session.add_track(TrackKind::Video);
        eventually("connect", || f.pusher.state() == SessionState::Connected).await;

        f.pusher.send_notify_when_open("first".to_string()).await.unwrap();
        f.pusher.send_notify_when_open("second".to_string()).await.unwrap();
        assert_eq!(f.pusher.deferred_count(), 2);

        // other channels do not release them
        let side = f.session.open_channel("side");
        eventually("side channel", || f.pusher.channels.contains_key("side")).await;
        assert_eq!(f.pusher.deferred_count(), 2);
        assert!(side.sent_texts().is_empty());

        let default = f.session.open_channel(DEFAULT_LABEL);
        eventually("flushed", || default.sent_texts().len() == 2).await;
        assert_eq!(default.sent_texts(), vec!["first".to_string(), "second".to_string()]);
        assert_eq!(f.pusher.deferred_count(), 0);

        f.pusher.send_notify_when_open("third".to_string()).await.unwrap();
        assert_eq!(default.sent_texts().len(), 3);
        assert_eq!(f.pusher.deferred_count(), 0);
    }

    #[tokio::test]
    async fn test_puller_lifecycle() {
        let f = publish(RoomMode::Video).await;
        f.session.open_channel(DEFAULT_LABEL);
        let video = f.session.add_track(TrackKind::Video);
        eventually("connect", || f.pusher.state() == SessionState::Connected).await;

        let played = f.pusher.subscribe(9, "sub-offer").await.unwrap();
        assert_eq!(played.subscriber_key, "/stream/r1/7/k/sub/9");
        assert_eq!(played.answer, "answer:sub-offer");
        assert_eq!(f.pusher.puller_count(), 1);

        let outbound = f.transport.last_subscribe().unwrap();
        assert_eq!(outbound.sent().len(), 1);
        let before = f.session.keyframe_requests().len();
        outbound.set_state(ConnectionState::Connected);
        eventually("keyframe on puller connect", || {
            f.session.keyframe_requests().len() > before
        })
        .await;
        assert!(f.session.keyframe_requests().contains(&video.ssrc()));

        f.pusher.close().await;
        assert!(outbound.is_closed());
        assert_eq!(f.pusher.puller_count(), 0);
        assert!(f.pusher.subscribe(10, "late").await.is_err());
    }
}
