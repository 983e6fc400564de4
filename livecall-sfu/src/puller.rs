//! Outbound subscribe session, fed from a local Pusher's relay tracks

use livecall_core::models::now_millis;
use livecall_core::service::StatRecord;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::pusher::{Pusher, SessionContext};
use crate::transport::{ConnectionState, MediaSession, SentStream, TransportEvent, TransportFactory};
use crate::types::SessionState;

pub struct Puller<T: TransportFactory> {
    room_id: String,
    uid: i64,
    key: String,
    stream_key: String,
    parent: Weak<Pusher<T>>,
    session: Arc<dyn MediaSession>,
    state: Mutex<SessionState>,
    cancel: CancellationToken,
    ctx: SessionContext<T>,
}

impl<T: TransportFactory> Puller<T> {
    pub(crate) fn new(
        parent: &Arc<Pusher<T>>,
        uid: i64,
        key: String,
        session: Arc<dyn MediaSession>,
        ctx: SessionContext<T>,
    ) -> Arc<Self> {
        Arc::new(Self {
            room_id: parent.room_id().to_string(),
            uid,
            key,
            stream_key: parent.key().to_string(),
            parent: Arc::downgrade(parent),
            session,
            state: Mutex::new(SessionState::Negotiating),
            cancel: CancellationToken::new(),
            ctx,
        })
    }

    /// Subscriber key, `{stream_key}/sub/{uid}`.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Key of the Pusher this Puller sends from.
    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }

    pub const fn uid(&self) -> i64 {
        self.uid
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

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
                Some(TransportEvent::State(state)) if state.is_terminal() => {
                    self.close().await;
                    break;
                }
                Some(TransportEvent::State(ConnectionState::Connected)) => self.connect().await,
                Some(_) => {}
                None => {
                    self.close().await;
                    break;
                }
            }
        }
    }

    async fn connect(&self) {
        {
            let mut state = self.state.lock();
            if *state != SessionState::Negotiating {
                return;
            }
            *state = SessionState::Connected;
        }
        info!(room_id = %self.room_id, uid = self.uid, subscriber_key = %self.key, "Puller connected");

        if let Some(parent) = self.parent.upgrade() {
            parent.request_keyframes().await;
        }
        let streams = self.session.sent_streams();
        if !streams.is_empty() {
            self.spawn_sampler(streams);
        }
    }

    /// Sample what this session sent, once per `stat_interval`.
    fn spawn_sampler(&self, streams: Vec<SentStream>) {
        let session = self.session.clone();
        let cancel = self.cancel.clone();
        let stats = self.ctx.stats.clone();
        let interval = self.ctx.config.stat_interval;
        let (room_id, uid) = (self.room_id.clone(), self.uid);
        let (key, stream_key) = (self.key.clone(), self.stream_key.clone());
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let totals = match session.sent_totals().await {
                    Ok(totals) => totals,
                    Err(e) => {
                        debug!(subscriber_key = %key, error = %e, "Outbound stats unavailable");
                        continue;
                    }
                };
                for stream in &streams {
                    let sent = totals.get(&stream.ssrc).copied().unwrap_or_default();
                    stats.collect(StatRecord {
                        room_id: room_id.clone(),
                        uid: uid.to_string(),
                        stream_id: stream.track_id.clone(),
                        stream_key: key.clone(),
                        sfu_stream_key: stream_key.clone(),
                        stream_type: stream.kind.stream_type(),
                        c_time: now_millis(),
                        p_size: sent.bytes,
                        h_size: sent.header_bytes,
                        p_count: sent.packets,
                        p_lost_count: stream.reports.lost(),
                        jitter: stream.reports.jitter_seconds(stream.clock_rate),
                    });
                }
            }
            debug!(subscriber_key = %key, "Puller sampler stopped");
        });
    }

    /// Close the session and leave the parent's puller set. Later calls are no-ops.
    pub async fn close(&self) {
        {
            let mut state = self.state.lock();
            if *state == SessionState::Closed {
                return;
            }
            *state = SessionState::Closed;
        }
        self.cancel.cancel();
        if let Err(e) = self.session.close().await {
            warn!(subscriber_key = %self.key, error = %e, "Failed to close subscribe session");
        }
        if let Some(parent) = self.parent.upgrade() {
            parent.remove_puller(self);
        }
        info!(room_id = %self.room_id, uid = self.uid, subscriber_key = %self.key, "Puller closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::notify::DEFAULT_LABEL;
    use crate::pusher::tests::{eventually, packet, RecordingHooks};
    use crate::pusher::PusherHooks;
    use crate::track::TrackKind;
    use crate::transport::memory::MemoryTransport;
    use async_trait::async_trait;
    use livecall_core::config::StatConfig;
    use livecall_core::models::RoomMode;
    use livecall_core::service::{StatCollector, StatSink};
    use std::time::Duration;

    #[derive(Default)]
    struct CollectingSink {
        records: Mutex<Vec<StatRecord>>,
    }

    #[async_trait]
    impl StatSink for CollectingSink {
        async fn write_batch(&self, records: &[StatRecord]) -> livecall_core::Result<()> {
            self.records.lock().extend_from_slice(records);
            Ok(())
        }
    }

    async fn connected_pusher(
        transport: &Arc<MemoryTransport>,
        hooks: &Arc<RecordingHooks>,
        stats: StatCollector,
    ) -> Arc<Pusher<MemoryTransport>> {
        let negotiated = transport.negotiate_publish(RoomMode::Audio, "offer").await.unwrap();
        let weak = Arc::downgrade(hooks);
        let weak: Weak<dyn PusherHooks<MemoryTransport>> = weak;
        let ctx = SessionContext {
            factory: transport.clone(),
            stats,
            config: SessionConfig {
                stat_interval: Duration::from_millis(20),
                ..SessionConfig::default()
            },
        };
        let pusher = Pusher::new("r1", RoomMode::Audio, 7, "/stream/r1/7/k".to_string(), negotiated.session, weak, ctx);
        pusher.start(negotiated.events);
        pusher
    }

    #[tokio::test]
    async fn test_puller_close_keeps_parent_running() {
        let transport = Arc::new(MemoryTransport::new());
        let hooks = Arc::new(RecordingHooks::default());
        let pusher = connected_pusher(&transport, &hooks, StatCollector::disabled()).await;
        let publish = transport.last_publish().unwrap();
        let _feed = publish.add_track(TrackKind::Audio);
        eventually("connect", || pusher.state() == SessionState::Connected).await;

        pusher.subscribe(9, "offer").await.unwrap();
        let outbound = transport.last_subscribe().unwrap();
        outbound.set_state(ConnectionState::Disconnected);
        eventually("puller removed", || pusher.puller_count() == 0).await;
        assert!(outbound.is_closed());
        // the parent keeps running
        assert_eq!(pusher.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn test_resubscribe_replaces_previous_puller() {
        let transport = Arc::new(MemoryTransport::new());
        let hooks = Arc::new(RecordingHooks::default());
        let pusher = connected_pusher(&transport, &hooks, StatCollector::disabled()).await;
        let _feed = transport.last_publish().unwrap().add_track(TrackKind::Audio);
        eventually("connect", || pusher.state() == SessionState::Connected).await;

        pusher.subscribe(9, "first").await.unwrap();
        let first = transport.last_subscribe().unwrap();
        pusher.subscribe(9, "second").await.unwrap();
        assert!(first.is_closed());
        assert_eq!(pusher.puller_count(), 1);
    }

    #[tokio::test]
    async fn test_outbound_samples() {
        let sink = Arc::new(CollectingSink::default());
        let config = StatConfig {
            flush_interval_ms: 10,
            ..StatConfig::default()
        };
        let stats = StatCollector::start(sink.clone(), &config);
        let transport = Arc::new(MemoryTransport::new());
        let hooks = Arc::new(RecordingHooks::default());
        let pusher = connected_pusher(&transport, &hooks, stats.clone()).await;
        let publish = transport.last_publish().unwrap();
        publish.open_channel(DEFAULT_LABEL);
        let feed = publish.add_track(TrackKind::Audio);
        eventually("connect", || pusher.state() == SessionState::Connected).await;
        feed.send(packet(1));
        feed.send(packet(2));
        let local = pusher.local_tracks().remove(0);
        eventually("relayed before subscribing", || local.written().len() == 2).await;

        // the subscriber only counts what was sent to it
        pusher.subscribe(9, "offer").await.unwrap();
        let outbound = transport.last_subscribe().unwrap();
        outbound.sent()[0].reports.record(3, 480);
        outbound.set_state(ConnectionState::Connected);
        feed.send(packet(3));

        let counted = |key: &str, packets: i64| {
            sink.records
                .lock()
                .iter()
                .any(|r| r.stream_key == key && r.p_count == packets)
        };
        eventually("outbound record", || counted("/stream/r1/7/k/sub/9", 1)).await;
        eventually("inbound record", || counted("/stream/r1/7/k", 3)).await;
        let records = sink.records.lock().clone();
        assert!(records
            .iter()
            .filter(|r| r.stream_key == "/stream/r1/7/k/sub/9")
            .all(|r| r.p_count <= 1));
        let outbound_record = records
            .iter()
            .find(|r| r.stream_key == "/stream/r1/7/k/sub/9" && r.p_count == 1)
            .unwrap();
        assert_eq!(outbound_record.p_size - outbound_record.h_size, 4);
        assert_eq!(outbound_record.uid, "9");
        assert_eq!(outbound_record.sfu_stream_key, "/stream/r1/7/k");
        assert_eq!(outbound_record.stream_id, "audio/id/7");
        assert_eq!(outbound_record.stream_type, 1);
        assert_eq!(outbound_record.p_lost_count, 3);
        assert!((outbound_record.jitter - 0.01).abs() < 1e-9);

        let inbound = records.iter().find(|r| r.stream_key == "/stream/r1/7/k").unwrap();
        assert_eq!(inbound.sfu_stream_key, "/stream/r1/7/k");
        assert_eq!(inbound.uid, "7");

        pusher.close().await;
        stats.shutdown().await;
    }
}
