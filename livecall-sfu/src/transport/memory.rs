//! In-process transport
//!
//! Negotiation always succeeds for a non-empty offer and answers with
//! `answer:{offer}`. Each session exposes handles to drive it the way a
//! remote client would: open channels, send messages, add tracks, change
//! connection state. A subscribe session counts only the packets written to
//! its tracks after it was negotiated.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use livecall_cluster::DataChannelParams;
use livecall_core::models::RoomMode;
use livecall_core::{Error, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use webrtc::rtp::packet::Packet;

use super::{
    ChannelMessage, CodecInfo, ConnectionState, DataChannel, LocalTrack, MediaSession, Negotiated, RemoteReports,
    RemoteTrack, SentCounters, SentStream, SentTotals, TransportEvent, TransportFactory,
};
use crate::track::{receive_kinds, TrackKind};

fn clock_rate(kind: TrackKind) -> u32 {
    match kind {
        TrackKind::Audio => 48000,
        TrackKind::Video => 90000,
    }
}

#[derive(Default)]
pub struct MemoryTransport {
    publishes: Mutex<Vec<Arc<MemorySession>>>,
    subscribes: Mutex<Vec<Arc<MemorySession>>>,
    next_ssrc: AtomicU32,
}

impl MemoryTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn publish_sessions(&self) -> Vec<Arc<MemorySession>> {
        self.publishes.lock().clone()
    }

    #[must_use]
    pub fn last_publish(&self) -> Option<Arc<MemorySession>> {
        self.publishes.lock().last().cloned()
    }

    #[must_use]
    pub fn subscribe_sessions(&self) -> Vec<Arc<MemorySession>> {
        self.subscribes.lock().clone()
    }

    #[must_use]
    pub fn last_subscribe(&self) -> Option<Arc<MemorySession>> {
        self.subscribes.lock().last().cloned()
    }

    fn ssrc(&self) -> u32 {
        1000 + self.next_ssrc.fetch_add(1, Ordering::Relaxed)
    }
}

fn answer_for(offer: &str) -> Result<String> {
    if offer.trim().is_empty() {
        return Err(Error::Transport("empty offer".to_string()));
    }
    Ok(format!("answer:{offer}"))
}

#[async_trait]
impl TransportFactory for MemoryTransport {
    type Track = MemoryLocalTrack;

    async fn negotiate_publish(&self, mode: RoomMode, offer: &str) -> Result<Negotiated> {
        let answer = answer_for(offer)?;
        let (tx, events) = mpsc::unbounded_channel();
        let session = Arc::new(MemorySession::new(tx, receive_kinds(mode).to_vec(), Vec::new(), Vec::new()));
        self.publishes.lock().push(session.clone());
        Ok(Negotiated {
            session,
            answer,
            events,
        })
    }

    async fn negotiate_subscribe(&self, tracks: &[Arc<MemoryLocalTrack>], offer: &str) -> Result<Negotiated> {
        let answer = answer_for(offer)?;
        let mut sent = Vec::with_capacity(tracks.len());
        let mut counters = Vec::with_capacity(tracks.len());
        for track in tracks {
            let ssrc = self.ssrc();
            let sender = Arc::new(SentCounters::default());
            track.bindings.lock().push(Arc::downgrade(&sender));
            counters.push((ssrc, sender));
            sent.push(SentStream {
                track_id: track.id.clone(),
                kind: track.kind,
                ssrc,
                clock_rate: clock_rate(track.kind),
                reports: Arc::new(RemoteReports::default()),
            });
        }
        let (tx, events) = mpsc::unbounded_channel();
        let session = Arc::new(MemorySession::new(tx, Vec::new(), sent, counters));
        self.subscribes.lock().push(session.clone());
        Ok(Negotiated {
            session,
            answer,
            events,
        })
    }

    fn relay_track(&self, source: &dyn RemoteTrack, id: &str, stream_id: &str) -> Result<Arc<MemoryLocalTrack>> {
        Ok(Arc::new(MemoryLocalTrack {
            id: id.to_string(),
            stream_id: stream_id.to_string(),
            kind: source.kind(),
            clock_rate: source.codec().clock_rate,
            written: Mutex::new(Vec::new()),
            bindings: Mutex::new(Vec::new()),
        }))
    }
}

/// One negotiated session, driven from the test side.
pub struct MemorySession {
    events: mpsc::UnboundedSender<TransportEvent>,
    receive_kinds: Vec<TrackKind>,
    sent: Vec<SentStream>,
    /// Per outbound SSRC; dropped on close so the tracks stop counting
    sent_counters: Mutex<Vec<(u32, Arc<SentCounters>)>>,
    channels: DashMap<String, Arc<MemoryChannel>>,
    keyframes: Mutex<Vec<u32>>,
    closed: AtomicBool,
    next_ssrc: AtomicU32,
}

impl MemorySession {
    fn new(
        events: mpsc::UnboundedSender<TransportEvent>,
        receive_kinds: Vec<TrackKind>,
        sent: Vec<SentStream>,
        sent_counters: Vec<(u32, Arc<SentCounters>)>,
    ) -> Self {
        Self {
            events,
            receive_kinds,
            sent,
            sent_counters: Mutex::new(sent_counters),
            channels: DashMap::new(),
            keyframes: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            next_ssrc: AtomicU32::new(1),
        }
    }

    fn emit(&self, event: TransportEvent) {
        // receiver is gone once the session owner stopped
        let _ = self.events.send(event);
    }

    /// Transceivers the session was negotiated with.
    #[must_use]
    pub fn receive_kinds(&self) -> &[TrackKind] {
        &self.receive_kinds
    }

    /// The client opens a data channel.
    pub fn open_channel(&self, label: &str) -> Arc<MemoryChannel> {
        let channel = Arc::new(MemoryChannel::new(label, DataChannelParams {
            ordered: true,
            ..DataChannelParams::default()
        }));
        self.channels.insert(label.to_string(), channel.clone());
        self.emit(TransportEvent::ChannelOpen {
            channel: channel.clone(),
            locally_created: false,
        });
        channel
    }

    /// The client sends on an open channel.
    pub fn client_send(&self, label: &str, message: ChannelMessage) {
        self.emit(TransportEvent::ChannelMessage {
            label: label.to_string(),
            message,
        });
    }

    /// The client closes a channel.
    pub fn client_close(&self, label: &str) {
        if let Some((_, channel)) = self.channels.remove(label) {
            channel.closed.store(true, Ordering::Release);
        }
        self.emit(TransportEvent::ChannelClosed {
            label: label.to_string(),
        });
    }

    /// The client starts sending a track; packets go through the returned feed.
    pub fn add_track(&self, kind: TrackKind) -> TrackFeed {
        let (tx, rx) = mpsc::unbounded_channel();
        let ssrc = self.next_ssrc.fetch_add(1, Ordering::Relaxed);
        let track = Arc::new(MemoryRemoteTrack {
            id: format!("{kind}-{ssrc}"),
            kind,
            ssrc,
            rx: tokio::sync::Mutex::new(rx),
        });
        self.emit(TransportEvent::Track(track));
        TrackFeed { tx, ssrc }
    }

    pub fn set_state(&self, state: ConnectionState) {
        self.emit(TransportEvent::State(state));
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn keyframe_requests(&self) -> Vec<u32> {
        self.keyframes.lock().clone()
    }

    #[must_use]
    pub fn channel(&self, label: &str) -> Option<Arc<MemoryChannel>> {
        self.channels.get(label).map(|entry| entry.value().clone())
    }

    #[must_use]
    pub fn sent(&self) -> &[SentStream] {
        &self.sent
    }
}

#[async_trait]
impl MediaSession for MemorySession {
    async fn request_keyframe(&self, ssrc: u32) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Transport("session closed".to_string()));
        }
        self.keyframes.lock().push(ssrc);
        Ok(())
    }

    async fn create_data_channel(&self, label: &str, params: &DataChannelParams) -> Result<()> {
        let channel = Arc::new(MemoryChannel::new(label, params.clone()));
        self.channels.insert(label.to_string(), channel.clone());
        self.emit(TransportEvent::ChannelOpen {
            channel,
            locally_created: true,
        });
        Ok(())
    }

    fn sent_streams(&self) -> Vec<SentStream> {
        self.sent.clone()
    }

    async fn sent_totals(&self) -> Result<HashMap<u32, SentTotals>> {
        Ok(self
            .sent_counters
            .lock()
            .iter()
            .map(|(ssrc, counters)| (*ssrc, counters.totals()))
            .collect())
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.sent_counters.lock().clear();
            for entry in &self.channels {
                entry.value().closed.store(true, Ordering::Release);
            }
            self.emit(TransportEvent::State(ConnectionState::Closed));
        }
        Ok(())
    }
}

/// Sending half of a [`MemoryRemoteTrack`]; dropping it ends the track.
pub struct TrackFeed {
    tx: mpsc::UnboundedSender<Packet>,
    ssrc: u32,
}

impl TrackFeed {
    #[must_use]
    pub const fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn send(&self, mut packet: Packet) {
        packet.header.ssrc = self.ssrc;
        let _ = self.tx.send(packet);
    }
}

pub struct MemoryRemoteTrack {
    id: String,
    kind: TrackKind,
    ssrc: u32,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Packet>>,
}

#[async_trait]
impl RemoteTrack for MemoryRemoteTrack {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn ssrc(&self) -> u32 {
        self.ssrc
    }

    fn codec(&self) -> CodecInfo {
        CodecInfo {
            mime_type: match self.kind {
                TrackKind::Audio => "audio/opus".to_string(),
                TrackKind::Video => "video/VP8".to_string(),
            },
            clock_rate: clock_rate(self.kind),
            channels: u16::from(self.kind == TrackKind::Audio) * 2,
            sdp_fmtp_line: String::new(),
        }
    }

    async fn read_rtp(&self) -> Option<Packet> {
        self.rx.lock().await.recv().await
    }
}

pub struct MemoryLocalTrack {
    id: String,
    stream_id: String,
    kind: TrackKind,
    clock_rate: u32,
    written: Mutex<Vec<Packet>>,
    /// Subscribe sessions sending this track
    bindings: Mutex<Vec<Weak<SentCounters>>>,
}

impl MemoryLocalTrack {
    #[must_use]
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    #[must_use]
    pub fn written(&self) -> Vec<Packet> {
        self.written.lock().clone()
    }
}

#[async_trait]
impl LocalTrack for MemoryLocalTrack {
    fn track_id(&self) -> String {
        self.id.clone()
    }

    fn track_kind(&self) -> TrackKind {
        self.kind
    }

    fn clock_rate(&self) -> u32 {
        self.clock_rate
    }

    async fn write_packet(&self, packet: &Packet) -> Result<()> {
        self.written.lock().push(packet.clone());
        self.bindings.lock().retain(|binding| match binding.upgrade() {
            Some(sender) => {
                sender.record(packet);
                true
            }
            None => false,
        });
        Ok(())
    }
}

pub struct MemoryChannel {
    label: String,
    params: DataChannelParams,
    texts: Mutex<Vec<String>>,
    binaries: Mutex<Vec<Bytes>>,
    closed: AtomicBool,
}

impl MemoryChannel {
    fn new(label: &str, params: DataChannelParams) -> Self {
        Self {
            label: label.to_string(),
            params,
            texts: Mutex::new(Vec::new()),
            binaries: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Text frames the server sent to the client.
    #[must_use]
    pub fn sent_texts(&self) -> Vec<String> {
        self.texts.lock().clone()
    }

    #[must_use]
    pub fn sent_binaries(&self) -> Vec<Bytes> {
        self.binaries.lock().clone()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl DataChannel for MemoryChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn params(&self) -> DataChannelParams {
        self.params.clone()
    }

    async fn send_text(&self, text: &str) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Transport(format!("channel {:?} closed", self.label)));
        }
        self.texts.lock().push(text.to_string());
        Ok(())
    }

    async fn send_binary(&self, data: &Bytes) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Transport(format!("channel {:?} closed", self.label)));
        }
        self.binaries.lock().push(data.clone());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
