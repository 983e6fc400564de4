//! Media transport seam
//!
//! Sessions never touch a peer connection directly. A [`TransportFactory`]
//! negotiates them and hands back a [`MediaSession`] plus a stream of
//! [`TransportEvent`]s; everything a Pusher or Puller reacts to arrives on
//! that stream.

pub mod memory;
pub mod stats;
pub mod webrtc_rs;

use async_trait::async_trait;
use bytes::Bytes;
use livecall_cluster::DataChannelParams;
use livecall_core::models::RoomMode;
use livecall_core::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::rtp::packet::Packet;

use crate::track::TrackKind;
pub use stats::{RemoteReports, SentCounters, SentTotals, StreamCounters, StreamSnapshot};

/// Peer connection state as reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// Disconnected and beyond end the session.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed | Self::Closed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    Text(String),
    Binary(Bytes),
}

/// Codec of a received track, enough to build a matching relay track.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodecInfo {
    pub mime_type: String,
    pub clock_rate: u32,
    pub channels: u16,
    pub sdp_fmtp_line: String,
}

#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> String;

    fn params(&self) -> DataChannelParams;

    async fn send_text(&self, text: &str) -> Result<()>;

    async fn send_binary(&self, data: &Bytes) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Inbound media track
#[async_trait]
pub trait RemoteTrack: Send + Sync {
    fn id(&self) -> String;

    fn kind(&self) -> TrackKind;

    fn ssrc(&self) -> u32;

    fn codec(&self) -> CodecInfo;

    /// Next packet; `None` once the track has ended.
    async fn read_rtp(&self) -> Option<Packet>;
}

/// Outbound track a Pusher writes into and Pullers send from
#[async_trait]
pub trait LocalTrack: Send + Sync {
    fn track_id(&self) -> String;

    fn track_kind(&self) -> TrackKind;

    fn clock_rate(&self) -> u32;

    async fn write_packet(&self, packet: &Packet) -> Result<()>;
}

/// One outbound stream of a subscribe session
#[derive(Clone)]
pub struct SentStream {
    pub track_id: String,
    pub kind: TrackKind,
    pub ssrc: u32,
    pub clock_rate: u32,
    /// Fed from the subscriber's receiver reports
    pub reports: Arc<RemoteReports>,
}

#[async_trait]
pub trait MediaSession: Send + Sync {
    /// Ask the publisher for a fresh keyframe on `ssrc`.
    async fn request_keyframe(&self, ssrc: u32) -> Result<()>;

    /// Open a server-side data channel; it is reported back as
    /// [`TransportEvent::ChannelOpen`] with `locally_created` set.
    async fn create_data_channel(&self, label: &str, params: &DataChannelParams) -> Result<()>;

    fn sent_streams(&self) -> Vec<SentStream>;

    /// Totals sent so far on each outbound stream, keyed by SSRC.
    async fn sent_totals(&self) -> Result<HashMap<u32, SentTotals>>;

    async fn close(&self) -> Result<()>;
}

pub enum TransportEvent {
    Track(Arc<dyn RemoteTrack>),
    ChannelOpen {
        channel: Arc<dyn DataChannel>,
        locally_created: bool,
    },
    ChannelMessage {
        label: String,
        message: ChannelMessage,
    },
    ChannelClosed {
        label: String,
    },
    State(ConnectionState),
}

/// A negotiated session: the answer to return to the client and the
/// events the session will raise from now on.
pub struct Negotiated {
    pub session: Arc<dyn MediaSession>,
    pub answer: String,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Builds sessions. Failures close anything partially constructed.
#[async_trait]
pub trait TransportFactory: Send + Sync + 'static {
    type Track: LocalTrack + 'static;

    /// Receive-only session with the transceivers `mode` needs.
    async fn negotiate_publish(&self, mode: RoomMode, offer: &str) -> Result<Negotiated>;

    /// Send-only session fed from `tracks`.
    async fn negotiate_subscribe(&self, tracks: &[Arc<Self::Track>], offer: &str) -> Result<Negotiated>;

    /// Local track relaying `source` to subscribers.
    fn relay_track(&self, source: &dyn RemoteTrack, id: &str, stream_id: &str) -> Result<Arc<Self::Track>>;
}
