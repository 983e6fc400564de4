//! webrtc-rs implementation of the transport seam

use async_trait::async_trait;
use bytes::Bytes;
use livecall_cluster::DataChannelParams;
use livecall_core::config::RtcConfig;
use livecall_core::models::RoomMode;
use livecall_core::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice::udp_network::{EphemeralUDP, UDPNetwork};
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtcp::receiver_report::ReceiverReport;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::stats::StatsReportType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};
use webrtc::track::track_remote::TrackRemote;

use super::{
    ChannelMessage, CodecInfo, ConnectionState, DataChannel, LocalTrack, MediaSession, Negotiated, RemoteReports,
    RemoteTrack, SentStream, SentTotals, TransportEvent, TransportFactory,
};
use crate::track::{receive_kinds, TrackKind};

impl From<RTCPeerConnectionState> for ConnectionState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => Self::New,
            RTCPeerConnectionState::Connecting => Self::Connecting,
            RTCPeerConnectionState::Connected => Self::Connected,
            RTCPeerConnectionState::Disconnected => Self::Disconnected,
            RTCPeerConnectionState::Failed => Self::Failed,
            RTCPeerConnectionState::Closed => Self::Closed,
        }
    }
}

/// Builds real peer connections, one API instance per session.
pub struct WebRtcTransport {
    node_ip: Option<String>,
    udp_port_min: u16,
    udp_port_max: u16,
    ice_servers: Vec<String>,
    ice_gather_timeout: Duration,
}

impl WebRtcTransport {
    #[must_use]
    pub fn new(config: &RtcConfig) -> Self {
        Self {
            node_ip: config.node_ip.clone().filter(|ip| !ip.is_empty()),
            udp_port_min: config.udp_port_min,
            udp_port_max: config.udp_port_max,
            ice_servers: config.ice_servers.clone(),
            ice_gather_timeout: config.ice_gather_timeout(),
        }
    }

    fn api(&self) -> Result<API> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(Error::transport)?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(Error::transport)?;

        let mut setting_engine = SettingEngine::default();
        if self.udp_port_min > 0 && self.udp_port_max > 0 {
            let ephemeral = EphemeralUDP::new(self.udp_port_min, self.udp_port_max)
                .map_err(|e| Error::Transport(format!("invalid UDP port range: {e}")))?;
            setting_engine.set_udp_network(UDPNetwork::Ephemeral(ephemeral));
        }
        if let Some(ip) = &self.node_ip {
            setting_engine.set_nat_1to1_ips(vec![ip.clone()], RTCIceCandidateType::Host);
        }

        Ok(APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(setting_engine)
            .build())
    }

    async fn peer_connection(&self) -> Result<Arc<RTCPeerConnection>> {
        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };
        let pc = self.api()?.new_peer_connection(config).await.map_err(Error::transport)?;
        Ok(Arc::new(pc))
    }

    /// Apply the offer and return the answer once ICE gathering is done.
    async fn answer(&self, pc: &RTCPeerConnection, offer: &str) -> Result<String> {
        let offer = RTCSessionDescription::offer(offer.to_string()).map_err(Error::transport)?;
        pc.set_remote_description(offer).await.map_err(Error::transport)?;
        let answer = pc.create_answer(None).await.map_err(Error::transport)?;

        let mut gather_complete = pc.gathering_complete_promise().await;
        pc.set_local_description(answer).await.map_err(Error::transport)?;
        tokio::time::timeout(self.ice_gather_timeout, gather_complete.recv())
            .await
            .map_err(|_| Error::Transport("ICE gathering did not complete".to_string()))?;

        pc.local_description()
            .await
            .map(|description| description.sdp)
            .ok_or_else(|| Error::Transport("local description unavailable".to_string()))
    }
}

async fn close_on_error<T>(pc: &RTCPeerConnection, result: Result<T>) -> Result<T> {
    if result.is_err() {
        if let Err(e) = pc.close().await {
            warn!(error = %e, "Failed to close partially negotiated peer connection");
        }
    }
    result
}

fn wire_peer_connection(pc: &RTCPeerConnection, tx: &mpsc::UnboundedSender<TransportEvent>) {
    let state_tx = tx.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        debug!(state = %state, "Peer connection state changed");
        let _ = state_tx.send(TransportEvent::State(state.into()));
        Box::pin(async {})
    }));

    let track_tx = tx.clone();
    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
            let _ = track_tx.send(TransportEvent::Track(Arc::new(WebRtcRemoteTrack { track })));
            Box::pin(async {})
        },
    ));

    let channel_tx = tx.clone();
    pc.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
        wire_channel(&channel, false, channel_tx.clone());
        Box::pin(async {})
    }));
}

fn wire_channel(channel: &Arc<RTCDataChannel>, locally_created: bool, tx: mpsc::UnboundedSender<TransportEvent>) {
    let weak: Weak<RTCDataChannel> = Arc::downgrade(channel);
    let open_tx = tx.clone();
    channel.on_open(Box::new(move || {
        if let Some(inner) = weak.upgrade() {
            let _ = open_tx.send(TransportEvent::ChannelOpen {
                channel: Arc::new(WebRtcDataChannel { inner }),
                locally_created,
            });
        }
        Box::pin(async {})
    }));

    let label = channel.label().to_string();
    let message_tx = tx.clone();
    let message_label = label.clone();
    channel.on_message(Box::new(move |msg: DataChannelMessage| {
        let message = if msg.is_string {
            ChannelMessage::Text(String::from_utf8_lossy(&msg.data).into_owned())
        } else {
            ChannelMessage::Binary(msg.data)
        };
        let _ = message_tx.send(TransportEvent::ChannelMessage {
            label: message_label.clone(),
            message,
        });
        Box::pin(async {})
    }));

    channel.on_close(Box::new(move || {
        let _ = tx.send(TransportEvent::ChannelClosed { label: label.clone() });
        Box::pin(async {})
    }));
}

/// Keep reading RTCP from `sender` so interceptors run, and record the
/// subscriber's reports for `ssrc`.
fn spawn_report_reader(sender: Arc<RTCRtpSender>, ssrc: u32, reports: Arc<RemoteReports>) {
    tokio::spawn(async move {
        while let Ok((packets, _)) = sender.read_rtcp().await {
            for packet in packets {
                let Some(report) = packet.as_any().downcast_ref::<ReceiverReport>() else {
                    continue;
                };
                for block in report.reports.iter().filter(|block| block.ssrc == ssrc) {
                    reports.record(block.total_lost, block.jitter);
                }
            }
        }
        debug!(ssrc = ssrc, "RTCP reader stopped");
    });
}

#[async_trait]
impl TransportFactory for WebRtcTransport {
    type Track = TrackLocalStaticRTP;

    async fn negotiate_publish(&self, mode: RoomMode, offer: &str) -> Result<Negotiated> {
        let pc = self.peer_connection().await?;
        let (tx, events) = mpsc::unbounded_channel();

        let prepared = async {
            for kind in receive_kinds(mode) {
                pc.add_transceiver_from_kind(
                    kind.codec_type(),
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: Vec::new(),
                    }),
                )
                .await
                .map_err(Error::transport)?;
            }
            wire_peer_connection(&pc, &tx);
            self.answer(&pc, offer).await
        }
        .await;
        let answer = close_on_error(&pc, prepared).await?;

        info!(mode = %mode, "Publish session negotiated");
        Ok(Negotiated {
            session: Arc::new(WebRtcSession {
                pc,
                sent: Vec::new(),
                events: tx,
            }),
            answer,
            events,
        })
    }

    async fn negotiate_subscribe(&self, tracks: &[Arc<TrackLocalStaticRTP>], offer: &str) -> Result<Negotiated> {
        let pc = self.peer_connection().await?;
        let (tx, events) = mpsc::unbounded_channel();

        let prepared = async {
            let mut sent = Vec::with_capacity(tracks.len());
            for track in tracks {
                let local: Arc<dyn TrackLocal + Send + Sync> = Arc::clone(track) as Arc<dyn TrackLocal + Send + Sync>;
                let sender = pc.add_track(local).await.map_err(Error::transport)?;
                let ssrc = sender
                    .get_parameters()
                    .await
                    .encodings
                    .first()
                    .map_or(0, |encoding| encoding.ssrc);
                let reports = Arc::new(RemoteReports::default());
                spawn_report_reader(sender, ssrc, reports.clone());
                sent.push(SentStream {
                    track_id: TrackLocal::id(track.as_ref()).to_string(),
                    kind: TrackLocal::kind(track.as_ref()).into(),
                    ssrc,
                    clock_rate: track.codec().clock_rate,
                    reports,
                });
            }
            wire_peer_connection(&pc, &tx);
            let answer = self.answer(&pc, offer).await?;
            Ok::<_, Error>((sent, answer))
        }
        .await;
        let (sent, answer) = close_on_error(&pc, prepared).await?;

        info!(tracks = sent.len(), "Subscribe session negotiated");
        Ok(Negotiated {
            session: Arc::new(WebRtcSession { pc, sent, events: tx }),
            answer,
            events,
        })
    }

    fn relay_track(&self, source: &dyn RemoteTrack, id: &str, stream_id: &str) -> Result<Arc<TrackLocalStaticRTP>> {
        let codec = source.codec();
        Ok(Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: codec.mime_type,
                clock_rate: codec.clock_rate,
                channels: codec.channels,
                sdp_fmtp_line: codec.sdp_fmtp_line,
                rtcp_feedback: Vec::new(),
            },
            id.to_string(),
            stream_id.to_string(),
        )))
    }
}

pub struct WebRtcSession {
    pc: Arc<RTCPeerConnection>,
    sent: Vec<SentStream>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

#[async_trait]
impl MediaSession for WebRtcSession {
    async fn request_keyframe(&self, ssrc: u32) -> Result<()> {
        let pli = PictureLossIndication {
            sender_ssrc: 0,
            media_ssrc: ssrc,
        };
        self.pc
            .write_rtcp(&[Box::new(pli)])
            .await
            .map_err(Error::transport)?;
        Ok(())
    }

    async fn create_data_channel(&self, label: &str, params: &DataChannelParams) -> Result<()> {
        let init = RTCDataChannelInit {
            ordered: Some(params.ordered),
            max_packet_life_time: params.max_packet_life_time,
            max_retransmits: params.max_retransmits,
            protocol: Some(params.protocol.clone()),
            negotiated: if params.negotiated { params.id } else { None },
        };
        let channel = self
            .pc
            .create_data_channel(label, Some(init))
            .await
            .map_err(Error::transport)?;
        wire_channel(&channel, true, self.events.clone());
        Ok(())
    }

    fn sent_streams(&self) -> Vec<SentStream> {
        self.sent.clone()
    }

    async fn sent_totals(&self) -> Result<HashMap<u32, SentTotals>> {
        let report = self.pc.get_stats().await;
        Ok(report
            .reports
            .values()
            .filter_map(|stat| match stat {
                StatsReportType::OutboundRTP(outbound) => Some((
                    outbound.ssrc,
                    SentTotals::new(outbound.packets_sent, outbound.bytes_sent, outbound.header_bytes_sent),
                )),
                _ => None,
            })
            .collect())
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await.map_err(Error::transport)
    }
}

struct WebRtcRemoteTrack {
    track: Arc<TrackRemote>,
}

#[async_trait]
impl RemoteTrack for WebRtcRemoteTrack {
    fn id(&self) -> String {
        self.track.id()
    }

    fn kind(&self) -> TrackKind {
        self.track.kind().into()
    }

    fn ssrc(&self) -> u32 {
        self.track.ssrc()
    }

    fn codec(&self) -> CodecInfo {
        let capability = self.track.codec().capability;
        CodecInfo {
            mime_type: capability.mime_type,
            clock_rate: capability.clock_rate,
            channels: capability.channels,
            sdp_fmtp_line: capability.sdp_fmtp_line,
        }
    }

    async fn read_rtp(&self) -> Option<Packet> {
        match self.track.read_rtp().await {
            Ok((packet, _)) => Some(packet),
            Err(e) => {
                debug!(ssrc = self.track.ssrc(), error = %e, "Remote track ended");
                None
            }
        }
    }
}

#[async_trait]
impl LocalTrack for TrackLocalStaticRTP {
    fn track_id(&self) -> String {
        TrackLocal::id(self).to_string()
    }

    fn track_kind(&self) -> TrackKind {
        TrackLocal::kind(self).into()
    }

    fn clock_rate(&self) -> u32 {
        self.codec().clock_rate
    }

    async fn write_packet(&self, packet: &Packet) -> Result<()> {
        match self.write_rtp(packet).await {
            Ok(_) => Ok(()),
            Err(webrtc::Error::ErrClosedPipe) => Ok(()),
            Err(e) => Err(Error::transport(e)),
        }
    }
}

struct WebRtcDataChannel {
    inner: Arc<RTCDataChannel>,
}

#[async_trait]
impl DataChannel for WebRtcDataChannel {
    fn label(&self) -> String {
        self.inner.label().to_string()
    }

    fn params(&self) -> DataChannelParams {
        let non_zero = |value: u16| (value > 0).then_some(value);
        DataChannelParams {
            ordered: self.inner.ordered(),
            max_packet_life_time: non_zero(self.inner.max_packet_lifetime()),
            max_retransmits: non_zero(self.inner.max_retransmits()),
            protocol: self.inner.protocol().to_string(),
            negotiated: self.inner.negotiated(),
            id: Some(self.inner.id()),
        }
    }

    async fn send_text(&self, text: &str) -> Result<()> {
        self.inner.send_text(text.to_string()).await.map_err(Error::transport)?;
        Ok(())
    }

    async fn send_binary(&self, data: &Bytes) -> Result<()> {
        self.inner.send(data).await.map_err(Error::transport)?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await.map_err(Error::transport)
    }
}
