//! Media track kinds and the transceivers each room mode needs

use livecall_core::models::RoomMode;
use serde::{Deserialize, Serialize};
use std::fmt;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

/// Media track kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    /// Numeric code used in stat records: 1 audio, 2 video.
    #[must_use]
    pub const fn stream_type(self) -> i64 {
        match self {
            Self::Audio => 1,
            Self::Video => 2,
        }
    }

    #[must_use]
    pub const fn codec_type(self) -> RTPCodecType {
        match self {
            Self::Audio => RTPCodecType::Audio,
            Self::Video => RTPCodecType::Video,
        }
    }
}

impl From<RTPCodecType> for TrackKind {
    fn from(codec_type: RTPCodecType) -> Self {
        match codec_type {
            RTPCodecType::Audio => Self::Audio,
            _ => Self::Video,
        }
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Audio => f.write_str("audio"),
            Self::Video => f.write_str("video"),
        }
    }
}

/// Receive-only transceivers a publisher in `mode` is offered.
#[must_use]
pub const fn receive_kinds(mode: RoomMode) -> &'static [TrackKind] {
    match mode {
        RoomMode::Video | RoomMode::VideoRoom => &[TrackKind::Video, TrackKind::Audio],
        RoomMode::Audio | RoomMode::VoiceRoom => &[TrackKind::Audio],
        RoomMode::Chat => &[],
    }
}

/// Whether the arrival of a `kind` track marks a publisher in `mode` as connected.
#[must_use]
pub const fn connects_on(mode: RoomMode, kind: TrackKind) -> bool {
    match mode {
        RoomMode::Video | RoomMode::VideoRoom => matches!(kind, TrackKind::Video),
        RoomMode::Audio | RoomMode::VoiceRoom => matches!(kind, TrackKind::Audio),
        RoomMode::Chat => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_receive_kinds_per_mode() {
        assert_eq!(receive_kinds(RoomMode::Video), &[TrackKind::Video, TrackKind::Audio]);
        assert_eq!(receive_kinds(RoomMode::VoiceRoom), &[TrackKind::Audio]);
        assert!(receive_kinds(RoomMode::Chat).is_empty());
    }

    #[test]
    fn test_connect_trigger() {
        assert!(connects_on(RoomMode::Video, TrackKind::Video));
        assert!(!connects_on(RoomMode::Video, TrackKind::Audio));
        assert!(connects_on(RoomMode::Audio, TrackKind::Audio));
        assert!(!connects_on(RoomMode::Chat, TrackKind::Audio));
    }

    #[test]
    fn test_stream_type_codes() {
        assert_eq!(TrackKind::Audio.stream_type(), 1);
        assert_eq!(TrackKind::Video.stream_type(), 2);
        assert_eq!(TrackKind::Video.to_string(), "video");
    }
}
