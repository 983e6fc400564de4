use serde::{Deserialize, Serialize};
use std::fmt;

use super::Participant;
use crate::{Error, Result};

/// Media mode of a room; serialized as its numeric code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum RoomMode {
    Chat = 1,
    Audio = 2,
    Video = 3,
    VoiceRoom = 4,
    VideoRoom = 5,
}

impl RoomMode {
    /// Persistent rooms outlive the default TTL once someone has joined.
    #[must_use]
    pub const fn is_persistent(self) -> bool {
        matches!(self, Self::VoiceRoom | Self::VideoRoom)
    }

    /// Whether subscribers may pull media from a room of this mode.
    #[must_use]
    pub const fn allows_play(self) -> bool {
        !matches!(self, Self::Chat)
    }

    #[must_use]
    pub const fn code(self) -> i32 {
        self as i32
    }
}

impl TryFrom<i32> for RoomMode {
    type Error = Error;

    fn try_from(code: i32) -> Result<Self> {
        match code {
            1 => Ok(Self::Chat),
            2 => Ok(Self::Audio),
            3 => Ok(Self::Video),
            4 => Ok(Self::VoiceRoom),
            5 => Ok(Self::VideoRoom),
            other => Err(Error::InvalidInput(format!("unknown room mode {other}"))),
        }
    }
}

impl From<RoomMode> for i32 {
    fn from(mode: RoomMode) -> Self {
        mode.code()
    }
}

impl fmt::Display for RoomMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Chat => "chat",
            Self::Audio => "audio",
            Self::Video => "video",
            Self::VoiceRoom => "voice_room",
            Self::VideoRoom => "video_room",
        };
        f.write_str(name)
    }
}

/// Encoder hints handed to clients; the server does not enforce them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaParams {
    #[serde(default)]
    pub video_max_bitrate: i64,
    #[serde(default)]
    pub video_width: i64,
    #[serde(default)]
    pub video_height: i64,
    #[serde(default)]
    pub video_fps: i64,
    #[serde(default)]
    pub audio_max_bitrate: i64,
}

/// Room record as stored in the shared cache.
///
/// `participants` is never persisted with the record; it is filled from
/// the participants hash when the room is read back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: String,
    pub mode: RoomMode,
    pub owner_id: i64,
    /// Milliseconds since epoch
    pub create_time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_params: Option<MediaParams>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub participants: Vec<Participant>,
}

impl Room {
    #[must_use]
    pub fn participant(&self, uid: i64) -> Option<&Participant> {
        self.participants.iter().find(|p| p.u_id == uid)
    }

    #[must_use]
    pub fn is_owner(&self, uid: i64) -> bool {
        self.owner_id == uid
    }
}
