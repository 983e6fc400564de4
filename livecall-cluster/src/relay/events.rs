//! Messages exchanged between nodes over the relay bus
//!
//! Each message type names its own channel. Every node subscribes to every
//! channel and filters locally, so payloads carry enough identity (room,
//! stream key, user) for a receiver to decide whether it owns the target.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use livecall_core::models::Role;
use livecall_core::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A payload bound to one cluster-wide channel.
pub trait RelayMessage: Serialize + DeserializeOwned + Send + 'static {
    /// Channel name, before the node's key prefix is applied
    const CHANNEL: &'static str;
}

/// Ask whichever node owns `stream_key` to build a subscriber for `u_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestSubscribe {
    pub room_id: String,
    pub u_id: i64,
    pub stream_key: String,
    /// Remote SDP offer in plain text
    pub offer: String,
}

impl RelayMessage for RequestSubscribe {
    const CHANNEL: &'static str = "RequestSubscribeEvent";
}

/// Reply from the owning node, addressed by `(stream_key, u_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseSubscribe {
    pub stream_key: String,
    pub u_id: i64,
    #[serde(default)]
    pub subscriber_key: String,
    /// Base64 encoded SDP answer; empty when `error` is set
    #[serde(default)]
    pub answer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResponseSubscribe {
    pub fn answered(stream_key: &str, u_id: i64, subscriber_key: &str, answer_sdp: &str) -> Self {
        Self {
            stream_key: stream_key.to_string(),
            u_id,
            subscriber_key: subscriber_key.to_string(),
            answer: STANDARD.encode(answer_sdp),
            error: None,
        }
    }

    pub fn failed(stream_key: &str, u_id: i64, error: impl Into<String>) -> Self {
        Self {
            stream_key: stream_key.to_string(),
            u_id,
            subscriber_key: String::new(),
            answer: String::new(),
            error: Some(error.into()),
        }
    }

    /// Decoded SDP answer.
    pub fn answer_sdp(&self) -> Result<String> {
        let bytes = STANDARD
            .decode(&self.answer)
            .map_err(|e| Error::InvalidInput(format!("answer is not base64: {e}")))?;
        String::from_utf8(bytes).map_err(|e| Error::InvalidInput(format!("answer is not utf-8: {e}")))
    }
}

impl RelayMessage for ResponseSubscribe {
    const CHANNEL: &'static str = "ResponseSubscribeEvent";
}

/// A publisher came up or went down.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamAnnouncement {
    pub room_id: String,
    pub u_id: i64,
    pub stream_key: String,
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NewStream(pub StreamAnnouncement);

impl RelayMessage for NewStream {
    const CHANNEL: &'static str = "NotifyClientNewStreamEvent";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoveStream(pub StreamAnnouncement);

impl RelayMessage for RemoveStream {
    const CHANNEL: &'static str = "NotifyClientRemoveStreamEvent";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataChannelEventKind {
    New,
    Msg,
    Close,
}

/// Options needed to recreate a data channel on another peer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataChannelParams {
    pub ordered: bool,
    pub max_packet_life_time: Option<u16>,
    pub max_retransmits: Option<u16>,
    pub protocol: String,
    pub negotiated: bool,
    pub id: Option<u16>,
}

/// Data channel payload; `data` is base64 regardless of `is_string`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayedMessage {
    pub is_string: bool,
    pub data: String,
}

impl RelayedMessage {
    pub fn text(text: &str) -> Self {
        Self {
            is_string: true,
            data: STANDARD.encode(text),
        }
    }

    pub fn binary(bytes: &[u8]) -> Self {
        Self {
            is_string: false,
            data: STANDARD.encode(bytes),
        }
    }

    pub fn bytes(&self) -> Result<Vec<u8>> {
        STANDARD
            .decode(&self.data)
            .map_err(|e| Error::InvalidInput(format!("relayed data is not base64: {e}")))
    }
}

/// One event on a publisher's data channel, replayed into every other
/// publisher in the room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataChannelRelay {
    pub room_id: String,
    pub u_id: i64,
    pub stream_key: String,
    pub label: String,
    #[serde(rename = "event_type")]
    pub kind: DataChannelEventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<RelayedMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_params: Option<DataChannelParams>,
}

impl RelayMessage for DataChannelRelay {
    const CHANNEL: &'static str = "DataChannelEvent";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomDestroyed {
    pub room_id: String,
}

impl RelayMessage for RoomDestroyed {
    const CHANNEL: &'static str = "DestroyRoomEvent";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_answer_is_base64_on_the_wire() {
        let response = ResponseSubscribe::answered("/stream/r/1/x", 2, "/stream/r/1/x/sub/2", "v=0\r\n");
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["answer"], "dj0wDQo=");
        assert!(json.get("error").is_none());
        assert_eq!(response.answer_sdp().unwrap(), "v=0\r\n");
    }

    #[test]
    fn test_announcement_is_flat() {
        let event = NewStream(StreamAnnouncement {
            room_id: "r".to_string(),
            u_id: 1,
            stream_key: "/stream/r/1/x".to_string(),
            role: Role::Broadcast,
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["role"], 2);
        assert_eq!(json["stream_key"], "/stream/r/1/x");
    }

    #[test]
    fn test_data_channel_event_shape() {
        let event = DataChannelRelay {
            room_id: "r".to_string(),
            u_id: 1,
            stream_key: "k".to_string(),
            label: "chat".to_string(),
            kind: DataChannelEventKind::Msg,
            message: Some(RelayedMessage::binary(&[0, 159, 146])),
            channel_params: None,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event_type\":\"msg\""));
        assert!(!json.contains("channel_params"));

        let back: DataChannelRelay = serde_json::from_str(&json).unwrap();
        assert_eq!(back.message.unwrap().bytes().unwrap(), vec![0, 159, 146]);
    }

    #[test]
    fn test_bad_base64_is_invalid_input() {
        let message = RelayedMessage {
            is_string: true,
            data: "***".to_string(),
        };
        assert!(matches!(message.bytes(), Err(Error::InvalidInput(_))));
    }
}
