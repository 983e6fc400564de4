//! Payloads sent to clients on the default data channel
//!
//! Every frame is `{"type": ..., "message": "<json string>"}`; the inner
//! message is itself serialized JSON so clients can dispatch on `type`
//! before parsing it.

use livecall_cluster::StreamAnnouncement;
use livecall_core::Result;
use serde::{Deserialize, Serialize};

/// Label of the channel notifications travel on.
pub const DEFAULT_LABEL: &str = "";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotifyKind {
    NewStream,
    RemoveStream,
    DataChannelMsg,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notify {
    #[serde(rename = "type")]
    pub kind: NotifyKind,
    pub message: String,
}

impl Notify {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

pub fn new_stream(announcement: &StreamAnnouncement) -> Result<String> {
    announce(NotifyKind::NewStream, announcement)
}

pub fn remove_stream(announcement: &StreamAnnouncement) -> Result<String> {
    announce(NotifyKind::RemoveStream, announcement)
}

/// Wrap a text message relayed from another participant's channel.
pub fn data_channel_msg(text: &str) -> Result<String> {
    Notify {
        kind: NotifyKind::DataChannelMsg,
        message: text.to_string(),
    }
    .to_json()
}

fn announce(kind: NotifyKind, announcement: &StreamAnnouncement) -> Result<String> {
    Notify {
        kind,
        message: serde_json::to_string(announcement)?,
    }
    .to_json()
}
