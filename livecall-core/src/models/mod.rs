pub mod participant;
pub mod room;
pub mod signal;
pub mod stream_key;

pub use participant::{Participant, Role};
pub use room::{MediaParams, Room, RoomMode};
pub use signal::{Signal, SignalKind};
pub use stream_key::{publish_key, subscriber_key};

/// Wall-clock milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
