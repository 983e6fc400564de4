//! Join-race reconciliation
//!
//! A publisher that asked for the room at `since` and connected at `until`
//! may have missed "new stream" broadcasts for anyone who joined in
//! between. Those participants are re-announced to it directly.

use livecall_cluster::StreamAnnouncement;
use livecall_core::models::Participant;

/// Participants whose join time lies strictly inside `(since, until)`,
/// excluding the stream `own_key`.
#[must_use]
pub fn joined_between(
    room_id: &str,
    participants: &[Participant],
    since: i64,
    until: i64,
    own_key: &str,
) -> Vec<StreamAnnouncement> {
    let mut missed: Vec<_> = participants
        .iter()
        .filter(|p| p.join_time > since && p.join_time < until)
        .filter_map(|p| {
            let stream_key = p.stream_key.as_deref()?;
            (stream_key != own_key).then(|| StreamAnnouncement {
                room_id: room_id.to_string(),
                u_id: p.u_id,
                stream_key: stream_key.to_string(),
                role: p.role,
            })
        })
        .collect();
    missed.sort_by(|a, b| a.stream_key.cmp(&b.stream_key));
    missed.dedup_by(|a, b| a.stream_key == b.stream_key);
    missed
}
