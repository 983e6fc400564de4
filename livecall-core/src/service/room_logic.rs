//! Room actions exposed to clients: permission checks, directory calls,
//! and call signalling to the affected users.

use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::config::SdkConfig;
use crate::models::{now_millis, MediaParams, Room, RoomMode, Signal};
use crate::sdk::{CheckApi, HttpCheckApi, HttpPushApi, LogPushApi, PushApi};
use crate::service::RoomDirectory;
use crate::{Error, Result};

/// External services the room logic talks to, resolved once at startup.
#[derive(Clone)]
pub struct Collaborators {
    pub check: Option<Arc<dyn CheckApi>>,
    pub push: Arc<dyn PushApi>,
}

impl Collaborators {
    pub fn from_config(config: &SdkConfig) -> Result<Self> {
        let timeout = Duration::from_millis(config.request_timeout_ms);
        let check: Option<Arc<dyn CheckApi>> = if config.check_endpoint.is_empty() {
            None
        } else {
            Some(Arc::new(HttpCheckApi::new(&config.check_endpoint, timeout)?))
        };
        let push: Arc<dyn PushApi> = if config.push_endpoint.is_empty() {
            Arc::new(LogPushApi)
        } else {
            Arc::new(HttpPushApi::new(&config.push_endpoint, config.push_signal_type, timeout)?)
        };
        Ok(Self { check, push })
    }
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            check: None,
            push: Arc::new(LogPushApi),
        }
    }
}

pub struct RoomLogic {
    directory: Arc<RoomDirectory>,
    collaborators: Collaborators,
    call_timeout_seconds: i64,
}

fn member_ids(room: &Room) -> Vec<i64> {
    let mut ids: Vec<i64> = room.participants.iter().map(|p| p.u_id).collect();
    ids.sort_unstable();
    ids.dedup();
    ids
}

impl RoomLogic {
    pub fn new(directory: Arc<RoomDirectory>, collaborators: Collaborators, call_timeout_seconds: i64) -> Self {
        Self {
            directory,
            collaborators,
            call_timeout_seconds,
        }
    }

    async fn existing_room(&self, room_id: &str) -> Result<Room> {
        self.directory
            .find_room_by_id(room_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("room {room_id}")))
    }

    /// Push failures never fail the action that triggered them.
    async fn signal(&self, uids: &[i64], signal: Result<Signal>) {
        if uids.is_empty() {
            return;
        }
        let result = match signal {
            Ok(signal) => self.collaborators.push.push(uids, &signal).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(uids = ?uids, error = %e, "Failed to push call signal");
        }
    }

    fn timeout_time(&self, duration_secs: i64) -> i64 {
        let secs = if duration_secs > 0 {
            duration_secs
        } else {
            self.call_timeout_seconds
        };
        now_millis() + secs * 1000
    }

    pub async fn create_room(&self, uid: i64, mode: RoomMode, media_params: Option<MediaParams>) -> Result<Room> {
        if let Some(check) = &self.collaborators.check {
            check.check_create_room(uid, mode).await?;
        }
        self.directory.create_room(mode, uid, media_params).await
    }

    pub async fn query_room(&self, room_id: &str) -> Result<Room> {
        self.existing_room(room_id).await
    }

    /// Record intent to join and let the owner know.
    pub async fn join_room(&self, uid: i64, room_id: &str) -> Result<Room> {
        let room = self.directory.request_join_room(room_id, uid).await?;
        if let Some(check) = &self.collaborators.check {
            check.check_join_room(uid, &room).await?;
        }
        self.signal(&[room.owner_id], Signal::accept_request(&room.id, "", uid, now_millis()))
            .await;
        Ok(room)
    }

    pub async fn call_members(&self, uid: i64, room_id: &str, members: &[i64], msg: &str, duration_secs: i64) -> Result<()> {
        let room = self.existing_room(room_id).await?;
        if members.is_empty() {
            return Err(Error::InvalidInput("members must not be empty".to_string()));
        }
        let signal = Signal::being_requested(
            &room.id,
            members,
            room.mode.code(),
            msg,
            uid,
            room.create_time,
            self.timeout_time(duration_secs),
        );
        self.signal(members, signal).await;
        Ok(())
    }

    pub async fn cancel_call(&self, room_id: &str, members: &[i64], msg: &str) -> Result<()> {
        let room = self.existing_room(room_id).await?;
        if members.is_empty() {
            return Err(Error::InvalidInput("members must not be empty".to_string()));
        }
        self.signal(
            members,
            Signal::cancel_requested(&room.id, msg, room.create_time, now_millis()),
        )
        .await;
        Ok(())
    }

    pub async fn invite_members(
        &self,
        uid: i64,
        room_id: &str,
        invitees: &[i64],
        msg: &str,
        duration_secs: i64,
    ) -> Result<()> {
        let room = self.existing_room(room_id).await?;
        if invitees.is_empty() {
            return Err(Error::InvalidInput("invitees must not be empty".to_string()));
        }
        if let Some(check) = &self.collaborators.check {
            check.check_invite(uid, &room, invitees).await?;
        }
        let signal = Signal::being_requested(
            &room.id,
            invitees,
            room.mode.code(),
            msg,
            uid,
            room.create_time,
            self.timeout_time(duration_secs),
        );
        self.signal(invitees, signal).await;
        Ok(())
    }

    /// Tell everyone already in the room that `uid` declined.
    pub async fn refuse_join(&self, uid: i64, room_id: &str, msg: &str) -> Result<()> {
        let room = self.existing_room(room_id).await?;
        let others: Vec<i64> = member_ids(&room).into_iter().filter(|id| *id != uid).collect();
        self.signal(&others, Signal::reject_request(&room.id, msg, uid, now_millis()))
            .await;
        Ok(())
    }

    /// Leaving an unknown room is a no-op.
    pub async fn leave_room(&self, uid: i64, room_id: &str, msg: &str) -> Result<()> {
        let Some(room) = self.directory.find_room_by_id(room_id).await? else {
            return Ok(());
        };
        self.signal(&member_ids(&room), Signal::hangup(&room.id, msg, uid, now_millis()))
            .await;
        Ok(())
    }

    pub async fn kick_members(&self, uid: i64, room_id: &str, kicked: &[i64], msg: &str) -> Result<()> {
        let room = self.existing_room(room_id).await?;
        if !room.is_owner(uid) {
            return Err(Error::PermissionDenied(format!("user {uid} does not own room {room_id}")));
        }
        self.signal(&member_ids(&room), Signal::kick(&room.id, msg, uid, now_millis(), kicked))
            .await;
        Ok(())
    }

    pub async fn delete_room(&self, uid: i64, room_id: &str) -> Result<()> {
        let room = self.existing_room(room_id).await?;
        if !room.is_owner(uid) {
            return Err(Error::PermissionDenied(format!("user {uid} does not own room {room_id}")));
        }
        self.directory.destroy_room(room_id).await?;
        self.signal(&member_ids(&room), Signal::end_call(&room.id, "", uid, now_millis()))
            .await;
        Ok(())
    }
}
