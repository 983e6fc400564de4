//! Room directory
//!
//! Cluster-wide room records, participant hashes, and join-request
//! timestamps, all kept in the shared cache:
//! - rooms expire after `ttl_seconds`, persistent modes switch to
//!   `long_ttl_seconds` once someone joins
//! - participants are keyed by stream key and refreshed on every join
//! - the join-request timestamp bounds the reconciliation window of a
//!   newly connected pusher

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::cache::{KeyBuilder, SharedCache};
use crate::config::{EmptyRoomPolicy, RoomConfig};
use crate::models::{now_millis, MediaParams, Participant, Role, Room, RoomMode};
use crate::service::RoomIdGenerator;
use crate::{Error, Result};

/// Outbound notifications raised by directory mutations.
#[async_trait]
pub trait RoomEvents: Send + Sync {
    /// Every node should stop its local sessions for `room_id`.
    async fn room_destroyed(&self, room_id: &str) -> Result<()>;
}

pub struct RoomDirectory {
    cache: Arc<dyn SharedCache>,
    keys: KeyBuilder,
    ids: Arc<dyn RoomIdGenerator>,
    config: RoomConfig,
    events: Option<Arc<dyn RoomEvents>>,
}

impl RoomDirectory {
    pub fn new(
        cache: Arc<dyn SharedCache>,
        keys: KeyBuilder,
        ids: Arc<dyn RoomIdGenerator>,
        config: RoomConfig,
    ) -> Self {
        Self {
            cache,
            keys,
            ids,
            config,
            events: None,
        }
    }

    #[must_use]
    pub fn with_events(mut self, events: Arc<dyn RoomEvents>) -> Self {
        self.events = Some(events);
        self
    }

    #[must_use]
    pub const fn empty_room_policy(&self) -> EmptyRoomPolicy {
        self.config.empty_room_policy
    }

    const fn room_ttl(&self, mode: RoomMode, joined: bool) -> Duration {
        if joined && mode.is_persistent() {
            Duration::from_secs(self.config.long_ttl_seconds)
        } else {
            Duration::from_secs(self.config.ttl_seconds)
        }
    }

    /// Create a room owned by `owner_id`; fails if the generated id is taken.
    pub async fn create_room(
        &self,
        mode: RoomMode,
        owner_id: i64,
        media_params: Option<MediaParams>,
    ) -> Result<Room> {
        let room = Room {
            id: self.ids.next_id(),
            mode,
            owner_id,
            create_time: now_millis(),
            media_params,
            participants: Vec::new(),
        };

        let room_key = self.keys.room(&room.id);
        if self.cache.get(&room_key).await?.is_some_and(|v| !v.is_empty()) {
            warn!(room_id = %room.id, "Generated room id collides with a live room");
            return Err(Error::AlreadyExists(format!("room {}", room.id)));
        }

        let json = serde_json::to_string(&room)?;
        self.cache
            .set_ex(&room_key, &json, self.room_ttl(mode, false))
            .await?;
        self.record_join_request(&room.id, owner_id).await?;

        info!(room_id = %room.id, owner_id = owner_id, mode = %mode, "Room created");
        Ok(room)
    }

    /// Room record merged with its live participants; `None` when absent.
    pub async fn find_room_by_id(&self, room_id: &str) -> Result<Option<Room>> {
        let Some(json) = self.cache.get(&self.keys.room(room_id)).await? else {
            return Ok(None);
        };
        let mut room: Room = serde_json::from_str(&json)?;

        let entries = self
            .cache
            .hvalues(&self.keys.room_participants(room_id))
            .await?;
        room.participants = entries
            .iter()
            .filter_map(|entry| match serde_json::from_str::<Participant>(entry) {
                Ok(p) => Some(p),
                Err(e) => {
                    warn!(room_id = %room_id, error = %e, "Skipping malformed participant entry");
                    None
                }
            })
            .collect();
        room.participants.sort_by_key(|p| p.join_time);

        Ok(Some(room))
    }

    /// Record intent to join and return the room.
    pub async fn request_join_room(&self, room_id: &str, uid: i64) -> Result<Room> {
        let room = self
            .find_room_by_id(room_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("room {room_id}")))?;
        self.record_join_request(room_id, uid).await?;
        debug!(room_id = %room_id, uid = uid, "Join requested");
        Ok(room)
    }

    async fn record_join_request(&self, room_id: &str, uid: i64) -> Result<()> {
        self.cache
            .set_ex(
                &self.keys.join_request_time(room_id, uid),
                &now_millis().to_string(),
                Duration::from_secs(self.config.join_request_ttl_seconds),
            )
            .await
    }

    /// Join-request timestamp for `uid`, or 0 when none is recorded.
    pub async fn get_request_join_room_time(&self, room_id: &str, uid: i64) -> Result<i64> {
        let value = self
            .cache
            .get(&self.keys.join_request_time(room_id, uid))
            .await?;
        Ok(value.and_then(|v| v.parse().ok()).unwrap_or(0))
    }

    pub async fn on_participant_join(
        &self,
        room_id: &str,
        stream_key: &str,
        join_time: i64,
        role: Role,
        uid: i64,
    ) -> Result<()> {
        let room = self
            .find_room_by_id(room_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("room {room_id}")))?;

        self.cache
            .expire(&self.keys.room(room_id), self.room_ttl(room.mode, true))
            .await?;

        let participant = Participant::new(uid, role, join_time, stream_key);
        self.cache
            .hset(
                &self.keys.room_participants(room_id),
                stream_key,
                &serde_json::to_string(&participant)?,
                Duration::from_secs(self.config.participant_ttl_seconds),
            )
            .await?;

        info!(room_id = %room_id, uid = uid, stream_key = %stream_key, role = ?role, "Participant joined");
        Ok(())
    }

    pub async fn on_participant_leave(&self, room_id: &str, stream_key: &str, uid: i64) -> Result<()> {
        let participants_key = self.keys.room_participants(room_id);
        self.cache.hdel(&participants_key, stream_key).await?;
        info!(room_id = %room_id, uid = uid, stream_key = %stream_key, "Participant left");

        if self.config.empty_room_policy == EmptyRoomPolicy::Destroy
            && self.cache.hvalues(&participants_key).await?.is_empty()
        {
            info!(room_id = %room_id, "Last participant left, destroying room");
            self.destroy_room(room_id).await?;
        }
        Ok(())
    }

    /// Remove the room and its participants, then announce the teardown.
    pub async fn destroy_room(&self, room_id: &str) -> Result<()> {
        self.cache.del(&self.keys.room(room_id)).await?;
        self.cache.del(&self.keys.room_participants(room_id)).await?;

        if let Some(events) = &self.events {
            if let Err(e) = events.room_destroyed(room_id).await {
                error!(room_id = %room_id, error = %e, "Failed to announce room teardown");
            }
        }
        info!(room_id = %room_id, "Room destroyed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::LocalCache;
    use parking_lot::Mutex;

    struct FixedId(&'static str);

    impl RoomIdGenerator for FixedId {
        fn next_id(&self) -> String {
            self.0.to_string()
        }
    }

    #[derive(Default)]
    struct RecordingEvents(Mutex<Vec<String>>);

    #[async_trait]
    impl RoomEvents for RecordingEvents {
        async fn room_destroyed(&self, room_id: &str) -> Result<()> {
            self.0.lock().push(room_id.to_string());
            Ok(())
        }
    }

    fn directory_with(ids: Arc<dyn RoomIdGenerator>, config: RoomConfig) -> (RoomDirectory, Arc<LocalCache>) {
        let cache = Arc::new(LocalCache::new());
        let dir = RoomDirectory::new(cache.clone(), KeyBuilder::default(), ids, config);
        (dir, cache)
    }

    fn directory() -> RoomDirectory {
        directory_with(
            Arc::new(crate::service::SnowflakeIdGenerator::new(1)),
            RoomConfig::default(),
        )
        .0
    }

    #[tokio::test]
    async fn test_new_room_has_no_participants() {
        let dir = directory();
        let room = dir.create_room(RoomMode::Video, 1, None).await.unwrap();

        let found = dir.find_room_by_id(&room.id).await.unwrap().unwrap();
        assert_eq!(found.id, room.id);
        assert_eq!(found.owner_id, 1);
        assert!(found.participants.is_empty());
    }

    #[tokio::test]
    async fn test_colliding_id_is_rejected() {
        let (dir, _) = directory_with(Arc::new(FixedId("same")), RoomConfig::default());
        let first = dir.create_room(RoomMode::Audio, 1, None).await.unwrap();

        let err = dir.create_room(RoomMode::Video, 2, None).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));

        // the first record is untouched
        let found = dir.find_room_by_id("same").await.unwrap().unwrap();
        assert_eq!(found.owner_id, first.owner_id);
        assert_eq!(found.mode, RoomMode::Audio);
    }

    #[tokio::test]
    async fn test_missing_room_is_none() {
        let dir = directory();
        assert!(dir.find_room_by_id("nope").await.unwrap().is_none());
        let err = dir.request_join_room("nope", 3).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_join_then_leave_removes_entry() {
        let dir = directory();
        let room = dir.create_room(RoomMode::Video, 1, None).await.unwrap();

        dir.on_participant_join(&room.id, "/stream/a", 10, Role::Broadcast, 1)
            .await
            .unwrap();
        dir.on_participant_join(&room.id, "/stream/b", 20, Role::Audience, 2)
            .await
            .unwrap();
        let found = dir.find_room_by_id(&room.id).await.unwrap().unwrap();
        assert_eq!(found.participants.len(), 2);

        dir.on_participant_leave(&room.id, "/stream/a", 1).await.unwrap();
        let found = dir.find_room_by_id(&room.id).await.unwrap().unwrap();
        assert_eq!(found.participants.len(), 1);
        assert_eq!(found.participants[0].stream_key.as_deref(), Some("/stream/b"));
    }

    #[tokio::test]
    async fn test_join_unknown_room_fails() {
        let dir = directory();
        let err = dir
            .on_participant_join("ghost", "/stream/x", 1, Role::Audience, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_request_join_records_timestamp() {
        let dir = directory();
        let room = dir.create_room(RoomMode::Chat, 1, None).await.unwrap();
        assert!(dir.get_request_join_room_time(&room.id, 1).await.unwrap() > 0);
        assert_eq!(dir.get_request_join_room_time(&room.id, 2).await.unwrap(), 0);

        let before = now_millis();
        dir.request_join_room(&room.id, 2).await.unwrap();
        assert!(dir.get_request_join_room_time(&room.id, 2).await.unwrap() >= before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_rooms_outlive_default_ttl() {
        let dir = directory();
        let voice = dir.create_room(RoomMode::VoiceRoom, 1, None).await.unwrap();
        let call = dir.create_room(RoomMode::Audio, 1, None).await.unwrap();
        dir.on_participant_join(&voice.id, "/stream/v", 1, Role::Broadcast, 1)
            .await
            .unwrap();
        dir.on_participant_join(&call.id, "/stream/c", 1, Role::Broadcast, 1)
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(25 * 3600)).await;

        assert!(dir.find_room_by_id(&voice.id).await.unwrap().is_some());
        assert!(dir.find_room_by_id(&call.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_destroy_removes_everything_and_announces() {
        let events = Arc::new(RecordingEvents::default());
        let (dir, cache) = directory_with(
            Arc::new(crate::service::SnowflakeIdGenerator::new(1)),
            RoomConfig::default(),
        );
        let dir = dir.with_events(events.clone());
        let room = dir.create_room(RoomMode::Video, 1, None).await.unwrap();
        dir.on_participant_join(&room.id, "/stream/a", 1, Role::Broadcast, 1)
            .await
            .unwrap();

        dir.destroy_room(&room.id).await.unwrap();

        assert!(dir.find_room_by_id(&room.id).await.unwrap().is_none());
        let keys = KeyBuilder::default();
        assert!(cache.hvalues(&keys.room_participants(&room.id)).await.unwrap().is_empty());
        assert_eq!(*events.0.lock(), vec![room.id.clone()]);
    }

    #[tokio::test]
    async fn test_keep_policy_leaves_empty_room() {
        let dir = directory();
        let room = dir.create_room(RoomMode::Video, 1, None).await.unwrap();
        dir.on_participant_join(&room.id, "/stream/a", 1, Role::Broadcast, 1)
            .await
            .unwrap();
        dir.on_participant_leave(&room.id, "/stream/a", 1).await.unwrap();
        assert!(dir.find_room_by_id(&room.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_destroy_policy_tears_down_empty_room() {
        let events = Arc::new(RecordingEvents::default());
        let config = RoomConfig {
            empty_room_policy: EmptyRoomPolicy::Destroy,
            ..RoomConfig::default()
        };
        let (dir, _) = directory_with(Arc::new(crate::service::SnowflakeIdGenerator::new(1)), config);
        let dir = dir.with_events(events.clone());
        let room = dir.create_room(RoomMode::Video, 1, None).await.unwrap();
        dir.on_participant_join(&room.id, "/stream/a", 1, Role::Broadcast, 1)
            .await
            .unwrap();
        dir.on_participant_join(&room.id, "/stream/b", 2, Role::Broadcast, 2)
            .await
            .unwrap();

        dir.on_participant_leave(&room.id, "/stream/a", 1).await.unwrap();
        assert!(dir.find_room_by_id(&room.id).await.unwrap().is_some());

        dir.on_participant_leave(&room.id, "/stream/b", 2).await.unwrap();
        assert!(dir.find_room_by_id(&room.id).await.unwrap().is_none());
        assert_eq!(events.0.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_room_json_survives_storage() {
        let dir = directory();
        let params = MediaParams {
            video_max_bitrate: 1_500_000,
            video_width: 1280,
            video_height: 720,
            video_fps: 30,
            audio_max_bitrate: 64_000,
        };
        let room = dir
            .create_room(RoomMode::VideoRoom, 9, Some(params))
            .await
            .unwrap();
        let found = dir.find_room_by_id(&room.id).await.unwrap().unwrap();
        assert_eq!(found, room);
    }
}
