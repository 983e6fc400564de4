//! Shared-cache key layout
//!
//! - `{prefix}:room:{room_id}` room record (string + TTL)
//! - `{prefix}:room:{room_id}:participants` participant hash keyed by stream key
//! - `{prefix}:room:{room_id}:uid:{uid}:request_time` join request timestamp
//! - `{prefix}:channel:{name}` pub/sub channel

use crate::Config;

#[derive(Debug, Clone)]
pub struct KeyBuilder {
    prefix: String,
}

impl KeyBuilder {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.cache.key_prefix.clone())
    }

    #[must_use]
    pub fn room(&self, room_id: &str) -> String {
        format!("{}:room:{}", self.prefix, room_id)
    }

    #[must_use]
    pub fn room_participants(&self, room_id: &str) -> String {
        format!("{}:room:{}:participants", self.prefix, room_id)
    }

    #[must_use]
    pub fn join_request_time(&self, room_id: &str, uid: i64) -> String {
        format!("{}:room:{}:uid:{}:request_time", self.prefix, room_id, uid)
    }

    /// Fully qualified pub/sub channel name
    #[must_use]
    pub fn channel(&self, name: &str) -> String {
        format!("{}{}", self.channel_prefix(), name)
    }

    #[must_use]
    pub fn channel_prefix(&self) -> String {
        format!("{}:channel:", self.prefix)
    }
}

impl Default for KeyBuilder {
    fn default() -> Self {
        Self::new("live_server")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_keys() {
        let keys = KeyBuilder::default();
        assert_eq!(keys.room("r1"), "live_server:room:r1");
        assert_eq!(keys.room_participants("r1"), "live_server:room:r1:participants");
        assert_eq!(keys.join_request_time("r1", 42), "live_server:room:r1:uid:42:request_time");
    }

    #[test]
    fn test_channel_names() {
        let keys = KeyBuilder::new("test");
        assert_eq!(keys.channel("RequestSubscribeEvent"), "test:channel:RequestSubscribeEvent");
        assert!(keys.channel("x").starts_with(&keys.channel_prefix()));
    }
}
