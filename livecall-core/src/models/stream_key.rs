//! Stream key layout
//!
//! - publisher: `/stream/{room_id}/{uid}/{token}`
//! - subscriber: `{publisher_key}/sub/{uid}`

/// Fresh publisher key for `uid` in `room_id`.
#[must_use]
pub fn publish_key(room_id: &str, uid: i64) -> String {
    format!("/stream/{room_id}/{uid}/{}", nanoid::nanoid!(10))
}

#[must_use]
pub fn subscriber_key(publisher_key: &str, uid: i64) -> String {
    format!("{publisher_key}/sub/{uid}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_keys_are_unique() {
        let a = publish_key("room1", 7);
        let b = publish_key("room1", 7);
        assert!(a.starts_with("/stream/room1/7/"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_subscriber_key() {
        assert_eq!(subscriber_key("/stream/r/1/abc", 2), "/stream/r/1/abc/sub/2");
    }
}
