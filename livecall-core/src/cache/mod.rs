//! Shared key/value store and pub/sub used for cross-node room state
//!
//! - `RedisCache` backs multi-node deployments
//! - `LocalCache` keeps everything in-process for a single node and for tests
//!
//! Getters return `Ok(None)` / empty collections for missing keys; `Err` is
//! reserved for store failures.

pub mod key_builder;
pub mod local;
pub mod redis;

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::broadcast;

pub use key_builder::KeyBuilder;
pub use local::LocalCache;
pub use redis::RedisCache;

use crate::Result;

/// Buffered messages per subscribed channel before slow receivers lag.
pub const CHANNEL_CAPACITY: usize = 1024;

#[async_trait]
pub trait SharedCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Reset the TTL of an existing key; a missing key is not an error.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;

    /// Set a hash field; `ttl` bounds the lifetime of the whole hash.
    async fn hset(&self, key: &str, field: &str, value: &str, ttl: Duration) -> Result<()>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;

    async fn hdel(&self, key: &str, field: &str) -> Result<()>;

    async fn hvalues(&self, key: &str) -> Result<Vec<String>>;

    async fn hfields(&self, key: &str) -> Result<Vec<String>>;

    async fn sadd(&self, key: &str, member: &str) -> Result<()>;

    async fn smembers(&self, key: &str) -> Result<Vec<String>>;

    async fn srem(&self, key: &str, member: &str) -> Result<()>;

    async fn del(&self, key: &str) -> Result<()>;

    /// Publish to every subscriber of `channel` cluster-wide, this node included.
    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;

    /// Receive every message published to `channel` from now on.
    async fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<String>>;
}

/// Per-channel broadcast fan-out shared by both implementations.
#[derive(Debug, Default)]
pub(crate) struct ChannelFanout {
    senders: dashmap::DashMap<String, broadcast::Sender<String>>,
}

impl ChannelFanout {
    pub(crate) fn subscribe(&self, channel: &str) -> broadcast::Receiver<String> {
        self.senders
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Returns how many local receivers got the message.
    pub(crate) fn deliver(&self, channel: &str, payload: String) -> usize {
        self.senders
            .get(channel)
            .and_then(|sender| sender.send(payload).ok())
            .unwrap_or(0)
    }
}
