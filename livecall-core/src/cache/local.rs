//! In-process implementation of [`SharedCache`]

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

use super::{ChannelFanout, SharedCache};
use crate::{Error, Result};

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(HashMap<String, String>),
    Set(HashSet<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Single-node cache with lazy expiry.
///
/// Expiry uses the tokio clock so paused-time tests can advance it.
#[derive(Debug, Default)]
pub struct LocalCache {
    entries: DashMap<String, Entry>,
    channels: ChannelFanout,
}

fn wrong_type(key: &str) -> Error {
    Error::Cache(format!("WRONGTYPE operation against key {key}"))
}

impl LocalCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Live entry for `key`, evicting it first if it has expired.
    fn live(&self, key: &str) -> Option<dashmap::mapref::one::Ref<'_, String, Entry>> {
        let now = Instant::now();
        self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        self.entries.get(key)
    }

    fn with_hash<R>(&self, key: &str, f: impl FnOnce(&HashMap<String, String>) -> R) -> Result<Option<R>> {
        match self.live(key) {
            None => Ok(None),
            Some(entry) => match &entry.value {
                Value::Hash(hash) => Ok(Some(f(hash))),
                _ => Err(wrong_type(key)),
            },
        }
    }

    fn with_set<R>(&self, key: &str, f: impl FnOnce(&HashSet<String>) -> R) -> Result<Option<R>> {
        match self.live(key) {
            None => Ok(None),
            Some(entry) => match &entry.value {
                Value::Set(set) => Ok(Some(f(set))),
                _ => Err(wrong_type(key)),
            },
        }
    }

    /// Mutable access that creates the entry from `init` when absent or expired.
    fn upsert<R>(
        &self,
        key: &str,
        init: impl FnOnce() -> Value,
        f: impl FnOnce(&mut Entry) -> Result<R>,
    ) -> Result<R> {
        let now = Instant::now();
        self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: init(),
            expires_at: None,
        });
        f(entry.value_mut())
    }
}

#[async_trait]
impl SharedCache for LocalCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        match self.live(key) {
            None => Ok(None),
            Some(entry) => match &entry.value {
                Value::Str(s) => Ok(Some(s.clone())),
                _ => Err(wrong_type(key)),
            },
        }
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let now = Instant::now();
        self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.expires_at = Some(now + ttl);
        }
        Ok(())
    }

    async fn hset(&self, key: &str, field: &str, value: &str, ttl: Duration) -> Result<()> {
        self.upsert(
            key,
            || Value::Hash(HashMap::new()),
            |entry| {
                let Value::Hash(hash) = &mut entry.value else {
                    return Err(wrong_type(key));
                };
                hash.insert(field.to_string(), value.to_string());
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(())
            },
        )
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        Ok(self.with_hash(key, |hash| hash.get(field).cloned())?.flatten())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<()> {
        let emptied = match self.entries.get_mut(key) {
            None => false,
            Some(mut entry) => match &mut entry.value {
                Value::Hash(hash) => {
                    hash.remove(field);
                    hash.is_empty()
                }
                _ => return Err(wrong_type(key)),
            },
        };
        // Redis drops a hash once its last field is gone
        if emptied {
            self.entries
                .remove_if(key, |_, entry| matches!(&entry.value, Value::Hash(h) if h.is_empty()));
        }
        Ok(())
    }

    async fn hvalues(&self, key: &str) -> Result<Vec<String>> {
        Ok(self
            .with_hash(key, |hash| hash.values().cloned().collect())?
            .unwrap_or_default())
    }

    async fn hfields(&self, key: &str) -> Result<Vec<String>> {
        Ok(self
            .with_hash(key, |hash| hash.keys().cloned().collect())?
            .unwrap_or_default())
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        self.upsert(
            key,
            || Value::Set(HashSet::new()),
            |entry| match &mut entry.value {
                Value::Set(set) => {
                    set.insert(member.to_string());
                    Ok(())
                }
                _ => Err(wrong_type(key)),
            },
        )
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        Ok(self
            .with_set(key, |set| set.iter().cloned().collect())?
            .unwrap_or_default())
    }

    async fn srem(&self, key: &str, member: &str) -> Result<()> {
        if let Some(mut entry) = self.entries.get_mut(key) {
            match &mut entry.value {
                Value::Set(set) => {
                    set.remove(member);
                }
                _ => return Err(wrong_type(key)),
            }
        }
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let receivers = self.channels.deliver(channel, payload.to_string());
        tracing::trace!(channel = %channel, receivers = receivers, "Published locally");
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<String>> {
        Ok(self.channels.subscribe(channel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_set_ex_expires() {
        let cache = LocalCache::new();
        cache.set_ex("k", "v", Duration::from_secs(10)).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_extends_lifetime() {
        let cache = LocalCache::new();
        cache.set_ex("k", "v", Duration::from_secs(10)).await.unwrap();
        cache.expire("k", Duration::from_secs(100)).await.unwrap();
        tokio::time::advance(Duration::from_secs(50)).await;
        assert!(cache.get("k").await.unwrap().is_some());

        // no-op for absent keys
        cache.expire("missing", Duration::from_secs(1)).await.unwrap();
        assert!(cache.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_hash_operations() {
        let cache = LocalCache::new();
        let ttl = Duration::from_secs(60);
        cache.hset("h", "a", "1", ttl).await.unwrap();
        cache.hset("h", "b", "2", ttl).await.unwrap();

        assert_eq!(cache.hget("h", "a").await.unwrap().as_deref(), Some("1"));
        assert_eq!(cache.hget("h", "zz").await.unwrap(), None);
        let mut fields = cache.hfields("h").await.unwrap();
        fields.sort();
        assert_eq!(fields, vec!["a", "b"]);

        cache.hdel("h", "a").await.unwrap();
        cache.hdel("h", "b").await.unwrap();
        assert!(cache.hvalues("h").await.unwrap().is_empty());
        assert!(cache.hvalues("never-set").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_set_operations() {
        let cache = LocalCache::new();
        cache.sadd("s", "x").await.unwrap();
        cache.sadd("s", "x").await.unwrap();
        cache.sadd("s", "y").await.unwrap();
        assert_eq!(cache.smembers("s").await.unwrap().len(), 2);
        cache.srem("s", "x").await.unwrap();
        assert_eq!(cache.smembers("s").await.unwrap(), vec!["y"]);
    }

    #[tokio::test]
    async fn test_wrong_type_is_an_error() {
        let cache = LocalCache::new();
        cache.set_ex("k", "v", Duration::from_secs(60)).await.unwrap();
        assert!(cache.hget("k", "f").await.is_err());
        assert!(cache.hset("k", "f", "v", Duration::from_secs(60)).await.is_err());
    }

    #[tokio::test]
    async fn test_publish_reaches_every_local_subscriber() {
        let cache = LocalCache::new();
        let mut first = cache.subscribe("events").await.unwrap();
        let mut second = cache.subscribe("events").await.unwrap();
        let mut other = cache.subscribe("other").await.unwrap();

        cache.publish("events", "hello").await.unwrap();

        assert_eq!(first.recv().await.unwrap(), "hello");
        assert_eq!(second.recv().await.unwrap(), "hello");
        assert!(other.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let cache = LocalCache::new();
        assert!(cache.publish("nobody", "x").await.is_ok());
    }
}
