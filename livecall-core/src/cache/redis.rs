//! Redis implementation of [`SharedCache`]
//!
//! Commands go through a `ConnectionManager`, which reconnects on its own.
//! Pub/sub runs on a dedicated connection owned by one background task that
//! pattern-subscribes to the node's channel prefix and fans messages out to
//! local broadcast receivers. The task reconnects with exponential backoff
//! and stops when the cache is shut down.

use async_trait::async_trait;
use futures::stream::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client as RedisClient};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{ChannelFanout, KeyBuilder, SharedCache};
use crate::{Error, Result};

/// Timeout for Redis operations in seconds
const REDIS_TIMEOUT_SECS: u64 = 5;

/// Initial backoff delay for subscriber reconnection
const INITIAL_BACKOFF_SECS: u64 = 1;

/// Maximum backoff delay for subscriber reconnection
const MAX_BACKOFF_SECS: u64 = 30;

pub struct RedisCache {
    conn: ConnectionManager,
    channels: Arc<ChannelFanout>,
    cancel_token: CancellationToken,
}

/// Describes how the subscriber loop exited, enabling proper backoff behavior.
enum SubscriberExit {
    /// Connected successfully, then the stream ended
    Disconnected,
    /// Could not connect or subscribe
    ConnectFailed(anyhow::Error),
}

fn ttl_secs(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_secs().max(1)).unwrap_or(i64::MAX)
}

impl RedisCache {
    /// Connect and start the pub/sub task.
    pub async fn connect(redis_url: &str, keys: &KeyBuilder, connect_timeout: Duration) -> Result<Self> {
        let client = RedisClient::open(redis_url)?;
        let conn = timeout(connect_timeout, ConnectionManager::new(client.clone()))
            .await
            .map_err(|_| Error::Timeout(format!("connecting to Redis at {redis_url}")))??;

        let cache = Self {
            conn,
            channels: Arc::new(ChannelFanout::default()),
            cancel_token: CancellationToken::new(),
        };
        cache.spawn_subscriber(client, format!("{}*", keys.channel_prefix()));
        info!(url = %redis_url, "Redis cache connected");
        Ok(cache)
    }

    /// Stop the pub/sub task; command connections close on drop.
    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }

    fn spawn_subscriber(&self, client: RedisClient, pattern: String) {
        let channels = Arc::clone(&self.channels);
        let cancel = self.cancel_token.clone();

        tokio::spawn(async move {
            let mut backoff_secs = INITIAL_BACKOFF_SECS;

            loop {
                if cancel.is_cancelled() {
                    info!("Redis subscriber task cancelled");
                    return;
                }

                let exit = tokio::select! {
                    () = cancel.cancelled() => {
                        info!("Redis subscriber task cancelled");
                        return;
                    }
                    exit = run_subscriber(&client, &pattern, &channels) => exit,
                };

                match exit {
                    SubscriberExit::Disconnected => {
                        error!(
                            "Redis subscriber stream ended (connection lost), reconnecting after {}s",
                            INITIAL_BACKOFF_SECS
                        );
                        backoff_secs = INITIAL_BACKOFF_SECS;
                    }
                    SubscriberExit::ConnectFailed(e) => {
                        error!(
                            error = %e,
                            backoff_secs = backoff_secs,
                            "Redis subscriber failed to connect, retrying after backoff"
                        );
                    }
                }

                tokio::select! {
                    () = cancel.cancelled() => {
                        info!("Redis subscriber task cancelled during backoff");
                        return;
                    }
                    () = tokio::time::sleep(Duration::from_secs(backoff_secs)) => {}
                }

                backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
            }
        });
    }
}

async fn run_subscriber(client: &RedisClient, pattern: &str, channels: &ChannelFanout) -> SubscriberExit {
    let mut pubsub = match timeout(Duration::from_secs(REDIS_TIMEOUT_SECS), client.get_async_pubsub()).await {
        Ok(Ok(ps)) => ps,
        Ok(Err(e)) => {
            return SubscriberExit::ConnectFailed(
                anyhow::anyhow!(e).context("Failed to get Redis Pub/Sub connection"),
            );
        }
        Err(_) => {
            return SubscriberExit::ConnectFailed(anyhow::anyhow!(
                "Timed out getting Redis Pub/Sub connection"
            ));
        }
    };

    match timeout(Duration::from_secs(REDIS_TIMEOUT_SECS), pubsub.psubscribe(pattern)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            return SubscriberExit::ConnectFailed(
                anyhow::anyhow!(e).context(format!("Failed to subscribe to {pattern}")),
            );
        }
        Err(_) => {
            return SubscriberExit::ConnectFailed(anyhow::anyhow!("Timed out subscribing to {pattern}"));
        }
    }

    info!(pattern = %pattern, "Redis subscriber connected");

    let mut stream = pubsub.on_message();
    while let Some(msg) = stream.next().await {
        let channel = msg.get_channel_name().to_string();
        let payload: String = match msg.get_payload() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, channel = %channel, "Invalid payload");
                continue;
            }
        };
        let receivers = channels.deliver(&channel, payload);
        debug!(channel = %channel, receivers = receivers, "Relayed pub/sub message");
    }

    SubscriberExit::Disconnected
}

impl Drop for RedisCache {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

#[async_trait]
impl SharedCache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.set_ex(key, value, ttl.as_secs().max(1)).await?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.expire(key, ttl_secs(ttl)).await?;
        Ok(())
    }

    async fn hset(&self, key: &str, field: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .hset(key, field, value)
            .ignore()
            .expire(key, ttl_secs(ttl))
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.hget(key, field).await?;
        Ok(value)
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.hdel(key, field).await?;
        Ok(())
    }

    async fn hvalues(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let values: Vec<String> = conn.hvals(key).await?;
        Ok(values)
    }

    async fn hfields(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let fields: Vec<String> = conn.hkeys(key).await?;
        Ok(fields)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.sadd(key, member).await?;
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn.smembers(key).await?;
        Ok(members)
    }

    async fn srem(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.srem(key, member).await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.del(key).await?;
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let subscribers: i64 = conn.publish(channel, payload).await?;
        debug!(channel = %channel, subscribers = subscribers, "Published to Redis");
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<String>> {
        Ok(self.channels.subscribe(channel))
    }
}
