use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tracing::{error, info};

use crate::models::Signal;
use crate::{Error, Result};

/// Delivers a call signal to a set of users.
#[async_trait]
pub trait PushApi: Send + Sync {
    async fn push(&self, uids: &[i64], signal: &Signal) -> Result<()>;
}

#[derive(Debug, Serialize)]
struct PushMessage<'a> {
    u_ids: &'a [i64],
    #[serde(rename = "type")]
    kind: i32,
    body: String,
    offline_push: bool,
}

/// Posts to `{endpoint}/message/push`.
pub struct HttpPushApi {
    client: reqwest::Client,
    endpoint: String,
    signal_type: i32,
}

impl HttpPushApi {
    pub fn new(endpoint: &str, signal_type: i32, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: super::http_client(timeout)?,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            signal_type,
        })
    }
}

#[async_trait]
impl PushApi for HttpPushApi {
    async fn push(&self, uids: &[i64], signal: &Signal) -> Result<()> {
        if uids.is_empty() {
            return Ok(());
        }
        let url = format!("{}/message/push", self.endpoint);
        let message = PushMessage {
            u_ids: uids,
            kind: self.signal_type,
            body: signal.to_json()?,
            offline_push: true,
        };
        let response = self.client.post(&url).json(&message).send().await?;
        let status = response.status();
        if !status.is_success() {
            error!(url = %url, status = %status, "Push rejected");
            return Err(Error::Internal(format!("push rejected with {status}")));
        }
        Ok(())
    }
}

/// Default when no push service is configured.
#[derive(Debug, Default)]
pub struct LogPushApi;

#[async_trait]
impl PushApi for LogPushApi {
    async fn push(&self, uids: &[i64], signal: &Signal) -> Result<()> {
        info!(uids = ?uids, kind = ?signal.kind, body = %signal.body, "Signal not pushed (no push endpoint)");
        Ok(())
    }
}
