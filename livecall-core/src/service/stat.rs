//! Quality telemetry
//!
//! Media workers hand samples to a [`StatCollector`], which never blocks:
//! records go through a bounded channel and are dropped when it is full.
//! A single worker batches them and flushes to a [`StatSink`] every
//! `flush_interval_ms` or once `batch_size` records have accumulated.
//! Sink failures are logged and the batch is discarded.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{StatConfig, StatSinkKind};
use crate::{Error, Result};

/// One per-track sample, matching the columns of the `stat` table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatRecord {
    pub room_id: String,
    pub uid: String,
    pub stream_id: String,
    pub stream_key: String,
    /// Key of the stream being relayed; equals `stream_key` for inbound samples
    pub sfu_stream_key: String,
    /// 1 audio, 2 video
    pub stream_type: i64,
    /// Milliseconds since epoch
    pub c_time: i64,
    pub p_size: i64,
    pub h_size: i64,
    pub p_count: i64,
    pub p_lost_count: i64,
    /// Seconds
    pub jitter: f64,
}

#[async_trait]
pub trait StatSink: Send + Sync {
    async fn write_batch(&self, records: &[StatRecord]) -> Result<()>;
}

/// Writes batches to the log at debug level.
#[derive(Debug, Default)]
pub struct LogStatSink;

#[async_trait]
impl StatSink for LogStatSink {
    async fn write_batch(&self, records: &[StatRecord]) -> Result<()> {
        for r in records {
            debug!(
                room_id = %r.room_id,
                uid = %r.uid,
                stream_id = %r.stream_id,
                stream_key = %r.stream_key,
                sfu_stream_key = %r.sfu_stream_key,
                stream_type = r.stream_type,
                p_count = r.p_count,
                p_size = r.p_size,
                h_size = r.h_size,
                p_lost_count = r.p_lost_count,
                jitter = r.jitter,
                "stat"
            );
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct NoopStatSink;

#[async_trait]
impl StatSink for NoopStatSink {
    async fn write_batch(&self, _records: &[StatRecord]) -> Result<()> {
        Ok(())
    }
}

/// Inserts batches over the ClickHouse HTTP interface as `JSONEachRow`.
pub struct ClickHouseStatSink {
    client: reqwest::Client,
    url: String,
    query: String,
    user: String,
    password: String,
}

impl ClickHouseStatSink {
    pub fn new(config: &StatConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            client,
            url: config.clickhouse_url.trim_end_matches('/').to_string(),
            query: format!(
                "INSERT INTO {}.{} FORMAT JSONEachRow",
                config.clickhouse_database, config.clickhouse_table
            ),
            user: config.clickhouse_user.clone(),
            password: config.clickhouse_password.clone(),
        })
    }
}

#[async_trait]
impl StatSink for ClickHouseStatSink {
    async fn write_batch(&self, records: &[StatRecord]) -> Result<()> {
        let mut body = String::new();
        for record in records {
            body.push_str(&serde_json::to_string(record)?);
            body.push('\n');
        }

        let response = self
            .client
            .post(format!("{}/", self.url))
            .query(&[("query", self.query.as_str())])
            .header("X-ClickHouse-User", &self.user)
            .header("X-ClickHouse-Key", &self.password)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(Error::Internal(format!("clickhouse insert failed ({status}): {detail}")));
        }
        Ok(())
    }
}

/// Build the configured sink.
pub fn sink_from_config(config: &StatConfig) -> Result<Arc<dyn StatSink>> {
    Ok(match config.sink {
        StatSinkKind::Log => Arc::new(LogStatSink),
        StatSinkKind::Clickhouse => Arc::new(ClickHouseStatSink::new(config)?),
        StatSinkKind::None => Arc::new(NoopStatSink),
    })
}

/// Cheap, cloneable handle to the telemetry pipeline.
#[derive(Clone)]
pub struct StatCollector {
    tx: Option<mpsc::Sender<StatRecord>>,
    cancel: CancellationToken,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl StatCollector {
    /// Spawn the flush worker.
    #[must_use]
    pub fn start(sink: Arc<dyn StatSink>, config: &StatConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(run_worker(
            rx,
            sink,
            Duration::from_millis(config.flush_interval_ms.max(1)),
            config.batch_size.max(1),
            cancel.clone(),
        ));
        Self {
            tx: Some(tx),
            cancel,
            worker: Arc::new(Mutex::new(Some(worker))),
        }
    }

    /// Collector that discards everything.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            tx: None,
            cancel: CancellationToken::new(),
            worker: Arc::new(Mutex::new(None)),
        }
    }

    /// Queue a sample; drops it when the buffer is full.
    pub fn collect(&self, record: StatRecord) {
        let Some(tx) = &self.tx else {
            return;
        };
        if let Err(e) = tx.try_send(record) {
            debug!(error = %e, "Dropping stat record");
        }
    }

    /// Flush what is buffered and stop the worker.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!(error = %e, "Stat worker ended abnormally");
            }
        }
    }
}

async fn run_worker(
    mut rx: mpsc::Receiver<StatRecord>,
    sink: Arc<dyn StatSink>,
    flush_interval: Duration,
    batch_size: usize,
    cancel: CancellationToken,
) {
    let mut batch: Vec<StatRecord> = Vec::with_capacity(batch_size);
    let mut ticker = tokio::time::interval(flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // the first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            record = rx.recv() => match record {
                Some(record) => {
                    batch.push(record);
                    if batch.len() >= batch_size {
                        flush(sink.as_ref(), &mut batch).await;
                    }
                }
                None => break,
            },
            _ = ticker.tick() => flush(sink.as_ref(), &mut batch).await,
            () = cancel.cancelled() => {
                while let Ok(record) = rx.try_recv() {
                    batch.push(record);
                }
                break;
            }
        }
    }

    flush(sink.as_ref(), &mut batch).await;
    info!("Stat worker stopped");
}

async fn flush(sink: &dyn StatSink, batch: &mut Vec<StatRecord>) {
    if batch.is_empty() {
        return;
    }
    if let Err(e) = sink.write_batch(batch).await {
        warn!(error = %e, records = batch.len(), "Failed to write stat batch, discarding");
    }
    batch.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Reports the size of every batch it receives.
    struct ChannelSink(mpsc::UnboundedSender<usize>);

    #[async_trait]
    impl StatSink for ChannelSink {
        async fn write_batch(&self, records: &[StatRecord]) -> Result<()> {
            let _ = self.0.send(records.len());
            Ok(())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl StatSink for FailingSink {
        async fn write_batch(&self, _records: &[StatRecord]) -> Result<()> {
            Err(Error::Internal("sink down".to_string()))
        }
    }

    fn record(n: i64) -> StatRecord {
        StatRecord {
            room_id: "r1".to_string(),
            uid: "1".to_string(),
            stream_id: "video/id/1".to_string(),
            stream_key: "/stream/r1/1/x".to_string(),
            sfu_stream_key: "/stream/r1/1/x".to_string(),
            stream_type: 2,
            p_count: n,
            ..StatRecord::default()
        }
    }

    fn config() -> StatConfig {
        StatConfig {
            channel_capacity: 1000,
            ..StatConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_flushes_when_batch_is_full() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let collector = StatCollector::start(Arc::new(ChannelSink(tx)), &config());

        for n in 0..100 {
            collector.collect(record(n));
        }
        assert_eq!(rx.recv().await, Some(100));
        collector.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_flushes_on_tick() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let collector = StatCollector::start(Arc::new(ChannelSink(tx)), &config());

        for n in 0..3 {
            collector.collect(record(n));
        }
        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert_eq!(rx.try_recv().ok(), Some(3));
        collector.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_flushes_remainder() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let collector = StatCollector::start(Arc::new(ChannelSink(tx)), &config());

        for n in 0..7 {
            collector.collect(record(n));
        }
        collector.shutdown().await;
        assert_eq!(rx.recv().await, Some(7));
    }

    #[tokio::test]
    async fn test_sink_failure_is_swallowed() {
        let collector = StatCollector::start(Arc::new(FailingSink), &config());
        collector.collect(record(1));
        collector.shutdown().await;
        // still usable as a no-op afterwards
        collector.collect(record(2));
    }

    #[tokio::test]
    async fn test_disabled_collector_accepts_records() {
        let collector = StatCollector::disabled();
        collector.collect(record(1));
        collector.shutdown().await;
    }

    #[tokio::test]
    async fn test_clickhouse_sink_posts_json_rows() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(query_param("query", "INSERT INTO default.stat FORMAT JSONEachRow"))
            .and(header("X-ClickHouse-User", "default"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let sink = ClickHouseStatSink::new(&StatConfig {
            clickhouse_url: server.uri(),
            ..StatConfig::default()
        })
        .unwrap();
        sink.write_batch(&[record(1), record(2)]).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let body = String::from_utf8(requests[0].body.clone()).unwrap();
        assert_eq!(body.lines().count(), 2);
        assert!(body.contains("\"sfu_stream_key\""));
    }

    #[tokio::test]
    async fn test_clickhouse_sink_reports_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("table missing"))
            .mount(&server)
            .await;

        let sink = ClickHouseStatSink::new(&StatConfig {
            clickhouse_url: server.uri(),
            ..StatConfig::default()
        })
        .unwrap();
        let err = sink.write_batch(&[record(1)]).await.unwrap_err();
        assert!(err.to_string().contains("table missing"));
    }
}
