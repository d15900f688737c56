//! Relay outcome recording.
//!
//! Every outcome updates the quality logs right away so routing reacts to it
//! on the next pick. The durable row is buffered and written in bulk once the
//! flush interval has passed; losing rows is acceptable, so store failures are
//! only logged.

use std::{
    mem,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use chrono::{
    DateTime,
    Utc,
};
use parking_lot::Mutex;
use serde::{
    Deserialize,
    Serialize,
};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{
    debug,
    warn,
};

use crate::{
    cherry_picker::{
        BadTimeoutContext,
        CherryPicker,
    },
    models::Node,
    quality::SUCCESS_CODE,
};

#[derive(Debug, Error)]
pub enum MetricsStoreError {
    #[error("metrics store rejected {rows} rows: {reason}")]
    Rejected { rows: usize, reason: String },
}

/// One durable relay row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRow {
    pub timestamp: DateTime<Utc>,
    pub request_id: String,
    pub application_public_key: String,
    pub chain: String,
    pub node_public_key: Option<String>,
    pub elapsed_secs: f64,
    pub result_code: u16,
    pub bytes: usize,
    pub method: String,
    pub fallback: bool,
}

#[async_trait]
pub trait MetricsStore: Send + Sync {
    async fn insert_rows(&self, rows: Vec<MetricRow>) -> Result<(), MetricsStoreError>;
}

pub type SharedMetricsStore = Arc<dyn MetricsStore>;

/// Drops every row.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetricsStore;

#[async_trait]
impl MetricsStore for NoopMetricsStore {
    async fn insert_rows(&self, _rows: Vec<MetricRow>) -> Result<(), MetricsStoreError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Minimum time between two bulk writes (seconds).
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,
}

const fn default_flush_interval_secs() -> u64 {
    10
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            flush_interval_secs: default_flush_interval_secs(),
        }
    }
}

/// What happened to one relay attempt or fallback.
#[derive(Debug, Clone, Copy)]
pub struct RelayOutcome<'a> {
    pub request_id: &'a str,
    pub application_id: &'a str,
    pub application_public_key: &'a str,
    pub chain: &'a str,
    /// Node that served the attempt; `None` for altruist fallbacks.
    pub node: Option<&'a Node>,
    pub method: &'a str,
    pub elapsed: Duration,
    pub result_code: u16,
    pub bytes: usize,
    pub fallback: bool,
    /// Set on failed attempts of chains that evict chronically slow nodes.
    pub bad_timeout: Option<BadTimeoutContext<'a>>,
}

struct Buffer {
    rows: Vec<MetricRow>,
    last_flush: Instant,
}

#[derive(Clone)]
pub struct MetricsRecorder {
    cherry_picker: CherryPicker,
    store: SharedMetricsStore,
    buffer: Arc<Mutex<Buffer>>,
    flush_interval: Duration,
}

impl MetricsRecorder {
    pub fn new(
        cherry_picker: CherryPicker,
        store: SharedMetricsStore,
        config: &MetricsConfig,
    ) -> Self {
        Self {
            cherry_picker,
            store,
            buffer: Arc::new(Mutex::new(Buffer {
                rows: Vec::new(),
                last_flush: Instant::now(),
            })),
            flush_interval: Duration::from_secs(config.flush_interval_secs),
        }
    }

    pub async fn record_metric(&self, outcome: RelayOutcome<'_>) {
        let result = if outcome.result_code == SUCCESS_CODE {
            "success"
        } else {
            "failure"
        };
        metrics::counter!("relay_gateway_relay_total", "result" => result).increment(1);
        metrics::histogram!("relay_gateway_relay_duration_seconds", "result" => result)
            .record(outcome.elapsed.as_secs_f64());
        if outcome.fallback {
            metrics::counter!("relay_gateway_fallback_total").increment(1);
        }

        if let Some(node) = outcome.node {
            self.cherry_picker
                .update_service_quality(
                    outcome.chain,
                    &node.public_key,
                    outcome.elapsed,
                    outcome.result_code,
                    outcome.bad_timeout,
                )
                .await;
        }
        if !outcome.fallback {
            self.cherry_picker
                .update_service_quality(
                    outcome.chain,
                    outcome.application_id,
                    outcome.elapsed,
                    outcome.result_code,
                    None,
                )
                .await;
        }

        let row = MetricRow {
            timestamp: Utc::now(),
            request_id: outcome.request_id.to_string(),
            application_public_key: outcome.application_public_key.to_string(),
            chain: outcome.chain.to_string(),
            node_public_key: outcome.node.map(|node| node.public_key.clone()),
            elapsed_secs: outcome.elapsed.as_secs_f64(),
            result_code: outcome.result_code,
            bytes: outcome.bytes,
            method: outcome.method.to_string(),
            fallback: outcome.fallback,
        };

        let due = {
            let mut buffer = self.buffer.lock();
            buffer.rows.push(row);
            if buffer.last_flush.elapsed() >= self.flush_interval {
                buffer.last_flush = Instant::now();
                Some(mem::take(&mut buffer.rows))
            } else {
                None
            }
        };
        if let Some(rows) = due {
            self.write(rows).await;
        }
    }

    /// Writes every buffered row now.
    pub async fn flush(&self) {
        let rows = {
            let mut buffer = self.buffer.lock();
            buffer.last_flush = Instant::now();
            mem::take(&mut buffer.rows)
        };
        self.write(rows).await;
    }

    pub fn buffered(&self) -> usize {
        self.buffer.lock().rows.len()
    }

    async fn write(&self, rows: Vec<MetricRow>) {
        if rows.is_empty() {
            return;
        }
        let count = rows.len();
        match self.store.insert_rows(rows).await {
            Ok(()) => debug!(rows = count, "flushed relay metrics"),
            Err(err) => warn!(%err, rows = count, "failed to flush relay metrics"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cache::TieredCache,
        quality::{
            FAILURE_CODE,
            QualityConfig,
            QualityLog,
        },
        session::{
            SessionConfig,
            SessionManager,
        },
        test_utils::{
            RecordingMetricsStore,
            ScriptedProtocolClient,
            node,
            session_with,
        },
    };

    fn recorder(store: Arc<RecordingMetricsStore>) -> (MetricsRecorder, QualityLog) {
        let cache = TieredCache::in_memory();
        let client = Arc::new(ScriptedProtocolClient::new(session_with(1)));
        let sessions = SessionManager::new(client, cache.clone(), SessionConfig::default());
        let quality = QualityLog::new(cache.clone(), QualityConfig::default());
        let picker = CherryPicker::new(quality.clone(), sessions, cache);
        (
            MetricsRecorder::new(picker, store, &MetricsConfig::default()),
            quality,
        )
    }

    fn outcome<'a>(node: &'a Node, result_code: u16) -> RelayOutcome<'a> {
        RelayOutcome {
            request_id: "req",
            application_id: "app",
            application_public_key: "app-public-key",
            chain: "0021",
            node: Some(node),
            method: "eth_blockNumber",
            elapsed: Duration::from_millis(120),
            result_code,
            bytes: 42,
            fallback: false,
            bad_timeout: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn quality_logs_update_before_the_flush() {
        let store = Arc::new(RecordingMetricsStore::default());
        let (recorder, quality) = recorder(store.clone());
        let node = node(0);

        recorder.record_metric(outcome(&node, SUCCESS_CODE)).await;
        recorder.record_metric(outcome(&node, FAILURE_CODE)).await;

        let entry = quality.load("0021", &node.public_key).await.unwrap().unwrap();
        assert_eq!(entry.attempts(), 2);
        let app = quality.load("0021", "app").await.unwrap().unwrap();
        assert_eq!(app.attempts(), 2);
        assert_eq!(recorder.buffered(), 2);
        assert!(store.rows().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn rows_flush_once_the_interval_passed() {
        let store = Arc::new(RecordingMetricsStore::default());
        let (recorder, _) = recorder(store.clone());
        let node = node(0);

        recorder.record_metric(outcome(&node, SUCCESS_CODE)).await;
        tokio::time::advance(Duration::from_secs(11)).await;
        recorder.record_metric(outcome(&node, SUCCESS_CODE)).await;

        assert_eq!(store.rows().len(), 2);
        assert_eq!(recorder.buffered(), 0);
        assert_eq!(store.rows()[0].method, "eth_blockNumber");
    }

    #[tokio::test]
    async fn store_failures_are_swallowed() {
        let store = Arc::new(RecordingMetricsStore::failing());
        let (recorder, _) = recorder(store.clone());
        let node = node(0);

        recorder.record_metric(outcome(&node, SUCCESS_CODE)).await;
        recorder.flush().await;
        assert_eq!(recorder.buffered(), 0);
        assert!(store.rows().is_empty());
    }
}
