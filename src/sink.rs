//! Destinations for completed results.
//!
//! The broker hands every delivered reply to a background pump which wraps it
//! in a [`StoredResult`] and publishes it to the configured [`ResultSink`].
//! Publishing failures are logged and never reach the HTTP caller.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::{io::AsyncWriteExt, sync::mpsc};
use uuid::Uuid;

use crate::{error::SinkError, protocol::ResultEnvelope};

pub const SAVE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredResult {
    pub key: String,
    pub stored_at: DateTime<Utc>,
    pub result: ResultEnvelope,
}

impl StoredResult {
    pub fn new(result: ResultEnvelope) -> Self {
        Self {
            key: Uuid::new_v4().to_string(),
            stored_at: Utc::now(),
            result,
        }
    }
}

#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn publish(&self, record: &StoredResult) -> Result<(), SinkError>;
}

/// Writes each result as a structured log line.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

#[async_trait]
impl ResultSink for LogSink {
    async fn publish(&self, record: &StoredResult) -> Result<(), SinkError> {
        let payload = serde_json::to_string(&record.result)?;
        tracing::info!(
            target = "agent_dispatch::sink",
            key = %record.key,
            request_id = %record.result.request_id,
            bot_id = %record.result.bot_id,
            status_code = record.result.status_code,
            payload = %payload,
            "result published"
        );
        Ok(())
    }
}

/// Appends one JSON document per line.
#[derive(Debug)]
pub struct JsonlFileSink {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonlFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ResultSink for JsonlFileSink {
    async fn publish(&self, record: &StoredResult) -> Result<(), SinkError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Drains `rx` until every sender is gone, publishing each result.
pub async fn run_result_pump(mut rx: mpsc::Receiver<ResultEnvelope>, sink: Arc<dyn ResultSink>) {
    while let Some(result) = rx.recv().await {
        let record = StoredResult::new(result);
        match tokio::time::timeout(SAVE_TIMEOUT, sink.publish(&record)).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                tracing::error!(
                    target = "agent_dispatch::sink",
                    key = %record.key,
                    error = %error,
                    "failed to publish result"
                );
            }
            Err(_) => {
                tracing::error!(
                    target = "agent_dispatch::sink",
                    key = %record.key,
                    "publishing result timed out"
                );
            }
        }
    }
    tracing::info!(target = "agent_dispatch::sink", "result pump stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    use super::{run_result_pump, JsonlFileSink, ResultSink, StoredResult};
    use crate::{
        error::SinkError,
        protocol::{CommandDefinition, DispatchEnvelope, ResultEnvelope},
    };

    fn result(request_id: &str) -> ResultEnvelope {
        let envelope = DispatchEnvelope {
            request_id: request_id.into(),
            definition: CommandDefinition::get("http://example/ok", "1s"),
        };
        ResultEnvelope::for_request("bot", &envelope)
    }

    #[derive(Default)]
    struct FlakySink {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ResultSink for FlakySink {
        async fn publish(&self, record: &StoredResult) -> Result<(), SinkError> {
            let mut seen = self.seen.lock();
            seen.push(record.result.request_id.clone());
            if seen.len() == 1 {
                return Err(SinkError::Io(std::io::Error::other("store unavailable")));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn jsonl_sink_appends_one_line_per_result() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonlFileSink::new(dir.path().join("nested").join("results.jsonl"));

        sink.publish(&StoredResult::new(result("r1"))).await.unwrap();
        sink.publish(&StoredResult::new(result("r2"))).await.unwrap();

        let contents = std::fs::read_to_string(sink.path()).unwrap();
        let records: Vec<StoredResult> = contents
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].result.request_id, "r1");
        assert_eq!(records[1].result.request_id, "r2");
        assert_ne!(records[0].key, records[1].key);
    }

    #[tokio::test]
    async fn pump_keeps_going_after_a_publish_failure() {
        let sink = Arc::new(FlakySink::default());
        let (tx, rx) = mpsc::channel(4);
        tx.send(result("first")).await.unwrap();
        tx.send(result("second")).await.unwrap();
        drop(tx);

        run_result_pump(rx, sink.clone()).await;

        assert_eq!(*sink.seen.lock(), ["first", "second"]);
    }
}
