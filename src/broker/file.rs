//! File-backed durable broker using append-only JSONL queue logs.
//!
//! Each queue is one JSONL file under the broker directory. Every state
//! change is appended as a record and flushed, so queue contents survive
//! restart; current state is derived by replaying the log. Appends take an
//! exclusive advisory lock on the queue file so concurrent producer
//! processes cannot interleave partial lines.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::domain::{ErrorKind, WorkerError};

use super::JobHandler;

/// Errors from broker operations
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Consumer task error: {0}")]
    Task(String),
}

/// A record in a queue log (append-only)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueRecord {
    pub timestamp: DateTime<Utc>,
    pub message_id: Uuid,
    pub record: RecordType,

    /// Message body; present on `published` and `dead` records
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,

    /// Handler error that caused a `requeued` or `dead` record
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Types of queue records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordType {
    /// Message durably enqueued
    Published,

    /// Delivery acknowledged; message is done
    Acked,

    /// Handler failed; message is deliverable again
    Requeued,

    /// Redelivery bound exceeded; message removed from circulation
    Dead,
}

/// State of a single message, derived by replay
#[derive(Debug, Clone)]
struct MessageState {
    payload: serde_json::Value,
    redeliveries: u32,
    acked: bool,
    dead: bool,
}

/// A deliverable message
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message_id: Uuid,
    pub payload: serde_json::Value,

    /// How many times this message has already been requeued
    pub redeliveries: u32,
}

/// Queue depth summary
#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    pub pending: usize,
    pub acked: usize,
    pub dead: usize,
}

/// Outcome counts for one drain pass
#[derive(Debug, Clone, Default)]
pub struct DrainStats {
    pub acked: usize,
    pub requeued: usize,
    pub dead: usize,
}

impl DrainStats {
    /// Total deliveries handled in this pass
    pub fn handled(&self) -> usize {
        self.acked + self.requeued + self.dead
    }
}

/// File-backed broker; one long-lived instance per process
pub struct FileBroker {
    /// Directory holding the queue logs
    dir: PathBuf,

    /// Requeue bound before a message is dead-lettered
    max_redeliveries: u32,
}

impl FileBroker {
    /// Create a broker rooted at `dir` (created lazily on first append)
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            max_redeliveries: 5,
        }
    }

    /// Override the redelivery bound
    pub fn with_max_redeliveries(mut self, max_redeliveries: u32) -> Self {
        self.max_redeliveries = max_redeliveries;
        self
    }

    fn queue_path(&self, queue: &str) -> PathBuf {
        self.dir.join(format!("{}.jsonl", queue))
    }

    fn dead_path(&self, queue: &str) -> PathBuf {
        self.dir.join(format!("{}.dead.jsonl", queue))
    }

    fn lock_path(&self, queue: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", queue))
    }

    /// Take the queue's exclusive consumer lock, waiting if another
    /// instance holds it.
    ///
    /// Competing worker processes share a queue directory; without the
    /// lock each of them would replay the same unacknowledged messages
    /// and handle every delivery once per instance. Holding the lock for
    /// a whole drain pass means the next instance replays only after
    /// this one's acks are on disk. The advisory lock is released when
    /// the returned file is dropped.
    async fn consumer_lock(&self, queue: &str) -> Result<std::fs::File, BrokerError> {
        let path = self.lock_path(queue);

        tokio::task::spawn_blocking(move || -> std::io::Result<std::fs::File> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .open(&path)?;
            file.lock_exclusive()?;
            Ok(file)
        })
        .await
        .map_err(|e| BrokerError::Task(e.to_string()))?
        .map_err(BrokerError::Io)
    }

    /// Append one record to a log file, flushed before returning
    async fn append(&self, path: &Path, record: &QueueRecord) -> Result<(), BrokerError> {
        let line = serde_json::to_string(record)?;
        let path = path.to_path_buf();

        tokio::task::spawn_blocking(move || append_line(&path, &line))
            .await
            .map_err(|e| BrokerError::Task(e.to_string()))??;

        Ok(())
    }

    /// Replay a queue log into per-message state, preserving publish order
    async fn replay(
        &self,
        queue: &str,
    ) -> Result<(Vec<Uuid>, HashMap<Uuid, MessageState>), BrokerError> {
        let mut order = Vec::new();
        let mut states: HashMap<Uuid, MessageState> = HashMap::new();

        let path = self.queue_path(queue);
        if !path.exists() {
            return Ok((order, states));
        }

        let file = File::open(&path).await?;
        let reader = BufReader::new(file);
        let mut lines = reader.lines();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }

            let record: QueueRecord = serde_json::from_str(&line)?;
            match record.record {
                RecordType::Published => {
                    if let Some(payload) = record.payload {
                        order.push(record.message_id);
                        states.insert(
                            record.message_id,
                            MessageState {
                                payload,
                                redeliveries: 0,
                                acked: false,
                                dead: false,
                            },
                        );
                    }
                }
                RecordType::Acked => {
                    if let Some(state) = states.get_mut(&record.message_id) {
                        state.acked = true;
                    }
                }
                RecordType::Requeued => {
                    if let Some(state) = states.get_mut(&record.message_id) {
                        state.redeliveries += 1;
                    }
                }
                RecordType::Dead => {
                    if let Some(state) = states.get_mut(&record.message_id) {
                        state.dead = true;
                    }
                }
            }
        }

        Ok((order, states))
    }

    /// Publish a payload to a durable queue, returning the message id
    pub async fn publish<T: Serialize>(
        &self,
        queue: &str,
        payload: &T,
    ) -> Result<Uuid, BrokerError> {
        let message_id = Uuid::new_v4();
        let record = QueueRecord {
            timestamp: Utc::now(),
            message_id,
            record: RecordType::Published,
            payload: Some(serde_json::to_value(payload)?),
            error: None,
        };

        self.append(&self.queue_path(queue), &record).await?;
        tracing::debug!(queue = %queue, %message_id, "published");

        Ok(message_id)
    }

    /// Deliverable messages, oldest first
    pub async fn pending(&self, queue: &str) -> Result<Vec<Delivery>, BrokerError> {
        let (order, states) = self.replay(queue).await?;

        Ok(order
            .into_iter()
            .filter_map(|id| {
                let state = states.get(&id)?;
                if state.acked || state.dead {
                    return None;
                }
                Some(Delivery {
                    message_id: id,
                    payload: state.payload.clone(),
                    redeliveries: state.redeliveries,
                })
            })
            .collect())
    }

    /// Acknowledge a delivery
    pub async fn ack(&self, queue: &str, message_id: Uuid) -> Result<(), BrokerError> {
        let record = QueueRecord {
            timestamp: Utc::now(),
            message_id,
            record: RecordType::Acked,
            payload: None,
            error: None,
        };
        self.append(&self.queue_path(queue), &record).await
    }

    /// Return a failed delivery to the queue.
    ///
    /// Once the message has been requeued `max_redeliveries` times it is
    /// dead-lettered instead: a `dead` record ends its circulation and the
    /// payload is copied to the queue's `.dead.jsonl` side file for
    /// operator inspection. Returns `true` if the message was dead-lettered.
    pub async fn requeue(
        &self,
        queue: &str,
        message_id: Uuid,
        error: &str,
    ) -> Result<bool, BrokerError> {
        let (_, states) = self.replay(queue).await?;
        let redeliveries = states.get(&message_id).map(|s| s.redeliveries).unwrap_or(0);

        if redeliveries >= self.max_redeliveries {
            let payload = states.get(&message_id).map(|s| s.payload.clone());

            let record = QueueRecord {
                timestamp: Utc::now(),
                message_id,
                record: RecordType::Dead,
                payload: None,
                error: Some(error.to_string()),
            };
            self.append(&self.queue_path(queue), &record).await?;

            let side = QueueRecord {
                timestamp: Utc::now(),
                message_id,
                record: RecordType::Dead,
                payload,
                error: Some(error.to_string()),
            };
            self.append(&self.dead_path(queue), &side).await?;

            tracing::error!(
                queue = %queue,
                %message_id,
                redeliveries,
                error = %error,
                "redelivery bound exceeded, message dead-lettered"
            );
            return Ok(true);
        }

        let record = QueueRecord {
            timestamp: Utc::now(),
            message_id,
            record: RecordType::Requeued,
            payload: None,
            error: Some(error.to_string()),
        };
        self.append(&self.queue_path(queue), &record).await?;
        tracing::warn!(queue = %queue, %message_id, error = %error, "requeued");

        Ok(false)
    }

    /// Queue depth counts
    pub async fn queue_stats(&self, queue: &str) -> Result<QueueStats, BrokerError> {
        let (_, states) = self.replay(queue).await?;

        let mut stats = QueueStats::default();
        for state in states.values() {
            if state.dead {
                stats.dead += 1;
            } else if state.acked {
                stats.acked += 1;
            } else {
                stats.pending += 1;
            }
        }
        Ok(stats)
    }

    /// Payloads of dead-lettered messages, in dead-letter order
    pub async fn dead_letters(&self, queue: &str) -> Result<Vec<QueueRecord>, BrokerError> {
        let path = self.dead_path(queue);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&path).await?;
        let reader = BufReader::new(file);
        let mut lines = reader.lines();
        let mut records = Vec::new();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            records.push(serde_json::from_str(&line)?);
        }

        Ok(records)
    }

    /// Process every currently deliverable message once.
    ///
    /// Deliveries run at most `max_in_flight` at a time. Each delivery is
    /// deserialized and passed to the handler; the ack/requeue decision
    /// dispatches on the handler's error kind. Messages requeued during
    /// this pass are not retried until the next pass.
    ///
    /// The whole pass runs under the queue's consumer lock, so each
    /// delivery goes to exactly one of any competing instances.
    pub async fn process_available<J, H>(
        &self,
        queue: &str,
        handler: Arc<H>,
        max_in_flight: usize,
    ) -> Result<DrainStats, BrokerError>
    where
        J: serde::de::DeserializeOwned + Send + 'static,
        H: JobHandler<J> + 'static,
    {
        let _consumer = self.consumer_lock(queue).await?;

        let pending = self.pending(queue).await?;
        let mut stats = DrainStats::default();

        for window in pending.chunks(max_in_flight.max(1)) {
            let mut in_flight = JoinSet::new();

            for delivery in window {
                let handler = Arc::clone(&handler);
                let payload = delivery.payload.clone();
                let message_id = delivery.message_id;

                in_flight.spawn(async move {
                    let outcome = match serde_json::from_value::<J>(payload) {
                        Ok(job) => handler.handle(job).await,
                        Err(e) => Err(WorkerError::structural(format!(
                            "malformed payload: {}",
                            e
                        ))),
                    };
                    (message_id, outcome)
                });
            }

            while let Some(joined) = in_flight.join_next().await {
                let (message_id, outcome) =
                    joined.map_err(|e| BrokerError::Task(e.to_string()))?;

                match outcome {
                    Ok(()) => {
                        self.ack(queue, message_id).await?;
                        stats.acked += 1;
                    }
                    Err(err) if err.kind() == ErrorKind::Terminal => {
                        // Workers absorb business failures before returning;
                        // a terminal error that escapes anyway must not loop.
                        tracing::warn!(
                            queue = %queue,
                            %message_id,
                            error = %err,
                            "terminal handler error, acknowledging"
                        );
                        self.ack(queue, message_id).await?;
                        stats.acked += 1;
                    }
                    Err(err) => {
                        if self.requeue(queue, message_id, &err.to_string()).await? {
                            stats.dead += 1;
                        } else {
                            stats.requeued += 1;
                        }
                    }
                }
            }
        }

        Ok(stats)
    }

    /// Start a long-lived consumer loop for a queue.
    ///
    /// The loop drains deliverable messages, sleeps `poll_interval` when
    /// the queue is idle, and runs until the handle is stopped.
    pub fn start_consumer<J, H>(
        self: &Arc<Self>,
        queue: impl Into<String>,
        handler: Arc<H>,
        max_in_flight: usize,
        poll_interval: Duration,
    ) -> ConsumerHandle
    where
        J: serde::de::DeserializeOwned + Send + 'static,
        H: JobHandler<J> + 'static,
    {
        let queue = queue.into();
        let broker = Arc::clone(self);
        let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);

        let task = tokio::spawn(async move {
            tracing::info!(queue = %queue, max_in_flight, "consumer started");

            loop {
                let handled = match broker
                    .process_available::<J, H>(&queue, Arc::clone(&handler), max_in_flight)
                    .await
                {
                    Ok(stats) => stats.handled(),
                    Err(e) => {
                        tracing::error!(queue = %queue, error = %e, "consume cycle failed");
                        0
                    }
                };

                if handled == 0 {
                    tokio::select! {
                        _ = stop_rx.recv() => break,
                        _ = tokio::time::sleep(poll_interval) => {}
                    }
                } else if stop_rx.try_recv().is_ok() {
                    break;
                }
            }

            tracing::info!(queue = %queue, "consumer stopped");
        });

        ConsumerHandle { stop_tx, task }
    }
}

/// Handle to stop a running consumer
pub struct ConsumerHandle {
    stop_tx: mpsc::Sender<()>,
    task: tokio::task::JoinHandle<()>,
}

impl ConsumerHandle {
    /// Signal the consumer to stop and wait for it to finish
    pub async fn stop(self) -> Result<(), BrokerError> {
        let _ = self.stop_tx.send(()).await;
        self.task
            .await
            .map_err(|e| BrokerError::Task(e.to_string()))?;
        Ok(())
    }
}

/// Append one line under an exclusive advisory lock, flushed to disk
fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    use std::io::Write;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;

    file.lock_exclusive()?;
    let result = (|| {
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        file.flush()
    })();
    let _ = fs2::FileExt::unlock(&file);

    result
}
