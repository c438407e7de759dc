//! Recording directory watcher.
//!
//! On startup, `scan_once` walks the whole directory and enqueues every
//! audio file the ledger has not seen; `watch` then subscribes to live
//! file-creation events and applies the identical enqueue-if-absent
//! check.
//!
//! Crash ordering: the call row is created and the job published before
//! the ledger entry is committed. A crash between the two re-publishes
//! the job on restart (harmless, downstream writes are idempotent per
//! call id); the reverse order could silently drop a recording.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use notify::RecursiveMode;
use notify_debouncer_mini::new_debouncer;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::broker::FileBroker;
use crate::domain::{TranscriptionJob, TRANSCRIPTION_JOBS};
use crate::store::CallStore;

use super::ledger::Ledger;

/// Errors that can occur with the watcher
#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("Watch directory does not exist: {0}")]
    DirectoryNotFound(PathBuf),

    #[error("Notify error: {0}")]
    Notify(#[from] notify::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration for the watcher
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    /// Directory holding call recordings
    pub watch_path: PathBuf,

    /// File extensions treated as audio
    pub extensions: Vec<String>,

    /// Debounce window for file events
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

fn default_debounce_ms() -> u64 {
    2000
}

impl WatcherConfig {
    pub fn new(watch_path: impl Into<PathBuf>) -> Self {
        Self {
            watch_path: watch_path.into(),
            extensions: vec!["mp3".to_string(), "wav".to_string()],
            debounce_ms: default_debounce_ms(),
        }
    }

    /// Check that the watch path exists
    pub fn validate(&self) -> Result<(), WatcherError> {
        if !self.watch_path.exists() {
            return Err(WatcherError::DirectoryNotFound(self.watch_path.clone()));
        }
        Ok(())
    }

    fn is_audio_file(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| self.extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)))
            .unwrap_or(false)
    }
}

/// Outcome of an enqueue-if-absent check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// New recording: call created and job published
    Enqueued(Uuid),

    /// Path already in the ledger
    AlreadySeen,
}

/// Result of a bootstrap scan
#[derive(Debug, Clone, Default)]
pub struct ScanResult {
    pub new_calls: usize,
    pub already_seen: usize,
    pub errors: usize,
}

/// Watches a recordings directory and seeds the pipeline
pub struct CallWatcher {
    config: WatcherConfig,
    store: Arc<CallStore>,
    broker: Arc<FileBroker>,
    ledger: Arc<dyn Ledger>,
}

impl CallWatcher {
    pub fn new(
        config: WatcherConfig,
        store: Arc<CallStore>,
        broker: Arc<FileBroker>,
        ledger: Arc<dyn Ledger>,
    ) -> Self {
        Self {
            config,
            store,
            broker,
            ledger,
        }
    }

    pub fn config(&self) -> &WatcherConfig {
        &self.config
    }

    /// Enqueue a recording unless its path is already in the ledger.
    ///
    /// Order matters: create the call row, publish the job, then commit
    /// the ledger entry last.
    pub async fn enqueue_if_new(&self, path: &Path) -> Result<EnqueueOutcome> {
        let path = tokio::fs::canonicalize(path)
            .await
            .with_context(|| format!("Failed to resolve path: {}", path.display()))?;

        if self.ledger.contains(&path).await? {
            return Ok(EnqueueOutcome::AlreadySeen);
        }

        let call_id = Uuid::new_v4();
        self.store
            .create_call(call_id, &path)
            .with_context(|| format!("Failed to create call for {}", path.display()))?;

        let job = TranscriptionJob {
            audio_path: Some(path.clone()),
            call_id,
        };
        self.broker
            .publish(TRANSCRIPTION_JOBS, &job)
            .await
            .context("Failed to publish transcription job")?;

        self.ledger.record(&path).await?;

        tracing::info!(%call_id, path = %path.display(), "new call enqueued");
        Ok(EnqueueOutcome::Enqueued(call_id))
    }

    /// Scan the directory once and enqueue every unseen audio file
    pub async fn scan_once(&self) -> Result<ScanResult> {
        self.config.validate()?;

        let mut result = ScanResult::default();
        let mut entries = tokio::fs::read_dir(&self.config.watch_path).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();

            if !self.config.is_audio_file(&path) {
                continue;
            }

            let metadata = match tokio::fs::metadata(&path).await {
                Ok(m) => m,
                Err(_) => continue,
            };
            if !metadata.is_file() {
                continue;
            }

            match self.enqueue_if_new(&path).await {
                Ok(EnqueueOutcome::Enqueued(_)) => result.new_calls += 1,
                Ok(EnqueueOutcome::AlreadySeen) => result.already_seen += 1,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "failed to enqueue");
                    result.errors += 1;
                }
            }
        }

        Ok(result)
    }

    /// Watch the directory for new recordings until stopped
    pub async fn watch(self: Arc<Self>) -> Result<WatchHandle> {
        self.config.validate()?;

        let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);
        let watcher = Arc::clone(&self);

        let task = tokio::spawn(async move {
            if let Err(e) = run_watcher(watcher, &mut stop_rx).await {
                tracing::error!(error = %e, "watcher error");
            }
        });

        Ok(WatchHandle { stop_tx, task })
    }
}

/// Handle to control the watcher
pub struct WatchHandle {
    stop_tx: mpsc::Sender<()>,
    task: tokio::task::JoinHandle<()>,
}

impl WatchHandle {
    /// Stop the watcher
    pub async fn stop(self) -> Result<()> {
        let _ = self.stop_tx.send(()).await;
        self.task.await?;
        Ok(())
    }
}

/// Internal watcher loop
async fn run_watcher(watcher: Arc<CallWatcher>, stop_rx: &mut mpsc::Receiver<()>) -> Result<()> {
    let (raw_tx, raw_rx) = std::sync::mpsc::channel();

    let mut debouncer = new_debouncer(
        Duration::from_millis(watcher.config.debounce_ms),
        raw_tx,
    )?;
    debouncer
        .watcher()
        .watch(&watcher.config.watch_path, RecursiveMode::NonRecursive)?;

    // The debouncer delivers on a sync channel; a dedicated thread
    // forwards batches onto an async one so this loop can await event
    // handling without parking an executor thread.
    let (event_tx, mut event_rx) = mpsc::channel(64);
    std::thread::spawn(move || {
        while let Ok(batch) = raw_rx.recv() {
            if event_tx.blocking_send(batch).is_err() {
                break;
            }
        }
    });

    tracing::info!(
        path = %watcher.config.watch_path.display(),
        "watching for new recordings"
    );

    loop {
        tokio::select! {
            _ = stop_rx.recv() => {
                tracing::info!("watcher stopping");
                break;
            }
            batch = event_rx.recv() => match batch {
                Some(Ok(events)) => {
                    for event in events {
                        let path = event.path;

                        if !watcher.config.is_audio_file(&path) {
                            continue;
                        }
                        if !path.is_file() {
                            continue;
                        }

                        if let Err(e) = watcher.enqueue_if_new(&path).await {
                            tracing::warn!(path = %path.display(), error = %e, "failed to enqueue");
                        }
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!(error = ?e, "watch event error");
                }
                None => {
                    tracing::error!("watch channel disconnected");
                    break;
                }
            }
        }
    }

    // Dropping the debouncer closes the sync channel, which ends the
    // forwarder thread.
    drop(debouncer);
    Ok(())
}
