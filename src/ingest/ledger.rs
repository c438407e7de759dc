//! Durable ledger of already-enqueued file paths.
//!
//! Append-only and monotonic: once a path is recorded it stays recorded,
//! across restarts, for the lifetime of the ledger file. The watcher
//! consults the ledger before enqueuing, so losing the ledger file is the
//! only way a recording can be enqueued twice.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::RwLock;

/// Durable set of already-enqueued paths
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Whether this path has already been enqueued
    async fn contains(&self, path: &Path) -> Result<bool>;

    /// Durably record the path as enqueued
    async fn record(&self, path: &Path) -> Result<()>;
}

/// One ledger entry per line
#[derive(Debug, Serialize, Deserialize)]
struct LedgerEntry {
    path: PathBuf,
    recorded_at: DateTime<Utc>,
}

/// JSONL-backed ledger keyed by resolved absolute path
pub struct FileLedger {
    path: PathBuf,
    seen: RwLock<HashSet<PathBuf>>,
}

impl FileLedger {
    /// Open a ledger file, loading any existing entries
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut seen = HashSet::new();

        if path.exists() {
            let file = File::open(&path)
                .await
                .with_context(|| format!("Failed to open ledger: {}", path.display()))?;
            let reader = BufReader::new(file);
            let mut lines = reader.lines();

            while let Some(line) = lines.next_line().await? {
                if line.trim().is_empty() {
                    continue;
                }
                let entry: LedgerEntry = serde_json::from_str(&line)
                    .with_context(|| format!("Corrupt ledger line: {}", line))?;
                seen.insert(entry.path);
            }
        }

        Ok(Self {
            path,
            seen: RwLock::new(seen),
        })
    }

    /// Number of recorded paths
    pub async fn len(&self) -> usize {
        self.seen.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.seen.read().await.is_empty()
    }
}

#[async_trait]
impl Ledger for FileLedger {
    async fn contains(&self, path: &Path) -> Result<bool> {
        Ok(self.seen.read().await.contains(path))
    }

    async fn record(&self, path: &Path) -> Result<()> {
        let entry = LedgerEntry {
            path: path.to_path_buf(),
            recorded_at: Utc::now(),
        };
        let json = serde_json::to_string(&entry)?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("Failed to open ledger: {}", self.path.display()))?;
        file.write_all(format!("{}\n", json).as_bytes()).await?;
        file.flush().await?;

        self.seen.write().await.insert(path.to_path_buf());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_record_and_contains() {
        let temp = TempDir::new().unwrap();
        let ledger = FileLedger::open(temp.path().join("ledger.jsonl"))
            .await
            .unwrap();

        let path = Path::new("/data/calls/a.mp3");
        assert!(!ledger.contains(path).await.unwrap());

        ledger.record(path).await.unwrap();
        assert!(ledger.contains(path).await.unwrap());
        assert_eq!(ledger.len().await, 1);
    }

    #[tokio::test]
    async fn test_entries_survive_reopen() {
        let temp = TempDir::new().unwrap();
        let ledger_path = temp.path().join("ledger.jsonl");

        {
            let ledger = FileLedger::open(&ledger_path).await.unwrap();
            ledger.record(Path::new("/data/a.mp3")).await.unwrap();
            ledger.record(Path::new("/data/b.mp3")).await.unwrap();
        }

        let reopened = FileLedger::open(&ledger_path).await.unwrap();
        assert!(reopened.contains(Path::new("/data/a.mp3")).await.unwrap());
        assert!(reopened.contains(Path::new("/data/b.mp3")).await.unwrap());
        assert!(!reopened.contains(Path::new("/data/c.mp3")).await.unwrap());
    }
}
