//! Configuration for callqa paths and collaborators.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (CALLQA_HOME, CALLQA_CHAT_API_KEY)
//! 2. Config file ($CALLQA_HOME/config.yaml)
//! 3. Defaults (~/.callqa)

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::workers::RetryPolicy;

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub whisper: Option<WhisperConfig>,
    #[serde(default)]
    pub chat: Option<ChatConfig>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    #[serde(default)]
    pub broker: Option<BrokerConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Directory watched for new recordings
    pub watch: Option<String>,
    /// SQLite database file
    pub database: Option<String>,
    /// Queue log directory
    pub queues: Option<String>,
    /// Ingestion ledger file
    pub ledger: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WhisperConfig {
    pub binary: Option<String>,
    pub model: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatConfig {
    pub base_url: Option<String>,
    pub model: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    pub prefetch: Option<usize>,
    pub poll_interval_ms: Option<u64>,
    pub max_redeliveries: Option<u32>,
}

/// Resolved configuration with absolute paths and all defaults applied
#[derive(Debug, Clone)]
pub struct Config {
    pub home: PathBuf,
    pub watch_path: PathBuf,
    pub database_path: PathBuf,
    pub queue_dir: PathBuf,
    pub ledger_path: PathBuf,

    pub whisper_binary: PathBuf,
    pub whisper_model: String,

    pub chat_base_url: String,
    pub chat_model: String,
    pub chat_api_key: Option<String>,

    pub retry: RetryPolicy,
    pub prefetch: usize,
    pub poll_interval_ms: u64,
    pub max_redeliveries: u32,
}

impl Config {
    /// Load configuration from env, config file and defaults
    pub fn load() -> Result<Self> {
        let home = match std::env::var("CALLQA_HOME") {
            Ok(home) => PathBuf::from(home),
            Err(_) => dirs::home_dir()
                .context("Failed to determine home directory")?
                .join(".callqa"),
        };

        let config_path = home.join("config.yaml");
        let file = if config_path.exists() {
            load_config_file(&config_path)?
        } else {
            ConfigFile::default()
        };

        Ok(Self::resolve(home, file))
    }

    fn resolve(home: PathBuf, file: ConfigFile) -> Self {
        let path_or = |configured: &Option<String>, default: PathBuf| {
            configured
                .as_ref()
                .map(|p| resolve_path(&home, p))
                .unwrap_or(default)
        };

        let watch_path = path_or(&file.paths.watch, home.join("recordings"));
        let database_path = path_or(&file.paths.database, home.join("callqa.db"));
        let queue_dir = path_or(&file.paths.queues, home.join("queues"));
        let ledger_path = path_or(&file.paths.ledger, home.join("ingested.jsonl"));

        let whisper = file.whisper.unwrap_or(WhisperConfig {
            binary: None,
            model: None,
        });
        let chat = file.chat.unwrap_or(ChatConfig {
            base_url: None,
            model: None,
        });
        let broker = file.broker.unwrap_or(BrokerConfig {
            prefetch: None,
            poll_interval_ms: None,
            max_redeliveries: None,
        });

        Self {
            home,
            watch_path,
            database_path,
            queue_dir,
            ledger_path,
            whisper_binary: whisper
                .binary
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("whisper")),
            whisper_model: whisper.model.unwrap_or_else(|| "base".to_string()),
            chat_base_url: chat
                .base_url
                .unwrap_or_else(|| "http://localhost:11434/v1".to_string()),
            chat_model: chat.model.unwrap_or_else(|| "qwen2.5:14b".to_string()),
            chat_api_key: std::env::var("CALLQA_CHAT_API_KEY").ok(),
            retry: file.retry.unwrap_or_default(),
            // One delivery in flight per instance: a single loaded
            // recognition model, strict per-instance ordering. Scale by
            // running more instances or raising this explicitly.
            prefetch: broker.prefetch.unwrap_or(1),
            poll_interval_ms: broker.poll_interval_ms.unwrap_or(500),
            max_redeliveries: broker.max_redeliveries.unwrap_or(5),
        }
    }
}

/// Load and parse a config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the home directory
fn resolve_path(home: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        home.join(path)
    }
}
