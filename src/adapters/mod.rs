//! External collaborators behind traits.
//!
//! The workers only see [`Recognizer`] and [`ChatModel`]; the concrete
//! adapters (whisper CLI subprocess, OpenAI-compatible chat endpoint)
//! live here so tests can substitute deterministic fakes.
//!
//! Adapter errors are already classified: a dead subprocess or a 429 is
//! Transient (the worker's retry policy applies), unparseable output is
//! Terminal (retrying the same input cannot help).

pub mod llm;
pub mod whisper;

use std::path::Path;

use async_trait::async_trait;

use crate::domain::{Segment, WorkerError};

pub use llm::ChatClient;
pub use whisper::WhisperCli;

/// Output of a speech recognition run
#[derive(Debug, Clone)]
pub struct Recognition {
    /// Full transcript text, unredacted
    pub text: String,

    /// Detected language code
    pub language: String,

    /// Ordered time-aligned segments
    pub segments: Vec<Segment>,

    /// Audio duration if the engine reports one
    pub duration_seconds: Option<f64>,
}

/// Speech-to-text engine
#[async_trait]
pub trait Recognizer: Send + Sync {
    /// Transcribe an audio file
    async fn transcribe(&self, audio_path: &Path) -> Result<Recognition, WorkerError>;

    /// Model name recorded alongside transcripts
    fn name(&self) -> &str;
}

/// Chat completion model
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Run a single-prompt completion and return the raw response text
    async fn complete(&self, prompt: &str) -> Result<String, WorkerError>;

    /// Model name, for logging
    fn name(&self) -> &str;
}
