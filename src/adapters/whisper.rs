//! Whisper transcription backend.
//!
//! Shells out to a local whisper binary and parses its JSON output.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;

use crate::domain::{Segment, WorkerError};

use super::{Recognition, Recognizer};

/// Whisper output JSON structure
#[derive(Debug, Deserialize)]
struct WhisperOutput {
    text: String,
    #[serde(default)]
    language: String,
    #[serde(default)]
    segments: Vec<WhisperSegment>,
}

#[derive(Debug, Deserialize)]
struct WhisperSegment {
    #[serde(default)]
    start: f64,
    #[serde(default)]
    end: f64,
    #[serde(default)]
    text: String,
}

/// [`Recognizer`] backed by the whisper CLI
pub struct WhisperCli {
    binary: PathBuf,
    model: String,
}

impl WhisperCli {
    pub fn new(binary: impl Into<PathBuf>, model: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            model: model.into(),
        }
    }
}

#[async_trait]
impl Recognizer for WhisperCli {
    async fn transcribe(&self, audio_path: &Path) -> Result<Recognition, WorkerError> {
        // Temp dir for the JSON output file
        let temp_dir = tempfile::tempdir()
            .map_err(|e| WorkerError::structural(format!("Failed to create temp dir: {}", e)))?;

        let output = Command::new(&self.binary)
            .arg(audio_path)
            .arg("--model")
            .arg(&self.model)
            .arg("--output_dir")
            .arg(temp_dir.path())
            .arg("--output_format")
            .arg("json")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| WorkerError::transient(format!("Failed to run whisper: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(WorkerError::transient(format!(
                "Whisper exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let stem = audio_path.file_stem().unwrap_or_default().to_string_lossy();
        let json_path = temp_dir.path().join(format!("{}.json", stem));

        let json_content = tokio::fs::read_to_string(&json_path)
            .await
            .map_err(|e| WorkerError::terminal(format!("Failed to read whisper output: {}", e)))?;

        let whisper: WhisperOutput = serde_json::from_str(&json_content)
            .map_err(|e| WorkerError::terminal(format!("Failed to parse whisper JSON: {}", e)))?;

        let segments: Vec<Segment> = whisper
            .segments
            .into_iter()
            .map(|s| Segment {
                start: s.start,
                end: s.end,
                text: s.text,
            })
            .collect();
        let duration_seconds = segments.last().map(|s| s.end);

        Ok(Recognition {
            text: whisper.text.trim().to_string(),
            language: if whisper.language.is_empty() {
                "en".to_string()
            } else {
                whisper.language
            },
            segments,
            duration_seconds,
        })
    }

    fn name(&self) -> &str {
        &self.model
    }
}
