//! Call lifecycle state and persisted pipeline results.
//!
//! A call moves through a fixed state machine:
//!
//! ```text
//! TRANSCRIPTION_QUEUE → EVALUATION_QUEUE → EVALUATED
//!          │                    │
//!          └────────→ FAILED ←──┘
//! ```
//!
//! No other transition is legal. Calls are never deleted; FAILED rows and
//! their error messages are the audit trail operators work from.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallStatus {
    /// Waiting for (or being) transcribed
    TranscriptionQueue,

    /// Transcribed, waiting for (or being) evaluated
    EvaluationQueue,

    /// Evaluation persisted (terminal)
    Evaluated,

    /// Unrecoverable failure at some stage (terminal)
    Failed,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TranscriptionQueue => "TRANSCRIPTION_QUEUE",
            Self::EvaluationQueue => "EVALUATION_QUEUE",
            Self::Evaluated => "EVALUATED",
            Self::Failed => "FAILED",
        }
    }

    /// Whether `next` is a legal successor state.
    ///
    /// A same-status update is allowed as an idempotent no-op so that a
    /// redelivered job can re-run its status write without tripping the
    /// state machine.
    pub fn can_transition_to(&self, next: CallStatus) -> bool {
        if *self == next {
            return true;
        }
        matches!(
            (self, next),
            (Self::TranscriptionQueue, Self::EvaluationQueue)
                | (Self::TranscriptionQueue, Self::Failed)
                | (Self::EvaluationQueue, Self::Evaluated)
                | (Self::EvaluationQueue, Self::Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Evaluated | Self::Failed)
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CallStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TRANSCRIPTION_QUEUE" => Ok(Self::TranscriptionQueue),
            "EVALUATION_QUEUE" => Ok(Self::EvaluationQueue),
            "EVALUATED" => Ok(Self::Evaluated),
            "FAILED" => Ok(Self::Failed),
            other => Err(format!("unknown call status: {}", other)),
        }
    }
}

/// A recorded call tracked by the pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Call {
    /// Unique identifier, assigned exactly once at ingestion
    pub id: Uuid,

    /// Resolved absolute path to the audio file
    pub audio_path: PathBuf,

    /// Audio duration, filled in by the transcription stage
    pub duration_seconds: Option<f64>,

    /// Current lifecycle status
    pub status: CallStatus,

    /// Human-readable error for FAILED calls
    pub error_message: Option<String>,

    /// When the call was first seen
    pub created_at: DateTime<Utc>,
}

/// A time-aligned transcript segment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

/// Transcript persisted by the transcription worker (at most one per call)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transcript {
    pub id: Uuid,
    pub call_id: Uuid,
    pub model_name: String,
    pub language: String,

    /// Full redacted text
    pub text: String,

    /// Ordered time-aligned segments
    pub segments: Vec<Segment>,

    /// Human-readable rendering with timestamp prefixes, one segment per line
    pub timestamped_text: String,
}

/// Render segments as `"{start} {text}"` lines, skipping empty segments.
///
/// Evaluation evidence cites these timestamp prefixes verbatim, so the
/// format is part of the prompt contract.
pub fn timestamped_rendering(segments: &[Segment]) -> String {
    let mut lines = Vec::new();
    for seg in segments {
        let text = seg.text.trim();
        if text.is_empty() {
            continue;
        }
        lines.push(format!("{} {}", seg.start, text));
    }
    lines.join("\n")
}

/// Score, justification and cited evidence for one quality category
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryScore {
    pub score: u8,
    pub explanation: String,
    pub evidence: String,
}

/// A persisted quality evaluation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evaluation {
    pub id: Uuid,
    pub call_id: Uuid,
    pub evaluator_type: String,
    pub evaluator_version: String,

    /// Rounded arithmetic mean of the category scores
    pub overall_score: u8,

    /// Scores keyed by the seven fixed category names
    pub category_scores: BTreeMap<String, CategoryScore>,

    pub strengths: Vec<String>,
    pub improvements: Vec<String>,

    /// Raw structured model output, kept for audit
    pub raw_output: serde_json::Value,

    /// Human-reviewed output, if an operator has corrected the evaluation
    pub human_output: Option<serde_json::Value>,

    pub created_at: DateTime<Utc>,
}

/// A versioned prompt row; at most one version per name is active
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prompt {
    pub name: String,
    pub version: String,
    pub content: String,
    pub is_active: bool,
}

impl Prompt {
    /// Substitute the transcript into the prompt template.
    pub fn render(&self, transcript: &str) -> String {
        self.content.replace("{transcript}", transcript)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legal_transitions() {
        use CallStatus::*;

        assert!(TranscriptionQueue.can_transition_to(EvaluationQueue));
        assert!(TranscriptionQueue.can_transition_to(Failed));
        assert!(EvaluationQueue.can_transition_to(Evaluated));
        assert!(EvaluationQueue.can_transition_to(Failed));
    }

    #[test]
    fn test_illegal_transitions() {
        use CallStatus::*;

        assert!(!TranscriptionQueue.can_transition_to(Evaluated));
        assert!(!EvaluationQueue.can_transition_to(TranscriptionQueue));
        assert!(!Evaluated.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(TranscriptionQueue));
        assert!(!Failed.can_transition_to(EvaluationQueue));
    }

    #[test]
    fn test_same_status_is_noop_transition() {
        use CallStatus::*;

        assert!(TranscriptionQueue.can_transition_to(TranscriptionQueue));
        assert!(Failed.can_transition_to(Failed));
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            CallStatus::TranscriptionQueue,
            CallStatus::EvaluationQueue,
            CallStatus::Evaluated,
            CallStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<CallStatus>(), Ok(status));
        }
    }

    #[test]
    fn test_timestamped_rendering() {
        let segments = vec![
            Segment {
                start: 0.0,
                end: 2.4,
                text: " Hello, thank you for calling. ".to_string(),
            },
            Segment {
                start: 2.4,
                end: 3.0,
                text: "   ".to_string(),
            },
            Segment {
                start: 3.0,
                end: 5.1,
                text: "How can I help?".to_string(),
            },
        ];

        let rendered = timestamped_rendering(&segments);
        assert_eq!(
            rendered,
            "0 Hello, thank you for calling.\n3 How can I help?"
        );
    }

    #[test]
    fn test_prompt_render() {
        let prompt = Prompt {
            name: "QUALITY_EVAL".to_string(),
            version: "0.1".to_string(),
            content: "Evaluate:\n{transcript}\nEnd.".to_string(),
            is_active: true,
        };

        assert_eq!(prompt.render("0 hi"), "Evaluate:\n0 hi\nEnd.");
    }
}
