//! Queue names and job payloads.
//!
//! Every payload is a small JSON document; the call id is the join key
//! back into the state store.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Queue feeding the transcription workers
pub const TRANSCRIPTION_JOBS: &str = "transcription_jobs";

/// Queue feeding the evaluation workers
pub const EVALUATION_JOBS: &str = "evaluation_jobs";

/// Dead-letter queue for terminal stage failures
pub const FAILED_JOBS: &str = "failed_jobs";

/// Work order for the transcription stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionJob {
    /// Absolute path to the recording. Optional so that a malformed
    /// message still deserializes and can be logged and dropped.
    #[serde(default)]
    pub audio_path: Option<PathBuf>,

    pub call_id: Uuid,
}

/// Work order for the evaluation stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationJob {
    pub call_id: Uuid,
}

/// Dead-letter record for a terminally failed stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedJob {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_path: Option<PathBuf>,

    pub call_id: Uuid,

    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transcription_job_without_path_deserializes() {
        let call_id = Uuid::new_v4();
        let json = format!(r#"{{"call_id":"{}"}}"#, call_id);

        let job: TranscriptionJob = serde_json::from_str(&json).unwrap();
        assert!(job.audio_path.is_none());
        assert_eq!(job.call_id, call_id);
    }

    #[test]
    fn test_failed_job_round_trip() {
        let job = FailedJob {
            audio_path: Some(PathBuf::from("/data/calls/a.mp3")),
            call_id: Uuid::new_v4(),
            error: "Transcription failed: engine unavailable".to_string(),
        };

        let json = serde_json::to_string(&job).unwrap();
        let parsed: FailedJob = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.call_id, job.call_id);
        assert_eq!(parsed.error, job.error);
    }
}
