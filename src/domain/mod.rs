//! Domain types for the call QA pipeline.
//!
//! This module contains the core data structures:
//! - Call: lifecycle row with the status state machine
//! - Transcript / Evaluation / Prompt: persisted pipeline results
//! - Job messages: queue payloads exchanged between stages
//! - WorkerError: the tagged failure taxonomy

pub mod call;
pub mod error;
pub mod jobs;

// Re-export commonly used types
pub use call::{
    timestamped_rendering, Call, CallStatus, CategoryScore, Evaluation, Prompt, Segment,
    Transcript,
};
pub use error::{ErrorKind, WorkerError};
pub use jobs::{
    EvaluationJob, FailedJob, TranscriptionJob, EVALUATION_JOBS, FAILED_JOBS, TRANSCRIPTION_JOBS,
};
