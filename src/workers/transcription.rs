//! Transcription stage worker.
//!
//! Consumes `transcription_jobs`: transcribes the recording, redacts
//! PII, persists the transcript, and hands the call to the evaluation
//! stage. Business failures are absorbed here, not requeued: the call
//! is marked FAILED, a dead-letter record goes to `failed_jobs`, and the
//! job is acknowledged so the queue keeps moving.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::adapters::Recognizer;
use crate::broker::{FileBroker, JobHandler};
use crate::domain::{
    timestamped_rendering, CallStatus, EvaluationJob, FailedJob, Segment, TranscriptionJob,
    Transcript, WorkerError, EVALUATION_JOBS, FAILED_JOBS,
};
use crate::store::CallStore;

use super::redact::redact_pii;
use super::retry::{run_with_retry, RetryPolicy};

/// Worker for the transcription stage
pub struct TranscriptionWorker {
    store: Arc<CallStore>,
    broker: Arc<FileBroker>,
    recognizer: Arc<dyn Recognizer>,
    retry: RetryPolicy,
}

impl TranscriptionWorker {
    pub fn new(
        store: Arc<CallStore>,
        broker: Arc<FileBroker>,
        recognizer: Arc<dyn Recognizer>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            broker,
            recognizer,
            retry,
        }
    }

    /// The stage body; any error escaping this is a stage failure.
    async fn run(&self, job: &TranscriptionJob) -> Result<(), WorkerError> {
        let audio_path = job
            .audio_path
            .as_deref()
            .ok_or_else(|| WorkerError::terminal("Job has no audio path"))?;

        let recognition = run_with_retry(&self.retry, "transcribe", || {
            self.recognizer.transcribe(audio_path)
        })
        .await?;

        let text = redact_pii(&recognition.text);
        let segments: Vec<Segment> = recognition
            .segments
            .iter()
            .map(|s| Segment {
                start: s.start,
                end: s.end,
                text: redact_pii(&s.text),
            })
            .collect();
        let timestamped_text = timestamped_rendering(&segments);

        let transcript = Transcript {
            id: Uuid::new_v4(),
            call_id: job.call_id,
            model_name: self.recognizer.name().to_string(),
            language: recognition.language,
            text,
            segments,
            timestamped_text,
        };

        let inserted = self
            .store
            .save_transcript(&transcript, recognition.duration_seconds)?;
        if !inserted {
            tracing::info!(call_id = %job.call_id, "transcript already stored, skipping insert");
        }

        self.broker
            .publish(EVALUATION_JOBS, &EvaluationJob { call_id: job.call_id })
            .await
            .map_err(|e| WorkerError::structural(e.to_string()))?;

        self.store
            .update_call_status(job.call_id, CallStatus::EvaluationQueue, None)?;

        tracing::info!(call_id = %job.call_id, "transcription complete");
        Ok(())
    }

    /// Record a stage failure: FAILED status plus a dead-letter record.
    async fn record_failure(&self, job: &TranscriptionJob, err: &WorkerError) {
        let message = format!("Transcription failed: {}", err);
        tracing::error!(call_id = %job.call_id, error = %err, "transcription failed");

        if let Err(e) = self
            .store
            .update_call_status(job.call_id, CallStatus::Failed, Some(&message))
        {
            tracing::error!(call_id = %job.call_id, error = %e, "failed to mark call FAILED");
        }

        let failed = FailedJob {
            audio_path: job.audio_path.clone(),
            call_id: job.call_id,
            error: message,
        };
        if let Err(e) = self.broker.publish(FAILED_JOBS, &failed).await {
            tracing::error!(call_id = %job.call_id, error = %e, "failed to dead-letter job");
        }
    }
}

#[async_trait]
impl JobHandler<TranscriptionJob> for TranscriptionWorker {
    async fn handle(&self, job: TranscriptionJob) -> Result<(), WorkerError> {
        // A message without a path cannot identify a recording; log and
        // drop rather than poison the queue.
        if job.audio_path.is_none() {
            tracing::warn!(call_id = %job.call_id, "transcription job has no audio path, dropping");
            return Ok(());
        }

        match self.run(&job).await {
            Ok(()) => Ok(()),
            // Store or broker unavailable: let the broker redeliver
            Err(err) if err.is_structural() => Err(err),
            // Business failure: absorb it so the message is acknowledged
            Err(err) => {
                self.record_failure(&job, &err).await;
                Ok(())
            }
        }
    }
}
