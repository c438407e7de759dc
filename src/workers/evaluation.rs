//! Evaluation stage worker.
//!
//! Consumes `evaluation_jobs`: loads the stored transcript, renders the
//! active quality prompt, runs the chat model, and persists the parsed
//! evaluation. The model's output contract is strict raw JSON; anything
//! that fails to parse is a Terminal failure since re-running the same
//! prompt cannot fix a schema violation deterministically.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use crate::adapters::ChatModel;
use crate::broker::{FileBroker, JobHandler};
use crate::domain::{
    CategoryScore, Evaluation, EvaluationJob, FailedJob, WorkerError, FAILED_JOBS,
};
use crate::prompts;
use crate::store::CallStore;

use super::retry::{run_with_retry, RetryPolicy};

/// Evaluator identity recorded with every evaluation row
pub const EVALUATOR_TYPE: &str = "agentic";

/// The seven fixed quality categories; the model must score exactly
/// these
pub const CATEGORY_KEYS: [&str; 7] = [
    "greeting_and_introduction",
    "empathy_and_tone",
    "compliance_statements",
    "product_information_accuracy",
    "call_closure_quality",
    "customer_satisfaction",
    "problem_resolution",
];

/// Model output as declared by the prompt contract. Every field is
/// required; a response missing any of them is a schema violation.
#[derive(Debug, Deserialize)]
struct RawEvaluation {
    #[allow(dead_code)]
    overall_score: serde_json::Value,
    category_scores: BTreeMap<String, RawCategoryScore>,
    strengths: Vec<String>,
    areas_for_improvement: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawCategoryScore {
    score: f64,
    explanation: String,
    evidence: String,
}

/// Parsed and validated evaluation content
#[derive(Debug)]
pub struct ParsedEvaluation {
    pub overall_score: u8,
    pub category_scores: BTreeMap<String, CategoryScore>,
    pub strengths: Vec<String>,
    pub improvements: Vec<String>,
    pub raw: serde_json::Value,
}

/// Parse a model response against the strict output contract.
///
/// The model's own overall_score is ignored; it is recomputed as the
/// rounded arithmetic mean of the category scores so the stored value
/// is always internally consistent.
pub fn parse_evaluation(response: &str) -> Result<ParsedEvaluation, WorkerError> {
    let raw: serde_json::Value = serde_json::from_str(response.trim())
        .map_err(|e| WorkerError::terminal(format!("Model output is not valid JSON: {}", e)))?;

    let parsed: RawEvaluation = serde_json::from_value(raw.clone())
        .map_err(|e| WorkerError::terminal(format!("Model output violates schema: {}", e)))?;

    let mut category_scores = BTreeMap::new();
    for key in CATEGORY_KEYS {
        let raw_score = parsed.category_scores.get(key).ok_or_else(|| {
            WorkerError::terminal(format!("Missing category score: {}", key))
        })?;

        if raw_score.score.fract() != 0.0 || !(1.0..=5.0).contains(&raw_score.score) {
            return Err(WorkerError::terminal(format!(
                "Score for {} out of range: {}",
                key, raw_score.score
            )));
        }

        category_scores.insert(
            key.to_string(),
            CategoryScore {
                score: raw_score.score as u8,
                explanation: raw_score.explanation.clone(),
                evidence: raw_score.evidence.clone(),
            },
        );
    }

    for key in parsed.category_scores.keys() {
        if !CATEGORY_KEYS.contains(&key.as_str()) {
            return Err(WorkerError::terminal(format!(
                "Unexpected category score: {}",
                key
            )));
        }
    }

    let sum: u32 = category_scores.values().map(|c| c.score as u32).sum();
    let overall_score = ((sum as f64) / (CATEGORY_KEYS.len() as f64)).round() as u8;

    Ok(ParsedEvaluation {
        overall_score,
        category_scores,
        strengths: parsed.strengths,
        improvements: parsed.areas_for_improvement,
        raw,
    })
}

/// Worker for the evaluation stage
pub struct EvaluationWorker {
    store: Arc<CallStore>,
    broker: Arc<FileBroker>,
    model: Arc<dyn ChatModel>,
    retry: RetryPolicy,
}

impl EvaluationWorker {
    pub fn new(
        store: Arc<CallStore>,
        broker: Arc<FileBroker>,
        model: Arc<dyn ChatModel>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            broker,
            model,
            retry,
        }
    }

    async fn run(&self, job: &EvaluationJob) -> Result<(), WorkerError> {
        let transcript = self
            .store
            .get_transcript(job.call_id)?
            .ok_or_else(|| WorkerError::terminal("No transcript stored for call"))?;

        let prompt = self
            .store
            .get_active_prompt(prompts::QUALITY_EVAL)?
            .ok_or_else(|| {
                WorkerError::terminal(format!("No active {} prompt", prompts::QUALITY_EVAL))
            })?;

        let rendered = prompt.render(&transcript.timestamped_text);

        let response = run_with_retry(&self.retry, "evaluate", || self.model.complete(&rendered))
            .await?;

        let parsed = parse_evaluation(&response)?;

        let evaluation = Evaluation {
            id: Uuid::new_v4(),
            call_id: job.call_id,
            evaluator_type: EVALUATOR_TYPE.to_string(),
            evaluator_version: prompt.version.clone(),
            overall_score: parsed.overall_score,
            category_scores: parsed.category_scores,
            strengths: parsed.strengths,
            improvements: parsed.improvements,
            raw_output: parsed.raw,
            human_output: None,
            created_at: Utc::now(),
        };

        let stored = self.store.save_evaluation_and_advance(&evaluation)?;
        if stored {
            tracing::info!(
                call_id = %job.call_id,
                overall_score = evaluation.overall_score,
                "evaluation complete"
            );
        } else {
            tracing::info!(call_id = %job.call_id, "call already evaluated, skipping");
        }
        Ok(())
    }

    async fn record_failure(&self, job: &EvaluationJob, err: &WorkerError) {
        let message = format!("Evaluation failed: {}", err);
        tracing::error!(call_id = %job.call_id, error = %err, "evaluation failed");

        if let Err(e) = self.store.update_call_status(
            job.call_id,
            crate::domain::CallStatus::Failed,
            Some(&message),
        ) {
            tracing::error!(call_id = %job.call_id, error = %e, "failed to mark call FAILED");
        }

        let failed = FailedJob {
            audio_path: None,
            call_id: job.call_id,
            error: message,
        };
        if let Err(e) = self.broker.publish(FAILED_JOBS, &failed).await {
            tracing::error!(call_id = %job.call_id, error = %e, "failed to dead-letter job");
        }
    }
}

#[async_trait]
impl JobHandler<EvaluationJob> for EvaluationWorker {
    async fn handle(&self, job: EvaluationJob) -> Result<(), WorkerError> {
        match self.run(&job).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_structural() => Err(err),
            Err(err) => {
                self.record_failure(&job, &err).await;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{timestamped_rendering, CallStatus, Segment, Transcript};
    use std::path::Path;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn category_json(score: u8) -> String {
        format!(
            r#"{{"score": {}, "explanation": "ok", "evidence": "0 Hello"}}"#,
            score
        )
    }

    fn model_response(scores: [u8; 7]) -> String {
        let categories: Vec<String> = CATEGORY_KEYS
            .iter()
            .zip(scores)
            .map(|(key, score)| format!(r#""{}": {}"#, key, category_json(score)))
            .collect();
        format!(
            r#"{{
                "overall_score": 1,
                "category_scores": {{{}}},
                "strengths": ["clear greeting"],
                "areas_for_improvement": ["confirm resolution"]
            }}"#,
            categories.join(",")
        )
    }

    struct FakeModel {
        responses: Mutex<Vec<Result<String, WorkerError>>>,
    }

    impl FakeModel {
        fn returning(response: &str) -> Self {
            Self {
                responses: Mutex::new(vec![Ok(response.to_string())]),
            }
        }
    }

    #[async_trait]
    impl ChatModel for FakeModel {
        async fn complete(&self, _prompt: &str) -> Result<String, WorkerError> {
            self.responses
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(WorkerError::transient("no scripted response")))
        }

        fn name(&self) -> &str {
            "fake-model"
        }
    }

    fn seed_call(store: &CallStore) -> Uuid {
        let call_id = Uuid::new_v4();
        store.create_call(call_id, Path::new("/a.mp3")).unwrap();

        let segments = vec![Segment {
            start: 0.0,
            end: 2.0,
            text: "Hello".to_string(),
        }];
        let transcript = Transcript {
            id: Uuid::new_v4(),
            call_id,
            model_name: "whisper-base".to_string(),
            language: "en".to_string(),
            text: "Hello".to_string(),
            timestamped_text: timestamped_rendering(&segments),
            segments,
        };
        store.save_transcript(&transcript, Some(2.0)).unwrap();
        store
            .update_call_status(call_id, CallStatus::EvaluationQueue, None)
            .unwrap();
        call_id
    }

    fn worker_with(temp: &TempDir, model: FakeModel) -> (EvaluationWorker, Arc<CallStore>, Arc<FileBroker>) {
        let store = Arc::new(CallStore::open_in_memory().unwrap());
        let broker = Arc::new(FileBroker::new(temp.path().join("queues")));
        let worker = EvaluationWorker::new(
            Arc::clone(&store),
            Arc::clone(&broker),
            Arc::new(model),
            RetryPolicy {
                initial_delay_ms: 1,
                max_delay_ms: 1,
                ..RetryPolicy::default()
            },
        );
        (worker, store, broker)
    }

    #[test]
    fn test_overall_score_is_rounded_mean() {
        let parsed = parse_evaluation(&model_response([1, 2, 3, 4, 5, 5, 5])).unwrap();
        // mean 25/7 = 3.57 → 4, regardless of the model's own claim
        assert_eq!(parsed.overall_score, 4);

        let parsed = parse_evaluation(&model_response([3; 7])).unwrap();
        assert_eq!(parsed.overall_score, 3);
    }

    #[test]
    fn test_invalid_json_is_terminal() {
        let err = parse_evaluation("I think the call went well!").unwrap_err();
        assert_eq!(err.kind(), crate::domain::ErrorKind::Terminal);
    }

    #[test]
    fn test_missing_category_rejected() {
        let mut response: serde_json::Value =
            serde_json::from_str(&model_response([3; 7])).unwrap();
        response["category_scores"]
            .as_object_mut()
            .unwrap()
            .remove("empathy_and_tone");

        let err = parse_evaluation(&response.to_string()).unwrap_err();
        assert!(err.to_string().contains("empathy_and_tone"));
    }

    #[test]
    fn test_missing_lists_rejected() {
        for field in ["strengths", "areas_for_improvement"] {
            let mut response: serde_json::Value =
                serde_json::from_str(&model_response([3; 7])).unwrap();
            response.as_object_mut().unwrap().remove(field);

            let err = parse_evaluation(&response.to_string()).unwrap_err();
            assert_eq!(err.kind(), crate::domain::ErrorKind::Terminal);
        }
    }

    #[test]
    fn test_out_of_range_score_rejected() {
        let mut response: serde_json::Value =
            serde_json::from_str(&model_response([3; 7])).unwrap();
        response["category_scores"]["empathy_and_tone"]["score"] = serde_json::json!(6);

        assert!(parse_evaluation(&response.to_string()).is_err());
    }

    #[tokio::test]
    async fn test_successful_evaluation_persists_and_advances() {
        let temp = TempDir::new().unwrap();
        let (worker, store, broker) = worker_with(
            &temp,
            FakeModel::returning(&model_response([4, 4, 4, 4, 4, 5, 5])),
        );
        let call_id = seed_call(&store);

        worker.handle(EvaluationJob { call_id }).await.unwrap();

        let call = store.get_call(call_id).unwrap().unwrap();
        assert_eq!(call.status, CallStatus::Evaluated);

        let eval = store.get_evaluation(call_id).unwrap().unwrap();
        assert_eq!(eval.evaluator_type, "agentic");
        assert_eq!(eval.evaluator_version, prompts::QUALITY_EVAL_SEED_VERSION);
        // mean 30/7 = 4.29 → 4
        assert_eq!(eval.overall_score, 4);
        assert_eq!(eval.category_scores.len(), 7);
        assert_eq!(eval.improvements, vec!["confirm resolution".to_string()]);

        assert!(broker.pending(FAILED_JOBS).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_output_fails_call_and_dead_letters() {
        let temp = TempDir::new().unwrap();
        let (worker, store, broker) =
            worker_with(&temp, FakeModel::returning("```json\nnot really\n```"));
        let call_id = seed_call(&store);

        worker.handle(EvaluationJob { call_id }).await.unwrap();

        let call = store.get_call(call_id).unwrap().unwrap();
        assert_eq!(call.status, CallStatus::Failed);
        assert!(call
            .error_message
            .unwrap()
            .starts_with("Evaluation failed:"));

        let failed = broker.pending(FAILED_JOBS).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert!(store.get_evaluation(call_id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_no_active_prompt_fails_call_and_dead_letters() {
        let temp = TempDir::new().unwrap();
        let (worker, store, broker) = worker_with(
            &temp,
            FakeModel::returning(&model_response([3; 7])),
        );
        let call_id = seed_call(&store);

        store.deactivate_prompt(prompts::QUALITY_EVAL).unwrap();

        worker.handle(EvaluationJob { call_id }).await.unwrap();

        let call = store.get_call(call_id).unwrap().unwrap();
        assert_eq!(call.status, CallStatus::Failed);
        assert!(call
            .error_message
            .unwrap()
            .contains("No active QUALITY_EVAL prompt"));

        let failed = broker.pending(FAILED_JOBS).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert!(store.get_evaluation(call_id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_transcript_is_terminal_failure() {
        let temp = TempDir::new().unwrap();
        let (worker, store, broker) = worker_with(
            &temp,
            FakeModel::returning(&model_response([3; 7])),
        );

        // Call exists but was never transcribed
        let call_id = Uuid::new_v4();
        store.create_call(call_id, Path::new("/a.mp3")).unwrap();

        worker.handle(EvaluationJob { call_id }).await.unwrap();

        let call = store.get_call(call_id).unwrap().unwrap();
        assert_eq!(call.status, CallStatus::Failed);
        assert_eq!(broker.pending(FAILED_JOBS).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_redelivered_job_is_noop_after_evaluated() {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(CallStore::open_in_memory().unwrap());
        let broker = Arc::new(FileBroker::new(temp.path().join("queues")));
        let call_id = seed_call(&store);

        let model = FakeModel {
            responses: Mutex::new(vec![
                Ok(model_response([3; 7])),
                Ok(model_response([5; 7])),
            ]),
        };
        let worker = EvaluationWorker::new(
            Arc::clone(&store),
            Arc::clone(&broker),
            Arc::new(model),
            RetryPolicy::default(),
        );

        worker.handle(EvaluationJob { call_id }).await.unwrap();
        worker.handle(EvaluationJob { call_id }).await.unwrap();

        // First response (popped from the end) wins; the redelivery is
        // skipped without inserting a second row
        let eval = store.get_evaluation(call_id).unwrap().unwrap();
        assert_eq!(eval.overall_score, 5);
    }
}
