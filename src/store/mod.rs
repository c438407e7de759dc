//! Call state store: the persisted source of truth for every call.
//!
//! SQLite-backed. All components read and write call lifecycle state
//! through this store; each logical write is one transaction. Status
//! updates are validated against the call state machine, and transcript
//! inserts are idempotent per call so redelivered jobs cannot duplicate
//! rows.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::{Call, CallStatus, CategoryScore, Evaluation, Prompt, Segment, Transcript};
use crate::domain::WorkerError;
use crate::prompts;

/// Errors from store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("No call found with id {0}")]
    CallNotFound(Uuid),

    #[error("Illegal status transition for call {call_id}: {from} → {to}")]
    IllegalTransition {
        call_id: Uuid,
        from: CallStatus,
        to: CallStatus,
    },

    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

impl From<StoreError> for WorkerError {
    fn from(err: StoreError) -> Self {
        match err {
            // Business-level: retrying will not help
            StoreError::CallNotFound(_) | StoreError::IllegalTransition { .. } => {
                WorkerError::terminal(err.to_string())
            }
            // Store unreachable or damaged: let the broker requeue
            other => WorkerError::structural(other.to_string()),
        }
    }
}

/// SQLite-backed call state store
pub struct CallStore {
    conn: Mutex<Connection>,
}

impl CallStore {
    /// Open (or create) the store at the given path and run migrations
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// In-memory store for tests
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A poisoned lock only means another thread panicked mid-query;
        // the connection itself is still usable.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn migrate(&self) -> Result<(), StoreError> {
        let conn = self.conn();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS calls (
                id               TEXT PRIMARY KEY,
                audio_path       TEXT NOT NULL,
                duration_seconds REAL,
                status           TEXT NOT NULL,
                error_message    TEXT,
                created_at       TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS transcripts (
                id                TEXT PRIMARY KEY,
                call_id           TEXT NOT NULL UNIQUE REFERENCES calls(id),
                model_name        TEXT NOT NULL,
                language          TEXT NOT NULL,
                transcript_text   TEXT NOT NULL,
                segments          TEXT NOT NULL,
                timestamped_text  TEXT NOT NULL,
                created_at        TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS evaluations (
                id                TEXT PRIMARY KEY,
                call_id           TEXT NOT NULL REFERENCES calls(id),
                evaluator_type    TEXT NOT NULL,
                evaluator_version TEXT NOT NULL,
                overall_score     INTEGER NOT NULL,
                category_scores   TEXT NOT NULL,
                strengths         TEXT NOT NULL,
                improvements      TEXT NOT NULL,
                raw_output        TEXT NOT NULL,
                human_output      TEXT,
                created_at        TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS prompts (
                name      TEXT NOT NULL,
                version   TEXT NOT NULL,
                content   TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (name, version)
            );",
        )?;

        // Seed the default evaluation prompt on a fresh database
        let existing: i64 = conn.query_row(
            "SELECT COUNT(*) FROM prompts WHERE name = ?1",
            params![prompts::QUALITY_EVAL],
            |row| row.get(0),
        )?;
        if existing == 0 {
            conn.execute(
                "INSERT INTO prompts (name, version, content, is_active) VALUES (?1, ?2, ?3, 1)",
                params![
                    prompts::QUALITY_EVAL,
                    prompts::QUALITY_EVAL_SEED_VERSION,
                    prompts::QUALITY_EVAL_SEED_CONTENT,
                ],
            )?;
        }

        Ok(())
    }

    // -----
    // Calls
    // -----

    /// Insert a new call in TRANSCRIPTION_QUEUE
    pub fn create_call(&self, call_id: Uuid, audio_path: &Path) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO calls (id, audio_path, status, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                call_id.to_string(),
                audio_path.to_string_lossy(),
                CallStatus::TranscriptionQueue.as_str(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_call(&self, call_id: Uuid) -> Result<Option<Call>, StoreError> {
        let row: Option<CallRow> = self
            .conn()
            .query_row(
                "SELECT id, audio_path, duration_seconds, status, error_message, created_at
                 FROM calls WHERE id = ?1",
                params![call_id.to_string()],
                |row| {
                    Ok(CallRow {
                        id: row.get(0)?,
                        audio_path: row.get(1)?,
                        duration_seconds: row.get(2)?,
                        status: row.get(3)?,
                        error_message: row.get(4)?,
                        created_at: row.get(5)?,
                    })
                },
            )
            .optional()?;

        row.map(CallRow::into_call).transpose()
    }

    /// All calls, newest first
    pub fn list_calls(&self) -> Result<Vec<Call>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, audio_path, duration_seconds, status, error_message, created_at
             FROM calls ORDER BY created_at DESC",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok(CallRow {
                id: row.get(0)?,
                audio_path: row.get(1)?,
                duration_seconds: row.get(2)?,
                status: row.get(3)?,
                error_message: row.get(4)?,
                created_at: row.get(5)?,
            })
        })?;

        let mut calls = Vec::new();
        for row in rows {
            calls.push(row?.into_call()?);
        }
        Ok(calls)
    }

    /// Advance a call through the state machine.
    ///
    /// Validates the transition against the current status inside one
    /// transaction; a same-status update is an idempotent no-op.
    pub fn update_call_status(
        &self,
        call_id: Uuid,
        status: CallStatus,
        error_message: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let current: Option<String> = tx
            .query_row(
                "SELECT status FROM calls WHERE id = ?1",
                params![call_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;

        let current = current.ok_or(StoreError::CallNotFound(call_id))?;
        let current: CallStatus = current.parse().map_err(StoreError::Corrupt)?;

        if !current.can_transition_to(status) {
            return Err(StoreError::IllegalTransition {
                call_id,
                from: current,
                to: status,
            });
        }

        tx.execute(
            "UPDATE calls SET status = ?1, error_message = ?2 WHERE id = ?3",
            params![status.as_str(), error_message, call_id.to_string()],
        )?;
        tx.commit()?;

        Ok(())
    }

    // -----------
    // Transcripts
    // -----------

    /// Persist a transcript and the call's audio duration in one
    /// transaction.
    ///
    /// At most one transcript exists per call; inserting again for the
    /// same call is a no-op (redelivery tolerance). Returns whether a row
    /// was actually inserted.
    pub fn save_transcript(
        &self,
        transcript: &Transcript,
        duration_seconds: Option<f64>,
    ) -> Result<bool, StoreError> {
        let segments = serde_json::to_string(&transcript.segments)?;

        let mut conn = self.conn();
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT OR IGNORE INTO transcripts
             (id, call_id, model_name, language, transcript_text, segments, timestamped_text, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                transcript.id.to_string(),
                transcript.call_id.to_string(),
                transcript.model_name,
                transcript.language,
                transcript.text,
                segments,
                transcript.timestamped_text,
                Utc::now().to_rfc3339(),
            ],
        )?;
        let inserted = tx.changes() == 1;

        if let Some(duration) = duration_seconds {
            tx.execute(
                "UPDATE calls SET duration_seconds = ?1
                 WHERE id = ?2 AND duration_seconds IS NULL",
                params![duration, transcript.call_id.to_string()],
            )?;
        }

        tx.commit()?;
        Ok(inserted)
    }

    pub fn get_transcript(&self, call_id: Uuid) -> Result<Option<Transcript>, StoreError> {
        let row: Option<(String, String, String, String, String, String)> = self
            .conn()
            .query_row(
                "SELECT id, model_name, language, transcript_text, segments, timestamped_text
                 FROM transcripts WHERE call_id = ?1",
                params![call_id.to_string()],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                    ))
                },
            )
            .optional()?;

        let Some((id, model_name, language, text, segments, timestamped_text)) = row else {
            return Ok(None);
        };

        let segments: Vec<Segment> = serde_json::from_str(&segments)?;
        Ok(Some(Transcript {
            id: parse_uuid(&id)?,
            call_id,
            model_name,
            language,
            text,
            segments,
            timestamped_text,
        }))
    }

    // -----------
    // Evaluations
    // -----------

    /// Persist an evaluation and advance the call to EVALUATED, as one
    /// atomic transaction.
    ///
    /// If the call is already EVALUATED the whole write is skipped
    /// (redelivery tolerance). Returns whether the evaluation was stored.
    pub fn save_evaluation_and_advance(&self, eval: &Evaluation) -> Result<bool, StoreError> {
        let category_scores = serde_json::to_string(&eval.category_scores)?;
        let strengths = serde_json::to_string(&eval.strengths)?;
        let improvements = serde_json::to_string(&eval.improvements)?;
        let raw_output = serde_json::to_string(&eval.raw_output)?;

        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let current: Option<String> = tx
            .query_row(
                "SELECT status FROM calls WHERE id = ?1",
                params![eval.call_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        let current = current.ok_or(StoreError::CallNotFound(eval.call_id))?;
        let current: CallStatus = current.parse().map_err(StoreError::Corrupt)?;

        if current == CallStatus::Evaluated {
            return Ok(false);
        }
        if !current.can_transition_to(CallStatus::Evaluated) {
            return Err(StoreError::IllegalTransition {
                call_id: eval.call_id,
                from: current,
                to: CallStatus::Evaluated,
            });
        }

        tx.execute(
            "INSERT INTO evaluations
             (id, call_id, evaluator_type, evaluator_version, overall_score,
              category_scores, strengths, improvements, raw_output, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                eval.id.to_string(),
                eval.call_id.to_string(),
                eval.evaluator_type,
                eval.evaluator_version,
                eval.overall_score,
                category_scores,
                strengths,
                improvements,
                raw_output,
                eval.created_at.to_rfc3339(),
            ],
        )?;
        tx.execute(
            "UPDATE calls SET status = ?1, error_message = NULL WHERE id = ?2",
            params![CallStatus::Evaluated.as_str(), eval.call_id.to_string()],
        )?;

        tx.commit()?;
        Ok(true)
    }

    /// Latest evaluation for a call, if any
    pub fn get_evaluation(&self, call_id: Uuid) -> Result<Option<Evaluation>, StoreError> {
        let row: Option<EvaluationRow> = self
            .conn()
            .query_row(
                "SELECT id, evaluator_type, evaluator_version, overall_score,
                        category_scores, strengths, improvements, raw_output,
                        human_output, created_at
                 FROM evaluations WHERE call_id = ?1
                 ORDER BY created_at DESC LIMIT 1",
                params![call_id.to_string()],
                |row| {
                    Ok(EvaluationRow {
                        id: row.get(0)?,
                        evaluator_type: row.get(1)?,
                        evaluator_version: row.get(2)?,
                        overall_score: row.get(3)?,
                        category_scores: row.get(4)?,
                        strengths: row.get(5)?,
                        improvements: row.get(6)?,
                        raw_output: row.get(7)?,
                        human_output: row.get(8)?,
                        created_at: row.get(9)?,
                    })
                },
            )
            .optional()?;

        row.map(|r| r.into_evaluation(call_id)).transpose()
    }

    // -------
    // Prompts
    // -------

    /// The single active prompt version for a name, if one exists
    pub fn get_active_prompt(&self, name: &str) -> Result<Option<Prompt>, StoreError> {
        let row = self
            .conn()
            .query_row(
                "SELECT name, version, content FROM prompts
                 WHERE name = ?1 AND is_active = 1 LIMIT 1",
                params![name],
                |row| {
                    Ok(Prompt {
                        name: row.get(0)?,
                        version: row.get(1)?,
                        content: row.get(2)?,
                        is_active: true,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Insert a new prompt version and make it the only active one for
    /// its name, in one transaction.
    pub fn activate_prompt(
        &self,
        name: &str,
        version: &str,
        content: &str,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        tx.execute(
            "UPDATE prompts SET is_active = 0 WHERE name = ?1",
            params![name],
        )?;
        tx.execute(
            "INSERT OR REPLACE INTO prompts (name, version, content, is_active)
             VALUES (?1, ?2, ?3, 1)",
            params![name, version, content],
        )?;

        tx.commit()?;
        Ok(())
    }

    /// Pull every version of a prompt out of service without activating
    /// a replacement. Workers needing the prompt fail terminally until a
    /// version is activated again.
    pub fn deactivate_prompt(&self, name: &str) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE prompts SET is_active = 0 WHERE name = ?1",
            params![name],
        )?;
        Ok(())
    }
}

/// Raw calls row before type conversion
struct CallRow {
    id: String,
    audio_path: String,
    duration_seconds: Option<f64>,
    status: String,
    error_message: Option<String>,
    created_at: String,
}

impl CallRow {
    fn into_call(self) -> Result<Call, StoreError> {
        Ok(Call {
            id: parse_uuid(&self.id)?,
            audio_path: PathBuf::from(self.audio_path),
            duration_seconds: self.duration_seconds,
            status: self.status.parse().map_err(StoreError::Corrupt)?,
            error_message: self.error_message,
            created_at: parse_timestamp(&self.created_at)?,
        })
    }
}

/// Raw evaluations row before type conversion
struct EvaluationRow {
    id: String,
    evaluator_type: String,
    evaluator_version: String,
    overall_score: u8,
    category_scores: String,
    strengths: String,
    improvements: String,
    raw_output: String,
    human_output: Option<String>,
    created_at: String,
}

impl EvaluationRow {
    fn into_evaluation(self, call_id: Uuid) -> Result<Evaluation, StoreError> {
        let category_scores: BTreeMap<String, CategoryScore> =
            serde_json::from_str(&self.category_scores)?;
        let human_output = self
            .human_output
            .map(|s| serde_json::from_str(&s))
            .transpose()?;

        Ok(Evaluation {
            id: parse_uuid(&self.id)?,
            call_id,
            evaluator_type: self.evaluator_type,
            evaluator_version: self.evaluator_version,
            overall_score: self.overall_score,
            category_scores,
            strengths: serde_json::from_str(&self.strengths)?,
            improvements: serde_json::from_str(&self.improvements)?,
            raw_output: serde_json::from_str(&self.raw_output)?,
            human_output,
            created_at: parse_timestamp(&self.created_at)?,
        })
    }
}

fn parse_uuid(s: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(s).map_err(|e| StoreError::Corrupt(format!("bad uuid {}: {}", s, e)))
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp {}: {}", s, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::timestamped_rendering;

    fn test_store() -> CallStore {
        CallStore::open_in_memory().unwrap()
    }

    fn test_transcript(call_id: Uuid) -> Transcript {
        let segments = vec![Segment {
            start: 0.0,
            end: 2.0,
            text: "Hello there".to_string(),
        }];
        Transcript {
            id: Uuid::new_v4(),
            call_id,
            model_name: "whisper-base".to_string(),
            language: "en".to_string(),
            text: "Hello there".to_string(),
            timestamped_text: timestamped_rendering(&segments),
            segments,
        }
    }

    #[test]
    fn test_create_and_get_call() {
        let store = test_store();
        let call_id = Uuid::new_v4();
        store
            .create_call(call_id, Path::new("/data/calls/a.mp3"))
            .unwrap();

        let call = store.get_call(call_id).unwrap().unwrap();
        assert_eq!(call.status, CallStatus::TranscriptionQueue);
        assert_eq!(call.audio_path, PathBuf::from("/data/calls/a.mp3"));
        assert!(call.error_message.is_none());
        assert!(call.duration_seconds.is_none());
    }

    #[test]
    fn test_status_transition_enforced() {
        let store = test_store();
        let call_id = Uuid::new_v4();
        store.create_call(call_id, Path::new("/a.mp3")).unwrap();

        // TRANSCRIPTION_QUEUE → EVALUATED is illegal
        let err = store
            .update_call_status(call_id, CallStatus::Evaluated, None)
            .unwrap_err();
        assert!(matches!(err, StoreError::IllegalTransition { .. }));

        store
            .update_call_status(call_id, CallStatus::EvaluationQueue, None)
            .unwrap();
        // Redelivered job repeats the same write: no-op, not an error
        store
            .update_call_status(call_id, CallStatus::EvaluationQueue, None)
            .unwrap();

        let call = store.get_call(call_id).unwrap().unwrap();
        assert_eq!(call.status, CallStatus::EvaluationQueue);
    }

    #[test]
    fn test_update_missing_call() {
        let store = test_store();
        let err = store
            .update_call_status(Uuid::new_v4(), CallStatus::Failed, Some("boom"))
            .unwrap_err();
        assert!(matches!(err, StoreError::CallNotFound(_)));
    }

    #[test]
    fn test_transcript_insert_is_idempotent() {
        let store = test_store();
        let call_id = Uuid::new_v4();
        store.create_call(call_id, Path::new("/a.mp3")).unwrap();

        let transcript = test_transcript(call_id);
        assert!(store.save_transcript(&transcript, Some(2.0)).unwrap());

        // Second write for the same call is ignored
        let again = test_transcript(call_id);
        assert!(!store.save_transcript(&again, Some(2.0)).unwrap());

        let stored = store.get_transcript(call_id).unwrap().unwrap();
        assert_eq!(stored.id, transcript.id);
        assert_eq!(stored.segments.len(), 1);

        let call = store.get_call(call_id).unwrap().unwrap();
        assert_eq!(call.duration_seconds, Some(2.0));
    }

    #[test]
    fn test_evaluation_advances_status_atomically() {
        let store = test_store();
        let call_id = Uuid::new_v4();
        store.create_call(call_id, Path::new("/a.mp3")).unwrap();
        store
            .update_call_status(call_id, CallStatus::EvaluationQueue, None)
            .unwrap();

        let eval = Evaluation {
            id: Uuid::new_v4(),
            call_id,
            evaluator_type: "agentic".to_string(),
            evaluator_version: "0.1".to_string(),
            overall_score: 4,
            category_scores: BTreeMap::new(),
            strengths: vec!["clear greeting".to_string()],
            improvements: vec![],
            raw_output: serde_json::json!({"overall_score": 4}),
            human_output: None,
            created_at: Utc::now(),
        };

        assert!(store.save_evaluation_and_advance(&eval).unwrap());
        let call = store.get_call(call_id).unwrap().unwrap();
        assert_eq!(call.status, CallStatus::Evaluated);

        // Redelivered evaluation job: skipped, no duplicate row
        assert!(!store.save_evaluation_and_advance(&eval).unwrap());

        let stored = store.get_evaluation(call_id).unwrap().unwrap();
        assert_eq!(stored.overall_score, 4);
        assert_eq!(stored.strengths, vec!["clear greeting".to_string()]);
    }

    #[test]
    fn test_default_prompt_seeded_and_active() {
        let store = test_store();
        let prompt = store
            .get_active_prompt(crate::prompts::QUALITY_EVAL)
            .unwrap()
            .unwrap();

        assert_eq!(prompt.version, crate::prompts::QUALITY_EVAL_SEED_VERSION);
        assert!(prompt.content.contains("{transcript}"));
        assert!(prompt.content.contains("greeting_and_introduction"));
    }

    #[test]
    fn test_activate_prompt_deactivates_previous() {
        let store = test_store();
        store
            .activate_prompt(crate::prompts::QUALITY_EVAL, "0.2", "new content {transcript}")
            .unwrap();

        let active = store
            .get_active_prompt(crate::prompts::QUALITY_EVAL)
            .unwrap()
            .unwrap();
        assert_eq!(active.version, "0.2");
    }

    #[test]
    fn test_no_active_prompt() {
        let store = test_store();
        assert!(store.get_active_prompt("NO_SUCH_PROMPT").unwrap().is_none());
    }

    #[test]
    fn test_deactivate_prompt_leaves_no_active_row() {
        let store = test_store();
        store.deactivate_prompt(crate::prompts::QUALITY_EVAL).unwrap();

        assert!(store
            .get_active_prompt(crate::prompts::QUALITY_EVAL)
            .unwrap()
            .is_none());
    }
}
