//! Stage workers and their shared machinery.
//!
//! Each worker implements [`crate::broker::JobHandler`] for its queue's
//! payload. The shared contract: transient collaborator failures are
//! retried in place with backoff; business failures mark the call FAILED
//! and dead-letter the job before acknowledging; only structural
//! failures propagate so the broker redelivers.

pub mod evaluation;
pub mod redact;
pub mod retry;
pub mod transcription;

pub use evaluation::{parse_evaluation, EvaluationWorker, CATEGORY_KEYS};
pub use redact::redact_pii;
pub use retry::{run_with_retry, RetryPolicy};
pub use transcription::TranscriptionWorker;
