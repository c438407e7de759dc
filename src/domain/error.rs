//! Tagged failure taxonomy for worker handlers.
//!
//! The broker's acknowledge/requeue decision dispatches on the kind:
//! - Transient: collaborator timeouts or rate limits; retried with backoff
//!   inside the worker, escalated once the retry budget is spent
//! - Terminal: business failures (missing transcript, malformed model
//!   output, no active prompt); never retried, the worker records FAILED
//!   and dead-letters before acknowledging
//! - Structural: the handler could not even attempt the work (malformed
//!   payload, store unreachable); requeued up to the redelivery bound

use thiserror::Error;

/// Classification of a worker failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Terminal,
    Structural,
}

/// A classified handler failure
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("{0}")]
    Transient(String),

    #[error("{0}")]
    Terminal(String),

    #[error("{0}")]
    Structural(String),
}

impl WorkerError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn terminal(msg: impl Into<String>) -> Self {
        Self::Terminal(msg.into())
    }

    pub fn structural(msg: impl Into<String>) -> Self {
        Self::Structural(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transient(_) => ErrorKind::Transient,
            Self::Terminal(_) => ErrorKind::Terminal,
            Self::Structural(_) => ErrorKind::Structural,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    pub fn is_structural(&self) -> bool {
        self.kind() == ErrorKind::Structural
    }
}
