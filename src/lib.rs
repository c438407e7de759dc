//! callqa - Call recording QA pipeline.
//!
//! Watches a directory for call recordings and runs each one through a
//! two-stage pipeline: speech-to-text transcription (with PII
//! redaction), then an LLM quality evaluation against a versioned
//! prompt. Stages are decoupled by durable queues with at-least-once
//! delivery; the SQLite store is the source of truth for call state.
//!
//! ```text
//! recordings/ → ingest → transcription_jobs → transcription worker
//!                                                   │
//!                              evaluation_jobs ←────┘
//!                                    │
//!                            evaluation worker → store (EVALUATED)
//! ```

pub mod adapters;
pub mod broker;
pub mod cli;
pub mod config;
pub mod domain;
pub mod ingest;
pub mod prompts;
pub mod store;
pub mod workers;

pub use config::Config;
pub use store::CallStore;
