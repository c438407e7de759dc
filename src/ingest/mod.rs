//! Ingestion: file discovery and pipeline seeding.
//!
//! The watcher finds audio recordings (bootstrap scan + live file
//! events), assigns each new file a call identity, and enqueues the
//! first job. The ledger is the durable memory of which paths have
//! already been enqueued, so repeated scans and restarts never seed the
//! same recording twice.
//!
//! ```text
//! recordings dir → CallWatcher → transcription_jobs
//!                     │
//!                 ledger.jsonl
//! ```

pub mod ledger;
pub mod watcher;

pub use ledger::{FileLedger, Ledger};
pub use watcher::{CallWatcher, EnqueueOutcome, ScanResult, WatchHandle, WatcherConfig};
