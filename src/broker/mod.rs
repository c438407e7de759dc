//! Broker gateway: durable publish/consume with manual acknowledgment.
//!
//! Queues are append-only JSONL logs; a message is deliverable when its
//! log holds a `published` record with no matching `acked` or `dead`
//! record. Consumers take up to `max_in_flight` deliveries at a time,
//! invoke a typed [`JobHandler`], acknowledge on success and requeue on
//! failure. A message requeued more than the configured redelivery bound
//! is dead-lettered into a `<queue>.dead.jsonl` side file so a poison
//! message cannot loop forever.
//!
//! # Architecture
//!
//! ```text
//! publish ──append──▶ <queue>.jsonl ──replay──▶ pending ──▶ handler
//!                          ▲                                  │
//!                          └── acked / requeued / dead ◀──────┘
//! ```

pub mod file;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use crate::domain::WorkerError;

pub use file::{ConsumerHandle, Delivery, DrainStats, FileBroker, QueueStats};

/// Typed handler invoked once per delivery.
///
/// Returning `Ok` acknowledges the message. A structural or transient
/// error requeues it (bounded); a terminal error acknowledges it, since
/// the worker has already recorded the failure and dead-lettered the job.
#[async_trait]
pub trait JobHandler<J>: Send + Sync
where
    J: DeserializeOwned + Send + 'static,
{
    async fn handle(&self, job: J) -> Result<(), WorkerError>;
}
