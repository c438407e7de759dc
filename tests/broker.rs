//! Broker delivery semantics: ordering, ack/requeue dispatch and the
//! redelivery bound.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tempfile::TempDir;

use callqa::broker::{FileBroker, JobHandler};
use callqa::domain::WorkerError;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Ping {
    n: usize,
}

/// Handler scripted to fail the first `failures` deliveries it sees
struct Flaky {
    failures: usize,
    calls: AtomicUsize,
}

#[async_trait]
impl JobHandler<Ping> for Flaky {
    async fn handle(&self, _job: Ping) -> Result<(), WorkerError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.failures {
            Err(WorkerError::structural("collaborator down"))
        } else {
            Ok(())
        }
    }
}

#[tokio::test]
async fn deliveries_preserve_publish_order() {
    let temp = TempDir::new().unwrap();
    let broker = FileBroker::new(temp.path());

    for n in 0..5 {
        broker.publish("pings", &Ping { n }).await.unwrap();
    }

    let pending = broker.pending("pings").await.unwrap();
    let order: Vec<usize> = pending
        .iter()
        .map(|d| serde_json::from_value::<Ping>(d.payload.clone()).unwrap().n)
        .collect();
    assert_eq!(order, vec![0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn failed_delivery_requeues_then_succeeds() {
    let temp = TempDir::new().unwrap();
    let broker = Arc::new(FileBroker::new(temp.path()));
    broker.publish("pings", &Ping { n: 1 }).await.unwrap();

    let handler = Arc::new(Flaky {
        failures: 1,
        calls: AtomicUsize::new(0),
    });

    let stats = broker
        .process_available::<Ping, _>("pings", Arc::clone(&handler), 1)
        .await
        .unwrap();
    assert_eq!(stats.requeued, 1);

    // Requeued message is deliverable again on the next pass
    let stats = broker
        .process_available::<Ping, _>("pings", handler, 1)
        .await
        .unwrap();
    assert_eq!(stats.acked, 1);

    let queue = broker.queue_stats("pings").await.unwrap();
    assert_eq!(queue.pending, 0);
    assert_eq!(queue.acked, 1);
}

#[tokio::test]
async fn redelivery_bound_dead_letters_with_payload() {
    let temp = TempDir::new().unwrap();
    let broker = Arc::new(FileBroker::new(temp.path()).with_max_redeliveries(2));
    broker.publish("pings", &Ping { n: 7 }).await.unwrap();

    let handler = Arc::new(Flaky {
        failures: usize::MAX,
        calls: AtomicUsize::new(0),
    });

    // Two requeues, then the third failure crosses the bound
    for _ in 0..2 {
        let stats = broker
            .process_available::<Ping, _>("pings", Arc::clone(&handler), 1)
            .await
            .unwrap();
        assert_eq!(stats.requeued, 1);
    }
    let stats = broker
        .process_available::<Ping, _>("pings", Arc::clone(&handler), 1)
        .await
        .unwrap();
    assert_eq!(stats.dead, 1);

    // Out of circulation: nothing left to deliver
    assert!(broker.pending("pings").await.unwrap().is_empty());
    let stats = broker
        .process_available::<Ping, _>("pings", handler, 1)
        .await
        .unwrap();
    assert_eq!(stats.handled(), 0);

    // The side file keeps the payload and last error for operators
    let dead = broker.dead_letters("pings").await.unwrap();
    assert_eq!(dead.len(), 1);
    let payload: Ping = serde_json::from_value(dead[0].payload.clone().unwrap()).unwrap();
    assert_eq!(payload.n, 7);
    assert_eq!(dead[0].error.as_deref(), Some("collaborator down"));
}

#[tokio::test]
async fn malformed_payload_is_bounded_not_poisonous() {
    let temp = TempDir::new().unwrap();
    let broker = Arc::new(FileBroker::new(temp.path()).with_max_redeliveries(1));

    // A payload the handler's job type cannot deserialize
    broker
        .publish("pings", &serde_json::json!({"unexpected": true}))
        .await
        .unwrap();

    let handler = Arc::new(Flaky {
        failures: 0,
        calls: AtomicUsize::new(0),
    });

    let stats = broker
        .process_available::<Ping, _>("pings", Arc::clone(&handler), 1)
        .await
        .unwrap();
    assert_eq!(stats.requeued, 1);
    // Handler never saw the malformed message
    assert_eq!(handler.calls.load(Ordering::SeqCst), 0);

    let stats = broker
        .process_available::<Ping, _>("pings", handler, 1)
        .await
        .unwrap();
    assert_eq!(stats.dead, 1);
    assert_eq!(broker.queue_stats("pings").await.unwrap().dead, 1);
}

/// Handler that counts invocations and lingers to widen any race window
struct Slow {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl JobHandler<Ping> for Slow {
    async fn handle(&self, _job: Ping) -> Result<(), WorkerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn competing_instances_deliver_each_message_once() {
    let temp = TempDir::new().unwrap();

    // Two broker instances over one queue directory, as when multiple
    // worker processes share a queue
    let first = Arc::new(FileBroker::new(temp.path()));
    let second = Arc::new(FileBroker::new(temp.path()));
    first.publish("pings", &Ping { n: 1 }).await.unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let handler_a = Arc::new(Slow {
        calls: Arc::clone(&calls),
    });
    let handler_b = Arc::new(Slow {
        calls: Arc::clone(&calls),
    });

    let (stats_a, stats_b) = tokio::join!(
        first.process_available::<Ping, _>("pings", handler_a, 1),
        second.process_available::<Ping, _>("pings", handler_b, 1),
    );

    // The consumer lock serializes the passes: one instance handles the
    // message, the other replays an already-acked queue
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(stats_a.unwrap().acked + stats_b.unwrap().acked, 1);

    let stats = first.queue_stats("pings").await.unwrap();
    assert_eq!(stats.acked, 1);
    assert_eq!(stats.pending, 0);
}

#[tokio::test]
async fn state_survives_broker_restart() {
    let temp = TempDir::new().unwrap();

    let first = FileBroker::new(temp.path());
    let id_a = first.publish("pings", &Ping { n: 1 }).await.unwrap();
    first.publish("pings", &Ping { n: 2 }).await.unwrap();
    first.ack("pings", id_a).await.unwrap();

    // New instance replays the same log
    let second = FileBroker::new(temp.path());
    let pending = second.pending("pings").await.unwrap();
    assert_eq!(pending.len(), 1);
    let remaining: Ping = serde_json::from_value(pending[0].payload.clone()).unwrap();
    assert_eq!(remaining.n, 2);
}
