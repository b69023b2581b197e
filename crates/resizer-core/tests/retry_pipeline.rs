//! End-to-end retry pipeline against the in-memory broker.
//!
//! Time is paused: whenever every task is idle the runtime jumps to the next
//! timer, so a 30 s retry-queue TTL elapses instantly.

use std::sync::Arc;
use std::time::Duration;

use resizer_core::app::{
    ConsumerConfig, DeliveryOutcome, IdempotentProcessor, Settlement, TopologyConfig, Worker,
    WorkerBuilder, WorkerError,
};
use resizer_core::domain::{BrokerError, DeathReason, RetryPolicy};
use resizer_core::impls::{InMemoryBroker, InMemoryCacheStore, ScriptedProcessor, SettleKind};
use resizer_core::ports::{MessageBroker, TaskProcessor};
use serde_json::Value;
use tokio::sync::watch;

const LABEL: &str = "resize-image";
const BODY: &[u8] = br#"{"id":"t-1","type":"resize-image","userId":"u-1","payload":{"imageUrl":"http://img/a.png","width":100,"height":0}}"#;

fn build(broker: &Arc<InMemoryBroker>, processor: Arc<dyn TaskProcessor>) -> Worker {
    WorkerBuilder::new()
        .broker(broker.clone())
        .processor(processor)
        .topology(TopologyConfig::new("tasks", "jobs", "resize"))
        .consumer(ConsumerConfig {
            retry_policy: RetryPolicy::new(3),
            ..ConsumerConfig::default()
        })
        .build()
        .unwrap()
}

/// Declare, publish `BODY`, then handle deliveries until one is not sent around the retry cycle.
async fn drive_until_settled(broker: &Arc<InMemoryBroker>, worker: &Worker) -> Vec<DeliveryOutcome> {
    worker.topology.declare(broker.as_ref()).await.unwrap();
    broker.publish("tasks", "resize", BODY).await.unwrap();

    let worker_loop = worker.worker_loop();
    let mut deliveries = broker.consume("jobs").await.unwrap();
    let mut outcomes = Vec::new();
    loop {
        let delivery = deliveries.recv().await.unwrap();
        let outcome = worker_loop.handle_delivery(delivery).await.unwrap();
        outcomes.push(outcome);
        if outcome.settlement != Settlement::Nacked {
            return outcomes;
        }
    }
}

#[tokio::test(start_paused = true)]
async fn first_attempt_success_is_acked_once() {
    let broker = Arc::new(InMemoryBroker::new());
    let processor = Arc::new(ScriptedProcessor::succeeding());
    let worker = build(&broker, processor.clone());

    let outcomes = drive_until_settled(&broker, &worker).await;

    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].settlement, Settlement::Acked);
    assert_eq!(broker.settlements(), vec![SettleKind::Ack]);
    assert_eq!(worker.metrics.retries(LABEL), 0);
    assert_eq!(worker.metrics.processed(LABEL, "success"), 1);
    assert_eq!(processor.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn transient_failures_retry_then_succeed() {
    let broker = Arc::new(InMemoryBroker::new());
    let processor = Arc::new(ScriptedProcessor::failing_first(2));
    let worker = build(&broker, processor.clone());

    let outcomes = drive_until_settled(&broker, &worker).await;

    let counts: Vec<u32> = outcomes.iter().map(|o| o.retry_count).collect();
    assert_eq!(counts, vec![0, 1, 2]);
    assert_eq!(outcomes.last().unwrap().settlement, Settlement::Acked);
    assert_eq!(
        broker.settlements(),
        vec![
            SettleKind::Nack { requeue: false },
            SettleKind::Nack { requeue: false },
            SettleKind::Ack,
        ]
    );
    assert_eq!(worker.metrics.retries(LABEL), 2);
    assert_eq!(worker.metrics.processed(LABEL, "failed"), 2);
    assert_eq!(worker.metrics.processed(LABEL, "success"), 1);
    assert_eq!(broker.queue_len("jobs.dead"), 0);
}

#[tokio::test(start_paused = true)]
async fn persistent_failure_lands_in_dead_queue_exactly_once() {
    let broker = Arc::new(InMemoryBroker::new());
    let worker = build(&broker, Arc::new(ScriptedProcessor::always_failing()));

    let outcomes = drive_until_settled(&broker, &worker).await;

    let settlements: Vec<Settlement> = outcomes.iter().map(|o| o.settlement).collect();
    assert_eq!(
        settlements,
        vec![
            Settlement::Nacked,
            Settlement::Nacked,
            Settlement::Nacked,
            Settlement::DeadLettered,
        ]
    );
    assert_eq!(outcomes.last().unwrap().retry_count, 3);

    // the raw body, untouched
    assert_eq!(broker.messages("jobs.dead"), vec![BODY.to_vec()]);
    assert_eq!(broker.queue_len("jobs"), 0);
    assert_eq!(broker.queue_len("jobs.retry"), 0);
    assert_eq!(worker.metrics.dropped(LABEL), 1);
    assert_eq!(worker.metrics.retries(LABEL), 3);
    assert_eq!(broker.settlements().last(), Some(&SettleKind::Ack));
}

#[tokio::test(start_paused = true)]
async fn retry_history_accumulates_across_cycles() {
    let broker = Arc::new(InMemoryBroker::new());
    let worker = build(&broker, Arc::new(ScriptedProcessor::always_failing()));
    worker.topology.declare(broker.as_ref()).await.unwrap();
    broker.publish("tasks", "resize", BODY).await.unwrap();

    let worker_loop = worker.worker_loop();
    let mut deliveries = broker.consume("jobs").await.unwrap();
    worker_loop
        .handle_delivery(deliveries.recv().await.unwrap())
        .await
        .unwrap();

    let second = deliveries.recv().await.unwrap();
    let history = second.death_history().clone();
    assert_eq!(history.retry_count("jobs"), 1);
    let reasons: Vec<DeathReason> = history.records().iter().map(|r| r.reason).collect();
    assert_eq!(reasons, vec![DeathReason::Expired, DeathReason::Rejected]);
    second.ack().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn redelivered_completed_task_is_served_from_cache() {
    let broker = Arc::new(InMemoryBroker::new());
    let store = Arc::new(InMemoryCacheStore::new());
    let inner = Arc::new(ScriptedProcessor::succeeding());
    let processor = Arc::new(IdempotentProcessor::new(inner.clone(), store.clone(), LABEL));
    let worker = build(&broker, processor);

    drive_until_settled(&broker, &worker).await;
    // the producer sends the same logical job again
    broker.publish("tasks", "resize", BODY).await.unwrap();
    let mut deliveries = broker.consume("jobs").await.unwrap();
    let outcome = worker
        .worker_loop()
        .handle_delivery(deliveries.recv().await.unwrap())
        .await
        .unwrap();

    assert_eq!(outcome.settlement, Settlement::Acked);
    assert_eq!(inner.calls(), 1);

    let published = store.published();
    assert_eq!(published.len(), 2);
    assert!(published.iter().all(|(channel, _)| channel == "task:t-1:status"));
    let first: Value = serde_json::from_slice(&published[0].1).unwrap();
    let second: Value = serde_json::from_slice(&published[1].1).unwrap();
    assert_eq!(first, second);
    assert_eq!(first["url"], "https://storage.local/t-1");
}

#[tokio::test(start_paused = true)]
async fn run_drains_retries_and_stops_on_shutdown() {
    let broker = Arc::new(InMemoryBroker::new());
    let processor = Arc::new(ScriptedProcessor::failing_first(1));
    let worker = Arc::new(build(&broker, processor.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let running = tokio::spawn({
        let worker = Arc::clone(&worker);
        async move { worker.run(shutdown_rx).await }
    });

    // let the topology get declared before publishing
    tokio::time::sleep(Duration::from_millis(10)).await;
    broker.publish("tasks", "resize", BODY).await.unwrap();
    broker
        .publish("tasks", "resize", br#"{"id":"t-2","payload":{}}"#)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(45)).await;
    shutdown_tx.send(true).unwrap();
    running.await.unwrap().unwrap();

    let settlements = broker.settlements();
    let acks = settlements.iter().filter(|s| **s == SettleKind::Ack).count();
    assert_eq!(acks, 2);
    assert_eq!(processor.calls(), 3);
    assert_eq!(broker.queue_len("jobs"), 0);
    assert_eq!(broker.queue_len("jobs.retry"), 0);
}

#[tokio::test(start_paused = true)]
async fn closed_delivery_stream_is_an_error() {
    let broker = Arc::new(InMemoryBroker::new());
    let worker = Arc::new(build(&broker, Arc::new(ScriptedProcessor::succeeding())));

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let running = tokio::spawn({
        let worker = Arc::clone(&worker);
        async move { worker.run(shutdown_rx).await }
    });

    tokio::time::sleep(Duration::from_millis(10)).await;
    broker.close();

    let result = running.await.unwrap();
    assert!(matches!(result, Err(WorkerError::Broker(BrokerError::Closed))));
}
