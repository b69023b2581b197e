//! WorkerLoop - 配送を受け取り、処理して、決着させるループ
//!
//! # フロー（配送ごと）
//! 1. body を TaskMessage にデコード（失敗したら processor も breaker も通さない）
//! 2. death history から retry 回数を導出
//! 3. CircuitBreaker 経由で TaskProcessor を実行
//! 4. RetryPolicy で ack / nack / dead-letter を決定して決着
//!
//! # 並行性
//! 受信は 1 タスク、処理は配送ごとに spawn。同時に処理される配送数は
//! broker の prefetch が上限になります。

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{Instrument, error, info, info_span, warn};

use super::circuit_breaker::{BreakerError, CircuitBreaker};
use super::topology::Topology;
use crate::domain::{AckDecision, BrokerError, MalformedPolicy, RetryPolicy, TaskMessage};
use crate::observability::WorkerMetrics;
use crate::ports::broker::DEFAULT_EXCHANGE;
use crate::ports::{Delivery, MessageBroker, TaskProcessor};

pub const DEFAULT_PREFETCH: u16 = 1;
pub const DEFAULT_TASK_LABEL: &str = "resize-image";

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub prefetch: u16,
    pub retry_policy: RetryPolicy,
    pub malformed_policy: MalformedPolicy,
    /// `type` label on every metric this consumer records.
    pub task_label: String,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            prefetch: DEFAULT_PREFETCH,
            retry_policy: RetryPolicy::default(),
            malformed_policy: MalformedPolicy::default(),
            task_label: DEFAULT_TASK_LABEL.to_string(),
        }
    }
}

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Acked,
    /// Nacked without requeue, so it goes around the retry cycle.
    Nacked,
    /// Published to the dead queue, then acked.
    DeadLettered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryOutcome {
    pub settlement: Settlement,
    pub retry_count: u32,
    pub malformed: bool,
}

pub struct WorkerLoop {
    broker: Arc<dyn MessageBroker>,
    topology: Topology,
    breaker: Arc<CircuitBreaker>,
    processor: Arc<dyn TaskProcessor>,
    metrics: Arc<WorkerMetrics>,
    config: ConsumerConfig,
}

impl WorkerLoop {
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        topology: Topology,
        breaker: Arc<CircuitBreaker>,
        processor: Arc<dyn TaskProcessor>,
        metrics: Arc<WorkerMetrics>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            broker,
            topology,
            breaker,
            processor,
            metrics,
            config,
        }
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Consume until shutdown is requested or the broker closes the stream.
    ///
    /// On shutdown no new deliveries are taken and in-flight ones are awaited,
    /// never cancelled.
    pub async fn run(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), BrokerError> {
        self.broker.set_prefetch(self.config.prefetch).await?;
        let mut deliveries = self.broker.consume(&self.topology.queue).await?;
        let mut in_flight = JoinSet::new();

        info!(
            queue = %self.topology.queue,
            prefetch = self.config.prefetch,
            max_retries = self.config.retry_policy.max_retries,
            "consumer started"
        );

        let result = loop {
            if *shutdown.borrow() {
                break Ok(());
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    // sender dropped counts as shutdown
                    if changed.is_err() {
                        break Ok(());
                    }
                    continue;
                }
                delivery = deliveries.recv() => {
                    let Some(delivery) = delivery else {
                        warn!(queue = %self.topology.queue, "delivery stream closed by broker");
                        break Err(BrokerError::Closed);
                    };
                    let this = Arc::clone(&self);
                    in_flight.spawn(async move {
                        if let Err(err) = this.handle_delivery(delivery).await {
                            error!(error = %err, "failed to settle delivery");
                        }
                    });
                }
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(err) = joined {
                        error!(error = %err, "delivery task panicked");
                    }
                }
            }
        };

        // Buffered but unhandled deliveries go back to the broker.
        drop(deliveries);
        if !in_flight.is_empty() {
            info!(in_flight = in_flight.len(), "waiting for in-flight deliveries");
        }
        while let Some(joined) = in_flight.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "delivery task panicked");
            }
        }

        info!(queue = %self.topology.queue, "consumer stopped");
        result
    }

    /// Process one delivery and settle it exactly once.
    pub async fn handle_delivery(
        &self,
        delivery: Box<dyn Delivery>,
    ) -> Result<DeliveryOutcome, BrokerError> {
        let retry_count = delivery.death_history().retry_count(&self.topology.queue);

        let task = match TaskMessage::decode(delivery.body()) {
            Ok(task) => task,
            Err(err) => {
                warn!(retry_count, error = %err, "malformed task message");
                self.metrics.record_malformed(&self.config.task_label);
                let decision = match self.config.malformed_policy {
                    MalformedPolicy::DeadLetter => AckDecision::DeadLetter,
                    MalformedPolicy::RetryPath => {
                        self.config.retry_policy.decide(retry_count, false)
                    }
                };
                let settlement = self.settle(delivery, decision, retry_count).await?;
                return Ok(DeliveryOutcome {
                    settlement,
                    retry_count,
                    malformed: true,
                });
            }
        };

        let span = info_span!("delivery", task_id = %task.id, retry_count);
        async move {
            let started = Instant::now();
            let result = self
                .breaker
                .execute(|| self.processor.process(&task.id, &task.payload))
                .await;
            self.metrics.set_breaker_state(self.breaker.state());

            let succeeded = match &result {
                Ok(success) => {
                    self.metrics
                        .record_success(&self.config.task_label, started.elapsed());
                    info!(url = %success.output_url, "task completed");
                    true
                }
                Err(BreakerError::Open) => {
                    self.metrics.record_failure(&self.config.task_label);
                    warn!("circuit breaker open, task not attempted");
                    false
                }
                Err(BreakerError::Inner(failure)) => {
                    self.metrics.record_failure(&self.config.task_label);
                    warn!(stage = %failure.stage, error = %failure.reason, "task failed");
                    false
                }
            };

            let decision = self.config.retry_policy.decide(retry_count, succeeded);
            let settlement = self.settle(delivery, decision, retry_count).await?;
            Ok::<_, BrokerError>(DeliveryOutcome {
                settlement,
                retry_count,
                malformed: false,
            })
        }
        .instrument(span)
        .await
    }

    async fn settle(
        &self,
        delivery: Box<dyn Delivery>,
        decision: AckDecision,
        retry_count: u32,
    ) -> Result<Settlement, BrokerError> {
        let label = &self.config.task_label;
        match decision {
            AckDecision::Ack => {
                delivery.ack().await?;
                Ok(Settlement::Acked)
            }
            AckDecision::Nack => {
                delivery.nack(false).await?;
                self.metrics.record_retry(label);
                info!(
                    retry_count,
                    attempts_remaining = self.config.retry_policy.attempts_remaining(retry_count),
                    "scheduled for retry"
                );
                Ok(Settlement::Nacked)
            }
            AckDecision::DeadLetter => {
                let published = self
                    .broker
                    .publish(DEFAULT_EXCHANGE, &self.topology.dead_queue, delivery.body())
                    .await;
                match published {
                    Ok(()) => {
                        delivery.ack().await?;
                        self.metrics.record_dropped(label);
                        warn!(
                            retry_count,
                            dead_queue = %self.topology.dead_queue,
                            "retries exhausted, moved to dead queue"
                        );
                        Ok(Settlement::DeadLettered)
                    }
                    Err(err) => {
                        // Keep the message: it takes another cycle through the retry queue.
                        error!(
                            retry_count,
                            error = %err,
                            "dead queue publish failed, nacking instead"
                        );
                        delivery.nack(false).await?;
                        Ok(Settlement::Nacked)
                    }
                }
            }
        }
    }
}
