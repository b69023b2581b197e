//! Topology - 遅延 retry を dead-letter で実現する exchange / queue 構成
//!
//! ```text
//! producer ─▶ [exchange] ─rk─▶ (queue) ──nack──▶ [exchange.retry] ─rk─▶ (queue.retry)
//!                 ▲                                                       │ TTL
//!                 └───────────────────────────────────────────────────────┘
//!
//! retry 上限超過: consumer が (queue.dead) へ直接 publish して ack
//! ```
//!
//! すべての宣言は冪等なので、起動のたびに実行して構いません。

use std::time::Duration;

use tracing::info;

use crate::domain::BrokerError;
use crate::ports::{MessageBroker, QueueOptions};

/// Reference delay between attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct TopologyConfig {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
    /// Message TTL of the retry queue.
    pub retry_delay: Duration,
}

impl TopologyConfig {
    pub fn new(
        exchange: impl Into<String>,
        queue: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            queue: queue.into(),
            routing_key: routing_key.into(),
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }
}

/// Resolved names of every exchange and queue the worker touches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub exchange: String,
    pub retry_exchange: String,
    pub queue: String,
    pub retry_queue: String,
    pub dead_queue: String,
    pub routing_key: String,
    pub retry_delay: Duration,
}

/// Which declaration failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyStage {
    MainExchange,
    RetryExchange,
    RetryQueue,
    RetryBinding,
    MainQueue,
    MainBinding,
    DeadQueue,
}

impl std::fmt::Display for TopologyStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TopologyStage::MainExchange => "declare main exchange",
            TopologyStage::RetryExchange => "declare retry exchange",
            TopologyStage::RetryQueue => "declare retry queue",
            TopologyStage::RetryBinding => "bind retry queue",
            TopologyStage::MainQueue => "declare main queue",
            TopologyStage::MainBinding => "bind main queue",
            TopologyStage::DeadQueue => "declare dead queue",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("failed to {stage}: {source}")]
pub struct TopologyError {
    pub stage: TopologyStage,
    #[source]
    pub source: BrokerError,
}

trait StageExt<T> {
    fn stage(self, stage: TopologyStage) -> Result<T, TopologyError>;
}

impl<T> StageExt<T> for Result<T, BrokerError> {
    fn stage(self, stage: TopologyStage) -> Result<T, TopologyError> {
        self.map_err(|source| TopologyError { stage, source })
    }
}

impl Topology {
    pub fn from_config(config: &TopologyConfig) -> Self {
        Self {
            exchange: config.exchange.clone(),
            retry_exchange: format!("{}.retry", config.exchange),
            queue: config.queue.clone(),
            retry_queue: format!("{}.retry", config.queue),
            dead_queue: format!("{}.dead", config.queue),
            routing_key: config.routing_key.clone(),
            retry_delay: config.retry_delay,
        }
    }

    /// Options of the main queue: rejections go to the retry exchange.
    pub fn main_queue_options(&self) -> QueueOptions {
        QueueOptions::new()
            .dead_letter_exchange(&self.retry_exchange)
            .dead_letter_routing_key(&self.routing_key)
    }

    /// Options of the retry queue: expiry goes back to the main exchange.
    pub fn retry_queue_options(&self) -> QueueOptions {
        QueueOptions::new()
            .dead_letter_exchange(&self.exchange)
            .dead_letter_routing_key(&self.routing_key)
            .message_ttl(self.retry_delay)
    }

    /// Declare the whole graph. Stops at the first failure.
    pub async fn declare(&self, broker: &dyn MessageBroker) -> Result<(), TopologyError> {
        use TopologyStage::*;

        broker
            .declare_direct_exchange(&self.exchange)
            .await
            .stage(MainExchange)?;
        broker
            .declare_direct_exchange(&self.retry_exchange)
            .await
            .stage(RetryExchange)?;

        broker
            .declare_queue(&self.retry_queue, &self.retry_queue_options())
            .await
            .stage(RetryQueue)?;
        broker
            .bind_queue(&self.retry_queue, &self.retry_exchange, &self.routing_key)
            .await
            .stage(RetryBinding)?;

        broker
            .declare_queue(&self.queue, &self.main_queue_options())
            .await
            .stage(MainQueue)?;
        broker
            .bind_queue(&self.queue, &self.exchange, &self.routing_key)
            .await
            .stage(MainBinding)?;

        broker
            .declare_queue(&self.dead_queue, &QueueOptions::new())
            .await
            .stage(DeadQueue)?;

        info!(
            exchange = %self.exchange,
            queue = %self.queue,
            retry_queue = %self.retry_queue,
            dead_queue = %self.dead_queue,
            retry_delay_secs = self.retry_delay.as_secs(),
            "broker topology declared"
        );
        Ok(())
    }
}
