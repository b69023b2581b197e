//! MessageBroker port - AMQP 型 broker の抽象化
//!
//! 宣言（exchange / queue / binding）、prefetch、publish、consume を提供します。
//! 配送は `Delivery` として取り出し、worker が `ack` / `nack` のどちらかで必ず決着させます。
//!
//! # 実装
//! - `resizer-amqp`: AmqpBroker（本番用、lapin）
//! - `impls::InMemoryBroker`: テスト用（TTL・dead-letter を再現）

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::domain::{BrokerError, DeathHistory};

/// The broker's default exchange: routes by queue name.
pub const DEFAULT_EXCHANGE: &str = "";

/// Arguments a queue is declared with.
///
/// Re-declaring an existing queue with different arguments is a broker error,
/// so callers must use the same options on every start.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueOptions {
    /// Exchange that receives messages rejected or expired out of this queue.
    pub dead_letter_exchange: Option<String>,
    /// Routing key override for dead-lettered messages.
    pub dead_letter_routing_key: Option<String>,
    /// Per-queue message TTL.
    pub message_ttl: Option<Duration>,
}

impl QueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dead_letter_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.dead_letter_exchange = Some(exchange.into());
        self
    }

    pub fn dead_letter_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.dead_letter_routing_key = Some(routing_key.into());
        self
    }

    pub fn message_ttl(mut self, ttl: Duration) -> Self {
        self.message_ttl = Some(ttl);
        self
    }
}

/// A received message.
/// The consumer owns the delivery and must either `ack` or `nack` it exactly once.
#[async_trait]
pub trait Delivery: Send + Sync {
    fn body(&self) -> &[u8];

    /// Dead-letter history the broker attached to this delivery.
    fn death_history(&self) -> &DeathHistory;

    async fn ack(self: Box<Self>) -> Result<(), BrokerError>;

    /// `requeue = false` routes the message through the queue's dead-letter exchange.
    async fn nack(self: Box<Self>, requeue: bool) -> Result<(), BrokerError>;
}

pub type DeliveryReceiver = mpsc::Receiver<Box<dyn Delivery>>;

#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Declare a durable direct exchange. Idempotent.
    async fn declare_direct_exchange(&self, name: &str) -> Result<(), BrokerError>;

    /// Declare a durable queue. Idempotent for identical options.
    async fn declare_queue(&self, name: &str, options: &QueueOptions) -> Result<(), BrokerError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    /// Bound the number of unsettled deliveries handed to this consumer.
    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError>;

    /// Publish a persistent message.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
    ) -> Result<(), BrokerError>;

    /// Start consuming. The receiver yields `None` once the broker side closes.
    async fn consume(&self, queue: &str) -> Result<DeliveryReceiver, BrokerError>;
}
