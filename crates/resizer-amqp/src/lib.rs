//! resizer-amqp
//!
//! RabbitMQ 実装の MessageBroker（lapin）
//!
//! # 設計
//! - 接続 1 本・チャネル 1 本をプロセスで共有（`Arc<AmqpBroker>`）
//! - チャネルは publisher confirm モード。broker の nack は publish 失敗として返す
//! - consume は lapin の Consumer（Stream）を mpsc に転送する
//! - `x-death` ヘッダは `headers` モジュールで DeathHistory に変換

pub mod headers;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use resizer_core::domain::{BrokerError, DeathHistory};
use resizer_core::ports::{Delivery, DeliveryReceiver, HealthCheck, MessageBroker, QueueOptions};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use ulid::Ulid;

pub use headers::{death_history_from_headers, queue_arguments};

/// Delivery mode 2: persisted by the broker.
const PERSISTENT: u8 = 2;

pub struct AmqpBroker {
    connection: Connection,
    channel: Channel,
}

impl AmqpBroker {
    pub async fn connect(url: &str) -> Result<Self, BrokerError> {
        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Connection(format!("open channel: {e}")))?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| BrokerError::Connection(format!("enable publisher confirms: {e}")))?;

        info!(channel_id = channel.id(), "connected to RabbitMQ");
        Ok(Self {
            connection,
            channel,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    pub async fn close(&self) -> Result<(), BrokerError> {
        self.connection
            .close(200, "worker shutdown")
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))
    }
}

fn publish_error(exchange: &str, routing_key: &str, message: String) -> BrokerError {
    BrokerError::Publish {
        exchange: exchange.to_string(),
        routing_key: routing_key.to_string(),
        message,
    }
}

/// Broker の confirm を publish の結果に変換する。
fn confirmation_result(
    confirmation: Confirmation,
    exchange: &str,
    routing_key: &str,
) -> Result<(), BrokerError> {
    match confirmation {
        Confirmation::Ack(_) => Ok(()),
        Confirmation::Nack(_) => Err(publish_error(
            exchange,
            routing_key,
            "broker nacked the message".to_string(),
        )),
        // confirm_select 済みのチャネルでは来ない
        Confirmation::NotRequested => {
            warn!(exchange, routing_key, "publish was not confirmed");
            Ok(())
        }
    }
}

#[async_trait]
impl MessageBroker for AmqpBroker {
    async fn declare_direct_exchange(&self, name: &str) -> Result<(), BrokerError> {
        self.channel
            .exchange_declare(
                name,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Declare {
                kind: "exchange",
                name: name.to_string(),
                message: e.to_string(),
            })
    }

    async fn declare_queue(&self, name: &str, options: &QueueOptions) -> Result<(), BrokerError> {
        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                queue_arguments(options),
            )
            .await
            .map(|_| ())
            .map_err(|e| BrokerError::Declare {
                kind: "queue",
                name: name.to_string(),
                message: e.to_string(),
            })
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Bind {
                queue: queue.to_string(),
                exchange: exchange.to_string(),
                message: e.to_string(),
            })
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(|e| BrokerError::Qos(e.to_string()))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
    ) -> Result<(), BrokerError> {
        let to_error = |message: String| publish_error(exchange, routing_key, message);

        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(PERSISTENT);
        let confirmation = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                properties,
            )
            .await
            .map_err(|e| to_error(e.to_string()))?
            .await
            .map_err(|e| to_error(e.to_string()))?;
        confirmation_result(confirmation, exchange, routing_key)
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryReceiver, BrokerError> {
        let consume_error = |message: String| BrokerError::Consume {
            queue: queue.to_string(),
            message,
        };

        let tag = format!("resizer-{}", Ulid::new());
        let mut consumer = self
            .channel
            .basic_consume(
                queue,
                &tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| consume_error(e.to_string()))?;

        // The QoS window bounds what the broker pushes; this buffer never fills past it.
        let (tx, rx) = mpsc::channel::<Box<dyn Delivery>>(64);
        let channel = self.channel.clone();
        let queue = queue.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    next = consumer.next() => match next {
                        Some(Ok(delivery)) => {
                            let delivery = AmqpDelivery {
                                history: death_history_from_headers(
                                    delivery.properties.headers().as_ref(),
                                ),
                                body: delivery.data,
                                acker: delivery.acker,
                            };
                            if tx.send(Box::new(delivery)).await.is_err() {
                                break;
                            }
                        }
                        Some(Err(err)) => {
                            warn!(%queue, error = %err, "consumer stream error");
                            break;
                        }
                        None => break,
                    },
                    _ = tx.closed() => break,
                }
            }

            if let Err(err) = channel
                .basic_cancel(&tag, BasicCancelOptions::default())
                .await
            {
                debug!(%queue, error = %err, "basic_cancel failed");
            }
            debug!(%queue, consumer_tag = %tag, "consumer forwarding stopped");
        });

        Ok(rx)
    }
}

#[async_trait]
impl HealthCheck for AmqpBroker {
    fn name(&self) -> &str {
        "rabbitMQ"
    }

    async fn is_healthy(&self) -> bool {
        self.is_connected()
    }
}

pub struct AmqpDelivery {
    body: Vec<u8>,
    history: DeathHistory,
    acker: Acker,
}

#[async_trait]
impl Delivery for AmqpDelivery {
    fn body(&self) -> &[u8] {
        &self.body
    }

    fn death_history(&self) -> &DeathHistory {
        &self.history
    }

    async fn ack(self: Box<Self>) -> Result<(), BrokerError> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError::Settle(format!("ack: {e}")))
    }

    async fn nack(self: Box<Self>, requeue: bool) -> Result<(), BrokerError> {
        self.acker
            .nack(BasicNackOptions {
                requeue,
                ..BasicNackOptions::default()
            })
            .await
            .map_err(|e| BrokerError::Settle(format!("nack: {e}")))
    }
}
