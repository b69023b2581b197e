//! InMemoryBroker - 開発・テスト用の broker
//!
//! # 学習ポイント
//! - direct exchange のルーティングと default exchange（queue 名で直接配送）
//! - dead-letter（nack requeue=false / TTL 切れ）と death history の記録
//! - prefetch を Semaphore の permit で表現（決着すると permit が返る）
//! - 決着しないまま drop された配送は queue の先頭に戻る
//!
//! TTL はタイマータスク（tokio::time::sleep）で実装しているので、
//! `start_paused` なテストで時間を進めれば retry の一周を再現できます。

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, mpsc};
use tracing::debug;
use ulid::Ulid;

use crate::domain::{BrokerError, DeathHistory, DeathReason};
use crate::ports::broker::DEFAULT_EXCHANGE;
use crate::ports::{Delivery, DeliveryReceiver, HealthCheck, MessageBroker, QueueOptions};

/// How a delivery was settled, in order of settlement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleKind {
    Ack,
    Nack { requeue: bool },
}

/// A message published through the broker API (dead-letter hops are not included).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    id: Ulid,
    exchange: String,
    routing_key: String,
    body: Vec<u8>,
    history: DeathHistory,
}

#[derive(Debug, Default)]
struct QueueState {
    options: QueueOptions,
    ready: VecDeque<StoredMessage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Binding {
    exchange: String,
    routing_key: String,
    queue: String,
}

/// TTL timer to start once the state lock is released.
struct ExpiryTimer {
    queue: String,
    id: Ulid,
    ttl: Duration,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashSet<String>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    prefetch: u16,
    published: Vec<PublishedMessage>,
    settlements: Vec<SettleKind>,
    fail_publishes: bool,
    closed: bool,
}

impl BrokerState {
    fn route(
        &mut self,
        exchange: &str,
        routing_key: &str,
        message: StoredMessage,
        timers: &mut Vec<ExpiryTimer>,
    ) {
        let targets: Vec<String> = if exchange == DEFAULT_EXCHANGE {
            self.queues
                .contains_key(routing_key)
                .then(|| routing_key.to_string())
                .into_iter()
                .collect()
        } else {
            self.bindings
                .iter()
                .filter(|b| b.exchange == exchange && b.routing_key == routing_key)
                .map(|b| b.queue.clone())
                .collect()
        };

        if targets.is_empty() {
            debug!(exchange, routing_key, "unroutable message dropped");
            return;
        }

        for queue in targets {
            let mut copy = message.clone();
            copy.id = Ulid::new();
            copy.exchange = exchange.to_string();
            copy.routing_key = routing_key.to_string();
            self.enqueue(&queue, copy, timers);
        }
    }

    fn enqueue(&mut self, queue: &str, message: StoredMessage, timers: &mut Vec<ExpiryTimer>) {
        let Some(state) = self.queues.get_mut(queue) else {
            return;
        };
        if let Some(ttl) = state.options.message_ttl {
            timers.push(ExpiryTimer {
                queue: queue.to_string(),
                id: message.id,
                ttl,
            });
        }
        state.ready.push_back(message);
    }

    fn dead_letter(
        &mut self,
        queue: &str,
        mut message: StoredMessage,
        reason: DeathReason,
        timers: &mut Vec<ExpiryTimer>,
    ) {
        let Some(options) = self.queues.get(queue).map(|q| q.options.clone()) else {
            return;
        };
        let Some(dlx) = options.dead_letter_exchange else {
            debug!(queue, reason = reason.as_str(), "no dead-letter exchange, message dropped");
            return;
        };

        message
            .history
            .record_death(queue, &message.exchange, reason, &message.routing_key);
        let routing_key = options
            .dead_letter_routing_key
            .unwrap_or_else(|| message.routing_key.clone());
        self.route(&dlx, &routing_key, message, timers);
    }
}

struct Shared {
    state: Mutex<BrokerState>,
    notify: Notify,
}

impl Shared {
    /// Start TTL timers and wake consumers after a state change.
    fn after_change(self: &Arc<Self>, timers: Vec<ExpiryTimer>) {
        for timer in timers {
            let shared = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(timer.ttl).await;
                shared.expire(&timer.queue, timer.id);
            });
        }
        self.notify.notify_waiters();
    }

    fn expire(self: &Arc<Self>, queue: &str, id: Ulid) {
        let mut timers = Vec::new();
        {
            let mut state = self.state.lock();
            let Some(q) = state.queues.get_mut(queue) else {
                return;
            };
            let Some(position) = q.ready.iter().position(|m| m.id == id) else {
                // already consumed
                return;
            };
            let Some(message) = q.ready.remove(position) else {
                return;
            };
            state.dead_letter(queue, message, DeathReason::Expired, &mut timers);
        }
        self.after_change(timers);
    }

    fn requeue_front(&self, queue: &str, message: StoredMessage) {
        {
            let mut state = self.state.lock();
            if let Some(q) = state.queues.get_mut(queue) {
                q.ready.push_front(message);
            }
        }
        self.notify.notify_waiters();
    }
}

/// In-memory broker with direct exchanges, dead-lettering, TTL and prefetch.
#[derive(Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BrokerState::default()),
                notify: Notify::new(),
            }),
        }
    }

    /// A delivery that belongs to no queue: settlements are recorded, nothing is routed.
    pub fn delivery(&self, body: &[u8], history: DeathHistory) -> Box<dyn Delivery> {
        Box::new(InMemoryDelivery {
            shared: Arc::clone(&self.shared),
            queue: None,
            message: Some(StoredMessage {
                id: Ulid::new(),
                exchange: String::new(),
                routing_key: String::new(),
                body: body.to_vec(),
                history,
            }),
            _permit: None,
        })
    }

    /// Make every publish fail until turned off.
    pub fn fail_publishes(&self, fail: bool) {
        self.shared.state.lock().fail_publishes = fail;
    }

    /// End every consumer stream, as a dropped connection would.
    pub fn close(&self) {
        self.shared.state.lock().closed = true;
        self.shared.notify.notify_waiters();
    }

    pub fn queue_len(&self, queue: &str) -> usize {
        self.shared
            .state
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.ready.len())
    }

    /// Bodies of the ready messages in `queue`, head first.
    pub fn messages(&self, queue: &str) -> Vec<Vec<u8>> {
        self.shared
            .state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }

    pub fn histories(&self, queue: &str) -> Vec<DeathHistory> {
        self.shared
            .state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|m| m.history.clone()).collect())
            .unwrap_or_default()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.shared.state.lock().published.clone()
    }

    pub fn settlements(&self) -> Vec<SettleKind> {
        self.shared.state.lock().settlements.clone()
    }

    pub fn queue_options(&self, queue: &str) -> Option<QueueOptions> {
        self.shared
            .state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.options.clone())
    }

    /// `(exchange, routing_key, queue)` triples.
    pub fn bindings(&self) -> Vec<(String, String, String)> {
        self.shared
            .state
            .lock()
            .bindings
            .iter()
            .map(|b| (b.exchange.clone(), b.routing_key.clone(), b.queue.clone()))
            .collect()
    }

    pub fn prefetch(&self) -> u16 {
        self.shared.state.lock().prefetch
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn declare_direct_exchange(&self, name: &str) -> Result<(), BrokerError> {
        self.shared.state.lock().exchanges.insert(name.to_string());
        Ok(())
    }

    async fn declare_queue(&self, name: &str, options: &QueueOptions) -> Result<(), BrokerError> {
        let mut state = self.shared.state.lock();
        match state.queues.get(name) {
            Some(existing) if existing.options != *options => Err(BrokerError::Declare {
                kind: "queue",
                name: name.to_string(),
                message: "PRECONDITION_FAILED - inequivalent arguments".to_string(),
            }),
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    name.to_string(),
                    QueueState {
                        options: options.clone(),
                        ready: VecDeque::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        let mut state = self.shared.state.lock();
        if !state.exchanges.contains(exchange) || !state.queues.contains_key(queue) {
            return Err(BrokerError::Bind {
                queue: queue.to_string(),
                exchange: exchange.to_string(),
                message: "NOT_FOUND".to_string(),
            });
        }
        let binding = Binding {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            queue: queue.to_string(),
        };
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError> {
        self.shared.state.lock().prefetch = count;
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
    ) -> Result<(), BrokerError> {
        let mut timers = Vec::new();
        {
            let mut state = self.shared.state.lock();
            let unknown_exchange =
                exchange != DEFAULT_EXCHANGE && !state.exchanges.contains(exchange);
            if state.fail_publishes || state.closed || unknown_exchange {
                return Err(BrokerError::Publish {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    message: "publish rejected".to_string(),
                });
            }

            state.published.push(PublishedMessage {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                body: body.to_vec(),
            });
            let message = StoredMessage {
                id: Ulid::new(),
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                body: body.to_vec(),
                history: DeathHistory::default(),
            };
            state.route(exchange, routing_key, message, &mut timers);
        }
        self.shared.after_change(timers);
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryReceiver, BrokerError> {
        let prefetch = {
            let state = self.shared.state.lock();
            if !state.queues.contains_key(queue) {
                return Err(BrokerError::Consume {
                    queue: queue.to_string(),
                    message: "NOT_FOUND".to_string(),
                });
            }
            state.prefetch
        };

        // prefetch 0 means unbounded, as in AMQP
        let permits = match prefetch {
            0 => Semaphore::MAX_PERMITS,
            n => n as usize,
        };
        let (tx, rx) = mpsc::channel(usize::from(prefetch.max(1)));
        tokio::spawn(dispatch(
            Arc::clone(&self.shared),
            queue.to_string(),
            tx,
            Arc::new(Semaphore::new(permits)),
        ));
        Ok(rx)
    }
}

#[async_trait]
impl HealthCheck for InMemoryBroker {
    fn name(&self) -> &str {
        "rabbitMQ"
    }

    async fn is_healthy(&self) -> bool {
        !self.shared.state.lock().closed
    }
}

async fn dispatch(
    shared: Arc<Shared>,
    queue: String,
    tx: mpsc::Sender<Box<dyn Delivery>>,
    permits: Arc<Semaphore>,
) {
    loop {
        let permit = tokio::select! {
            permit = Arc::clone(&permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
            _ = tx.closed() => return,
        };

        let message = loop {
            let notified = shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = shared.state.lock();
                if state.closed {
                    return;
                }
                if let Some(message) = state.queues.get_mut(&queue).and_then(|q| q.ready.pop_front())
                {
                    break message;
                }
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tx.closed() => return,
            }
        };

        let delivery = InMemoryDelivery {
            shared: Arc::clone(&shared),
            queue: Some(queue.clone()),
            message: Some(message),
            _permit: Some(permit),
        };
        // A refused delivery is dropped here, which puts it back on the queue.
        if tx.send(Box::new(delivery)).await.is_err() {
            return;
        }
    }
}

pub struct InMemoryDelivery {
    shared: Arc<Shared>,
    /// Source queue; `None` for detached deliveries.
    queue: Option<String>,
    /// `None` once settled.
    message: Option<StoredMessage>,
    _permit: Option<OwnedSemaphorePermit>,
}

impl InMemoryDelivery {
    fn take(&mut self) -> Result<StoredMessage, BrokerError> {
        self.message
            .take()
            .ok_or_else(|| BrokerError::Settle("delivery already settled".to_string()))
    }
}

#[async_trait]
impl Delivery for InMemoryDelivery {
    fn body(&self) -> &[u8] {
        self.message
            .as_ref()
            .map(|m| m.body.as_slice())
            .unwrap_or_default()
    }

    fn death_history(&self) -> &DeathHistory {
        static EMPTY: DeathHistory = DeathHistory::empty();
        self.message.as_ref().map_or(&EMPTY, |m| &m.history)
    }

    async fn ack(mut self: Box<Self>) -> Result<(), BrokerError> {
        self.take()?;
        self.shared.state.lock().settlements.push(SettleKind::Ack);
        Ok(())
    }

    async fn nack(mut self: Box<Self>, requeue: bool) -> Result<(), BrokerError> {
        let message = self.take()?;
        let mut timers = Vec::new();
        {
            let mut state = self.shared.state.lock();
            state.settlements.push(SettleKind::Nack { requeue });
            if let Some(queue) = &self.queue {
                if requeue {
                    if let Some(q) = state.queues.get_mut(queue) {
                        q.ready.push_front(message);
                    }
                } else {
                    state.dead_letter(queue, message, DeathReason::Rejected, &mut timers);
                }
            }
        }
        self.shared.after_change(timers);
        Ok(())
    }
}

impl Drop for InMemoryDelivery {
    fn drop(&mut self) {
        if let Some(message) = self.message.take()
            && let Some(queue) = &self.queue
        {
            self.shared.requeue_front(queue, message);
        }
    }
}
