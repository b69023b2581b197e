//! WorkerBuilder - ワーカーの構築とワイヤリング
//!
//! # 起動時検証（Fail-fast）
//! - broker / processor / topology が揃っていなければ `BuildError` を返す
//! - 省略できる部品（breaker, metrics, consumer 設定）はデフォルト値で埋める

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use super::health::HealthRegistry;
use super::topology::{Topology, TopologyConfig, TopologyError};
use super::worker_loop::{ConsumerConfig, WorkerLoop};
use crate::domain::BrokerError;
use crate::observability::WorkerMetrics;
use crate::ports::{HealthCheck, MessageBroker, TaskProcessor};

/// # 使用例
/// ```ignore
/// let worker = WorkerBuilder::new()
///     .broker(broker)
///     .processor(processor)
///     .topology(TopologyConfig::new("tasks", "jobs", "resize"))
///     .build()?;
/// worker.run(shutdown_rx).await?;
/// ```
#[derive(Default)]
pub struct WorkerBuilder {
    broker: Option<Arc<dyn MessageBroker>>,
    processor: Option<Arc<dyn TaskProcessor>>,
    topology: Option<TopologyConfig>,
    breaker: Option<Arc<CircuitBreaker>>,
    metrics: Option<Arc<WorkerMetrics>>,
    consumer: ConsumerConfig,
    health_checks: Vec<Arc<dyn HealthCheck>>,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("missing component: {0}. It must be provided before build().")]
    MissingComponent(&'static str),

    #[error("failed to register metrics: {0}")]
    Metrics(#[from] prometheus::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

impl WorkerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn broker(mut self, broker: Arc<dyn MessageBroker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn processor(mut self, processor: Arc<dyn TaskProcessor>) -> Self {
        self.processor = Some(processor);
        self
    }

    pub fn topology(mut self, config: TopologyConfig) -> Self {
        self.topology = Some(config);
        self
    }

    pub fn breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn metrics(mut self, metrics: Arc<WorkerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn consumer(mut self, config: ConsumerConfig) -> Self {
        self.consumer = config;
        self
    }

    pub fn health_check(mut self, check: Arc<dyn HealthCheck>) -> Self {
        self.health_checks.push(check);
        self
    }

    pub fn build(self) -> Result<Worker, BuildError> {
        let broker = self.broker.ok_or(BuildError::MissingComponent("broker"))?;
        let processor = self
            .processor
            .ok_or(BuildError::MissingComponent("processor"))?;
        let topology_config = self
            .topology
            .ok_or(BuildError::MissingComponent("topology"))?;

        let breaker = self
            .breaker
            .unwrap_or_else(|| Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default())));
        let metrics = match self.metrics {
            Some(metrics) => metrics,
            None => Arc::new(WorkerMetrics::new()?),
        };
        metrics.set_breaker_state(breaker.state());

        let mut health = HealthRegistry::new();
        for check in self.health_checks {
            health.register(check);
        }

        let topology = Topology::from_config(&topology_config);
        let worker_loop = Arc::new(WorkerLoop::new(
            Arc::clone(&broker),
            topology.clone(),
            Arc::clone(&breaker),
            processor,
            Arc::clone(&metrics),
            self.consumer,
        ));

        Ok(Worker {
            broker,
            worker_loop,
            topology,
            breaker,
            metrics,
            health: Arc::new(health),
        })
    }
}

/// Wired worker: declares the topology, then consumes until shutdown.
pub struct Worker {
    broker: Arc<dyn MessageBroker>,
    worker_loop: Arc<WorkerLoop>,
    pub topology: Topology,
    pub breaker: Arc<CircuitBreaker>,
    pub metrics: Arc<WorkerMetrics>,
    pub health: Arc<HealthRegistry>,
}

impl Worker {
    pub fn worker_loop(&self) -> Arc<WorkerLoop> {
        Arc::clone(&self.worker_loop)
    }

    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<(), WorkerError> {
        self.topology.declare(self.broker.as_ref()).await?;
        info!(queue = %self.topology.queue, "worker ready");
        self.worker_loop().run(shutdown).await?;
        Ok(())
    }
}
