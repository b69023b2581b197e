//! resize worker
//!
//! RabbitMQ から `resize-image` タスクを受け取り、縮小した画像を S3 に置く。
//!
//! # 起動手順
//! 1. 環境変数から Config（不正なら即終了）
//! 2. RabbitMQ / Redis / S3 に接続
//! 3. ResizeProcessor を IdempotentProcessor で包み、Worker を組み立てる
//! 4. metrics / health サーバを起動し、SIGTERM か Ctrl+C まで consume

mod config;
mod processor;
mod server;
mod telemetry;

use std::sync::Arc;

use anyhow::Context;
use resizer_amqp::AmqpBroker;
use resizer_core::app::{CircuitBreaker, IdempotentProcessor, WorkerBuilder};
use resizer_core::observability::WorkerMetrics;
use resizer_redis::RedisCacheStore;
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::Config;
use crate::processor::{HttpImageSource, ResizeProcessor, S3Config, S3Storage};
use crate::server::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("invalid configuration")?;
    telemetry::init(config.log_format);
    info!(
        exchange = %config.exchange,
        queue = %config.queue,
        routing_key = %config.routing_key,
        task_type = %config.task_type,
        malformed_policy = %config.malformed_policy,
        "starting resize worker"
    );

    let broker = Arc::new(
        AmqpBroker::connect(&config.rabbitmq_url)
            .await
            .context("failed to connect to RabbitMQ")?,
    );
    let cache = Arc::new(
        RedisCacheStore::connect(&config.redis_url)
            .await
            .context("failed to connect to Redis")?,
    );
    let storage = Arc::new(
        S3Storage::new(S3Config {
            bucket: config.s3_bucket.clone(),
            region: config.aws_region.clone(),
            endpoint: config.s3_endpoint.clone(),
        })
        .await,
    );
    let source = Arc::new(HttpImageSource::new().context("failed to build HTTP client")?);
    let metrics = Arc::new(WorkerMetrics::new().context("failed to register metrics")?);

    let resize = Arc::new(ResizeProcessor::new(
        storage,
        source,
        Arc::clone(&metrics),
        &config.task_type,
    ));
    let processor = Arc::new(
        IdempotentProcessor::new(resize, cache.clone(), &config.task_type)
            .with_ttl(config.cache_ttl),
    );

    let worker = WorkerBuilder::new()
        .broker(broker.clone())
        .processor(processor)
        .topology(config.topology())
        .breaker(Arc::new(CircuitBreaker::new(config.breaker())))
        .metrics(metrics)
        .consumer(config.consumer())
        .health_check(broker.clone())
        .health_check(cache)
        .build()?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);
    let server = server::start(
        config.metrics_addr,
        AppState {
            metrics: Arc::clone(&worker.metrics),
            health: Arc::clone(&worker.health),
        },
        shutdown_rx.clone(),
    );
    tokio::spawn({
        let shutdown_tx = Arc::clone(&shutdown_tx);
        async move {
            shutdown_signal().await;
            let _ = shutdown_tx.send(true);
        }
    });

    let result = worker.run(shutdown_rx).await;

    // the metrics server follows the worker down, whatever the reason
    let _ = shutdown_tx.send(true);
    if let Err(e) = server.await {
        warn!(error = %e, "metrics server task failed");
    }
    if let Err(e) = broker.close().await {
        warn!(error = %e, "failed to close RabbitMQ connection");
    }

    result.context("worker stopped")?;
    info!("resize worker shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = ?e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = ?e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
