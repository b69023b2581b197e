//! HTTP server for Prometheus metrics and health probes
//!
//! # Endpoints
//!
//! - `GET /metrics` - Prometheus text exposition
//! - `GET /live` - プロセスが生きていれば常に 200
//! - `GET /health` - 依存サービス (rabbitMQ, redis) の状態。1 つでも DOWN なら 503

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::{Json, Router, http::StatusCode, response::IntoResponse, routing::get};
use resizer_core::app::{HealthRegistry, LivenessReport};
use resizer_core::observability::WorkerMetrics;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Shared state for the metrics server
#[derive(Clone)]
pub struct AppState {
    pub metrics: Arc<WorkerMetrics>,
    pub health: Arc<HealthRegistry>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/live", get(live_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Bind and serve until `shutdown` flips to true.
///
/// A bind failure is logged; the worker keeps consuming without the endpoint.
pub fn start(
    addr: SocketAddr,
    state: AppState,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(l) => l,
            Err(e) => {
                error!(error = %e, %addr, "failed to bind metrics server");
                return;
            }
        };
        info!(%addr, "metrics server listening");

        let stop = async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        };
        if let Err(e) = axum::serve(listener, router(state))
            .with_graceful_shutdown(stop)
            .await
        {
            error!(error = %e, "metrics server error");
        }
    })
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn live_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(LivenessReport::alive()))
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let report = state.health.report().await;
    let code = if report.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(report))
}
