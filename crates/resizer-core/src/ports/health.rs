use async_trait::async_trait;

/// A dependency that `/health` reports on.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// Service name as it appears in the health report (`rabbitMQ`, `redis`).
    fn name(&self) -> &str;

    async fn is_healthy(&self) -> bool;
}
