//! Health - 依存サービスの稼働状況
//!
//! 起動時に `HealthCheck` 実装（broker, cache）を登録し、`/health` で集計します。
//! 各チェックには timeout を掛けるので、ハングした依存先は DOWN として扱われます。

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::ports::HealthCheck;

pub const CHECK_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ServiceStatus {
    #[serde(rename = "UP")]
    Up,
    #[serde(rename = "DOWN")]
    Down,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OverallStatus {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub status: OverallStatus,
    pub services: BTreeMap<String, ServiceStatus>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status == OverallStatus::Healthy
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LivenessReport {
    pub status: &'static str,
}

impl LivenessReport {
    pub fn alive() -> Self {
        Self { status: "Alive" }
    }
}

pub struct HealthRegistry {
    checks: Vec<Arc<dyn HealthCheck>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self { checks: Vec::new() }
    }

    pub fn register(&mut self, check: Arc<dyn HealthCheck>) {
        self.checks.push(check);
    }

    pub async fn report(&self) -> HealthReport {
        let mut services = BTreeMap::new();
        let mut healthy = true;

        for check in &self.checks {
            let up = tokio::time::timeout(CHECK_TIMEOUT, check.is_healthy())
                .await
                .unwrap_or(false);
            healthy &= up;
            let status = if up {
                ServiceStatus::Up
            } else {
                ServiceStatus::Down
            };
            services.insert(check.name().to_string(), status);
        }

        HealthReport {
            status: if healthy {
                OverallStatus::Healthy
            } else {
                OverallStatus::Unhealthy
            },
            services,
        }
    }
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    struct Static {
        name: &'static str,
        up: bool,
    }

    #[async_trait]
    impl HealthCheck for Static {
        fn name(&self) -> &str {
            self.name
        }

        async fn is_healthy(&self) -> bool {
            self.up
        }
    }

    struct Hangs;

    #[async_trait]
    impl HealthCheck for Hangs {
        fn name(&self) -> &str {
            "redis"
        }

        async fn is_healthy(&self) -> bool {
            std::future::pending::<()>().await;
            true
        }
    }

    #[tokio::test]
    async fn all_up_is_healthy() {
        let mut registry = HealthRegistry::new();
        registry.register(Arc::new(Static { name: "rabbitMQ", up: true }));
        registry.register(Arc::new(Static { name: "redis", up: true }));

        let report = registry.report().await;
        assert!(report.is_healthy());
        assert_eq!(
            serde_json::to_value(&report).unwrap(),
            json!({"status": "Healthy", "services": {"rabbitMQ": "UP", "redis": "UP"}})
        );
    }

    #[tokio::test]
    async fn any_down_is_unhealthy() {
        let mut registry = HealthRegistry::new();
        registry.register(Arc::new(Static { name: "rabbitMQ", up: false }));
        registry.register(Arc::new(Static { name: "redis", up: true }));

        let report = registry.report().await;
        assert!(!report.is_healthy());
        assert_eq!(report.services["rabbitMQ"], ServiceStatus::Down);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_check_times_out_as_down() {
        let mut registry = HealthRegistry::new();
        registry.register(Arc::new(Hangs));

        let report = registry.report().await;
        assert_eq!(report.services["redis"], ServiceStatus::Down);
    }

    #[test]
    fn liveness_body() {
        assert_eq!(
            serde_json::to_value(LivenessReport::alive()).unwrap(),
            json!({"status": "Alive"})
        );
    }
}
