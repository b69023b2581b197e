//! resizer-redis
//!
//! Redis 実装の CacheStore
//!
//! - GET / SET EX / PUBLISH / PING だけを使う
//! - ConnectionManager が再接続を引き受けるので、呼び出しごとに clone して使う

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use resizer_core::domain::CacheError;
use resizer_core::ports::{CacheStore, HealthCheck};
use tracing::{debug, info};

pub const DEFAULT_REDIS_ADDR: &str = "localhost:6379";

/// Build a connection URL from `host:port` and an optional password.
///
/// Values that are already URLs pass through untouched.
pub fn redis_url(addr: &str, password: Option<&str>) -> String {
    if addr.starts_with("redis://") || addr.starts_with("rediss://") {
        return addr.to_string();
    }
    match password {
        Some(password) if !password.is_empty() => format!("redis://:{password}@{addr}"),
        _ => format!("redis://{addr}"),
    }
}

pub struct RedisCacheStore {
    manager: ConnectionManager,
}

impl RedisCacheStore {
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client =
            redis::Client::open(url).map_err(|e| CacheError::Connection(e.to_string()))?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(|e| CacheError::Connection(e.to_string()))?;

        info!("connected to Redis");
        Ok(Self { manager })
    }
}

fn command_error(command: &str, err: redis::RedisError) -> CacheError {
    if err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout() {
        CacheError::Connection(format!("{command}: {err}"))
    } else {
        CacheError::Command(format!("{command}: {err}"))
    }
}

#[async_trait]
impl CacheStore for RedisCacheStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut conn = self.manager.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async::<_, Option<Vec<u8>>>(&mut conn)
            .await
            .map_err(|e| command_error("GET", e))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.manager.clone();
        // EX 0 is rejected by Redis
        let seconds = ttl.as_secs().max(1);
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(seconds)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| command_error("SET", e))
    }

    async fn publish(&self, channel: &str, message: &[u8]) -> Result<(), CacheError> {
        let mut conn = self.manager.clone();
        let receivers = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(message)
            .query_async::<_, i64>(&mut conn)
            .await
            .map_err(|e| command_error("PUBLISH", e))?;
        debug!(channel, receivers, "published");
        Ok(())
    }

    async fn ping(&self) -> Result<(), CacheError> {
        let mut conn = self.manager.clone();
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map(|_| ())
            .map_err(|e| command_error("PING", e))
    }
}

#[async_trait]
impl HealthCheck for RedisCacheStore {
    fn name(&self) -> &str {
        "redis"
    }

    async fn is_healthy(&self) -> bool {
        self.ping().await.is_ok()
    }
}
