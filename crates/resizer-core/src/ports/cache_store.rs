//! CacheStore port - key/value キャッシュと pub/sub
//!
//! 結果キャッシュと status 通知に使います。
//! 呼び出し側は失敗を best-effort として扱うので、ここではエラーをそのまま返すだけです。

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::CacheError;

#[async_trait]
pub trait CacheStore: Send + Sync {
    /// `Ok(None)` when the key is absent or expired.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError>;

    /// Fire-and-forget publish to a channel.
    async fn publish(&self, channel: &str, message: &[u8]) -> Result<(), CacheError>;

    async fn ping(&self) -> Result<(), CacheError>;
}
