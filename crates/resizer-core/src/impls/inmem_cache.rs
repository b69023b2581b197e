//! InMemoryCacheStore - 開発・テスト用のキャッシュストア
//!
//! - 有効期限は Clock で判定（テストでは FixedClock で時間を進める）
//! - publish されたメッセージは記録するだけ（購読者はいない）
//! - `set_unavailable(true)` で障害を再現できる

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::domain::CacheError;
use crate::ports::{CacheStore, Clock, HealthCheck, SystemClock};

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, (Vec<u8>, DateTime<Utc>)>,
    published: Vec<(String, Vec<u8>)>,
    unavailable: bool,
}

pub struct InMemoryCacheStore {
    clock: Arc<dyn Clock>,
    state: Mutex<CacheState>,
}

impl InMemoryCacheStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unavailable = unavailable;
    }

    /// `(channel, message)` pairs in publish order.
    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.state.lock().published.clone()
    }

    /// Live (unexpired) key check.
    pub fn contains_key(&self, key: &str) -> bool {
        let now = self.clock.now();
        self.state
            .lock()
            .entries
            .get(key)
            .is_some_and(|(_, expires_at)| *expires_at > now)
    }

    fn check_available(state: &CacheState) -> Result<(), CacheError> {
        if state.unavailable {
            return Err(CacheError::Connection("cache store unavailable".to_string()));
        }
        Ok(())
    }
}

impl Default for InMemoryCacheStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        Self::check_available(&state)?;

        match state.entries.get(key) {
            Some((value, expires_at)) if *expires_at > now => Ok(Some(value.clone())),
            Some(_) => {
                state.entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| CacheError::Command(format!("invalid ttl: {e}")))?;
        let expires_at = self.clock.now() + ttl;
        let mut state = self.state.lock();
        Self::check_available(&state)?;
        state
            .entries
            .insert(key.to_string(), (value.to_vec(), expires_at));
        Ok(())
    }

    async fn publish(&self, channel: &str, message: &[u8]) -> Result<(), CacheError> {
        let mut state = self.state.lock();
        Self::check_available(&state)?;
        state
            .published
            .push((channel.to_string(), message.to_vec()));
        Ok(())
    }

    async fn ping(&self) -> Result<(), CacheError> {
        Self::check_available(&self.state.lock())
    }
}

#[async_trait]
impl HealthCheck for InMemoryCacheStore {
    fn name(&self) -> &str {
        "redis"
    }

    async fn is_healthy(&self) -> bool {
        self.ping().await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::FixedClock;
    use chrono::TimeZone;

    #[tokio::test]
    async fn expires_strictly_after_ttl() {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
        ));
        let store = InMemoryCacheStore::with_clock(clock.clone());
        store.set("k", b"v", Duration::from_secs(10)).await.unwrap();

        clock.advance(Duration::from_secs(9));
        assert_eq!(store.get("k").await.unwrap(), Some(b"v".to_vec()));

        clock.advance(Duration::from_secs(1));
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn unavailable_store_errors_and_reports_down() {
        let store = InMemoryCacheStore::new();
        store.set_unavailable(true);

        assert!(store.get("k").await.is_err());
        assert!(store.ping().await.is_err());
        assert!(!store.is_healthy().await);
    }
}
