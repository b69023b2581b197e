//! ResultCache - 完了済みタスクの結果を保持する冪等キャッシュ
//!
//! キー: `task:{task_type}:{task_id}:output`
//!
//! # best-effort
//! ストアの失敗はタスクの失敗にしません。
//! - get の失敗・デコード不能な値は「miss」
//! - put の失敗はログだけ残して続行

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::domain::Payload;
use crate::ports::CacheStore;

pub const DEFAULT_RESULT_TTL: Duration = Duration::from_secs(3600);

pub struct ResultCache {
    store: Arc<dyn CacheStore>,
}

impl ResultCache {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self { store }
    }

    pub fn key(task_type: &str, task_id: &str) -> String {
        format!("task:{task_type}:{task_id}:output")
    }

    pub async fn get(&self, task_type: &str, task_id: &str) -> Option<Payload> {
        let key = Self::key(task_type, task_id);
        let bytes = match self.store.get(&key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(err) => {
                warn!(task_id, %key, error = %err, "result cache read failed, treating as miss");
                return None;
            }
        };

        match serde_json::from_slice::<Payload>(&bytes) {
            Ok(payload) => Some(payload),
            Err(err) => {
                warn!(task_id, %key, error = %err, "cached result is not a JSON object, ignoring");
                None
            }
        }
    }

    pub async fn put(&self, task_type: &str, task_id: &str, result: &Payload, ttl: Duration) {
        let key = Self::key(task_type, task_id);
        let bytes = match serde_json::to_vec(result) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(task_id, %key, error = %err, "failed to encode result for cache");
                return;
            }
        };

        if let Err(err) = self.store.set(&key, &bytes, ttl).await {
            warn!(task_id, %key, error = %err, "result cache write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::InMemoryCacheStore;
    use crate::ports::FixedClock;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn payload() -> Payload {
        json!({"success": true, "url": "https://cdn/image/t-1.jpg"})
            .as_object()
            .cloned()
            .unwrap()
    }

    fn setup() -> (ResultCache, Arc<InMemoryCacheStore>, Arc<FixedClock>) {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
        ));
        let store = Arc::new(InMemoryCacheStore::with_clock(clock.clone()));
        (ResultCache::new(store.clone()), store, clock)
    }

    #[test]
    fn key_combines_type_and_id() {
        assert_eq!(
            ResultCache::key("resize-image", "t-1"),
            "task:resize-image:t-1:output"
        );
    }

    #[tokio::test]
    async fn get_after_put_returns_identical_payload() {
        let (cache, _, _) = setup();
        cache.put("resize-image", "t-1", &payload(), DEFAULT_RESULT_TTL).await;

        assert_eq!(cache.get("resize-image", "t-1").await, Some(payload()));
        assert_eq!(cache.get("other-type", "t-1").await, None);
    }

    #[tokio::test]
    async fn get_after_ttl_is_a_miss() {
        let (cache, _, clock) = setup();
        cache.put("resize-image", "t-1", &payload(), Duration::from_secs(10)).await;

        clock.advance(Duration::from_secs(11));
        assert_eq!(cache.get("resize-image", "t-1").await, None);
    }

    #[tokio::test]
    async fn put_overwrites() {
        let (cache, _, _) = setup();
        cache.put("resize-image", "t-1", &payload(), DEFAULT_RESULT_TTL).await;

        let mut newer = payload();
        newer.insert("url".into(), json!("https://cdn/other.jpg"));
        cache.put("resize-image", "t-1", &newer, DEFAULT_RESULT_TTL).await;

        assert_eq!(cache.get("resize-image", "t-1").await, Some(newer));
    }

    #[tokio::test]
    async fn store_outage_degrades_to_miss() {
        let (cache, store, _) = setup();
        cache.put("resize-image", "t-1", &payload(), DEFAULT_RESULT_TTL).await;

        store.set_unavailable(true);
        assert_eq!(cache.get("resize-image", "t-1").await, None);
        // does not panic or surface an error
        cache.put("resize-image", "t-2", &payload(), DEFAULT_RESULT_TTL).await;

        store.set_unavailable(false);
        assert_eq!(cache.get("resize-image", "t-2").await, None);
    }

    #[tokio::test]
    async fn undecodable_entry_is_a_miss() {
        let (cache, store, _) = setup();
        store
            .set(&ResultCache::key("resize-image", "t-1"), b"not json", DEFAULT_RESULT_TTL)
            .await
            .unwrap();

        assert_eq!(cache.get("resize-image", "t-1").await, None);
    }
}
