//! IdempotentProcessor - 結果キャッシュ付きの TaskProcessor デコレータ
//!
//! # フロー
//! 1. キャッシュ hit: キャッシュ済みの結果をそのまま status チャネルに publish し、成功を返す
//!    （内側の processor は呼ばない）
//! 2. miss: 内側の processor を実行
//!    - 成功: 結果をキャッシュして publish
//!    - 失敗: `{"success": false, "error": ...}` を publish
//!
//! 再配送された完了済みタスクは、副作用を繰り返さずに同じ結果を返します。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use super::result_cache::{DEFAULT_RESULT_TTL, ResultCache};
use super::status::StatusPublisher;
use crate::domain::{Payload, ProcessFailure, ProcessSuccess};
use crate::ports::{CacheStore, TaskProcessor};

pub struct IdempotentProcessor {
    inner: Arc<dyn TaskProcessor>,
    task_type: String,
    cache: ResultCache,
    status: StatusPublisher,
    ttl: Duration,
}

impl IdempotentProcessor {
    pub fn new(
        inner: Arc<dyn TaskProcessor>,
        store: Arc<dyn CacheStore>,
        task_type: impl Into<String>,
    ) -> Self {
        Self {
            inner,
            task_type: task_type.into(),
            cache: ResultCache::new(store.clone()),
            status: StatusPublisher::new(store),
            ttl: DEFAULT_RESULT_TTL,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }
}

#[async_trait]
impl TaskProcessor for IdempotentProcessor {
    async fn process(
        &self,
        task_id: &str,
        payload: &Payload,
    ) -> Result<ProcessSuccess, ProcessFailure> {
        if let Some(cached) = self.cache.get(&self.task_type, task_id).await {
            info!(task_id, "result cache hit, republishing stored result");
            self.status.publish(task_id, &cached).await;
            return Ok(ProcessSuccess::from_status_payload(&cached));
        }

        match self.inner.process(task_id, payload).await {
            Ok(success) => {
                let status = success.to_status_payload();
                self.cache.put(&self.task_type, task_id, &status, self.ttl).await;
                self.status.publish(task_id, &status).await;
                Ok(success)
            }
            Err(failure) => {
                self.status.publish(task_id, &failure.to_status_payload()).await;
                Err(failure)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::{InMemoryCacheStore, ScriptedProcessor};
    use serde_json::{Value, json};

    fn setup(failures: u32) -> (IdempotentProcessor, Arc<ScriptedProcessor>, Arc<InMemoryCacheStore>) {
        let inner = Arc::new(ScriptedProcessor::failing_first(failures));
        let store = Arc::new(InMemoryCacheStore::new());
        let processor = IdempotentProcessor::new(inner.clone(), store.clone(), "resize-image");
        (processor, inner, store)
    }

    fn published_bodies(store: &InMemoryCacheStore) -> Vec<Value> {
        store
            .published()
            .iter()
            .map(|(_, body)| serde_json::from_slice(body).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn miss_runs_inner_then_caches_and_publishes() {
        let (processor, inner, store) = setup(0);

        let success = processor.process("t-1", &Payload::new()).await.unwrap();

        assert_eq!(inner.calls(), 1);
        assert_eq!(success.output_url, "https://storage.local/t-1");
        let bodies = published_bodies(&store);
        assert_eq!(bodies.len(), 1);
        assert_eq!(bodies[0]["success"], json!(true));
        assert!(store.contains_key("task:resize-image:t-1:output"));
    }

    #[tokio::test]
    async fn hit_republishes_without_running_inner() {
        let (processor, inner, store) = setup(0);
        processor.process("t-1", &Payload::new()).await.unwrap();

        let again = processor.process("t-1", &Payload::new()).await.unwrap();

        assert_eq!(inner.calls(), 1);
        assert_eq!(again.output_url, "https://storage.local/t-1");
        let bodies = published_bodies(&store);
        assert_eq!(bodies.len(), 2);
        assert_eq!(bodies[0], bodies[1]);
    }

    #[tokio::test]
    async fn failure_is_published_and_not_cached() {
        let (processor, inner, store) = setup(1);

        let failure = processor.process("t-1", &Payload::new()).await.unwrap_err();

        assert_eq!(failure.stage, "scripted");
        let bodies = published_bodies(&store);
        assert_eq!(bodies[0]["success"], json!(false));
        assert!(!store.contains_key("task:resize-image:t-1:output"));

        processor.process("t-1", &Payload::new()).await.unwrap();
        assert_eq!(inner.calls(), 2);
    }

    #[tokio::test]
    async fn cache_outage_still_processes() {
        let (processor, inner, store) = setup(0);
        store.set_unavailable(true);

        processor.process("t-1", &Payload::new()).await.unwrap();
        processor.process("t-1", &Payload::new()).await.unwrap();

        assert_eq!(inner.calls(), 2);
    }
}
