//! Status - タスクの結果通知
//!
//! 各試行の後に `task:{task_id}:status` チャネルへ結果を publish します。
//! 購読者がいなくても、publish に失敗しても、タスクの結果には影響しません。

use std::sync::Arc;

use tracing::{debug, warn};

use crate::domain::Payload;
use crate::ports::CacheStore;

pub struct StatusPublisher {
    store: Arc<dyn CacheStore>,
}

impl StatusPublisher {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self { store }
    }

    pub fn channel(task_id: &str) -> String {
        format!("task:{task_id}:status")
    }

    pub async fn publish(&self, task_id: &str, status: &Payload) {
        let channel = Self::channel(task_id);
        let bytes = match serde_json::to_vec(status) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(task_id, error = %err, "failed to encode task status");
                return;
            }
        };

        match self.store.publish(&channel, &bytes).await {
            Ok(()) => debug!(task_id, %channel, "task status published"),
            Err(err) => warn!(task_id, %channel, error = %err, "failed to publish task status"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::InMemoryCacheStore;
    use serde_json::{Value, json};

    #[tokio::test]
    async fn publishes_on_task_channel() {
        let store = Arc::new(InMemoryCacheStore::new());
        let publisher = StatusPublisher::new(store.clone());
        let status = json!({"success": false, "error": "download: 404"})
            .as_object()
            .cloned()
            .unwrap();

        publisher.publish("t-1", &status).await;

        let published = store.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "task:t-1:status");
        let body: Value = serde_json::from_slice(&published[0].1).unwrap();
        assert_eq!(body["error"], "download: 404");
    }

    #[tokio::test]
    async fn publish_failure_is_swallowed() {
        let store = Arc::new(InMemoryCacheStore::new());
        store.set_unavailable(true);
        let publisher = StatusPublisher::new(store.clone());

        publisher.publish("t-1", &Payload::new()).await;
        assert!(store.published().is_empty());
    }
}
