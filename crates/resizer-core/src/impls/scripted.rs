//! ScriptedProcessor - 結果を台本どおりに返すテスト用 TaskProcessor

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{Payload, ProcessFailure, ProcessSuccess};
use crate::ports::TaskProcessor;

/// Fails the first `failures` calls, then succeeds with
/// `https://storage.local/{task_id}`.
pub struct ScriptedProcessor {
    failures: u32,
    delay: Option<Duration>,
    calls: AtomicU32,
}

impl ScriptedProcessor {
    pub fn failing_first(failures: u32) -> Self {
        Self {
            failures,
            delay: None,
            calls: AtomicU32::new(0),
        }
    }

    pub fn succeeding() -> Self {
        Self::failing_first(0)
    }

    pub fn always_failing() -> Self {
        Self::failing_first(u32::MAX)
    }

    /// Sleep before answering (tokio time, so paused tests stay deterministic).
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskProcessor for ScriptedProcessor {
    async fn process(
        &self,
        task_id: &str,
        _payload: &Payload,
    ) -> Result<ProcessSuccess, ProcessFailure> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if call < self.failures {
            return Err(ProcessFailure::new(
                "scripted",
                format!("scripted failure {}", call + 1),
            ));
        }
        Ok(ProcessSuccess::new(format!("https://storage.local/{task_id}")))
    }
}
