//! Outcome model: what a task processor reports back.
//!
//! The status payload (`{"success": true, "url": ...}`) is also what gets
//! cached and published, so conversions to and from it live here.

use serde_json::Value;
use thiserror::Error;

use super::task::Payload;

/// A completed task.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessSuccess {
    pub output_url: String,
    pub metadata: Payload,
}

impl ProcessSuccess {
    pub fn new(output_url: impl Into<String>) -> Self {
        Self {
            output_url: output_url.into(),
            metadata: Payload::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Status payload published to listeners and stored in the result cache.
    pub fn to_status_payload(&self) -> Payload {
        let mut payload = self.metadata.clone();
        payload.insert("success".to_string(), Value::Bool(true));
        payload.insert("url".to_string(), Value::String(self.output_url.clone()));
        payload
    }

    /// Rebuild a success from a cached status payload.
    pub fn from_status_payload(payload: &Payload) -> Self {
        let output_url = payload
            .get("url")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let metadata = payload
            .iter()
            .filter(|(k, _)| k.as_str() != "url" && k.as_str() != "success")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Self {
            output_url,
            metadata,
        }
    }
}

/// A failed attempt. `stage` names the step that failed (download, upload, ...).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{stage}: {reason}")]
pub struct ProcessFailure {
    pub stage: String,
    pub reason: String,
}

impl ProcessFailure {
    pub fn new(stage: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            reason: reason.into(),
        }
    }

    pub fn to_status_payload(&self) -> Payload {
        let mut payload = Payload::new();
        payload.insert("success".to_string(), Value::Bool(false));
        payload.insert("error".to_string(), Value::String(self.to_string()));
        payload
    }
}
