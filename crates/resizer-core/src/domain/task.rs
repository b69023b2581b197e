use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Task-kind-specific parameters carried by a [`TaskMessage`].
pub type Payload = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskType(String);

impl TaskType {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The unit of work received from the queue.
///
/// Read-only to the worker: the same message (including `id`) is redelivered
/// unchanged on every retry, so `id` identifies the logical job.
///
/// Only `id` is required. Every other field falls back to its default when it
/// is missing or `null`, but a present field of the wrong JSON type is still a
/// decode error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMessage {
    pub id: String,

    #[serde(rename = "type", default, deserialize_with = "null_as_default")]
    pub task_type: String,

    #[serde(default, deserialize_with = "null_as_default")]
    pub user_id: String,

    #[serde(default, deserialize_with = "null_as_default")]
    pub payload: Payload,

    #[serde(default, deserialize_with = "null_as_default")]
    pub trace_id: String,

    #[serde(default, deserialize_with = "null_as_default")]
    pub created_at: String,
}

impl TaskMessage {
    /// Decode a raw delivery body.
    pub fn decode(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(body)
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
