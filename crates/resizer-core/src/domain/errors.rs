//! Errors - ポートごとのエラー型
//!
//! # 分類
//! - BrokerError: broker 呼び出し（declare / publish / consume / ack / nack）の失敗
//! - CacheError: キャッシュストア呼び出しの失敗（呼び出し側で best-effort に吸収する）
//!
//! タスク自体の失敗は `ProcessFailure`（outcome.rs）で表現します。

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("declare {kind} '{name}' failed: {message}")]
    Declare {
        kind: &'static str,
        name: String,
        message: String,
    },

    #[error("bind '{queue}' to '{exchange}' failed: {message}")]
    Bind {
        queue: String,
        exchange: String,
        message: String,
    },

    #[error("qos failed: {0}")]
    Qos(String),

    #[error("publish to exchange '{exchange}' with key '{routing_key}' failed: {message}")]
    Publish {
        exchange: String,
        routing_key: String,
        message: String,
    },

    #[error("consume from '{queue}' failed: {message}")]
    Consume { queue: String, message: String },

    #[error("settle delivery failed: {0}")]
    Settle(String),

    #[error("delivery stream closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache connection error: {0}")]
    Connection(String),

    #[error("cache command error: {0}")]
    Command(String),
}
