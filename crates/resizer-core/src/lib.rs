//! resizer-core
//!
//! Core building blocks for the resize worker: consume jobs from a broker,
//! run them behind a circuit breaker, and settle each delivery as
//! ack / retry / dead-letter.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（task message, death history, decision, outcome, errors）
//! - **ports**: 抽象化レイヤー（MessageBroker, CacheStore, TaskProcessor, Clock, HealthCheck）
//! - **app**: アプリケーションロジック（topology, circuit breaker, result cache, worker loop, builder）
//! - **impls**: 実装（InMemoryBroker など開発・テスト用）
//! - **observability**: prometheus メトリクス

pub mod app;
pub mod domain;
pub mod impls;
pub mod observability;
pub mod ports;
