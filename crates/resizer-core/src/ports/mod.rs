//! Ports - 抽象化レイヤー
//!
//! このモジュールは Hexagonal Architecture の「ポート」を定義します。
//! 各 trait は外部システム（RabbitMQ, Redis, オブジェクトストレージなど）への
//! インターフェースを提供し、実装の詳細を隠蔽します。
//!
//! # 設計原則
//! - broker が配送と retry 履歴の正本（アプリ側に retry 状態を持たない）
//! - Redis は結果キャッシュと status 通知（best-effort）
//! - タスク固有の処理は TaskProcessor の裏に隠す

pub mod broker;
pub mod cache_store;
pub mod clock;
pub mod health;
pub mod processor;

pub use self::broker::{Delivery, DeliveryReceiver, MessageBroker, QueueOptions};
pub use self::cache_store::CacheStore;
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::health::HealthCheck;
pub use self::processor::TaskProcessor;
