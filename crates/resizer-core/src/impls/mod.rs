//! Impls - 実装（開発用・テスト用）
//!
//! このモジュールには ports のインメモリ実装を含めます。
//!
//! # 含まれる実装
//! - **InMemoryBroker**: DLX / TTL / prefetch を再現する broker
//! - **InMemoryCacheStore**: Clock で有効期限を判定するキャッシュ
//! - **ScriptedProcessor**: 指定回数だけ失敗する TaskProcessor
//!
//! # 本番用実装
//! 本番用の実装は別クレートに配置します：
//! - `resizer-amqp`: AmqpBroker（RabbitMQ）
//! - `resizer-redis`: RedisCacheStore

pub mod inmem_broker;
pub mod inmem_cache;
pub mod scripted;

pub use self::inmem_broker::{InMemoryBroker, PublishedMessage, SettleKind};
pub use self::inmem_cache::InMemoryCacheStore;
pub use self::scripted::ScriptedProcessor;
