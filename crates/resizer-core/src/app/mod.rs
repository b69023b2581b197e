//! App - アプリケーション層
//!
//! このモジュールは、ports を組み合わせてアプリケーションロジックを実装します。
//!
//! # 主要コンポーネント
//! - **Topology**: exchange / queue / binding の宣言（遅延 retry の経路）
//! - **CircuitBreaker**: 下流障害の遮断
//! - **ResultCache / IdempotentProcessor**: 完了済みタスクの再実行防止
//! - **WorkerLoop**: 配送の受信→処理→決着
//! - **HealthRegistry**: 依存サービスの稼働状況
//! - **WorkerBuilder**: 構築とワイヤリング

pub mod builder;
pub mod circuit_breaker;
pub mod health;
pub mod idempotent;
pub mod result_cache;
pub mod status;
pub mod topology;
pub mod worker_loop;

pub use self::builder::{BuildError, Worker, WorkerBuilder, WorkerError};
pub use self::circuit_breaker::{BreakerError, CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use self::health::{HealthRegistry, HealthReport, LivenessReport, ServiceStatus};
pub use self::idempotent::IdempotentProcessor;
pub use self::result_cache::ResultCache;
pub use self::status::StatusPublisher;
pub use self::topology::{Topology, TopologyConfig, TopologyError};
pub use self::worker_loop::{ConsumerConfig, DeliveryOutcome, Settlement, WorkerLoop};
