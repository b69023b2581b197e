//! Death history - broker が付与する dead-letter 履歴
//!
//! retry 回数はアプリ側で保存せず、配送ごとの death history から導出します。
//! プロセスが再起動しても broker 側に履歴が残るので、retry の勘定は崩れません。
//!
//! ここは live な broker 型に依存しない純粋なモデルです。
//! AMQP の `x-death` ヘッダからの変換はアダプタ側（resizer-amqp）で行います。

use serde::{Deserialize, Serialize};

/// Why a message was dead-lettered out of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeathReason {
    /// Negatively acknowledged without requeue.
    Rejected,
    /// Message TTL elapsed.
    Expired,
    /// Queue length limit exceeded.
    Maxlen,
    /// Quorum queue delivery limit exceeded.
    DeliveryLimit,
    Other,
}

impl DeathReason {
    pub fn parse(s: &str) -> Self {
        match s {
            "rejected" => DeathReason::Rejected,
            "expired" => DeathReason::Expired,
            "maxlen" => DeathReason::Maxlen,
            "delivery_limit" => DeathReason::DeliveryLimit,
            _ => DeathReason::Other,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeathReason::Rejected => "rejected",
            DeathReason::Expired => "expired",
            DeathReason::Maxlen => "maxlen",
            DeathReason::DeliveryLimit => "delivery_limit",
            DeathReason::Other => "other",
        }
    }
}

/// One `(queue, reason)` entry of the history, with how many times it happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeathRecord {
    pub queue: String,
    pub exchange: String,
    pub reason: DeathReason,
    pub count: u64,
    #[serde(default)]
    pub routing_keys: Vec<String>,
}

impl DeathRecord {
    pub fn new(queue: impl Into<String>, reason: DeathReason, count: u64) -> Self {
        Self {
            queue: queue.into(),
            exchange: String::new(),
            reason,
            count,
            routing_keys: Vec::new(),
        }
    }
}

/// DeathHistory は配送に付随する dead-letter 履歴（新しいものが先頭）
///
/// # 不変条件
/// - `(queue, reason)` ごとにエントリは 1 つ
/// - 同じ論理タスクの再配送間で count は単調非減少
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeathHistory {
    records: Vec<DeathRecord>,
}

impl DeathHistory {
    pub fn new(records: Vec<DeathRecord>) -> Self {
        Self { records }
    }

    pub const fn empty() -> Self {
        Self {
            records: Vec::new(),
        }
    }

    pub fn records(&self) -> &[DeathRecord] {
        &self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Record one more death the way the broker does: bump the matching
    /// `(queue, reason)` entry and move it to the front, or push a new one.
    pub fn record_death(
        &mut self,
        queue: &str,
        exchange: &str,
        reason: DeathReason,
        routing_key: &str,
    ) {
        let position = self
            .records
            .iter()
            .position(|r| r.queue == queue && r.reason == reason);

        let record = match position {
            Some(i) => {
                let mut record = self.records.remove(i);
                record.count += 1;
                record
            }
            None => DeathRecord {
                queue: queue.to_string(),
                exchange: exchange.to_string(),
                reason,
                count: 1,
                routing_keys: vec![routing_key.to_string()],
            },
        };
        self.records.insert(0, record);
    }

    /// Number of prior attempts that were rejected out of `queue`.
    ///
    /// - the `(queue, rejected)` entry's count when present
    /// - otherwise the most recent entry's count (histories written by a
    ///   topology that dead-letters from a differently named queue)
    /// - 0 for a first delivery
    pub fn retry_count(&self, queue: &str) -> u32 {
        let count = self
            .records
            .iter()
            .find(|r| r.queue == queue && r.reason == DeathReason::Rejected)
            .or_else(|| self.records.first())
            .map(|r| r.count)
            .unwrap_or(0);

        u32::try_from(count).unwrap_or(u32::MAX)
    }
}
