//! `x-death` header parsing and queue argument building.
//!
//! Kept free of connections so it can be tested with constructed tables.

use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use resizer_core::domain::{DeathHistory, DeathReason, DeathRecord};
use resizer_core::ports::QueueOptions;

const X_DEATH: &str = "x-death";

/// Convert the broker's `x-death` header into a death history.
///
/// Entries that are not tables are skipped; missing fields default.
pub fn death_history_from_headers(headers: Option<&FieldTable>) -> DeathHistory {
    let Some(headers) = headers else {
        return DeathHistory::default();
    };
    let Some(AMQPValue::FieldArray(entries)) = lookup(headers, X_DEATH) else {
        return DeathHistory::default();
    };

    let records = entries
        .as_slice()
        .iter()
        .filter_map(|entry| match entry {
            AMQPValue::FieldTable(table) => Some(death_record(table)),
            _ => None,
        })
        .collect();
    DeathHistory::new(records)
}

fn death_record(table: &FieldTable) -> DeathRecord {
    let routing_keys = match lookup(table, "routing-keys") {
        Some(AMQPValue::FieldArray(keys)) => keys.as_slice().iter().filter_map(as_string).collect(),
        _ => Vec::new(),
    };

    DeathRecord {
        queue: lookup(table, "queue").and_then(as_string).unwrap_or_default(),
        exchange: lookup(table, "exchange").and_then(as_string).unwrap_or_default(),
        reason: DeathReason::parse(
            &lookup(table, "reason").and_then(as_string).unwrap_or_default(),
        ),
        count: lookup(table, "count").and_then(as_count).unwrap_or(0),
        routing_keys,
    }
}

fn lookup<'a>(table: &'a FieldTable, key: &str) -> Option<&'a AMQPValue> {
    table
        .inner()
        .iter()
        .find(|(k, _)| k.as_str() == key)
        .map(|(_, v)| v)
}

fn as_string(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(s) => Some(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        AMQPValue::ShortString(s) => Some(s.as_str().to_string()),
        _ => None,
    }
}

fn as_count(value: &AMQPValue) -> Option<u64> {
    match value {
        AMQPValue::LongLongInt(n) => u64::try_from(*n).ok(),
        AMQPValue::LongInt(n) => u64::try_from(*n).ok(),
        AMQPValue::LongUInt(n) => Some(u64::from(*n)),
        AMQPValue::ShortInt(n) => u64::try_from(*n).ok(),
        AMQPValue::ShortUInt(n) => Some(u64::from(*n)),
        AMQPValue::ShortShortInt(n) => u64::try_from(*n).ok(),
        AMQPValue::ShortShortUInt(n) => Some(u64::from(*n)),
        _ => None,
    }
}

/// `x-dead-letter-*` and `x-message-ttl` arguments for a queue declaration.
pub fn queue_arguments(options: &QueueOptions) -> FieldTable {
    let mut args = FieldTable::default();
    if let Some(exchange) = &options.dead_letter_exchange {
        args.insert(
            ShortString::from("x-dead-letter-exchange"),
            AMQPValue::LongString(LongString::from(exchange.as_str())),
        );
    }
    if let Some(routing_key) = &options.dead_letter_routing_key {
        args.insert(
            ShortString::from("x-dead-letter-routing-key"),
            AMQPValue::LongString(LongString::from(routing_key.as_str())),
        );
    }
    if let Some(ttl) = options.message_ttl {
        let millis = i32::try_from(ttl.as_millis()).unwrap_or(i32::MAX);
        args.insert(
            ShortString::from("x-message-ttl"),
            AMQPValue::LongInt(millis),
        );
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::types::FieldArray;
    use rstest::rstest;
    use std::time::Duration;

    fn death(queue: &str, reason: &str, count: AMQPValue) -> AMQPValue {
        let mut table = FieldTable::default();
        table.insert("queue".into(), AMQPValue::LongString(queue.into()));
        table.insert("exchange".into(), AMQPValue::LongString("tasks".into()));
        table.insert("reason".into(), AMQPValue::LongString(reason.into()));
        table.insert("count".into(), count);
        table.insert(
            "routing-keys".into(),
            AMQPValue::FieldArray(FieldArray::from(vec![AMQPValue::LongString(
                "resize".into(),
            )])),
        );
        AMQPValue::FieldTable(table)
    }

    fn headers(entries: Vec<AMQPValue>) -> FieldTable {
        let mut headers = FieldTable::default();
        headers.insert(X_DEATH.into(), AMQPValue::FieldArray(FieldArray::from(entries)));
        headers
    }

    #[test]
    fn no_headers_means_no_history() {
        assert!(death_history_from_headers(None).is_empty());
        assert!(death_history_from_headers(Some(&FieldTable::default())).is_empty());
    }

    #[test]
    fn parses_retry_cycle_history() {
        let headers = headers(vec![
            death("jobs.retry", "expired", AMQPValue::LongLongInt(2)),
            death("jobs", "rejected", AMQPValue::LongLongInt(2)),
        ]);

        let history = death_history_from_headers(Some(&headers));

        assert_eq!(history.records().len(), 2);
        assert_eq!(history.records()[0].reason, DeathReason::Expired);
        assert_eq!(history.records()[1].routing_keys, vec!["resize".to_string()]);
        assert_eq!(history.retry_count("jobs"), 2);
    }

    #[rstest]
    #[case::long_long(AMQPValue::LongLongInt(3), 3)]
    #[case::long(AMQPValue::LongInt(3), 3)]
    #[case::unsigned(AMQPValue::LongUInt(3), 3)]
    #[case::negative(AMQPValue::LongLongInt(-1), 0)]
    #[case::not_a_number(AMQPValue::Boolean(true), 0)]
    fn count_accepts_integer_encodings(#[case] count: AMQPValue, #[case] expected: u64) {
        let headers = headers(vec![death("jobs", "rejected", count)]);
        let history = death_history_from_headers(Some(&headers));
        assert_eq!(history.records()[0].count, expected);
    }

    #[test]
    fn skips_non_table_entries() {
        let headers = headers(vec![
            AMQPValue::Boolean(false),
            death("jobs", "rejected", AMQPValue::LongLongInt(1)),
        ]);
        assert_eq!(death_history_from_headers(Some(&headers)).retry_count("jobs"), 1);
    }

    #[test]
    fn builds_retry_queue_arguments() {
        let options = QueueOptions::new()
            .dead_letter_exchange("tasks")
            .dead_letter_routing_key("resize")
            .message_ttl(Duration::from_secs(30));

        let args = queue_arguments(&options);

        assert_eq!(
            lookup(&args, "x-dead-letter-exchange").and_then(as_string),
            Some("tasks".to_string())
        );
        assert_eq!(
            lookup(&args, "x-dead-letter-routing-key").and_then(as_string),
            Some("resize".to_string())
        );
        assert_eq!(lookup(&args, "x-message-ttl"), Some(&AMQPValue::LongInt(30_000)));
    }

    #[test]
    fn plain_queue_has_no_arguments() {
        assert!(queue_arguments(&QueueOptions::new()).inner().is_empty());
    }
}
