//! Decision model: how a processed delivery gets settled.
//!
//! The decision is a pure function of the attempt's outcome and the retry
//! count derived from broker history. It never looks at the error category:
//! a breaker-open rejection is just another failure here.

use std::fmt;
use std::str::FromStr;

/// Default bound on retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// What to do with a delivery once its attempt has finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDecision {
    /// Work completed: acknowledge.
    Ack,

    /// Retries remain: negative-acknowledge without requeue so the topology
    /// carries the message through the retry queue.
    Nack,

    /// Retries exhausted: publish the raw body to the final dead queue, then
    /// acknowledge so it leaves the retry cycle.
    DeadLetter,
}

/// Retry policy for failed tasks.
///
/// The delay between attempts is not part of the policy: it is the retry
/// queue's message TTL, owned by the broker topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of retries (not total attempts).
    /// `3` allows the original attempt plus 3 redeliveries.
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    /// Decide how to settle a delivery.
    ///
    /// # Arguments
    /// * `retry_count` - prior dead-letter events for this delivery (0 = first attempt)
    /// * `succeeded` - outcome of the attempt that just finished
    pub fn decide(&self, retry_count: u32, succeeded: bool) -> AckDecision {
        if succeeded {
            AckDecision::Ack
        } else if retry_count >= self.max_retries {
            AckDecision::DeadLetter
        } else {
            AckDecision::Nack
        }
    }

    pub fn attempts_remaining(&self, retry_count: u32) -> u32 {
        self.max_retries.saturating_sub(retry_count)
    }
}

/// What to do with a body that does not decode into a task message.
///
/// `RetryPath` sends malformed input through the same nack/retry path as any
/// failure, so it spends the retry budget before reaching the dead queue.
/// `DeadLetter` parks it in the dead queue on first sight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MalformedPolicy {
    #[default]
    RetryPath,
    DeadLetter,
}

impl FromStr for MalformedPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "retry" | "retry-path" => Ok(MalformedPolicy::RetryPath),
            "dead-letter" | "dead_letter" | "dlq" => Ok(MalformedPolicy::DeadLetter),
            other => Err(format!(
                "unknown malformed policy '{other}' (expected 'retry' or 'dead-letter')"
            )),
        }
    }
}

impl fmt::Display for MalformedPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MalformedPolicy::RetryPath => f.write_str("retry"),
            MalformedPolicy::DeadLetter => f.write_str("dead-letter"),
        }
    }
}
