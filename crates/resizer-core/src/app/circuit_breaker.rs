//! CircuitBreaker - 下流障害の連鎖を止める状態機械
//!
//! # 状態遷移
//! - CLOSED: work を実行。失敗が threshold に達したら OPEN
//! - OPEN: work を実行せず `BreakerError::Open` を返す。最後の失敗から timeout を
//!   超えて経過していれば HALF_OPEN に移り、その呼び出しが probe になる
//! - HALF_OPEN: probe の結果だけで CLOSED / OPEN が決まる
//!
//! # ロック方針
//! work 自体はロックの外で await するので、遅い下流が他の判定をブロックしない。
//! 受付時に世代番号（generation）を払い出し、状態遷移のたびに世代を進める。
//! 結果は受付時と同じ世代のときだけ記録されるので、1 回の `execute` は
//! 受付から記録まで 1 つの状態遷移の中で完結する。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::ports::{Clock, SystemClock};

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
pub const DEFAULT_RESET_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    /// Value exported on the `circuit_breaker_state` gauge.
    pub fn as_metric_value(self) -> i64 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before a probe is allowed.
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            reset_timeout: DEFAULT_RESET_TIMEOUT,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    #[error("circuit breaker is open")]
    Open,

    #[error(transparent)]
    Inner(E),
}

impl<E> BreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open)
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure_at: Option<DateTime<Utc>>,
    /// Start of the in-flight HALF_OPEN probe, if any.
    probe_started_at: Option<DateTime<Utc>>,
    /// Bumped on every state transition and on every new probe.
    generation: u64,
}

impl BreakerState {
    fn transition(&mut self, to: CircuitState) {
        self.state = to;
        self.generation = self.generation.wrapping_add(1);
    }
}

/// Generation the call was admitted under.
#[derive(Debug, Clone, Copy)]
struct Admission {
    generation: u64,
}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure_at: None,
                probe_started_at: None,
                generation: 0,
            }),
        }
    }

    pub fn config(&self) -> CircuitBreakerConfig {
        self.config
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    /// Run `work` if the circuit admits it.
    ///
    /// An outcome only counts if no transition happened while `work` ran, so a
    /// slow call admitted before the circuit opened cannot close it again.
    pub async fn execute<F, Fut, T, E>(&self, work: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let Some(admission) = self.admit() else {
            return Err(BreakerError::Open);
        };

        match work().await {
            Ok(value) => {
                self.on_success(admission);
                Ok(value)
            }
            Err(err) => {
                self.on_failure(admission);
                Err(BreakerError::Inner(err))
            }
        }
    }

    fn elapsed_exceeds_timeout(&self, since: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        match since {
            Some(since) => (now - since).to_std().unwrap_or_default() > self.config.reset_timeout,
            None => true,
        }
    }

    fn admit(&self) -> Option<Admission> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitState::Closed => {}
            CircuitState::Open => {
                if !self.elapsed_exceeds_timeout(inner.last_failure_at, now) {
                    return None;
                }
                inner.transition(CircuitState::HalfOpen);
                inner.probe_started_at = Some(now);
                info!(
                    failure_count = inner.failure_count,
                    "circuit breaker half-open, admitting probe"
                );
            }
            CircuitState::HalfOpen => {
                // A probe that never reported back does not wedge the circuit.
                if inner.probe_started_at.is_some()
                    && !self.elapsed_exceeds_timeout(inner.probe_started_at, now)
                {
                    return None;
                }
                inner.generation = inner.generation.wrapping_add(1);
                inner.probe_started_at = Some(now);
            }
        }
        Some(Admission {
            generation: inner.generation,
        })
    }

    fn on_success(&self, admission: Admission) {
        let mut inner = self.inner.lock();
        if admission.generation != inner.generation {
            debug!(state = inner.state.as_str(), "stale success ignored");
            return;
        }
        inner.failure_count = 0;
        inner.probe_started_at = None;
        if inner.state != CircuitState::Closed {
            info!(previous = inner.state.as_str(), "circuit breaker closed");
            inner.transition(CircuitState::Closed);
        }
    }

    fn on_failure(&self, admission: Admission) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        if admission.generation != inner.generation {
            debug!(state = inner.state.as_str(), "stale failure ignored");
            return;
        }
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure_at = Some(now);
        inner.probe_started_at = None;

        match inner.state {
            CircuitState::HalfOpen => {
                inner.transition(CircuitState::Open);
                warn!(
                    failure_count = inner.failure_count,
                    "circuit breaker probe failed, reopening"
                );
            }
            CircuitState::Closed if inner.failure_count >= self.config.failure_threshold => {
                inner.transition(CircuitState::Open);
                warn!(
                    failure_count = inner.failure_count,
                    threshold = self.config.failure_threshold,
                    "circuit breaker opened"
                );
            }
            _ => {}
        }
    }
}
