//! Domain model (task messages, death history, decisions, outcomes, errors).

pub mod death;
pub mod decision;
pub mod errors;
pub mod outcome;
pub mod task;

pub use death::{DeathHistory, DeathReason, DeathRecord};
pub use decision::{AckDecision, MalformedPolicy, RetryPolicy};
pub use errors::{BrokerError, CacheError};
pub use outcome::{ProcessFailure, ProcessSuccess};
pub use task::{Payload, TaskMessage, TaskType};
