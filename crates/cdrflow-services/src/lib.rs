//! Pipeline services for cdrflow
//!
//! This crate contains the decision logic that sits between the queue
//! transport and the document store: validating call events, escalating
//! failures along the retry ladder, and reconciling start/stop pairs into
//! completed call records.
//!
//! # Architecture
//!
//! - Validation, normalization and ledger bookkeeping are synchronous
//! - The engine talks to the store and the consumer to the transport only
//!   through the traits in `cdrflow_core::traits`
//! - Services are wrapped in Arc for safe sharing across async tasks
//! - Entry points are instrumented with tracing
//!
//! # Services
//!
//! - `TimestampNormalizer` - Parses structured and textual event timestamps
//! - `Validator` - Field checks over a single event
//! - `RetryLedger` - Retry history and the next queue of a failed event
//! - `ReconciliationEngine` - Validate, persist or merge, route failures
//! - `EventConsumer` - Drives one queue subscription through the engine

pub mod consumer;
pub mod reconciliation;
pub mod retry_ledger;
pub mod stats;
pub mod timestamp;
pub mod validator;

pub use consumer::EventConsumer;
pub use reconciliation::{Outcome, ReconciliationEngine};
pub use retry_ledger::RetryLedger;
pub use stats::{PipelineStats, StatsSnapshot};
pub use timestamp::TimestampNormalizer;
pub use validator::Validator;

/// Pipeline constants
pub mod constants {
    /// Caller id accepted in place of a phone number for the calling party
    pub const ANONYMOUS_CALLER: &str = "Anonymous";

    /// Valid phone numbers: 8 to 15 digits with an optional leading `+`
    pub const PHONE_PATTERN: &str = r"^\+?[0-9]{8,15}$";

    /// Millisecond timestamps must have exactly this many digits
    pub const EPOCH_MS_DIGITS: usize = 13;
}
