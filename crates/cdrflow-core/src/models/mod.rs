//! Domain models for cdrflow
//!
//! This module contains the call event as it travels through the queues, the
//! retry history attached to it, the documents persisted for a call, and the
//! routing keys that address the queue ladder.

pub mod attempt;
pub mod event;
pub mod record;
pub mod routing;
pub mod timestamp;

pub use attempt::{Attempt, AttemptCause};
pub use event::{Action, CallEvent};
pub use record::{CallRecord, StartRecord};
pub use routing::{CallLeg, QueueStage, RoutingKey};
pub use timestamp::{EventTimestamp, StructuredTimestamp};

/// Wire names of the event fields checked by the pipeline
pub mod fields {
    pub const ACTION: &str = "action";
    pub const SESSION_ID: &str = "Acct-Session-Id";
    pub const TIMESTAMP: &str = "Event-Timestamp";
    pub const TIMESTAMP_ISO: &str = "Event-Timestamp-ISO";
    pub const SIP_METHOD: &str = "Sip-Method";
    pub const TO_USER: &str = "Sip-To-User";
    pub const FROM_USER: &str = "Sip-From-User";
    pub const DELAY: &str = "Acct-Delay-Time";
    pub const RETRY: &str = "retry";
}
