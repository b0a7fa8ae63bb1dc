//! Queue names for the retry ladder
//!
//! Every stage of the ladder has its own Redis list, derived from the
//! configured prefix, plus a processing list holding messages that were
//! received but not yet acknowledged.
//!
//! # Key Patterns
//!
//! - `{prefix}` - primary queue, collects `call.*`
//! - `{prefix}_retry` - retry queue, collects `retry.call.*`
//! - `{prefix}_rejected` - rejected queue, collects `rejected.call.*`
//! - `{queue}:processing` - in-flight messages of `{queue}`
//!
//! # Example
//!
//! ```
//! use cdrflow_core::models::QueueStage;
//! use cdrflow_queue::keys::QueueKeys;
//!
//! let keys = QueueKeys::new("cdr_queue");
//! assert_eq!(keys.queue(QueueStage::Retry), "cdr_queue_retry");
//! assert_eq!(keys.processing(QueueStage::Retry), "cdr_queue_retry:processing");
//! ```

use cdrflow_core::models::{QueueStage, RoutingKey};

/// Suffix of the retry queue
pub const RETRY_SUFFIX: &str = "_retry";

/// Suffix of the rejected queue
pub const REJECTED_SUFFIX: &str = "_rejected";

/// Suffix of a queue's in-flight list
pub const PROCESSING_SUFFIX: &str = ":processing";

/// Builds the list names of one queue topology
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKeys {
    prefix: String,
}

impl QueueKeys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// List collecting the messages of `stage`
    pub fn queue(&self, stage: QueueStage) -> String {
        match stage {
            QueueStage::Primary => self.prefix.clone(),
            QueueStage::Retry => format!("{}{}", self.prefix, RETRY_SUFFIX),
            QueueStage::Rejected => format!("{}{}", self.prefix, REJECTED_SUFFIX),
        }
    }

    /// List a message published under `routing_key` lands in
    pub fn queue_for_key(&self, routing_key: &RoutingKey) -> String {
        self.queue(routing_key.stage)
    }

    /// In-flight list of the queue collecting `stage`
    pub fn processing(&self, stage: QueueStage) -> String {
        format!("{}{}", self.queue(stage), PROCESSING_SUFFIX)
    }
}
