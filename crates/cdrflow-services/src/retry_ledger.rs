//! Retry ledger
//!
//! Records each failed pass of an event in its retry history and picks the
//! queue it goes to next. Events climb the ladder primary → retry → rejected
//! and never come back down; rejected is terminal.

use cdrflow_core::models::{Attempt, CallEvent, QueueStage, RoutingKey};
use cdrflow_core::Failure;
use chrono::Utc;
use tracing::{debug, info, warn};

/// Decides retry destinations from an event's attempt count
#[derive(Debug, Clone)]
pub struct RetryLedger {
    max_attempts: usize,
}

impl RetryLedger {
    /// `max_attempts` below 1 is treated as 1
    pub fn new(max_attempts: usize) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Append one attempt built from `failures` and return the event with
    /// the routing key it must be published under.
    ///
    /// `arrived_on` is the key the event was received (or last routed) under;
    /// the result is never on a lower stage.
    pub fn on_failure(
        &self,
        arrived_on: &RoutingKey,
        mut event: CallEvent,
        failures: &[Failure],
    ) -> (CallEvent, RoutingKey) {
        match Attempt::from_failures(failures, Utc::now()) {
            Some(attempt) => event.retry_history.push(attempt),
            None => warn!(
                session = %event.session_label(),
                "Failure reported without causes, retry history left unchanged"
            ),
        }

        let stage = self.stage_for(event.attempts());
        let destination = arrived_on.escalate_to(stage);

        if destination.stage.is_terminal() {
            info!(
                session = %event.session_label(),
                attempts = event.attempts(),
                "Event rejected, routing to {}", destination
            );
        } else {
            debug!(
                session = %event.session_label(),
                attempts = event.attempts(),
                "Routing event to {}", destination
            );
        }

        (event, destination)
    }

    /// An accepted event leaves the ladder without changing its history
    pub fn on_success(&self, event: &CallEvent) {
        if event.attempts() > 0 {
            info!(
                session = %event.session_label(),
                attempts = event.attempts(),
                "Event accepted after retries"
            );
        }
    }

    /// Stage for an event whose history holds `attempts` entries
    pub fn stage_for(&self, attempts: usize) -> QueueStage {
        if attempts <= 1 || attempts < self.max_attempts {
            QueueStage::Retry
        } else {
            QueueStage::Rejected
        }
    }
}

impl Default for RetryLedger {
    fn default() -> Self {
        Self::new(2)
    }
}
