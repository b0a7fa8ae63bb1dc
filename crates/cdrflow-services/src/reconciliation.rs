//! Reconciliation engine
//!
//! Takes one delivered call event through the pipeline:
//! - validate its fields
//! - store it (start) or find its stored start and merge (stop)
//! - check the resulting duration
//!
//! Any failure along the way goes through the retry ledger, and the event
//! comes back out as `Outcome::Requeued` with the key to publish it under.

use cdrflow_core::models::{fields, Action, CallEvent, CallRecord, RoutingKey, StartRecord};
use cdrflow_core::traits::{CallDocumentStore, StoredDocument};
use cdrflow_core::{AppError, AppResult, Failure, FailureKind, PipelineConfig};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::retry_ledger::RetryLedger;
use crate::timestamp::TimestampNormalizer;
use crate::validator::Validator;

/// Where an event ended up after one pass
#[derive(Debug)]
pub enum Outcome {
    /// A document was written; the source message can be acknowledged
    Persisted(StoredDocument),
    /// The event must be published under `destination` before the source
    /// message is acknowledged
    Requeued {
        destination: RoutingKey,
        event: CallEvent,
    },
}

enum Stage {
    Validating,
    Routing,
    DurationCheck(StartRecord),
}

/// Validation and start/stop reconciliation
pub struct ReconciliationEngine {
    store: Arc<dyn CallDocumentStore>,
    validator: Validator,
    ledger: RetryLedger,
    stop_lookup_delay: Duration,
}

impl ReconciliationEngine {
    /// Create a new engine
    pub fn new(store: Arc<dyn CallDocumentStore>, config: &PipelineConfig) -> Self {
        Self {
            store,
            validator: Validator::new(TimestampNormalizer::new(config)),
            ledger: RetryLedger::new(config.max_attempts),
            stop_lookup_delay: Duration::from_millis(config.stop_lookup_delay_ms),
        }
    }

    pub fn ledger(&self) -> &RetryLedger {
        &self.ledger
    }

    pub fn store(&self) -> &Arc<dyn CallDocumentStore> {
        &self.store
    }

    /// Process one event received under `routing_key`.
    ///
    /// # Errors
    ///
    /// `AppError::UnknownRoutingKey` when the key is not on the ladder. Data
    /// and store problems are never errors: they produce `Outcome::Requeued`.
    #[instrument(skip(self, event), fields(session = %event.session_label()))]
    pub async fn process(&self, routing_key: &str, event: CallEvent) -> AppResult<Outcome> {
        let key: RoutingKey = routing_key.parse()?;
        let mut event = event;
        let mut stage = Stage::Validating;

        loop {
            stage = match stage {
                Stage::Validating => {
                    let failures = self.validator.validate(&mut event);
                    if !failures.is_empty() {
                        return Ok(self.requeue(&key, event, failures));
                    }
                    Stage::Routing
                }

                Stage::Routing => {
                    let Some(session_id) = event.session_id.clone() else {
                        let failure = Failure::missing([fields::SESSION_ID]);
                        return Ok(self.requeue(&key, event, vec![failure]));
                    };

                    match event.action {
                        Some(Action::Start) => return self.persist_start(&key, session_id, event).await,
                        Some(Action::Stop) => match self.find_start(&session_id).await {
                            Ok(start) => Stage::DurationCheck(start),
                            Err(failure) => return Ok(self.requeue(&key, event, vec![failure])),
                        },
                        other => {
                            // Validation rejects these; kept for events built by hand
                            let failure = Failure::new(
                                FailureKind::SipMethodMismatch,
                                fields::ACTION,
                                format!("cannot route action {:?}", other.map(|a| a.as_str())),
                            );
                            return Ok(self.requeue(&key, event, vec![failure]));
                        }
                    }
                }

                Stage::DurationCheck(start) => return self.merge_stop(&key, start, event).await,
            };
        }
    }

    async fn persist_start(
        &self,
        key: &RoutingKey,
        session_id: String,
        event: CallEvent,
    ) -> AppResult<Outcome> {
        let record = StartRecord::new(session_id, event);

        match self.store.insert_start_record(&record).await {
            Ok(document) => {
                info!(document_id = document.id, "Stored start of call {}", record.session_id);
                self.ledger.on_success(&record.start_event);
                Ok(Outcome::Persisted(document))
            }
            Err(err) => {
                let failure = Failure::external_store(&err);
                Ok(self.requeue(key, record.start_event, vec![failure]))
            }
        }
    }

    /// Look up the stored start for a stop event, after the configured delay
    async fn find_start(&self, session_id: &str) -> Result<StartRecord, Failure> {
        if !self.stop_lookup_delay.is_zero() {
            tokio::time::sleep(self.stop_lookup_delay).await;
        }

        let records = self
            .store
            .find_start_records(session_id)
            .await
            .map_err(|e| Failure::external_store(&e))?;

        if records.len() > 1 {
            warn!(
                "found multiple Session-Id: {} ({} documents), using the first",
                session_id,
                records.len()
            );
        }

        records.into_iter().next().ok_or_else(|| {
            Failure::store(
                fields::SESSION_ID,
                format!("{} not found in database", fields::SESSION_ID),
            )
        })
    }

    async fn merge_stop(
        &self,
        key: &RoutingKey,
        mut start: StartRecord,
        mut stop: CallEvent,
    ) -> AppResult<Outcome> {
        let normalizer = self.validator.normalizer();

        let start_ms = match normalizer.normalize(&mut start.start_event) {
            Ok(ms) => ms,
            Err(failure) => return Ok(self.requeue(key, stop, vec![failure])),
        };
        let stop_ms = match normalizer.normalize(&mut stop) {
            Ok(ms) => ms,
            Err(failure) => return Ok(self.requeue(key, stop, vec![failure])),
        };

        let duration = call_duration(start_ms, stop_ms, stop.delay_seconds());
        debug!(start_ms, stop_ms, duration, "Computed call duration");

        if duration < 0.0 {
            let failure = Failure::negative_duration(duration);
            return Ok(self.requeue(key, stop, vec![failure]));
        }

        let record = CallRecord::merge(start, stop, duration).ok_or_else(|| {
            AppError::Internal(format!("duration {} passed the check but was refused", duration))
        })?;

        match self.store.insert_call_record(&record).await {
            Ok(document) => {
                info!(
                    document_id = document.id,
                    duration = record.duration_seconds,
                    "Stored call {}", record.session_id
                );
                self.ledger.on_success(&record.stop_event);
                Ok(Outcome::Persisted(document))
            }
            Err(err) => {
                let failure = Failure::external_store(&err);
                Ok(self.requeue(key, record.stop_event, vec![failure]))
            }
        }
    }

    fn requeue(&self, key: &RoutingKey, event: CallEvent, failures: Vec<Failure>) -> Outcome {
        for failure in &failures {
            warn!(
                code = failure.kind.code(),
                invalid = %failure.field_label(),
                session = %event.session_label(),
                "{}", failure.reason
            );
        }
        let (event, destination) = self.ledger.on_failure(key, event, &failures);
        Outcome::Requeued { destination, event }
    }
}

/// Billable seconds between two epoch-ms instants. The reporting delay is
/// subtracted only when the call lasted at least that long.
pub fn call_duration(start_ms: i64, stop_ms: i64, delay_seconds: i64) -> f64 {
    let duration = (stop_ms - start_ms) as f64 / 1000.0;
    let delay = delay_seconds as f64;
    if duration >= delay {
        duration - delay
    } else {
        duration
    }
}
