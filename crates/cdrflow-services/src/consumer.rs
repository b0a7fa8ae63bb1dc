//! Queue consumer
//!
//! Drives one subscription: every delivery is processed by the engine on
//! its own task, bounded by a semaphore. A delivery is acknowledged once it
//! reaches a terminal state (stored, or republished to its next queue).
//! Otherwise, when republishing fails twice or the engine errors, the
//! delivery is released and the transport puts the original back on its
//! queue.

use cdrflow_core::models::{CallEvent, QueueStage, RoutingKey};
use cdrflow_core::traits::{Acknowledger, Delivery, EventTransport};
use cdrflow_core::{AppError, AppResult, Failure};
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::reconciliation::{Outcome, ReconciliationEngine};
use crate::stats::PipelineStats;

/// Consumer of one queue of the ladder
pub struct EventConsumer {
    stage: QueueStage,
    engine: Arc<ReconciliationEngine>,
    transport: Arc<dyn EventTransport>,
    stats: Arc<PipelineStats>,
    concurrency: usize,
}

impl EventConsumer {
    pub fn new(
        stage: QueueStage,
        engine: Arc<ReconciliationEngine>,
        transport: Arc<dyn EventTransport>,
        stats: Arc<PipelineStats>,
        concurrency: usize,
    ) -> Self {
        Self {
            stage,
            engine,
            transport,
            stats,
            concurrency: concurrency.max(1),
        }
    }

    /// Consume until `shutdown` is cancelled or the subscription ends, then
    /// wait for in-flight deliveries.
    #[instrument(skip_all, fields(queue = %self.stage))]
    pub async fn run(self, shutdown: CancellationToken) -> AppResult<()> {
        let mut deliveries = self.transport.subscribe(self.stage).await?;
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();

        info!(concurrency = self.concurrency, "Consumer started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,

                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!("Delivery task failed: {}", e);
                    }
                }

                next = deliveries.next() => {
                    let delivery = match next {
                        Some(Ok(delivery)) => delivery,
                        Some(Err(e)) => {
                            error!("Failed to receive delivery: {}", e);
                            continue;
                        }
                        None => {
                            warn!("Subscription ended");
                            break;
                        }
                    };

                    let permit = tokio::select! {
                        _ = shutdown.cancelled() => {
                            release(delivery.acker, &self.stats).await;
                            break;
                        }
                        permit = permits.clone().acquire_owned() => permit
                            .map_err(|e| AppError::Internal(format!("Semaphore closed: {}", e)))?,
                    };

                    let engine = self.engine.clone();
                    let transport = self.transport.clone();
                    let stats = self.stats.clone();
                    tasks.spawn(async move {
                        handle_delivery(&engine, transport.as_ref(), &stats, delivery).await;
                        drop(permit);
                    });
                }
            }
        }

        info!(in_flight = tasks.len(), "Consumer stopping");
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("Delivery task failed: {}", e);
            }
        }
        info!("Consumer stopped");
        Ok(())
    }
}

/// Take one delivery to a terminal state
pub async fn handle_delivery(
    engine: &ReconciliationEngine,
    transport: &dyn EventTransport,
    stats: &PipelineStats,
    delivery: Delivery,
) {
    stats.record_received();
    let Delivery {
        routing_key,
        event,
        acker,
    } = delivery;

    match engine.process(&routing_key, event).await {
        Ok(Outcome::Persisted(document)) => {
            debug!(document_id = document.id, "Delivery persisted");
            stats.record_persisted();
            acknowledge(acker).await;
        }
        Ok(Outcome::Requeued { destination, event }) => {
            if republish(engine, transport, stats, destination, event).await {
                acknowledge(acker).await;
            } else {
                release(acker, stats).await;
            }
        }
        Err(err) if err.is_fatal_for_message() => {
            error!(code = err.error_code(), "Dropping delivery: {}", err);
            stats.record_discarded();
            acknowledge(acker).await;
        }
        Err(err) => {
            error!(code = err.error_code(), "Releasing delivery for redelivery: {}", err);
            release(acker, stats).await;
        }
    }
}

/// Publish a requeued event. A failed publish is itself recorded as an
/// attempt and the event is published once more to the ledger's new choice.
///
/// Returns whether the event was published.
async fn republish(
    engine: &ReconciliationEngine,
    transport: &dyn EventTransport,
    stats: &PipelineStats,
    destination: RoutingKey,
    event: CallEvent,
) -> bool {
    let err = match transport.publish(&destination, &event).await {
        Ok(()) => {
            record_requeue(stats, &destination);
            return true;
        }
        Err(err) => err,
    };

    stats.record_publish_failure();
    let failure = Failure::publish(&err);
    warn!(
        code = failure.kind.code(),
        invalid = %failure.field_label(),
        session = %event.session_label(),
        "{}", failure.reason
    );

    let (event, destination) = engine.ledger().on_failure(&destination, event, &[failure]);
    match transport.publish(&destination, &event).await {
        Ok(()) => {
            record_requeue(stats, &destination);
            true
        }
        Err(err) => {
            stats.record_publish_failure();
            error!(
                session = %event.session_label(),
                "Message was not published to {}, releasing it for redelivery: {}",
                destination, err
            );
            false
        }
    }
}

fn record_requeue(stats: &PipelineStats, destination: &RoutingKey) {
    if destination.stage.is_terminal() {
        stats.record_rejected();
    } else {
        stats.record_requeued();
    }
}

async fn acknowledge(acker: Box<dyn Acknowledger>) {
    if let Err(e) = acker.ack().await {
        error!("Failed to acknowledge delivery: {}", e);
    }
}

async fn release(acker: Box<dyn Acknowledger>, stats: &PipelineStats) {
    stats.record_released();
    if let Err(e) = acker.nack().await {
        error!("Failed to release delivery: {}", e);
    }
}
