//! Common traits for the document store and the queue transport
//!
//! The pipeline only talks to its collaborators through these abstractions,
//! so the engine can run against PostgreSQL/Redis in production and in-memory
//! fakes in tests.

use crate::error::AppError;
use crate::models::{CallEvent, CallRecord, QueueStage, RoutingKey, StartRecord};
use async_trait::async_trait;
use futures::stream::BoxStream;

/// Identity of a document written by the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredDocument {
    pub id: i64,
    pub session_id: String,
}

/// Persistence of start documents and completed call documents
#[async_trait]
pub trait CallDocumentStore: Send + Sync {
    /// Insert the start document of a call
    async fn insert_start_record(&self, record: &StartRecord) -> Result<StoredDocument, AppError>;

    /// Insert the final merged document of a call
    async fn insert_call_record(&self, record: &CallRecord) -> Result<StoredDocument, AppError>;

    /// Fetch every start document stored for a session, oldest first.
    ///
    /// An empty vector means the start has not been stored (yet).
    async fn find_start_records(&self, session_id: &str) -> Result<Vec<StartRecord>, AppError>;

    /// Verify the store is reachable
    async fn health_check(&self) -> Result<(), AppError> {
        Ok(())
    }
}

/// Settles one delivered message with the transport.
///
/// Both methods consume the acknowledger, so a message is settled at most once.
#[async_trait]
pub trait Acknowledger: Send {
    /// The message reached a terminal state and is removed
    async fn ack(self: Box<Self>) -> Result<(), AppError>;

    /// The message was not handled and goes back on its queue, untouched
    async fn nack(self: Box<Self>) -> Result<(), AppError>;
}

/// A message received from a queue
pub struct Delivery {
    /// Routing key the message was published under, unparsed
    pub routing_key: String,
    pub event: CallEvent,
    pub acker: Box<dyn Acknowledger>,
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("routing_key", &self.routing_key)
            .field("session", &self.event.session_label())
            .finish_non_exhaustive()
    }
}

/// Stream of deliveries from one subscription
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AppError>>;

/// Publish/subscribe access to the queue ladder
#[async_trait]
pub trait EventTransport: Send + Sync {
    /// Publish an event under a routing key
    async fn publish(&self, routing_key: &RoutingKey, event: &CallEvent) -> Result<(), AppError>;

    /// Consume the queue collecting `stage`
    async fn subscribe(&self, stage: QueueStage) -> Result<DeliveryStream, AppError>;

    /// Verify the transport is reachable
    async fn health_check(&self) -> Result<(), AppError> {
        Ok(())
    }
}
