//! Integration tests for the reconciliation pipeline
//!
//! The engine and consumer run against in-memory implementations of the
//! document store and the queue transport.

use async_trait::async_trait;
use cdrflow_core::models::{
    Action, CallEvent, CallRecord, EventTimestamp, QueueStage, RoutingKey, StartRecord,
};
use cdrflow_core::traits::{
    Acknowledger, CallDocumentStore, Delivery, DeliveryStream, EventTransport, StoredDocument,
};
use cdrflow_core::{AppError, AppResult, PipelineConfig};
use cdrflow_services::consumer::handle_delivery;
use cdrflow_services::{EventConsumer, Outcome, PipelineStats, ReconciliationEngine};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

// ==================== In-memory store ====================

#[derive(Default)]
struct MemoryStore {
    starts: Mutex<Vec<StartRecord>>,
    calls: Mutex<Vec<CallRecord>>,
    next_id: AtomicUsize,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
}

impl MemoryStore {
    fn next_document(&self, session_id: &str) -> StoredDocument {
        StoredDocument {
            id: self.next_id.fetch_add(1, Ordering::SeqCst) as i64 + 1,
            session_id: session_id.to_string(),
        }
    }

    fn starts(&self) -> Vec<StartRecord> {
        self.starts.lock().unwrap().clone()
    }

    fn calls(&self) -> Vec<CallRecord> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CallDocumentStore for MemoryStore {
    async fn insert_start_record(&self, record: &StartRecord) -> AppResult<StoredDocument> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(AppError::Database("connection refused".to_string()));
        }
        self.starts.lock().unwrap().push(record.clone());
        Ok(self.next_document(&record.session_id))
    }

    async fn insert_call_record(&self, record: &CallRecord) -> AppResult<StoredDocument> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(AppError::Database("connection refused".to_string()));
        }
        self.calls.lock().unwrap().push(record.clone());
        Ok(self.next_document(&record.session_id))
    }

    async fn find_start_records(&self, session_id: &str) -> AppResult<Vec<StartRecord>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(AppError::Database("connection refused".to_string()));
        }
        Ok(self
            .starts
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.session_id == session_id)
            .cloned()
            .collect())
    }
}

// ==================== In-memory transport ====================

#[derive(Default)]
struct MemoryTransport {
    queued: Mutex<HashMap<QueueStage, Vec<(String, CallEvent)>>>,
    published: Mutex<Vec<(RoutingKey, CallEvent)>>,
    /// Number of upcoming publishes that fail
    failing_publishes: AtomicUsize,
    acks: Arc<AtomicUsize>,
    nacks: Arc<AtomicUsize>,
}

impl MemoryTransport {
    fn enqueue(&self, stage: QueueStage, routing_key: &str, event: CallEvent) {
        self.queued
            .lock()
            .unwrap()
            .entry(stage)
            .or_default()
            .push((routing_key.to_string(), event));
    }

    fn delivery(&self, routing_key: &str, event: CallEvent) -> Delivery {
        Delivery {
            routing_key: routing_key.to_string(),
            event,
            acker: Box::new(CountingAcker {
                acks: self.acks.clone(),
                nacks: self.nacks.clone(),
            }),
        }
    }

    fn published(&self) -> Vec<(RoutingKey, CallEvent)> {
        self.published.lock().unwrap().clone()
    }

    fn acks(&self) -> usize {
        self.acks.load(Ordering::SeqCst)
    }

    fn nacks(&self) -> usize {
        self.nacks.load(Ordering::SeqCst)
    }
}

struct CountingAcker {
    acks: Arc<AtomicUsize>,
    nacks: Arc<AtomicUsize>,
}

#[async_trait]
impl Acknowledger for CountingAcker {
    async fn ack(self: Box<Self>) -> AppResult<()> {
        self.acks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn nack(self: Box<Self>) -> AppResult<()> {
        self.nacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl EventTransport for MemoryTransport {
    async fn publish(&self, routing_key: &RoutingKey, event: &CallEvent) -> AppResult<()> {
        let failing = self.failing_publishes.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_publishes.store(failing - 1, Ordering::SeqCst);
            return Err(AppError::Publish {
                routing_key: routing_key.to_string(),
                reason: "channel closed".to_string(),
            });
        }
        self.published
            .lock()
            .unwrap()
            .push((*routing_key, event.clone()));
        Ok(())
    }

    async fn subscribe(&self, stage: QueueStage) -> AppResult<DeliveryStream> {
        let queued = self
            .queued
            .lock()
            .unwrap()
            .remove(&stage)
            .unwrap_or_default();
        let deliveries: Vec<AppResult<Delivery>> = queued
            .into_iter()
            .map(|(key, event)| Ok(self.delivery(&key, event)))
            .collect();
        Ok(Box::pin(futures::stream::iter(deliveries)))
    }
}

// ==================== Fixtures ====================

fn config() -> PipelineConfig {
    PipelineConfig {
        stop_lookup_delay_ms: 0,
        concurrency: 4,
        ..Default::default()
    }
}

fn engine(store: Arc<MemoryStore>) -> ReconciliationEngine {
    ReconciliationEngine::new(store, &config())
}

fn event(value: serde_json::Value) -> CallEvent {
    serde_json::from_value(value).unwrap()
}

fn start_event(session: &str, timestamp: &str) -> CallEvent {
    event(json!({
        "Sip-To-User": "+77775678900",
        "Acct-Session-Id": session,
        "Service-Type": "Sip-Session",
        "Sip-From-User": "Anonymous",
        "Sip-Method": "INVITE",
        "Event-Timestamp": timestamp,
        "action": "start",
        "Acct-Delay-Time": "0"
    }))
}

fn stop_event(session: &str, timestamp: &str, delay: &str) -> CallEvent {
    event(json!({
        "Sip-To-User": "+77775678900",
        "Acct-Session-Id": session,
        "Service-Type": "Sip-Session",
        "Sip-From-User": "Anonymous",
        "Sip-Method": "BYE",
        "Event-Timestamp": timestamp,
        "action": "stop",
        "Acct-Delay-Time": delay
    }))
}

fn expect_requeued(outcome: Outcome) -> (RoutingKey, CallEvent) {
    match outcome {
        Outcome::Requeued { destination, event } => (destination, event),
        Outcome::Persisted(doc) => panic!("expected requeue, got persisted document {}", doc.id),
    }
}

// ==================== Engine ====================

#[tokio::test]
async fn test_valid_start_is_stored_once() {
    let store = Arc::new(MemoryStore::default());
    let engine = engine(store.clone());

    let outcome = engine
        .process("call.start", start_event("s-1", "Jan 08 2015 10:30:00 CEST"))
        .await
        .unwrap();

    assert!(matches!(outcome, Outcome::Persisted(_)));
    let starts = store.starts();
    assert_eq!(starts.len(), 1);
    assert_eq!(starts[0].session_id, "s-1");
    assert_eq!(
        starts[0].start_event.timestamp_iso.as_deref(),
        Some("2015-01-08T08:30:00.000Z")
    );
}

#[tokio::test]
async fn test_stop_merges_with_start() {
    let store = Arc::new(MemoryStore::default());
    let engine = engine(store.clone());

    engine
        .process("call.start", start_event("s-2", "Jan 08 2015 10:30:00 CEST"))
        .await
        .unwrap();
    let outcome = engine
        .process("call.stop", stop_event("s-2", "Jan 08 2015 10:30:35 CEST", "5"))
        .await
        .unwrap();

    assert!(matches!(outcome, Outcome::Persisted(_)));
    let calls = store.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].duration_seconds, 30.0);
    assert_eq!(calls[0].start_event.action, Some(Action::Start));
    assert_eq!(calls[0].stop_event.action, Some(Action::Stop));
    assert_eq!(calls[0].stop_event.extra.get("Service-Type"), Some(&json!("Sip-Session")));
}

#[tokio::test]
async fn test_stop_before_start_is_negative_duration() {
    let store = Arc::new(MemoryStore::default());
    let engine = engine(store.clone());

    engine
        .process("call.start", start_event("s-3", "Jan 08 2015 10:30:35 CEST"))
        .await
        .unwrap();
    let outcome = engine
        .process("call.stop", stop_event("s-3", "Jan 08 2015 10:30:00 CEST", "0"))
        .await
        .unwrap();

    let (destination, event) = expect_requeued(outcome);
    assert_eq!(destination.to_string(), "retry.call.stop");
    assert_eq!(event.retry_history[0].invalid_fields(), json!("duration"));
    assert!(store.calls().is_empty());
}

#[tokio::test]
async fn test_stop_without_start_is_retried() {
    let store = Arc::new(MemoryStore::default());
    let engine = engine(store.clone());

    let outcome = engine
        .process("call.stop", stop_event("missing", "Jan 08 2015 10:30:35 CEST", "0"))
        .await
        .unwrap();

    let (destination, event) = expect_requeued(outcome);
    assert_eq!(destination.to_string(), "retry.call.stop");
    let attempt = &event.retry_history[0];
    assert_eq!(attempt.invalid_fields(), json!("Acct-Session-Id"));
    assert_eq!(attempt.reasons(), json!("Acct-Session-Id not found in database"));
}

#[tokio::test]
async fn test_multiple_starts_use_the_first() {
    let store = Arc::new(MemoryStore::default());
    let engine = engine(store.clone());

    engine
        .process("call.start", start_event("dup", "Jan 08 2015 10:30:00 CEST"))
        .await
        .unwrap();
    engine
        .process("call.start", start_event("dup", "Jan 08 2015 10:30:20 CEST"))
        .await
        .unwrap();
    engine
        .process("call.stop", stop_event("dup", "Jan 08 2015 10:30:40 CEST", "0"))
        .await
        .unwrap();

    let calls = store.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].duration_seconds, 40.0);
}

#[tokio::test]
async fn test_structured_timestamps_reconcile() {
    let store = Arc::new(MemoryStore::default());
    let engine = engine(store.clone());

    let mut start = start_event("s-4", "");
    start.timestamp = Some(EventTimestamp::structured(1_419_350_815_635));
    let mut stop = stop_event("s-4", "", "0");
    stop.timestamp = Some(EventTimestamp::structured(1_419_350_875_135));

    engine.process("call.start", start).await.unwrap();
    engine.process("call.stop", stop).await.unwrap();

    assert_eq!(store.calls()[0].duration_seconds, 59.5);
}

#[tokio::test]
async fn test_invalid_timestamp_is_not_cached() {
    let store = Arc::new(MemoryStore::default());
    let engine = engine(store.clone());

    let outcome = engine
        .process("call.start", start_event("s-5", "asdasd"))
        .await
        .unwrap();

    let (destination, event) = expect_requeued(outcome);
    assert_eq!(destination.to_string(), "retry.call.start");
    assert!(event.timestamp_iso.is_none());
    assert_eq!(event.retry_history[0].invalid_fields(), json!("timestamp"));
    assert!(store.starts().is_empty());
}

#[tokio::test]
async fn test_missing_parties_is_one_cause() {
    let store = Arc::new(MemoryStore::default());
    let engine = engine(store.clone());

    let mut start = start_event("s-6", "Jan 08 2015 10:30:00 CEST");
    start.to_user = None;
    start.from_user = None;

    let (_, event) = expect_requeued(engine.process("call.start", start).await.unwrap());
    let attempt = &event.retry_history[0];
    assert!(!attempt.is_multi_cause());
    assert_eq!(attempt.invalid_fields(), json!(["Sip-To-User", "Sip-From-User"]));
    assert_eq!(attempt.reasons(), json!("property missing"));
}

#[tokio::test]
async fn test_numeric_fields_are_validated_not_dropped() {
    let store = Arc::new(MemoryStore::default());
    let engine = engine(store.clone());

    let valid = event(json!({
        "action": "start",
        "Acct-Session-Id": 1420713000,
        "Sip-Method": "INVITE",
        "Sip-To-User": 77775678900_i64,
        "Sip-From-User": "Anonymous",
        "Event-Timestamp": "Jan 08 2015 10:30:00 CEST"
    }));
    let outcome = engine.process("call.start", valid).await.unwrap();
    assert!(matches!(outcome, Outcome::Persisted(_)));
    assert_eq!(store.starts()[0].session_id, "1420713000");

    let short = event(json!({
        "action": "start",
        "Acct-Session-Id": "num-2",
        "Sip-Method": "INVITE",
        "Sip-To-User": 1234,
        "Sip-From-User": "Anonymous",
        "Event-Timestamp": "Jan 08 2015 10:30:00 CEST"
    }));
    let (destination, event) = expect_requeued(engine.process("call.start", short).await.unwrap());
    assert_eq!(destination.to_string(), "retry.call.start");
    assert_eq!(event.retry_history.len(), 1);
}

#[tokio::test]
async fn test_ladder_with_two_attempts() {
    let store = Arc::new(MemoryStore::default());
    let engine = engine(store.clone());

    let bad = start_event("s-7", "asdasd");
    let (first, event) = expect_requeued(engine.process("call.start", bad).await.unwrap());
    assert_eq!(first.to_string(), "retry.call.start");

    let (second, event) =
        expect_requeued(engine.process(&first.to_string(), event).await.unwrap());
    assert_eq!(second.to_string(), "rejected.call.start");
    assert_eq!(event.attempts(), 2);
}

#[tokio::test]
async fn test_store_failure_is_external_error() {
    let store = Arc::new(MemoryStore::default());
    store.fail_writes.store(true, Ordering::SeqCst);
    let engine = engine(store.clone());

    let outcome = engine
        .process("call.start", start_event("s-8", "Jan 08 2015 10:30:00 CEST"))
        .await
        .unwrap();

    let (destination, event) = expect_requeued(outcome);
    assert_eq!(destination.to_string(), "retry.call.start");
    assert_eq!(event.retry_history[0].invalid_fields(), json!("service"));
}

#[tokio::test]
async fn test_lookup_failure_is_external_error() {
    let store = Arc::new(MemoryStore::default());
    store.fail_reads.store(true, Ordering::SeqCst);
    let engine = engine(store.clone());

    let outcome = engine
        .process("call.stop", stop_event("s-9", "Jan 08 2015 10:30:00 CEST", "0"))
        .await
        .unwrap();

    let (_, event) = expect_requeued(outcome);
    assert_eq!(event.retry_history[0].invalid_fields(), json!("service"));
}

#[tokio::test]
async fn test_unknown_routing_key() {
    let engine = engine(Arc::new(MemoryStore::default()));
    let err = engine
        .process("call.pause", start_event("s-10", "Jan 08 2015 10:30:00 CEST"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::UnknownRoutingKey(_)));
}

// ==================== Consumer ====================

#[tokio::test]
async fn test_persisted_delivery_is_acknowledged() {
    let store = Arc::new(MemoryStore::default());
    let engine = engine(store.clone());
    let transport = MemoryTransport::default();
    let stats = PipelineStats::new();

    let delivery = transport.delivery("call.start", start_event("c-1", "Jan 08 2015 10:30:00 CEST"));
    handle_delivery(&engine, &transport, &stats, delivery).await;

    assert_eq!(transport.acks(), 1);
    assert!(transport.published().is_empty());
    assert_eq!(stats.snapshot().persisted, 1);
}

#[tokio::test]
async fn test_requeued_delivery_is_published_then_acknowledged() {
    let engine = engine(Arc::new(MemoryStore::default()));
    let transport = MemoryTransport::default();
    let stats = PipelineStats::new();

    let delivery = transport.delivery("call.start", start_event("c-2", "asdasd"));
    handle_delivery(&engine, &transport, &stats, delivery).await;

    let published = transport.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].0.to_string(), "retry.call.start");
    assert_eq!(published[0].1.attempts(), 1);
    assert_eq!(transport.acks(), 1);
    assert_eq!(stats.snapshot().requeued, 1);
}

#[tokio::test]
async fn test_publish_failure_is_recorded_and_escalated() {
    let engine = engine(Arc::new(MemoryStore::default()));
    let transport = MemoryTransport::default();
    transport.failing_publishes.store(1, Ordering::SeqCst);
    let stats = PipelineStats::new();

    let delivery = transport.delivery("call.start", start_event("c-3", "asdasd"));
    handle_delivery(&engine, &transport, &stats, delivery).await;

    let published = transport.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].0.to_string(), "rejected.call.start");
    assert_eq!(published[0].1.attempts(), 2);
    assert_eq!(published[0].1.retry_history[1].invalid_fields(), json!("publish"));
    assert_eq!(transport.acks(), 1);

    let snapshot = stats.snapshot();
    assert_eq!(snapshot.publish_failures, 1);
    assert_eq!(snapshot.rejected, 1);
}

#[tokio::test]
async fn test_repeated_publish_failure_releases_delivery() {
    let engine = engine(Arc::new(MemoryStore::default()));
    let transport = MemoryTransport::default();
    transport.failing_publishes.store(2, Ordering::SeqCst);
    let stats = PipelineStats::new();

    let delivery = transport.delivery("call.start", start_event("c-4", "asdasd"));
    handle_delivery(&engine, &transport, &stats, delivery).await;

    assert!(transport.published().is_empty());
    assert_eq!(transport.acks(), 0);
    assert_eq!(transport.nacks(), 1);

    let snapshot = stats.snapshot();
    assert_eq!(snapshot.publish_failures, 2);
    assert_eq!(snapshot.released, 1);
}

#[tokio::test]
async fn test_unknown_routing_key_is_acknowledged_and_dropped() {
    let engine = engine(Arc::new(MemoryStore::default()));
    let transport = MemoryTransport::default();
    let stats = PipelineStats::new();

    let delivery = transport.delivery("billing.start", start_event("c-5", "Jan 08 2015 10:30:00 CEST"));
    handle_delivery(&engine, &transport, &stats, delivery).await;

    assert_eq!(transport.acks(), 1);
    assert!(transport.published().is_empty());
    assert_eq!(stats.snapshot().discarded, 1);
}

#[tokio::test]
async fn test_consumer_drains_subscription() {
    let store = Arc::new(MemoryStore::default());
    let engine = Arc::new(engine(store.clone()));
    let transport = Arc::new(MemoryTransport::default());
    let stats = Arc::new(PipelineStats::new());

    for i in 0..5 {
        transport.enqueue(
            QueueStage::Primary,
            "call.start",
            start_event(&format!("run-{}", i), "Jan 08 2015 10:30:00 CEST"),
        );
    }
    transport.enqueue(QueueStage::Primary, "call.start", start_event("run-bad", "asdasd"));

    let consumer = EventConsumer::new(
        QueueStage::Primary,
        engine,
        transport.clone(),
        stats.clone(),
        2,
    );
    consumer.run(CancellationToken::new()).await.unwrap();

    assert_eq!(store.starts().len(), 5);
    assert_eq!(transport.published().len(), 1);
    assert_eq!(transport.acks(), 6);
    assert_eq!(transport.nacks(), 0);

    let snapshot = stats.snapshot();
    assert_eq!(snapshot.received, 6);
    assert_eq!(snapshot.persisted, 5);
    assert_eq!(snapshot.requeued, 1);
}

#[tokio::test]
async fn test_consumer_stops_on_cancel() {
    let engine = Arc::new(engine(Arc::new(MemoryStore::default())));
    let transport = Arc::new(PendingTransport);
    let shutdown = CancellationToken::new();

    let consumer = EventConsumer::new(
        QueueStage::Retry,
        engine,
        transport,
        Arc::new(PipelineStats::new()),
        1,
    );
    let handle = tokio::spawn(consumer.run(shutdown.clone()));
    shutdown.cancel();

    handle.await.unwrap().unwrap();
}

/// Transport whose subscription never yields
struct PendingTransport;

#[async_trait]
impl EventTransport for PendingTransport {
    async fn publish(&self, _: &RoutingKey, _: &CallEvent) -> AppResult<()> {
        Ok(())
    }

    async fn subscribe(&self, _: QueueStage) -> AppResult<DeliveryStream> {
        Ok(Box::pin(futures::stream::pending::<AppResult<Delivery>>()))
    }
}
