//! Redis queue transport for cdrflow
//!
//! Implements `EventTransport` on Redis lists using the reliable-queue
//! pattern:
//!
//! - `publish` pushes an envelope onto the list bound to the routing key
//! - receiving moves an entry atomically into the queue's processing list
//!   (`BLMOVE`), so a crash never loses it
//! - acknowledging removes the entry from the processing list (`LREM`)
//! - releasing removes it and pushes it back onto the queue, at the end of
//!   the line
//! - subscribing first puts leftovers from the processing list back on the
//!   queue
//!
//! # Example
//!
//! ```no_run
//! use cdrflow_core::config::QueueConfig;
//! use cdrflow_queue::RedisQueueTransport;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = QueueConfig {
//!         url: "redis://127.0.0.1:6379".to_string(),
//!         prefix: "cdr_queue".to_string(),
//!         block_timeout_secs: 5,
//!     };
//!     let transport = RedisQueueTransport::new(&config).await?;
//!     transport.ping().await?;
//!     Ok(())
//! }
//! ```

pub mod envelope;
pub mod keys;

use async_trait::async_trait;
use cdrflow_core::config::QueueConfig;
use cdrflow_core::error::AppError;
use cdrflow_core::models::{CallEvent, QueueStage, RoutingKey};
use cdrflow_core::traits::{Acknowledger, Delivery, DeliveryStream, EventTransport};
use redis::{aio::ConnectionManager, Client, RedisError};
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

use crate::envelope::Decoded;
use crate::keys::QueueKeys;

/// Pause after a failed receive before trying again
const RECEIVE_BACKOFF: Duration = Duration::from_secs(1);

/// Redis list transport with connection pooling
///
/// Publishing and acknowledging share one multiplexed ConnectionManager.
/// Each subscription gets its own connection because `BLMOVE` blocks the
/// connection it runs on.
#[derive(Clone)]
pub struct RedisQueueTransport {
    client: Client,
    manager: ConnectionManager,
    keys: QueueKeys,
    block_timeout_secs: u64,
}

impl RedisQueueTransport {
    /// Connect to Redis
    ///
    /// # Errors
    ///
    /// Returns `AppError::QueueConnection` if the connection fails
    pub async fn new(config: &QueueConfig) -> Result<Self, AppError> {
        debug!("Connecting to Redis at {}", config.url);

        let client = Client::open(config.url.as_str()).map_err(|e| {
            error!("Failed to create Redis client: {}", e);
            AppError::QueueConnection(format!("Invalid Redis URL: {}", e))
        })?;

        let manager = Self::connect(&client).await?;

        info!(prefix = %config.prefix, "Redis queue transport ready");
        Ok(Self {
            client,
            manager,
            keys: QueueKeys::new(config.prefix.clone()),
            block_timeout_secs: config.block_timeout_secs.max(1),
        })
    }

    async fn connect(client: &Client) -> Result<ConnectionManager, AppError> {
        ConnectionManager::new(client.clone()).await.map_err(|e| {
            error!("Failed to establish Redis connection: {}", e);
            AppError::QueueConnection(format!("Connection failed: {}", e))
        })
    }

    pub fn keys(&self) -> &QueueKeys {
        &self.keys
    }

    /// Ping the Redis server to check connectivity
    pub async fn ping(&self) -> Result<(), AppError> {
        let mut conn = self.manager.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }

    /// Number of waiting messages per queue, primary first
    pub async fn queue_depths(&self) -> Result<Vec<(String, u64)>, AppError> {
        let mut conn = self.manager.clone();
        let mut depths = Vec::with_capacity(QueueStage::ALL.len());
        for stage in QueueStage::ALL {
            let queue = self.keys.queue(stage);
            let len: u64 = redis::cmd("LLEN")
                .arg(&queue)
                .query_async(&mut conn)
                .await
                .map_err(map_redis_error)?;
            depths.push((queue, len));
        }
        Ok(depths)
    }

    /// Move unacknowledged messages of a previous run back onto the queue,
    /// oldest ending up first in line.
    async fn recover_in_flight(&self, stage: QueueStage) -> Result<usize, AppError> {
        let mut conn = self.manager.clone();
        let queue = self.keys.queue(stage);
        let processing = self.keys.processing(stage);

        let mut recovered = 0;
        loop {
            let moved: Option<String> = redis::cmd("LMOVE")
                .arg(&processing)
                .arg(&queue)
                .arg("LEFT")
                .arg("RIGHT")
                .query_async(&mut conn)
                .await
                .map_err(map_redis_error)?;
            if moved.is_none() {
                break;
            }
            recovered += 1;
        }

        if recovered > 0 {
            warn!(queue = %queue, recovered, "Recovered unacknowledged messages");
        }
        Ok(recovered)
    }
}

#[async_trait]
impl EventTransport for RedisQueueTransport {
    #[instrument(skip(self, event), fields(session = %event.session_label()))]
    async fn publish(&self, routing_key: &RoutingKey, event: &CallEvent) -> Result<(), AppError> {
        let queue = self.keys.queue_for_key(routing_key);
        let body = envelope::encode(routing_key, event)?;

        let mut conn = self.manager.clone();
        let _: i64 = redis::cmd("LPUSH")
            .arg(&queue)
            .arg(body)
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                error!("Failed to publish to {}: {}", queue, e);
                AppError::Publish {
                    routing_key: routing_key.to_string(),
                    reason: e.to_string(),
                }
            })?;

        debug!("Published {} to {}", routing_key, queue);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn subscribe(&self, stage: QueueStage) -> Result<DeliveryStream, AppError> {
        self.recover_in_flight(stage).await?;

        let receiver = Receiver {
            blocking: Self::connect(&self.client).await?,
            manager: self.manager.clone(),
            queue: self.keys.queue(stage),
            processing: self.keys.processing(stage),
            rejected: self.keys.queue(QueueStage::Rejected),
            block_timeout_secs: self.block_timeout_secs,
        };

        info!(queue = %receiver.queue, "Subscribed");
        let stream = futures::stream::unfold(receiver, |mut receiver| async move {
            let next = receiver.next_delivery().await;
            Some((next, receiver))
        });
        Ok(Box::pin(stream))
    }

    async fn health_check(&self) -> Result<(), AppError> {
        self.ping().await
    }
}

/// Receiving side of one subscription
struct Receiver {
    blocking: ConnectionManager,
    manager: ConnectionManager,
    queue: String,
    processing: String,
    rejected: String,
    block_timeout_secs: u64,
}

impl Receiver {
    async fn next_delivery(&mut self) -> Result<Delivery, AppError> {
        loop {
            let raw = match self.receive().await {
                Ok(Some(raw)) => raw,
                Ok(None) => continue,
                Err(e) => {
                    error!(queue = %self.queue, "Failed to receive: {}", e);
                    tokio::time::sleep(RECEIVE_BACKOFF).await;
                    return Err(e);
                }
            };

            match envelope::decode(&raw) {
                Decoded::Message { routing_key, event } => {
                    return Ok(Delivery {
                        routing_key,
                        event,
                        acker: Box::new(RedisAcker {
                            manager: self.manager.clone(),
                            queue: self.queue.clone(),
                            processing: self.processing.clone(),
                            raw,
                        }),
                    });
                }
                Decoded::Malformed {
                    routing_key,
                    reason,
                } => {
                    error!(
                        queue = %self.queue,
                        routing_key = routing_key.as_deref().unwrap_or("<none>"),
                        "Rejecting malformed message: {}", reason
                    );
                    self.reject_raw(&raw).await?;
                }
            }
        }
    }

    /// Wait for one entry, moving it into the processing list
    async fn receive(&mut self) -> Result<Option<String>, AppError> {
        redis::cmd("BLMOVE")
            .arg(&self.queue)
            .arg(&self.processing)
            .arg("RIGHT")
            .arg("LEFT")
            .arg(self.block_timeout_secs)
            .query_async(&mut self.blocking)
            .await
            .map_err(map_redis_error)
    }

    /// Park an unreadable entry on the rejected queue
    async fn reject_raw(&mut self, raw: &str) -> Result<(), AppError> {
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("LPUSH")
            .arg(&self.rejected)
            .arg(raw)
            .ignore()
            .cmd("LREM")
            .arg(&self.processing)
            .arg(1)
            .arg(raw)
            .ignore();

        let _: () = pipe
            .query_async(&mut self.manager)
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }
}

/// Settles one entry of a processing list
struct RedisAcker {
    manager: ConnectionManager,
    queue: String,
    processing: String,
    raw: String,
}

#[async_trait]
impl Acknowledger for RedisAcker {
    async fn ack(self: Box<Self>) -> Result<(), AppError> {
        let RedisAcker {
            mut manager,
            processing,
            raw,
            ..
        } = *self;

        let removed: i64 = redis::cmd("LREM")
            .arg(&processing)
            .arg(1)
            .arg(&raw)
            .query_async(&mut manager)
            .await
            .map_err(map_redis_error)?;

        if removed == 0 {
            warn!(queue = %processing, "Acknowledged message was not in flight");
        }
        Ok(())
    }

    async fn nack(self: Box<Self>) -> Result<(), AppError> {
        let RedisAcker {
            mut manager,
            queue,
            processing,
            raw,
        } = *self;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("LREM")
            .arg(&processing)
            .arg(1)
            .arg(&raw)
            .ignore()
            .cmd("LPUSH")
            .arg(&queue)
            .arg(&raw)
            .ignore();

        let _: () = pipe
            .query_async(&mut manager)
            .await
            .map_err(map_redis_error)?;

        debug!(queue = %queue, "Released message back to the queue");
        Ok(())
    }
}

/// Convert RedisError to AppError
fn map_redis_error(err: RedisError) -> AppError {
    match err.kind() {
        redis::ErrorKind::IoError => {
            error!("Redis I/O error: {}", err);
            AppError::QueueConnection(format!("I/O error: {}", err))
        }
        redis::ErrorKind::TypeError => {
            warn!("Redis type error: {}", err);
            AppError::Queue(format!("Type mismatch: {}", err))
        }
        _ => {
            error!("Redis error: {}", err);
            AppError::Queue(err.to_string())
        }
    }
}
