//! Unified error handling for cdrflow
//!
//! `AppError` covers infrastructure failures (database, queue, configuration).
//! Problems with the *data* of a call event are modelled separately as
//! [`Failure`](crate::failure::Failure) values, which feed the retry ladder.

use thiserror::Error;

/// Main application error type
#[derive(Error, Debug)]
pub enum AppError {
    // ==================== Database Errors ====================
    #[error("Database error: {0}")]
    Database(String),

    #[error("Database pool error: {0}")]
    Pool(String),

    // ==================== Queue Errors ====================
    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Queue connection failed: {0}")]
    QueueConnection(String),

    #[error("Message was not published to {routing_key}: {reason}")]
    Publish { routing_key: String, reason: String },

    #[error("Unknown routing key: {0}")]
    UnknownRoutingKey(String),

    // ==================== Internal Errors ====================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl AppError {
    /// Returns a stable, machine-readable error code
    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::Database(_) => "database_error",
            AppError::Pool(_) => "pool_error",
            AppError::Queue(_) => "queue_error",
            AppError::QueueConnection(_) => "queue_connection_error",
            AppError::Publish { .. } => "publish_error",
            AppError::UnknownRoutingKey(_) => "unknown_routing_key",
            AppError::Internal(_) => "internal_error",
            AppError::Config(_) => "config_error",
            AppError::Serialization(_) => "serialization_error",
        }
    }

    /// Whether the error stems from routing/topology misconfiguration.
    ///
    /// Such messages are logged and dropped rather than retried.
    pub fn is_fatal_for_message(&self) -> bool {
        matches!(self, AppError::UnknownRoutingKey(_))
    }
}

// ==================== From implementations ====================

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}
