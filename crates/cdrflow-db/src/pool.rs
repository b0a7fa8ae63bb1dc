//! PostgreSQL connection pool management
//!
//! Provides utilities for creating the connection pool and preparing the
//! call document schema.

use cdrflow_core::config::DatabaseConfig;
use cdrflow_core::{AppError, AppResult};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;
use tracing::{error, info, warn};

const CREATE_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS call_documents (
        id BIGSERIAL PRIMARY KEY,
        session_id TEXT NOT NULL,
        doc_type TEXT NOT NULL CHECK (doc_type IN ('start', 'call')),
        document JSONB NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        modified_at TIMESTAMPTZ
    )
"#;

const CREATE_SESSION_INDEX: &str = r#"
    CREATE INDEX IF NOT EXISTS idx_call_documents_session
        ON call_documents (session_id, doc_type)
"#;

/// Create a PostgreSQL connection pool
///
/// # Example
///
/// ```no_run
/// use cdrflow_core::AppConfig;
/// use cdrflow_db::create_pool;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = AppConfig::load()?;
///     let pool = create_pool(&config.database).await?;
///     Ok(())
/// }
/// ```
pub async fn create_pool(config: &DatabaseConfig) -> AppResult<PgPool> {
    info!("Creating database connection pool");

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections.min(config.max_connections))
        .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
        .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
        .test_before_acquire(true)
        .connect(&config.url)
        .await
        .map_err(|e| {
            warn!("Failed to create database pool: {}", e);
            AppError::Pool(format!("Failed to connect to database: {}", e))
        })?;

    info!(
        "Database pool created successfully with {} max connections",
        config.max_connections
    );

    // Test the connection
    sqlx::query("SELECT 1")
        .execute(&pool)
        .await
        .map_err(|e| AppError::Database(format!("Database health check failed: {}", e)))?;

    info!("Database connection verified");

    Ok(pool)
}

/// Create the call document table and its lookup index if missing
pub async fn ensure_schema(pool: &PgPool) -> AppResult<()> {
    for statement in [CREATE_TABLE, CREATE_SESSION_INDEX] {
        sqlx::query(statement).execute(pool).await.map_err(|e| {
            error!("Failed to prepare schema: {}", e);
            AppError::Database(format!("Failed to prepare schema: {}", e))
        })?;
    }

    info!("Call document schema ready");
    Ok(())
}
