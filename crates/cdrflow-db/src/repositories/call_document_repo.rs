//! Call document repository implementation
//!
//! Stores start documents and completed call documents as JSONB rows in a
//! single `call_documents` table, keyed by session id and document type.
//! Uses runtime queries (not compile-time macros) to avoid requiring
//! database connection at build time.

use async_trait::async_trait;
use cdrflow_core::{
    models::{CallRecord, StartRecord},
    traits::{CallDocumentStore, StoredDocument},
    AppError, AppResult,
};
use serde::Serialize;
use sqlx::types::Json;
use sqlx::PgPool;
use std::fmt;
use tracing::{debug, error, instrument};

/// Kind of document held in a row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentType {
    /// A validated start event waiting for its stop
    Start,
    /// A completed call
    Call,
}

impl DocumentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::Start => "start",
            DocumentType::Call => "call",
        }
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// PostgreSQL implementation of CallDocumentStore
#[derive(Clone)]
pub struct PgCallDocumentRepository {
    pool: PgPool,
}

impl PgCallDocumentRepository {
    /// Create a new call document repository
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert_document<T: Serialize + Sync>(
        &self,
        session_id: &str,
        doc_type: DocumentType,
        document: &T,
        created_at: chrono::DateTime<chrono::Utc>,
        modified_at: Option<chrono::DateTime<chrono::Utc>>,
    ) -> AppResult<StoredDocument> {
        let (id, session_id): (i64, String) = sqlx::query_as(
            r#"
            INSERT INTO call_documents (session_id, doc_type, document, created_at, modified_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, session_id
            "#,
        )
        .bind(session_id)
        .bind(doc_type.as_str())
        .bind(Json(document))
        .bind(created_at)
        .bind(modified_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            error!("Database error storing {} document for {}: {}", doc_type, session_id, e);
            AppError::Database(format!("Failed to store {} document: {}", doc_type, e))
        })?;

        debug!("Stored {} document {} for session {}", doc_type, id, session_id);
        Ok(StoredDocument { id, session_id })
    }
}

#[async_trait]
impl CallDocumentStore for PgCallDocumentRepository {
    #[instrument(skip(self, record), fields(session = %record.session_id))]
    async fn insert_start_record(&self, record: &StartRecord) -> AppResult<StoredDocument> {
        self.insert_document(
            &record.session_id,
            DocumentType::Start,
            record,
            record.created_at,
            None,
        )
        .await
    }

    #[instrument(skip(self, record), fields(session = %record.session_id))]
    async fn insert_call_record(&self, record: &CallRecord) -> AppResult<StoredDocument> {
        self.insert_document(
            &record.session_id,
            DocumentType::Call,
            record,
            record.created_at,
            Some(record.modified_at),
        )
        .await
    }

    #[instrument(skip(self))]
    async fn find_start_records(&self, session_id: &str) -> AppResult<Vec<StartRecord>> {
        debug!("Finding start documents for session: {}", session_id);

        let rows = sqlx::query_as::<sqlx::Postgres, StartDocumentRow>(
            r#"
            SELECT id, session_id, document
            FROM call_documents
            WHERE session_id = $1 AND doc_type = $2
            ORDER BY id
            "#,
        )
        .bind(session_id)
        .bind(DocumentType::Start.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Database error finding start of {}: {}", session_id, e);
            AppError::Database(format!("Failed to find start documents: {}", e))
        })?;

        rows.into_iter().map(StartRecord::try_from).collect()
    }

    async fn health_check(&self) -> AppResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::Database(format!("Database health check failed: {}", e)))?;
        Ok(())
    }
}

// ==================== Row types ====================

#[derive(Debug, sqlx::FromRow)]
struct StartDocumentRow {
    id: i64,
    session_id: String,
    document: Json<serde_json::Value>,
}

impl TryFrom<StartDocumentRow> for StartRecord {
    type Error = AppError;

    fn try_from(row: StartDocumentRow) -> Result<Self, Self::Error> {
        let record: StartRecord = serde_json::from_value(row.document.0).map_err(|e| {
            error!("Start document {} is unreadable: {}", row.id, e);
            AppError::Serialization(format!("Start document {} is unreadable: {}", row.id, e))
        })?;

        if record.session_id != row.session_id {
            return Err(AppError::Database(format!(
                "Start document {} is filed under {} but belongs to {}",
                row.id, row.session_id, record.session_id
            )));
        }
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdrflow_core::models::{Action, CallEvent};
    use serde_json::json;

    fn start_record() -> StartRecord {
        StartRecord::new(
            "1420713000-5",
            CallEvent {
                action: Some(Action::Start),
                session_id: Some("1420713000-5".to_string()),
                sip_method: Some("INVITE".to_string()),
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_start_row_conversion() {
        let record = start_record();
        let row = StartDocumentRow {
            id: 7,
            session_id: "1420713000-5".to_string(),
            document: Json(serde_json::to_value(&record).unwrap()),
        };

        let converted = StartRecord::try_from(row).unwrap();
        assert_eq!(converted, record);
    }

    #[test]
    fn test_unreadable_row() {
        let row = StartDocumentRow {
            id: 8,
            session_id: "x".to_string(),
            document: Json(json!({"session": 12})),
        };
        let err = StartRecord::try_from(row).unwrap_err();
        assert_eq!(err.error_code(), "serialization_error");
    }

    #[test]
    fn test_misfiled_row() {
        let row = StartDocumentRow {
            id: 9,
            session_id: "other".to_string(),
            document: Json(serde_json::to_value(start_record()).unwrap()),
        };
        assert!(StartRecord::try_from(row).is_err());
    }

    #[test]
    fn test_document_type_names() {
        assert_eq!(DocumentType::Start.to_string(), "start");
        assert_eq!(DocumentType::Call.as_str(), "call");
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_insert_and_find_start() {
        let config = cdrflow_core::config::DatabaseConfig {
            url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgresql://localhost/cdrflow".to_string()),
            max_connections: 2,
            min_connections: 1,
            acquire_timeout_secs: 5,
            idle_timeout_secs: 60,
        };
        let pool = crate::create_pool(&config).await.unwrap();
        crate::ensure_schema(&pool).await.unwrap();
        let repo = PgCallDocumentRepository::new(pool);

        let mut record = start_record();
        record.session_id = format!("it-{}", chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default());
        repo.insert_start_record(&record).await.unwrap();

        let found = repo.find_start_records(&record.session_id).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].session_id, record.session_id);
    }
}
