//! Repository implementations
//!
//! Concrete implementations of the store traits defined in cdrflow-core,
//! using sqlx for PostgreSQL access.

pub mod call_document_repo;

pub use call_document_repo::{DocumentType, PgCallDocumentRepository};
