//! cdrflow Database Layer
//!
//! This crate provides PostgreSQL access for the cdrflow pipeline. It includes:
//!
//! - Connection pool management with sqlx
//! - Schema bootstrap for the call document table
//! - `PgCallDocumentRepository`, the JSONB-backed `CallDocumentStore`

pub mod pool;
pub mod repositories;

pub use pool::{create_pool, ensure_schema};
pub use repositories::*;

// Re-export commonly used types
pub use cdrflow_core::{AppError, AppResult};
pub use sqlx::PgPool;
