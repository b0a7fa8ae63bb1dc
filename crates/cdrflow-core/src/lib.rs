//! cdrflow Core Library
//!
//! This crate provides the foundational types, traits, and error handling
//! for the cdrflow call-event pipeline. It includes:
//!
//! - Call event, attempt, and record models with their wire formats
//! - Routing keys and the primary/retry/rejected queue ladder
//! - The `Failure` taxonomy that drives retries
//! - Store and transport traits consumed by the pipeline
//! - Unified infrastructure error handling
//! - Application configuration

pub mod config;
pub mod error;
pub mod failure;
pub mod models;
pub mod traits;

pub use config::{AppConfig, PipelineConfig};
pub use error::AppError;
pub use failure::{Failure, FailureKind};

/// Result type alias using AppError
pub type AppResult<T> = Result<T, AppError>;
