//! Application configuration
//!
//! This module provides centralized configuration management using the `config` crate.
//! Configuration is layered: built-in defaults, optional config files, then
//! environment variables.

use config::builder::DefaultState;
use config::{Config, ConfigBuilder, ConfigError, Environment, File};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;

/// Main application configuration
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub queue: QueueConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

/// HTTP server configuration (health and stats endpoints)
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9002
}

/// Database configuration
#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,

    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection acquire timeout in seconds
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,

    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

fn default_acquire_timeout() -> u64 {
    30
}

fn default_idle_timeout() -> u64 {
    600
}

/// Message queue configuration
#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    /// Redis connection URL
    pub url: String,

    /// Name of the primary queue; the retry and rejected queues derive from it
    #[serde(default = "default_queue_prefix")]
    pub prefix: String,

    /// How long one blocking receive waits before re-checking for shutdown
    #[serde(default = "default_block_timeout")]
    pub block_timeout_secs: u64,
}

fn default_queue_prefix() -> String {
    "cdr_queue".to_string()
}

fn default_block_timeout() -> u64 {
    5
}

/// Decision parameters of the validation and retry pipeline
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Failed attempts after which an event is rejected
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    /// Earliest accepted event time, in epoch milliseconds
    #[serde(default = "default_timestamp_floor")]
    pub timestamp_floor_epoch_ms: i64,

    /// Zone abbreviation to UTC offset in hours
    #[serde(default = "default_timezone_table")]
    pub timezone_table: HashMap<String, i32>,

    /// Pause before looking up the start of a stop event
    #[serde(default = "default_stop_lookup_delay")]
    pub stop_lookup_delay_ms: u64,

    /// Deliveries processed at once per consumer
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

fn default_max_attempts() -> usize {
    2
}

fn default_timestamp_floor() -> i64 {
    1_325_376_000_000 // 2012-01-01T00:00:00Z
}

fn default_timezone_table() -> HashMap<String, i32> {
    HashMap::from([("CET".to_string(), 1), ("CEST".to_string(), 2)])
}

fn default_stop_lookup_delay() -> u64 {
    400
}

fn default_concurrency() -> usize {
    num_cpus::get()
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            timestamp_floor_epoch_ms: default_timestamp_floor(),
            timezone_table: default_timezone_table(),
            stop_lookup_delay_ms: default_stop_lookup_delay(),
            concurrency: default_concurrency(),
        }
    }
}

impl PipelineConfig {
    /// Offset in hours for a zone abbreviation
    pub fn zone_offset_hours(&self, abbreviation: &str) -> Option<i32> {
        self.timezone_table.get(abbreviation).copied()
    }

    /// Zone abbreviations are matched in upper case; config sources may
    /// have lowered them.
    fn normalize(&mut self) {
        self.timezone_table = self
            .timezone_table
            .drain()
            .map(|(zone, offset)| (zone.to_ascii_uppercase(), offset))
            .collect();
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Message(
                "pipeline.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.concurrency == 0 {
            return Err(ConfigError::Message(
                "pipeline.concurrency must be at least 1".to_string(),
            ));
        }
        if let Some((zone, offset)) = self.timezone_table.iter().find(|(_, o)| o.abs() > 14) {
            return Err(ConfigError::Message(format!(
                "pipeline.timezone_table.{} has an out of range offset: {}",
                zone, offset
            )));
        }
        Ok(())
    }
}

impl AppConfig {
    /// Load configuration from environment and optional config files
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".to_string());

        let builder = Config::builder()
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // Load from environment variables with CDRFLOW__ prefix
            .add_source(
                Environment::with_prefix("CDRFLOW")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            // Support the conventional connection variables
            .set_override_option("database.url", env::var("DATABASE_URL").ok())?
            .set_override_option("queue.url", env::var("REDIS_URL").ok())?;

        Self::build(builder)
    }

    /// Load configuration from a specific file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix("CDRFLOW")
                    .prefix_separator("__")
                    .separator("__"),
            );

        Self::build(builder)
    }

    fn build(builder: ConfigBuilder<DefaultState>) -> Result<Self, ConfigError> {
        let config = builder
            // Start with default values
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 9002)?
            .set_default("database.max_connections", 10)?
            .set_default("queue.prefix", "cdr_queue")?
            .set_default("queue.block_timeout_secs", 5)?
            .set_default("pipeline.max_attempts", 2)?
            .set_default("pipeline.timestamp_floor_epoch_ms", default_timestamp_floor())?
            .set_default("pipeline.stop_lookup_delay_ms", 400)?
            .set_default("pipeline.concurrency", num_cpus::get() as i64)?
            .build()?;

        let mut app: AppConfig = config.try_deserialize()?;
        app.pipeline.normalize();
        app.validate()?;
        Ok(app)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.url.is_empty() {
            return Err(ConfigError::NotFound("database.url".to_string()));
        }
        if self.queue.url.is_empty() {
            return Err(ConfigError::NotFound("queue.url".to_string()));
        }
        self.pipeline.validate()
    }

    /// Get the server bind address
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;

    fn from_toml(raw: &str) -> Result<AppConfig, ConfigError> {
        AppConfig::build(Config::builder().add_source(File::from_str(raw, FileFormat::Toml)))
    }

    #[test]
    fn test_default_pipeline_config() {
        let config = PipelineConfig::default();
        assert_eq!(config.max_attempts, 2);
        assert_eq!(config.timestamp_floor_epoch_ms, 1_325_376_000_000);
        assert_eq!(config.zone_offset_hours("CET"), Some(1));
        assert_eq!(config.zone_offset_hours("CEST"), Some(2));
        assert_eq!(config.zone_offset_hours("PST"), None);
        assert_eq!(config.stop_lookup_delay_ms, 400);
        assert!(config.concurrency >= 1);
    }

    #[test]
    fn test_minimal_file_gets_defaults() {
        let config = from_toml(
            r#"
            [database]
            url = "postgres://localhost/cdr"

            [queue]
            url = "redis://localhost:6379"
            "#,
        )
        .unwrap();

        assert_eq!(config.server_addr(), "0.0.0.0:9002");
        assert_eq!(config.queue.prefix, "cdr_queue");
        assert_eq!(config.queue.block_timeout_secs, 5);
        assert_eq!(config.database.max_connections, 10);
        assert_eq!(config.pipeline.max_attempts, 2);
        assert_eq!(config.pipeline.zone_offset_hours("CEST"), Some(2));
    }

    #[test]
    fn test_timezone_table_is_upper_cased() {
        let config = from_toml(
            r#"
            [database]
            url = "postgres://localhost/cdr"

            [queue]
            url = "redis://localhost:6379"

            [pipeline.timezone_table]
            EET = 2
            eest = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.pipeline.zone_offset_hours("EET"), Some(2));
        assert_eq!(config.pipeline.zone_offset_hours("EEST"), Some(3));
    }

    #[test]
    fn test_zero_attempts_is_rejected() {
        let result = from_toml(
            r#"
            [database]
            url = "postgres://localhost/cdr"

            [queue]
            url = "redis://localhost:6379"

            [pipeline]
            max_attempts = 0
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_database_url() {
        let result = from_toml(
            r#"
            [queue]
            url = "redis://localhost:6379"
            "#,
        );
        assert!(result.is_err());
    }
}
