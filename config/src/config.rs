//! # Configuration Structures
//!
//! This module defines all configuration structures for the authorization
//! engine.
//!
//! All configuration structures:
//! - Use `serde` for serialization/deserialization
//! - Use `validator` for input validation
//! - Include comprehensive M-CANONICAL-DOCS

use authz_core::BindMode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use strum::{Display, EnumString};
use validator::Validate;

/// Main configuration structure for the authorization engine.
///
/// # M-CANONICAL-DOCS
///
/// ## Purpose
/// Aggregates the binding policy, the permission store backend, engine
/// limits and observability settings.
///
/// ## Usage
/// ```rust,no_run
/// use config::Config;
///
/// let config = Config::default();
/// println!("Bind mode: {}", config.permissions_user_mapping.bind_id);
/// ```
///
/// ## Fields
/// - `permissions_user_mapping`: How pending permissions bind to users
/// - `store`: Permission store backend and its connection settings
/// - `engine`: Per-operation limits
/// - `observability`: Logging level and metrics switch
///
/// ## Validation
/// All nested configurations must pass their own validation rules.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, Default, PartialEq)]
pub struct Config {
    /// Binding policy for pending permissions
    #[serde(default)]
    #[validate(nested)]
    pub permissions_user_mapping: PermissionsUserMappingConfig,

    /// Permission store configuration
    #[serde(default)]
    #[validate(nested)]
    pub store: StoreConfig,

    /// Engine limits
    #[serde(default)]
    #[validate(nested)]
    pub engine: EngineConfig,

    /// Observability configuration (metrics, logging)
    #[serde(default)]
    #[validate(nested)]
    pub observability: ObservabilityConfig
}

/// Binding policy configuration.
///
/// # M-CANONICAL-DOCS
///
/// ## Purpose
/// Selects which identity fact of a user is matched against the bind ids of
/// pending permissions when they are granted.
///
/// ## Fields
/// - `bind_id`: `email` (verified emails), `username`, or `unset` (linked
///   external accounts, default)
#[derive(Debug, Clone, Serialize, Deserialize, Validate, Default, PartialEq)]
pub struct PermissionsUserMappingConfig {
    /// Identity fact used as the bind id
    #[serde(default)]
    pub bind_id: BindMode
}

/// Permission store backend selector.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, EnumString, Display
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Postgres
}

/// Permission store configuration.
///
/// # M-CANONICAL-DOCS
///
/// ## Purpose
/// Chooses the permission store backend and carries its connection settings.
///
/// ## Fields
/// - `backend`: `memory` (default) or `postgres`
/// - `postgres`: Connection settings, used when `backend` is `postgres`
#[derive(Debug, Clone, Serialize, Deserialize, Validate, Default, PartialEq)]
pub struct StoreConfig {
    /// Store backend
    #[serde(default)]
    pub backend: StoreBackend,

    /// PostgreSQL connection settings
    #[serde(default)]
    #[validate(nested)]
    pub postgres: PostgresConfig
}

/// PostgreSQL connection configuration.
///
/// # M-CANONICAL-DOCS
///
/// ## Purpose
/// Configures the PostgreSQL pool backing the permission store.
///
/// ## Fields
/// - `host`: Database server hostname (default: "localhost")
/// - `port`: Database server port (default: 5432)
/// - `database`: Database name (default: "authz")
/// - `username`: Database user (default: "postgres")
/// - `password`: Database password (default: "")
/// - `pool_size`: Maximum connections in pool (default: 10)
/// - `timeout_seconds`: Connection acquire timeout (default: 30)
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
pub struct PostgresConfig {
    /// Database server hostname
    #[serde(default = "default_postgres_host")]
    #[validate(length(min = 1, max = 255))]
    pub host: String,

    /// Database server port
    #[serde(default = "default_postgres_port")]
    #[validate(range(min = 1, max = 65535))]
    pub port: u16,

    /// Database name
    #[serde(default = "default_postgres_database")]
    #[validate(length(min = 1, max = 63))]
    pub database: String,

    /// Database username
    #[serde(default = "default_postgres_username")]
    #[validate(length(min = 1, max = 63))]
    pub username: String,

    /// Database password
    #[serde(default)]
    pub password: String,

    /// Maximum connections in pool
    #[serde(default = "default_postgres_pool_size")]
    #[validate(range(min = 1, max = 100))]
    pub pool_size: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_postgres_timeout")]
    #[validate(range(min = 1, max = 300))]
    pub timeout_seconds: u64
}

pub(crate) fn default_postgres_host() -> String {
    "localhost".to_string()
}

pub(crate) fn default_postgres_port() -> u16 {
    5432
}

pub(crate) fn default_postgres_database() -> String {
    "authz".to_string()
}

pub(crate) fn default_postgres_username() -> String {
    "postgres".to_string()
}

pub(crate) fn default_postgres_pool_size() -> u32 {
    10
}

pub(crate) fn default_postgres_timeout() -> u64 {
    30
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            host: default_postgres_host(),
            port: default_postgres_port(),
            database: default_postgres_database(),
            username: default_postgres_username(),
            password: String::new(),
            pool_size: default_postgres_pool_size(),
            timeout_seconds: default_postgres_timeout()
        }
    }
}

impl PostgresConfig {
    /// Connection URL for the pool.
    pub fn url(&self) -> String {
        if self.password.is_empty() {
            format!(
                "postgres://{}@{}:{}/{}",
                self.username, self.host, self.port, self.database
            )
        } else {
            format!(
                "postgres://{}:{}@{}:{}/{}",
                self.username, self.password, self.host, self.port, self.database
            )
        }
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// Engine configuration.
///
/// # M-CANONICAL-DOCS
///
/// ## Purpose
/// Bounds the time a single engine operation (grant, authorization check,
/// revocation) may take, including the store transaction it runs.
///
/// ## Fields
/// - `operation_timeout_ms`: Deadline per operation; unset means no deadline
///
/// ## Validation
/// - `operation_timeout_ms`: 1-600000 when set
#[derive(Debug, Clone, Serialize, Deserialize, Validate, Default, PartialEq)]
pub struct EngineConfig {
    /// Deadline per engine operation in milliseconds
    #[serde(default)]
    #[validate(range(min = 1, max = 600_000))]
    pub operation_timeout_ms: Option<u64>
}

impl EngineConfig {
    pub fn operation_timeout(&self) -> Option<Duration> {
        self.operation_timeout_ms.map(Duration::from_millis)
    }
}

/// Observability configuration.
///
/// # M-CANONICAL-DOCS
///
/// ## Fields
/// - `metrics_enabled`: Record engine metrics (default: true)
/// - `logging_level`: trace/debug/info/warn/error (default: "info")
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
pub struct ObservabilityConfig {
    /// Enable metrics collection
    #[serde(default = "default_observability_metrics_enabled")]
    pub metrics_enabled: bool,

    /// Logging level
    #[serde(default = "default_observability_logging_level")]
    #[validate(custom(function = "validate_logging_level"))]
    pub logging_level: String
}

pub(crate) fn default_observability_metrics_enabled() -> bool {
    true
}

pub(crate) fn default_observability_logging_level() -> String {
    "info".to_string()
}

fn validate_logging_level(value: &str) -> Result<(), validator::ValidationError> {
    match value {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(validator::ValidationError::new("Invalid logging level"))
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: default_observability_metrics_enabled(),
            logging_level: default_observability_logging_level()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = Config::default();
        assert_eq!(config.permissions_user_mapping.bind_id, BindMode::Unset);
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.store.postgres.host, "localhost");
        assert_eq!(config.store.postgres.port, 5432);
        assert_eq!(config.engine.operation_timeout(), None);
        assert!(config.observability.metrics_enabled);
        assert_eq!(config.observability.logging_level, "info");
    }

    #[test]
    fn test_postgres_url() {
        let mut postgres = PostgresConfig::default();
        assert_eq!(postgres.url(), "postgres://postgres@localhost:5432/authz");

        postgres.password = "secret".to_string();
        postgres.host = "db".to_string();
        assert_eq!(postgres.url(), "postgres://postgres:secret@db:5432/authz");
        assert_eq!(postgres.acquire_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_config_deserialize_partial_toml() {
        let config: Config = toml::from_str(
            r#"
[permissions_user_mapping]
bind_id = "email"

[engine]
operation_timeout_ms = 2500
"#
        )
        .unwrap();

        assert_eq!(config.permissions_user_mapping.bind_id, BindMode::Email);
        assert_eq!(
            config.engine.operation_timeout(),
            Some(Duration::from_millis(2500))
        );
        assert_eq!(config.store, StoreConfig::default());
    }

    #[test]
    fn test_config_rejects_unknown_bind_mode() {
        let result: Result<Config, _> = toml::from_str(
            r#"
[permissions_user_mapping]
bind_id = "phone"
"#
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_store_backend_parse() {
        use std::str::FromStr;
        assert_eq!(
            StoreBackend::from_str("postgres").unwrap(),
            StoreBackend::Postgres
        );
        assert_eq!(StoreBackend::Memory.to_string(), "memory");
    }
}
