//! # Environment Variable Loader
//!
//! Loads configuration from environment variables following 12-factor app
//! principles.
//!
//! # Naming Convention
//! - `AUTHZ_*`: Binding policy, store backend, engine and observability
//! - `PG_*`: PostgreSQL settings

use crate::config::{
    Config, EngineConfig, ObservabilityConfig, PermissionsUserMappingConfig, PostgresConfig,
    StoreConfig, default_observability_logging_level, default_observability_metrics_enabled,
    default_postgres_database, default_postgres_host, default_postgres_pool_size,
    default_postgres_port, default_postgres_timeout, default_postgres_username
};
use std::env;

/// Load configuration from environment variables.
///
/// # M-CANONICAL-DOCS
///
/// ## Purpose
/// Loads configuration from environment variables. Unset variables fall back
/// to defaults; a variable that is set but cannot be parsed is an error.
///
/// ## Usage
/// ```rust,no_run
/// use config::load_from_env;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = load_from_env()?;
///     println!("Bind mode: {}", config.permissions_user_mapping.bind_id);
///     Ok(())
/// }
/// ```
///
/// ## Environment Variables
/// ### Authorization Settings (`AUTHZ_*`)
/// - `AUTHZ_BIND_ID`: email/username/unset (default: "unset")
/// - `AUTHZ_STORE_BACKEND`: memory/postgres (default: "memory")
/// - `AUTHZ_OPERATION_TIMEOUT_MS`: Deadline per engine operation (optional)
/// - `AUTHZ_LOGGING_LEVEL`: trace/debug/info/warn/error (default: "info")
/// - `AUTHZ_METRICS_ENABLED`: Record metrics (true/false, default: true)
///
/// ### PostgreSQL Settings (`PG_*`)
/// - `PG_HOST`: Database host (default: "localhost")
/// - `PG_PORT`: Database port (default: 5432)
/// - `PG_DATABASE`: Database name (default: "authz")
/// - `PG_USERNAME`: Database user (default: "postgres")
/// - `PG_PASSWORD`: Database password (default: "")
/// - `PG_POOL_SIZE`: Connection pool size (default: 10)
/// - `PG_TIMEOUT_SECONDS`: Connection timeout in seconds (default: 30)
pub fn load_from_env() -> Result<Config, Box<dyn std::error::Error>> {
    let config = Config {
        permissions_user_mapping: load_user_mapping_from_env()?,
        store: load_store_from_env()?,
        engine: load_engine_from_env()?,
        observability: load_observability_from_env()?
    };

    Ok(config)
}

fn load_user_mapping_from_env() -> Result<PermissionsUserMappingConfig, Box<dyn std::error::Error>>
{
    Ok(PermissionsUserMappingConfig {
        bind_id: parse_optional_env("AUTHZ_BIND_ID")?.unwrap_or_default()
    })
}

fn load_store_from_env() -> Result<StoreConfig, Box<dyn std::error::Error>> {
    Ok(StoreConfig {
        backend: parse_optional_env("AUTHZ_STORE_BACKEND")?.unwrap_or_default(),
        postgres: load_postgres_from_env()?
    })
}

fn load_postgres_from_env() -> Result<PostgresConfig, Box<dyn std::error::Error>> {
    Ok(PostgresConfig {
        host: env::var("PG_HOST").unwrap_or_else(|_| default_postgres_host()),
        port: parse_optional_env("PG_PORT")?.unwrap_or_else(default_postgres_port),
        database: env::var("PG_DATABASE").unwrap_or_else(|_| default_postgres_database()),
        username: env::var("PG_USERNAME").unwrap_or_else(|_| default_postgres_username()),
        password: env::var("PG_PASSWORD").unwrap_or_default(),
        pool_size: parse_optional_env("PG_POOL_SIZE")?.unwrap_or_else(default_postgres_pool_size),
        timeout_seconds: parse_optional_env("PG_TIMEOUT_SECONDS")?
            .unwrap_or_else(default_postgres_timeout)
    })
}

fn load_engine_from_env() -> Result<EngineConfig, Box<dyn std::error::Error>> {
    Ok(EngineConfig {
        operation_timeout_ms: parse_optional_env("AUTHZ_OPERATION_TIMEOUT_MS")?
    })
}

fn load_observability_from_env() -> Result<ObservabilityConfig, Box<dyn std::error::Error>> {
    Ok(ObservabilityConfig {
        metrics_enabled: parse_optional_env("AUTHZ_METRICS_ENABLED")?
            .unwrap_or_else(default_observability_metrics_enabled),
        logging_level: env::var("AUTHZ_LOGGING_LEVEL")
            .unwrap_or_else(|_| default_observability_logging_level())
    })
}

fn parse_env<T>(key: &str) -> Result<T, Box<dyn std::error::Error>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static
{
    match env::var(key) {
        Ok(s) => s
            .parse::<T>()
            .map_err(|e| Box::new(e) as Box<dyn std::error::Error>),
        Err(e) => Err(Box::new(e) as Box<dyn std::error::Error>)
    }
}

/// `None` when the variable is unset, an error when it is set but invalid.
fn parse_optional_env<T>(key: &str) -> Result<Option<T>, Box<dyn std::error::Error>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static
{
    if env::var_os(key).is_none() {
        return Ok(None);
    }
    parse_env(key).map(Some)
}
