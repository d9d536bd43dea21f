//! # Configuration Validation
//!
//! Validates configuration structures using the `validator` crate.

use crate::config::Config;
use validator::Validate;

/// Validate configuration structure.
///
/// # M-CANONICAL-DOCS
///
/// ## Purpose
/// Validates all configuration fields using the `validator` crate. Call it
/// after merging sources and before building the engine.
///
/// ## Usage
/// ```rust,no_run
/// use config::{Config, validate};
///
/// let config = Config::default();
/// match validate(&config) {
///     Ok(()) => println!("Configuration is valid"),
///     Err(errors) => println!("Validation errors: {:?}", errors),
/// }
/// ```
///
/// ## Validation Rules
/// ### PostgreSQL
/// - `host`: 1-255 characters
/// - `port`: 1-65535
/// - `database`: 1-63 characters
/// - `username`: 1-63 characters
/// - `pool_size`: 1-100
/// - `timeout_seconds`: 1-300
///
/// ### Engine
/// - `operation_timeout_ms`: 1-600000 when set
///
/// ### Observability
/// - `logging_level`: must be "trace", "debug", "info", "warn", or "error"
pub fn validate(config: &Config) -> Result<(), validator::ValidationErrors> {
    config.validate()
}
