//! # Configuration System
//!
//! Configuration for the authorization engine.
//!
//! This crate provides:
//! - Configuration structures for the binding policy, store, engine and
//!   observability
//! - Environment variable loading (12-factor app principles)
//! - Configuration file loading (TOML/YAML)
//! - Configuration precedence (CLI > env > file > defaults)
//! - Configuration validation
//! - Hot reload of the binding policy

pub mod config;
pub mod file_loader;
pub mod hot_reload;
pub mod loader;
pub mod precedence;
pub mod validation;

pub use config::{
    Config, EngineConfig, ObservabilityConfig, PermissionsUserMappingConfig, PostgresConfig,
    StoreBackend, StoreConfig
};
pub use file_loader::{ConfigFormat, load_from_file, parse_config};
pub use hot_reload::{SharedBindPolicy, spawn_policy_reload, watch_config};
pub use loader::load_from_env;
pub use precedence::merge_configs;
pub use validation::validate;
