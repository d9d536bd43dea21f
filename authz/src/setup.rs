//! Builds the engine and its store from configuration.

use crate::engine::AuthzEngine;
use authz_core::{BindPolicySource, IdentityProvider};
use config::{Config, StoreBackend, StoreConfig};
use errors::PermsResult;
use std::sync::Arc;
use storage::{InMemoryPermsStore, PermsStore, PostgresPermsStore};
use tracing::info;

/// Opens the configured permission store. The PostgreSQL schema is created
/// if missing.
pub async fn open_store(config: &StoreConfig) -> PermsResult<Arc<dyn PermsStore>> {
    match config.backend {
        StoreBackend::Memory => {
            info!("Using in-memory permission store");
            Ok(Arc::new(InMemoryPermsStore::new()))
        }
        StoreBackend::Postgres => {
            let postgres = &config.postgres;
            let store = PostgresPermsStore::with_options(
                &postgres.url(),
                postgres.pool_size,
                postgres.acquire_timeout()
            )
            .await?;
            store.initialize_schema().await?;
            info!(
                host = %postgres.host,
                database = %postgres.database,
                "Using PostgreSQL permission store"
            );
            Ok(Arc::new(store))
        }
    }
}

impl AuthzEngine {
    /// Applies the engine and observability settings of `config`. The binding
    /// policy is passed separately so it can be reloaded at runtime.
    pub fn from_config(
        config: &Config,
        store: Arc<dyn PermsStore>,
        identities: Arc<dyn IdentityProvider>,
        policy: Arc<dyn BindPolicySource>
    ) -> Self {
        Self::new(store, identities, policy)
            .with_operation_timeout(config.engine.operation_timeout())
            .with_metrics(config.observability.metrics_enabled)
    }
}
