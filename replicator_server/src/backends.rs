use replicator_core::config::PostgresConfig;
use replicator_core::store::memory::{MemoryIntegrationStore, MemoryRowStore};
use replicator_core::store::postgres::PostgresRowStore;
use replicator_core::store::postgres_integrations::PostgresIntegrationStore;
use replicator_core::store::traits::{IntegrationStore, RowStoreResolver, SharedRowStore};
use std::sync::Arc;

/// Configuration store and row store resolver the server runs against.
pub struct Backends {
    pub integrations: Arc<dyn IntegrationStore>,
    pub rows: Arc<dyn RowStoreResolver>,
}

impl Backends {
    /// Process-local stores. Nothing survives a restart.
    pub fn in_memory() -> Self {
        tracing::warn!("using in-memory stores; data is lost on exit");
        Self {
            integrations: Arc::new(MemoryIntegrationStore::new()),
            rows: Arc::new(SharedRowStore(Arc::new(MemoryRowStore::new()))),
        }
    }

    /// Postgres for both stores, migrating the configuration schema first.
    /// Every organization shares the pool.
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn postgres(cfg: &PostgresConfig) -> anyhow::Result<Self> {
        let integrations = PostgresIntegrationStore::connect(cfg).await?;
        integrations.migrate().await?;
        let rows = PostgresRowStore::new(integrations.pool().clone());
        Ok(Self {
            integrations: Arc::new(integrations),
            rows: Arc::new(SharedRowStore(Arc::new(rows))),
        })
    }
}
