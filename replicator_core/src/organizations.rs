use std::sync::Arc;

use crate::models::{OrgId, Organization};
use crate::store::traits::IntegrationStore;
use crate::upsert::engine::UpsertEngine;
use crate::{Error, Result};

/// Tenant lifecycle. Removing an organization drops every integration table it owns.
pub struct Organizations {
    integrations: Arc<dyn IntegrationStore>,
    engine: Arc<UpsertEngine>,
}

impl Organizations {
    pub fn new(integrations: Arc<dyn IntegrationStore>, engine: Arc<UpsertEngine>) -> Self {
        Self {
            integrations,
            engine,
        }
    }

    #[tracing::instrument(level = "info", skip(self))]
    pub async fn create_organization(&self, name: &str) -> Result<Organization> {
        let org = Organization::new(name, None)?;
        self.integrations.upsert_organization(&org).await?;
        Ok(org)
    }

    /// Drop each integration's table, delete the integrations, then the organization.
    /// Returns the names of the dropped tables.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn remove_organization(&self, org_id: OrgId) -> Result<Vec<String>> {
        if self.integrations.get_organization(org_id).await?.is_none() {
            return Err(Error::NotFound(format!("organization {org_id} not found")));
        }

        let store = self.engine.row_store(org_id).await?;
        let mut integrations = self.integrations.list_integrations(org_id).await?;
        // Dependents first so no integration outlives the parent it points at.
        integrations.sort_by_key(|i| i.depends_on.is_none());

        let mut dropped = Vec::with_capacity(integrations.len());
        for integration in &integrations {
            let table = integration.table_name();
            store.drop_table(&table).await?;
            self.integrations.delete_integration(integration.id).await?;
            dropped.push(table);
        }
        self.engine.forget_org(org_id).await;
        self.integrations.delete_organization(org_id).await?;
        tracing::info!(tables = dropped.len(), "organization removed");
        Ok(dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ServiceIntegration;
    use crate::store::memory::{MemoryIntegrationStore, MemoryRowStore};
    use crate::store::schema::TableSchema;
    use crate::store::traits::{RowStore, SharedRowStore};

    #[tokio::test]
    async fn removal_drops_tables_and_integrations() {
        let rows = MemoryRowStore::new();
        let store = MemoryIntegrationStore::new();
        let engine = Arc::new(UpsertEngine::new(Arc::new(SharedRowStore(Arc::new(
            rows.clone(),
        )))));
        let orgs = Organizations::new(Arc::new(store.clone()), engine);

        let org = orgs.create_organization("acme").await.unwrap();
        let parent = ServiceIntegration::new(org.org_id, "parent", None).unwrap();
        let child = ServiceIntegration::new(org.org_id, "child", None)
            .unwrap()
            .with_depends_on(parent.id);
        for i in [&parent, &child] {
            store.insert_integration(i).await.unwrap();
            rows.create_table(&TableSchema::new(i.table_name(), "updated_at"))
                .await
                .unwrap();
        }

        let dropped = orgs.remove_organization(org.org_id).await.unwrap();
        assert_eq!(dropped, vec![child.table_name(), parent.table_name()]);
        assert!(!rows.table_exists(&parent.table_name()).await);
        assert!(store.list_integrations(org.org_id).await.unwrap().is_empty());
        assert!(store.get_organization(org.org_id).await.unwrap().is_none());

        let err = orgs.remove_organization(org.org_id).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
