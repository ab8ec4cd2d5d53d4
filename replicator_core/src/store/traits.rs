use crate::models::{
    BackfillJob, BackfillJobId, IntegrationId, OrgId, Organization, ServiceIntegration,
};
use crate::store::schema::{
    DeletePredicate, RowWrite, SessionScope, StoredRow, TableSchema, UpsertOutcome,
};
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Row store for one organization's replicated tables.
///
/// All operations go through the administrative access path (the same
/// credentials used for schema changes).
#[async_trait]
pub trait RowStore: Send + Sync {
    /// Create the table if missing, adding any declared columns/indexes that do not exist yet.
    async fn create_table(&self, schema: &TableSchema) -> Result<()>;

    async fn drop_table(&self, table: &str) -> Result<()>;

    async fn get_row(&self, table: &str, external_id: &str) -> Result<Option<StoredRow>>;

    /// Insert, or update only when `write.last_modified` is strictly newer than the
    /// stored value. Must be a single indivisible compare-and-write per external id.
    async fn upsert_row(&self, table: &str, write: &RowWrite) -> Result<UpsertOutcome>;

    /// Delete at most `limit` rows matching `predicate` in one statement, with
    /// `session` options applied for that statement only. Returns rows deleted.
    async fn delete_where(
        &self,
        table: &str,
        predicate: &DeletePredicate,
        limit: u32,
        session: &SessionScope,
    ) -> Result<u64>;

    async fn count_where(&self, table: &str, predicate: &DeletePredicate) -> Result<u64>;

    /// Toggle `autovacuum_enabled` on the table.
    async fn set_autovacuum(&self, table: &str, enabled: bool) -> Result<()>;
}

/// Resolves the row store owning an organization's tables.
#[async_trait]
pub trait RowStoreResolver: Send + Sync {
    async fn row_store(&self, org_id: OrgId) -> Result<Arc<dyn RowStore>>;
}

/// A single shared row store serves every organization (dev/test wiring).
pub struct SharedRowStore(pub Arc<dyn RowStore>);

#[async_trait]
impl RowStoreResolver for SharedRowStore {
    async fn row_store(&self, _org_id: OrgId) -> Result<Arc<dyn RowStore>> {
        Ok(self.0.clone())
    }
}

/// Configuration entities: organizations, integrations and backfill jobs.
#[async_trait]
pub trait IntegrationStore: Send + Sync {
    async fn upsert_organization(&self, org: &Organization) -> Result<()>;
    async fn get_organization(&self, org_id: OrgId) -> Result<Option<Organization>>;
    async fn delete_organization(&self, org_id: OrgId) -> Result<()>;

    async fn insert_integration(&self, integration: &ServiceIntegration) -> Result<()>;
    async fn update_integration(&self, integration: &ServiceIntegration) -> Result<()>;
    async fn get_integration(&self, id: IntegrationId) -> Result<Option<ServiceIntegration>>;
    async fn get_integration_by_opaque_id(
        &self,
        opaque_id: &str,
    ) -> Result<Option<ServiceIntegration>>;
    async fn list_integrations(&self, org_id: OrgId) -> Result<Vec<ServiceIntegration>>;
    /// Integrations whose `depends_on` is `parent`.
    async fn list_dependents(&self, parent: IntegrationId) -> Result<Vec<ServiceIntegration>>;
    async fn delete_integration(&self, id: IntegrationId) -> Result<()>;

    async fn insert_backfill_job(&self, job: &BackfillJob) -> Result<()>;
    async fn update_backfill_job(&self, job: &BackfillJob) -> Result<()>;
    async fn get_backfill_job(&self, id: BackfillJobId) -> Result<Option<BackfillJob>>;
    async fn list_backfill_jobs(&self, integration: IntegrationId) -> Result<Vec<BackfillJob>>;
}

/// Job-queue transport that eventually calls `BackfillRunner::run(job_id)`.
#[async_trait]
pub trait JobScheduler: Send + Sync {
    async fn enqueue_backfill(&self, job_id: BackfillJobId) -> Result<()>;
}
