use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::models::{
    BackfillJob, BackfillJobId, IntegrationId, OrgId, Organization, ServiceIntegration,
};
use crate::store::schema::{
    DeletePredicate, ROW_CREATED_AT_COLUMN, RowWrite, SessionScope, StoredRow, TableSchema,
    UpsertOutcome,
};
use crate::store::traits::{IntegrationStore, JobScheduler, RowStore};
use crate::{Error, Result};

/// Statements observed by `MemoryRowStore`, for assertions in tests.
#[derive(Debug, Clone, PartialEq)]
pub enum StatementRecord {
    Delete {
        table: String,
        rows: u64,
        limit: u32,
        session: SessionScope,
    },
    Autovacuum {
        table: String,
        enabled: bool,
    },
}

struct MemoryTable {
    schema: TableSchema,
    rows: BTreeMap<String, StoredRow>,
    autovacuum: bool,
}

impl MemoryTable {
    fn age_of(&self, row: &StoredRow, column: &str) -> Option<chrono::DateTime<Utc>> {
        if column == self.schema.last_modified_column {
            Some(row.last_modified)
        } else if column == ROW_CREATED_AT_COLUMN {
            Some(row.row_created_at)
        } else {
            row.columns.get(column).and_then(|v| v.as_timestamp())
        }
    }

    fn matches(&self, row: &StoredRow, predicate: &DeletePredicate) -> bool {
        let status = row
            .columns
            .get(&predicate.expiry.status_column)
            .and_then(|v| v.as_text());
        predicate.matches(status, self.age_of(row, &predicate.expiry.age_column))
    }
}

#[derive(Default)]
struct RowState {
    tables: HashMap<String, MemoryTable>,
    statements: Vec<StatementRecord>,
    fail_delete_after: Option<usize>,
    delete_delay: Option<Duration>,
}

/// In-memory RowStore for local development and unit tests.
///
/// Every operation takes a single lock, so upserts are trivially atomic per external id.
#[derive(Clone, Default)]
pub struct MemoryRowStore {
    state: Arc<Mutex<RowState>>,
}

impl MemoryRowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a row verbatim, bypassing the ordering check (fixtures only).
    pub async fn seed_row(&self, table: &str, row: StoredRow) -> Result<()> {
        let mut state = self.state.lock().await;
        let t = state
            .tables
            .get_mut(table)
            .ok_or_else(|| Error::NotFound(format!("table '{table}' not found")))?;
        t.rows.insert(row.external_id.clone(), row);
        Ok(())
    }

    pub async fn rows(&self, table: &str) -> Vec<StoredRow> {
        let state = self.state.lock().await;
        state
            .tables
            .get(table)
            .map(|t| t.rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn table_exists(&self, table: &str) -> bool {
        self.state.lock().await.tables.contains_key(table)
    }

    pub async fn schema(&self, table: &str) -> Option<TableSchema> {
        let state = self.state.lock().await;
        state.tables.get(table).map(|t| t.schema.clone())
    }

    pub async fn autovacuum_enabled(&self, table: &str) -> Option<bool> {
        let state = self.state.lock().await;
        state.tables.get(table).map(|t| t.autovacuum)
    }

    pub async fn statements(&self) -> Vec<StatementRecord> {
        self.state.lock().await.statements.clone()
    }

    pub async fn clear_statements(&self) {
        self.state.lock().await.statements.clear();
    }

    /// Make every delete after the first `n` fail with a store error.
    pub async fn fail_deletes_after(&self, n: usize) {
        self.state.lock().await.fail_delete_after = Some(n);
    }

    /// Sleep before every delete statement; `None` removes the delay.
    pub async fn delay_deletes(&self, delay: Option<Duration>) {
        self.state.lock().await.delete_delay = delay;
    }
}

#[async_trait]
impl RowStore for MemoryRowStore {
    async fn create_table(&self, schema: &TableSchema) -> Result<()> {
        schema.validate()?;
        let mut state = self.state.lock().await;
        match state.tables.get_mut(&schema.table) {
            Some(existing) => {
                if existing.schema.last_modified_column != schema.last_modified_column {
                    return Err(Error::Conflict(format!(
                        "table '{}' already uses last-modified column '{}'",
                        schema.table, existing.schema.last_modified_column
                    )));
                }
                for col in &schema.columns {
                    if !existing.schema.columns.iter().any(|c| c.name == col.name) {
                        existing.schema.columns.push(col.clone());
                    }
                }
                for index in &schema.indexes {
                    if !existing.schema.indexes.contains(index) {
                        existing.schema.indexes.push(index.clone());
                    }
                }
            }
            None => {
                state.tables.insert(
                    schema.table.clone(),
                    MemoryTable {
                        schema: schema.clone(),
                        rows: BTreeMap::new(),
                        autovacuum: true,
                    },
                );
            }
        }
        Ok(())
    }

    async fn drop_table(&self, table: &str) -> Result<()> {
        self.state.lock().await.tables.remove(table);
        Ok(())
    }

    async fn get_row(&self, table: &str, external_id: &str) -> Result<Option<StoredRow>> {
        let state = self.state.lock().await;
        let t = state
            .tables
            .get(table)
            .ok_or_else(|| Error::NotFound(format!("table '{table}' not found")))?;
        Ok(t.rows.get(external_id).cloned())
    }

    async fn upsert_row(&self, table: &str, write: &RowWrite) -> Result<UpsertOutcome> {
        let mut state = self.state.lock().await;
        let t = state
            .tables
            .get_mut(table)
            .ok_or_else(|| Error::NotFound(format!("table '{table}' not found")))?;
        t.schema.check_columns(&write.columns)?;

        match t.rows.get_mut(&write.external_id) {
            None => {
                t.rows.insert(
                    write.external_id.clone(),
                    StoredRow {
                        external_id: write.external_id.clone(),
                        last_modified: write.last_modified,
                        data: write.data.clone(),
                        columns: write.columns.clone(),
                        row_created_at: Utc::now(),
                    },
                );
                Ok(UpsertOutcome::Inserted)
            }
            Some(row) if write.last_modified <= row.last_modified => Ok(UpsertOutcome::Stale {
                stored_last_modified: row.last_modified,
            }),
            Some(row) => {
                let previous = row.clone();
                row.last_modified = write.last_modified;
                row.data = write.data.clone();
                for (name, value) in &write.columns {
                    row.columns.insert(name.clone(), value.clone());
                }
                Ok(UpsertOutcome::Updated {
                    previous: Some(previous),
                })
            }
        }
    }

    async fn delete_where(
        &self,
        table: &str,
        predicate: &DeletePredicate,
        limit: u32,
        session: &SessionScope,
    ) -> Result<u64> {
        session.validate()?;
        let delay = self.state.lock().await.delete_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock().await;

        if let Some(remaining) = state.fail_delete_after {
            if remaining == 0 {
                return Err(Error::StoreMessage(format!(
                    "injected delete failure on '{table}'"
                )));
            }
            state.fail_delete_after = Some(remaining - 1);
        }

        let t = state
            .tables
            .get_mut(table)
            .ok_or_else(|| Error::NotFound(format!("table '{table}' not found")))?;
        let doomed: Vec<String> = t
            .rows
            .values()
            .filter(|row| t.matches(row, predicate))
            .take(limit as usize)
            .map(|row| row.external_id.clone())
            .collect();
        for id in &doomed {
            t.rows.remove(id);
        }

        let rows = doomed.len() as u64;
        state.statements.push(StatementRecord::Delete {
            table: table.to_string(),
            rows,
            limit,
            session: session.clone(),
        });
        Ok(rows)
    }

    async fn count_where(&self, table: &str, predicate: &DeletePredicate) -> Result<u64> {
        let state = self.state.lock().await;
        let t = state
            .tables
            .get(table)
            .ok_or_else(|| Error::NotFound(format!("table '{table}' not found")))?;
        Ok(t.rows.values().filter(|row| t.matches(row, predicate)).count() as u64)
    }

    async fn set_autovacuum(&self, table: &str, enabled: bool) -> Result<()> {
        let mut state = self.state.lock().await;
        let t = state
            .tables
            .get_mut(table)
            .ok_or_else(|| Error::NotFound(format!("table '{table}' not found")))?;
        t.autovacuum = enabled;
        state.statements.push(StatementRecord::Autovacuum {
            table: table.to_string(),
            enabled,
        });
        Ok(())
    }
}

#[derive(Default)]
struct ConfigState {
    orgs: HashMap<OrgId, Organization>,
    integrations: HashMap<IntegrationId, ServiceIntegration>,
    jobs: HashMap<BackfillJobId, BackfillJob>,
    fail_job_update_after: Option<usize>,
}

/// In-memory IntegrationStore for local development and unit tests.
#[derive(Clone, Default)]
pub struct MemoryIntegrationStore {
    state: Arc<Mutex<ConfigState>>,
}

impl MemoryIntegrationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the job update after the next `n` fail once with a store error.
    pub async fn fail_job_update_after(&self, n: usize) {
        self.state.lock().await.fail_job_update_after = Some(n);
    }
}

#[async_trait]
impl IntegrationStore for MemoryIntegrationStore {
    async fn upsert_organization(&self, org: &Organization) -> Result<()> {
        self.state
            .lock()
            .await
            .orgs
            .insert(org.org_id, org.clone());
        Ok(())
    }

    async fn get_organization(&self, org_id: OrgId) -> Result<Option<Organization>> {
        Ok(self.state.lock().await.orgs.get(&org_id).cloned())
    }

    async fn delete_organization(&self, org_id: OrgId) -> Result<()> {
        let mut state = self.state.lock().await;
        state.orgs.remove(&org_id);
        state.jobs.retain(|_, j| j.org_id != org_id);
        state.integrations.retain(|_, i| i.org_id != org_id);
        Ok(())
    }

    async fn insert_integration(&self, integration: &ServiceIntegration) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.integrations.contains_key(&integration.id) {
            return Err(Error::Conflict(format!(
                "integration {} already exists",
                integration.id
            )));
        }
        if state
            .integrations
            .values()
            .any(|i| i.opaque_id == integration.opaque_id)
        {
            return Err(Error::Conflict(format!(
                "opaque_id '{}' already in use",
                integration.opaque_id
            )));
        }
        state
            .integrations
            .insert(integration.id, integration.clone());
        Ok(())
    }

    async fn update_integration(&self, integration: &ServiceIntegration) -> Result<()> {
        let mut state = self.state.lock().await;
        let Some(slot) = state.integrations.get_mut(&integration.id) else {
            return Err(Error::NotFound(format!(
                "integration {} not found",
                integration.id
            )));
        };
        *slot = integration.clone();
        Ok(())
    }

    async fn get_integration(&self, id: IntegrationId) -> Result<Option<ServiceIntegration>> {
        Ok(self.state.lock().await.integrations.get(&id).cloned())
    }

    async fn get_integration_by_opaque_id(
        &self,
        opaque_id: &str,
    ) -> Result<Option<ServiceIntegration>> {
        let state = self.state.lock().await;
        Ok(state
            .integrations
            .values()
            .find(|i| i.opaque_id == opaque_id)
            .cloned())
    }

    async fn list_integrations(&self, org_id: OrgId) -> Result<Vec<ServiceIntegration>> {
        let state = self.state.lock().await;
        let mut out: Vec<_> = state
            .integrations
            .values()
            .filter(|i| i.org_id == org_id)
            .cloned()
            .collect();
        out.sort_by_key(|i| i.created_at);
        Ok(out)
    }

    async fn list_dependents(&self, parent: IntegrationId) -> Result<Vec<ServiceIntegration>> {
        let state = self.state.lock().await;
        let mut out: Vec<_> = state
            .integrations
            .values()
            .filter(|i| i.depends_on == Some(parent))
            .cloned()
            .collect();
        out.sort_by_key(|i| i.created_at);
        Ok(out)
    }

    async fn delete_integration(&self, id: IntegrationId) -> Result<()> {
        let mut state = self.state.lock().await;
        state.integrations.remove(&id);
        state.jobs.retain(|_, j| j.integration_id != id);
        Ok(())
    }

    async fn insert_backfill_job(&self, job: &BackfillJob) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.integrations.contains_key(&job.integration_id) {
            return Err(Error::NotFound(format!(
                "integration {} not found",
                job.integration_id
            )));
        }
        state.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn update_backfill_job(&self, job: &BackfillJob) -> Result<()> {
        let mut state = self.state.lock().await;
        match state.fail_job_update_after {
            Some(0) => {
                state.fail_job_update_after = None;
                return Err(Error::StoreMessage(format!(
                    "injected update failure on backfill job {}",
                    job.id
                )));
            }
            Some(n) => state.fail_job_update_after = Some(n - 1),
            None => {}
        }
        let Some(slot) = state.jobs.get_mut(&job.id) else {
            return Err(Error::NotFound(format!("backfill job {} not found", job.id)));
        };
        *slot = job.clone();
        Ok(())
    }

    async fn get_backfill_job(&self, id: BackfillJobId) -> Result<Option<BackfillJob>> {
        Ok(self.state.lock().await.jobs.get(&id).cloned())
    }

    async fn list_backfill_jobs(&self, integration: IntegrationId) -> Result<Vec<BackfillJob>> {
        let state = self.state.lock().await;
        let mut out: Vec<_> = state
            .jobs
            .values()
            .filter(|j| j.integration_id == integration)
            .cloned()
            .collect();
        out.sort_by_key(|j| j.created_at);
        Ok(out)
    }
}

/// Records enqueued jobs instead of dispatching them.
#[derive(Clone, Default)]
pub struct MemoryJobScheduler {
    enqueued: Arc<Mutex<Vec<BackfillJobId>>>,
}

impl MemoryJobScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn enqueued(&self) -> Vec<BackfillJobId> {
        self.enqueued.lock().await.clone()
    }
}

#[async_trait]
impl JobScheduler for MemoryJobScheduler {
    async fn enqueue_backfill(&self, job_id: BackfillJobId) -> Result<()> {
        self.enqueued.lock().await.push(job_id);
        Ok(())
    }
}
