use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use uuid::Uuid;

use crate::config::PostgresConfig;
use crate::models::{
    BackfillJob, BackfillJobId, BackfillStatus, Cursor, IntegrationId, OrgId, Organization,
    ServiceIntegration,
};
use crate::store::traits::IntegrationStore;
use crate::{Error, Result};

const MIGRATION_0001: &str = include_str!("../../migrations/0001_init.sql");

fn migration_statements(schema: &str) -> Vec<&str> {
    schema
        .split(';')
        .filter_map(|statement| {
            let trimmed = statement.trim();
            let has_sql = trimmed.lines().any(|line| {
                let line = line.trim();
                !line.is_empty() && !line.starts_with("--")
            });
            has_sql.then_some(trimmed)
        })
        .collect()
}

/// Postgres-backed IntegrationStore.
#[derive(Clone)]
pub struct PostgresIntegrationStore {
    pool: PgPool,
}

impl PostgresIntegrationStore {
    #[tracing::instrument(level = "debug", skip(cfg))]
    pub async fn connect(cfg: &PostgresConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(cfg.max_connections)
            .acquire_timeout(cfg.acquire_timeout)
            .connect(&cfg.url)
            .await
            .map_err(|e| Error::store("connect postgres", e))?;
        Ok(Self { pool })
    }

    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    #[tracing::instrument(level = "info", skip(self))]
    pub async fn migrate(&self) -> Result<()> {
        for stmt in migration_statements(MIGRATION_0001) {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(|e| Error::store("apply migrations", e))?;
        }
        Ok(())
    }

    fn integration_from_row(row: &PgRow) -> Result<ServiceIntegration> {
        Ok(ServiceIntegration {
            id: IntegrationId(row.try_get::<Uuid, _>("id").map_err(|e| Error::store("id", e))?),
            org_id: OrgId(
                row.try_get::<Uuid, _>("org_id")
                    .map_err(|e| Error::store("org_id", e))?,
            ),
            service_name: row
                .try_get("service_name")
                .map_err(|e| Error::store("service_name", e))?,
            opaque_id: row
                .try_get("opaque_id")
                .map_err(|e| Error::store("opaque_id", e))?,
            api_url: row
                .try_get("api_url")
                .map_err(|e| Error::store("api_url", e))?,
            backfill_key: row
                .try_get("backfill_key")
                .map_err(|e| Error::store("backfill_key", e))?,
            backfill_secret: row
                .try_get("backfill_secret")
                .map_err(|e| Error::store("backfill_secret", e))?,
            webhook_secret: row
                .try_get("webhook_secret")
                .map_err(|e| Error::store("webhook_secret", e))?,
            depends_on: row
                .try_get::<Option<Uuid>, _>("depends_on")
                .map_err(|e| Error::store("depends_on", e))?
                .map(IntegrationId),
            settings: row
                .try_get("settings")
                .map_err(|e| Error::store("settings", e))?,
            created_at: row
                .try_get("created_at")
                .map_err(|e| Error::store("created_at", e))?,
            updated_at: row
                .try_get("updated_at")
                .map_err(|e| Error::store("updated_at", e))?,
        })
    }

    fn job_from_row(row: &PgRow) -> Result<BackfillJob> {
        let status_str: String = row
            .try_get("status")
            .map_err(|e| Error::store("status", e))?;
        let status = BackfillStatus::parse_str(&status_str).ok_or_else(|| {
            Error::StoreMessage(format!("invalid backfill status in db: {status_str}"))
        })?;
        let pages: i64 = row
            .try_get("pages_fetched")
            .map_err(|e| Error::store("pages_fetched", e))?;
        let items: i64 = row
            .try_get("items_upserted")
            .map_err(|e| Error::store("items_upserted", e))?;
        Ok(BackfillJob {
            id: BackfillJobId(row.try_get::<Uuid, _>("id").map_err(|e| Error::store("id", e))?),
            org_id: OrgId(
                row.try_get::<Uuid, _>("org_id")
                    .map_err(|e| Error::store("org_id", e))?,
            ),
            integration_id: IntegrationId(
                row.try_get::<Uuid, _>("integration_id")
                    .map_err(|e| Error::store("integration_id", e))?,
            ),
            cursor: row
                .try_get::<Option<serde_json::Value>, _>("cursor")
                .map_err(|e| Error::store("cursor", e))?
                .map(Cursor::new),
            incremental: row
                .try_get("incremental")
                .map_err(|e| Error::store("incremental", e))?,
            status,
            pages_fetched: pages.max(0) as u64,
            items_upserted: items.max(0) as u64,
            last_error: row
                .try_get("last_error")
                .map_err(|e| Error::store("last_error", e))?,
            created_at: row
                .try_get("created_at")
                .map_err(|e| Error::store("created_at", e))?,
            updated_at: row
                .try_get("updated_at")
                .map_err(|e| Error::store("updated_at", e))?,
        })
    }
}

const INTEGRATION_COLUMNS: &str = "id, org_id, service_name, opaque_id, api_url, backfill_key, \
     backfill_secret, webhook_secret, depends_on, settings, created_at, updated_at";

const JOB_COLUMNS: &str = "id, org_id, integration_id, cursor, incremental, status, \
     pages_fetched, items_upserted, last_error, created_at, updated_at";

#[async_trait]
impl IntegrationStore for PostgresIntegrationStore {
    #[tracing::instrument(level = "debug", skip(self, org))]
    async fn upsert_organization(&self, org: &Organization) -> Result<()> {
        sqlx::query(
            r#"
INSERT INTO replicator_organizations (org_id, name, created_at)
VALUES ($1, $2, $3)
ON CONFLICT (org_id) DO UPDATE SET name = EXCLUDED.name
"#,
        )
        .bind(org.org_id.0)
        .bind(&org.name)
        .bind(org.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::store("upsert organization", e))?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn get_organization(&self, org_id: OrgId) -> Result<Option<Organization>> {
        let row = sqlx::query(
            "SELECT org_id, name, created_at FROM replicator_organizations WHERE org_id = $1",
        )
        .bind(org_id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::store("get organization", e))?;
        row.map(|r| {
            Ok(Organization {
                org_id: OrgId(
                    r.try_get::<Uuid, _>("org_id")
                        .map_err(|e| Error::store("org_id", e))?,
                ),
                name: r.try_get("name").map_err(|e| Error::store("name", e))?,
                created_at: r
                    .try_get("created_at")
                    .map_err(|e| Error::store("created_at", e))?,
            })
        })
        .transpose()
    }

    #[tracing::instrument(level = "info", skip(self))]
    async fn delete_organization(&self, org_id: OrgId) -> Result<()> {
        sqlx::query("DELETE FROM replicator_organizations WHERE org_id = $1")
            .bind(org_id.0)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::store("delete organization", e))?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self, integration), fields(id = %integration.id))]
    async fn insert_integration(&self, integration: &ServiceIntegration) -> Result<()> {
        let result = sqlx::query(&format!(
            "INSERT INTO replicator_service_integrations ({INTEGRATION_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)"
        ))
        .bind(integration.id.0)
        .bind(integration.org_id.0)
        .bind(&integration.service_name)
        .bind(&integration.opaque_id)
        .bind(&integration.api_url)
        .bind(&integration.backfill_key)
        .bind(&integration.backfill_secret)
        .bind(&integration.webhook_secret)
        .bind(integration.depends_on.map(|d| d.0))
        .bind(sqlx::types::Json(&integration.settings))
        .bind(integration.created_at)
        .bind(integration.updated_at)
        .execute(&self.pool)
        .await;
        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Err(Error::Conflict(
                format!("integration {} already exists", integration.id),
            )),
            Err(e) => Err(Error::store("insert integration", e)),
        }
    }

    #[tracing::instrument(level = "debug", skip(self, integration), fields(id = %integration.id))]
    async fn update_integration(&self, integration: &ServiceIntegration) -> Result<()> {
        let result = sqlx::query(
            r#"
UPDATE replicator_service_integrations SET
  api_url = $2,
  backfill_key = $3,
  backfill_secret = $4,
  webhook_secret = $5,
  depends_on = $6,
  settings = $7,
  updated_at = $8
WHERE id = $1
"#,
        )
        .bind(integration.id.0)
        .bind(&integration.api_url)
        .bind(&integration.backfill_key)
        .bind(&integration.backfill_secret)
        .bind(&integration.webhook_secret)
        .bind(integration.depends_on.map(|d| d.0))
        .bind(sqlx::types::Json(&integration.settings))
        .bind(integration.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::store("update integration", e))?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!(
                "integration {} not found",
                integration.id
            )));
        }
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn get_integration(&self, id: IntegrationId) -> Result<Option<ServiceIntegration>> {
        let row = sqlx::query(&format!(
            "SELECT {INTEGRATION_COLUMNS} FROM replicator_service_integrations WHERE id = $1"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::store("get integration", e))?;
        row.map(|r| Self::integration_from_row(&r)).transpose()
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn get_integration_by_opaque_id(
        &self,
        opaque_id: &str,
    ) -> Result<Option<ServiceIntegration>> {
        let row = sqlx::query(&format!(
            "SELECT {INTEGRATION_COLUMNS} FROM replicator_service_integrations WHERE opaque_id = $1"
        ))
        .bind(opaque_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::store("get integration by opaque id", e))?;
        row.map(|r| Self::integration_from_row(&r)).transpose()
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn list_integrations(&self, org_id: OrgId) -> Result<Vec<ServiceIntegration>> {
        let rows = sqlx::query(&format!(
            "SELECT {INTEGRATION_COLUMNS} FROM replicator_service_integrations \
             WHERE org_id = $1 ORDER BY created_at ASC"
        ))
        .bind(org_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::store("list integrations", e))?;
        rows.iter().map(Self::integration_from_row).collect()
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn list_dependents(&self, parent: IntegrationId) -> Result<Vec<ServiceIntegration>> {
        let rows = sqlx::query(&format!(
            "SELECT {INTEGRATION_COLUMNS} FROM replicator_service_integrations \
             WHERE depends_on = $1 ORDER BY created_at ASC"
        ))
        .bind(parent.0)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::store("list dependents", e))?;
        rows.iter().map(Self::integration_from_row).collect()
    }

    #[tracing::instrument(level = "info", skip(self))]
    async fn delete_integration(&self, id: IntegrationId) -> Result<()> {
        sqlx::query("DELETE FROM replicator_service_integrations WHERE id = $1")
            .bind(id.0)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::store("delete integration", e))?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self, job), fields(id = %job.id))]
    async fn insert_backfill_job(&self, job: &BackfillJob) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO replicator_backfill_jobs ({JOB_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"
        ))
        .bind(job.id.0)
        .bind(job.org_id.0)
        .bind(job.integration_id.0)
        .bind(job.cursor.as_ref().map(|c| sqlx::types::Json(&c.value)))
        .bind(job.incremental)
        .bind(job.status.as_str())
        .bind(job.pages_fetched as i64)
        .bind(job.items_upserted as i64)
        .bind(&job.last_error)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::store("insert backfill job", e))?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self, job), fields(id = %job.id))]
    async fn update_backfill_job(&self, job: &BackfillJob) -> Result<()> {
        let result = sqlx::query(
            r#"
UPDATE replicator_backfill_jobs SET
  cursor = $2,
  status = $3,
  pages_fetched = $4,
  items_upserted = $5,
  last_error = $6,
  updated_at = $7
WHERE id = $1
"#,
        )
        .bind(job.id.0)
        .bind(job.cursor.as_ref().map(|c| sqlx::types::Json(&c.value)))
        .bind(job.status.as_str())
        .bind(job.pages_fetched as i64)
        .bind(job.items_upserted as i64)
        .bind(&job.last_error)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::store("update backfill job", e))?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("backfill job {} not found", job.id)));
        }
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn get_backfill_job(&self, id: BackfillJobId) -> Result<Option<BackfillJob>> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM replicator_backfill_jobs WHERE id = $1"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::store("get backfill job", e))?;
        row.map(|r| Self::job_from_row(&r)).transpose()
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn list_backfill_jobs(&self, integration: IntegrationId) -> Result<Vec<BackfillJob>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM replicator_backfill_jobs \
             WHERE integration_id = $1 ORDER BY created_at ASC"
        ))
        .bind(integration.0)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::store("list backfill jobs", e))?;
        rows.iter().map(Self::job_from_row).collect()
    }
}
