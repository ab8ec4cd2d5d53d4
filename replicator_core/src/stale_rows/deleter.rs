use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::StaleRowConfig;
use crate::inflight::InFlight;
use crate::models::{IntegrationId, OrgId};
use crate::replicator::registry::ReplicatorRegistry;
use crate::stale_rows::guard::with_autovacuum_paused;
use crate::store::schema::{DeletePredicate, ExpiryPredicate, SessionScope};
use crate::store::traits::{IntegrationStore, RowStore};
use crate::upsert::engine::UpsertEngine;
use crate::{Error, Result};

/// Counters for one deleter pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaleRowReport {
    /// Age sub-ranges visited.
    pub windows: u64,
    /// Delete statements issued.
    pub statements: u64,
    pub rows_deleted: u64,
}

/// Incrementally purges expired rows from an integration's table.
///
/// Each pass disables autovacuum on the table for its duration and issues
/// chunked, range-bounded deletes with sequential scans disabled. Passes over
/// the same table must be serialized by the caller across processes; within a
/// process a second concurrent pass on the same table is refused.
pub struct StaleRowDeleter {
    integrations: Arc<dyn IntegrationStore>,
    registry: Arc<ReplicatorRegistry>,
    engine: Arc<UpsertEngine>,
    config: StaleRowConfig,
    cancel: CancellationToken,
    running: InFlight<(OrgId, String)>,
}

struct Target {
    org_id: OrgId,
    table: String,
    store: Arc<dyn RowStore>,
    expiry: ExpiryPredicate,
}

impl StaleRowDeleter {
    pub fn new(
        integrations: Arc<dyn IntegrationStore>,
        registry: Arc<ReplicatorRegistry>,
        engine: Arc<UpsertEngine>,
        config: StaleRowConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            integrations,
            registry,
            engine,
            config,
            cancel: CancellationToken::new(),
            running: InFlight::new(),
        })
    }

    /// Cancellation takes effect at the next window boundary.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &StaleRowConfig {
        &self.config
    }

    /// Delete expired rows aged within `[floor, ceiling)`.
    pub async fn run(&self, integration_id: IntegrationId) -> Result<StaleRowReport> {
        self.run_at(integration_id, Utc::now()).await
    }

    /// Delete every expired row older than the floor, with no upper age bound.
    pub async fn run_initial(&self, integration_id: IntegrationId) -> Result<StaleRowReport> {
        self.run_initial_at(integration_id, Utc::now()).await
    }

    #[tracing::instrument(level = "info", skip(self))]
    pub async fn run_at(
        &self,
        integration_id: IntegrationId,
        now: DateTime<Utc>,
    ) -> Result<StaleRowReport> {
        let floor = chrono_duration(self.config.floor)?;
        let ceiling = chrono_duration(self.config.ceiling)?;
        let step = chrono_duration(self.config.step)?;
        let start = now - ceiling;
        let cutoff = now - floor;

        let target = self.resolve(integration_id).await?;
        let report = self
            .exclusive(&target, || async {
                let mut report = StaleRowReport::default();
                let mut at = start;
                while at < cutoff {
                    if self.cancel.is_cancelled() {
                        return Err(Error::Cancelled);
                    }
                    let end = (at + step).min(cutoff);
                    let predicate = target.expiry.within(Some(at), end);
                    self.delete_chunked(&target, &predicate, &mut report).await?;
                    report.windows += 1;
                    at = end;
                }
                Ok(report)
            })
            .await?;

        tracing::info!(
            table = %target.table,
            windows = report.windows,
            statements = report.statements,
            rows_deleted = report.rows_deleted,
            "stale row pass completed"
        );
        Ok(report)
    }

    #[tracing::instrument(level = "info", skip(self))]
    pub async fn run_initial_at(
        &self,
        integration_id: IntegrationId,
        now: DateTime<Utc>,
    ) -> Result<StaleRowReport> {
        let cutoff = now - chrono_duration(self.config.floor)?;
        let target = self.resolve(integration_id).await?;
        let report = self
            .exclusive(&target, || async {
                let mut report = StaleRowReport::default();
                if self.cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                let predicate = target.expiry.within(None, cutoff);
                self.delete_chunked(&target, &predicate, &mut report).await?;
                report.windows = 1;
                Ok(report)
            })
            .await?;

        tracing::info!(
            table = %target.table,
            statements = report.statements,
            rows_deleted = report.rows_deleted,
            "initial stale row pass completed"
        );
        Ok(report)
    }

    async fn resolve(&self, integration_id: IntegrationId) -> Result<Target> {
        let integration = self
            .integrations
            .get_integration(integration_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("integration {integration_id} not found")))?;
        let replicator = self.registry.build(&integration)?;
        let Some(policy) = replicator.stale_row_policy() else {
            return Err(Error::InvalidInput(format!(
                "service '{}' declares no stale row policy",
                replicator.service_name()
            )));
        };
        let expiry = policy.expiry_predicate();
        let schema = self.engine.ensure_table(replicator.as_ref()).await?;
        expiry.validate(&schema)?;

        Ok(Target {
            org_id: integration.org_id,
            store: self.engine.row_store(integration.org_id).await?,
            table: schema.table,
            expiry,
        })
    }

    /// Refuse overlapping passes on one table, then run `body` with autovacuum paused.
    async fn exclusive<F, Fut>(&self, target: &Target, body: F) -> Result<StaleRowReport>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<StaleRowReport>>,
    {
        let Some(_claim) = self.running.claim((target.org_id, target.table.clone())) else {
            return Err(Error::Conflict(format!(
                "stale row pass already running on '{}'",
                target.table
            )));
        };
        with_autovacuum_paused(target.store.clone(), &target.table, body).await
    }

    async fn delete_chunked(
        &self,
        target: &Target,
        predicate: &DeletePredicate,
        report: &mut StaleRowReport,
    ) -> Result<()> {
        let chunk = self.config.chunk_size;
        let session = SessionScope::without_seqscan();
        loop {
            let deleted = target
                .store
                .delete_where(&target.table, predicate, chunk, &session)
                .await?;
            report.statements += 1;
            report.rows_deleted += deleted;
            tracing::debug!(
                table = %target.table,
                not_before = ?predicate.not_before,
                before = %predicate.before,
                deleted,
                "stale row chunk deleted"
            );
            if deleted < u64::from(chunk) {
                return Ok(());
            }
        }
    }
}

fn chrono_duration(d: std::time::Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(d)
        .map_err(|e| Error::InvalidInput(format!("duration out of range: {e}")))
}
