use chrono::Utc;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::backfill::pages::PageWalker;
use crate::config::BackfillConfig;
use crate::dependencies::DependencyGraph;
use crate::inflight::InFlight;
use crate::models::{BackfillJob, BackfillJobId, BackfillStatus, IntegrationId, ServiceIntegration};
use crate::replicator::registry::ReplicatorRegistry;
use crate::store::traits::{IntegrationStore, JobScheduler};
use crate::upsert::engine::UpsertEngine;
use crate::{Error, Result};

/// Create a backfill job for `integration` and hand it to the scheduler.
#[tracing::instrument(level = "debug", skip(integrations, scheduler, integration), fields(integration = %integration.id))]
pub async fn schedule_backfill(
    integrations: &dyn IntegrationStore,
    scheduler: &dyn JobScheduler,
    integration: &ServiceIntegration,
    incremental: bool,
) -> Result<BackfillJob> {
    let job = BackfillJob::new(integration, incremental, None);
    integrations.insert_backfill_job(&job).await?;
    scheduler.enqueue_backfill(job.id).await?;
    tracing::info!(job_id = %job.id, incremental, "backfill job scheduled");
    Ok(job)
}

/// Drives one `BackfillJob` through the adapter's paginated list operation.
///
/// The cursor is persisted after every fully applied page, so an interrupted
/// run resumes from the last page boundary, including a job a crashed process
/// left marked `Running`. Runs of the same job are expected to be serialized
/// by the job scheduler; this runner only rejects a second start inside the
/// same process.
pub struct BackfillRunner {
    integrations: Arc<dyn IntegrationStore>,
    scheduler: Arc<dyn JobScheduler>,
    registry: Arc<ReplicatorRegistry>,
    engine: Arc<UpsertEngine>,
    dependencies: Arc<DependencyGraph>,
    config: BackfillConfig,
    cancel: CancellationToken,
    active: InFlight<BackfillJobId>,
}

impl BackfillRunner {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn new(
        integrations: Arc<dyn IntegrationStore>,
        scheduler: Arc<dyn JobScheduler>,
        registry: Arc<ReplicatorRegistry>,
        engine: Arc<UpsertEngine>,
        dependencies: Arc<DependencyGraph>,
    ) -> Self {
        Self {
            integrations,
            scheduler,
            registry,
            engine,
            dependencies,
            config: BackfillConfig::default(),
            cancel: CancellationToken::new(),
            active: InFlight::new(),
        }
    }

    pub fn with_config(mut self, config: BackfillConfig) -> Self {
        self.config = config;
        self
    }

    /// Cancellation takes effect at the next page boundary.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Create a job for the integration and enqueue it.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn request(&self, integration_id: IntegrationId, incremental: bool) -> Result<BackfillJob> {
        let integration = self
            .integrations
            .get_integration(integration_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("integration {integration_id} not found")))?;
        schedule_backfill(
            self.integrations.as_ref(),
            self.scheduler.as_ref(),
            &integration,
            incremental,
        )
        .await
    }

    /// Put a job left `Running` by a crashed process back to `Pending`, so it
    /// reads as resumable to operators before the next run picks it up.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn release(&self, job_id: BackfillJobId) -> Result<BackfillJob> {
        let mut job = self.load_job(job_id).await?;
        if self.active.contains(&job_id) {
            return Err(Error::Conflict(format!(
                "backfill job {job_id} is running in this process"
            )));
        }
        if job.status == BackfillStatus::Running {
            job.status = BackfillStatus::Pending;
            job.updated_at = Utc::now();
            self.integrations.update_backfill_job(&job).await?;
        }
        Ok(job)
    }

    /// Run the job until its source is exhausted, a fetch fails, the page
    /// budget is spent, or cancellation is requested.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn run(&self, job_id: BackfillJobId) -> Result<BackfillJob> {
        let Some(_claim) = self.active.claim(job_id) else {
            return Err(Error::Conflict(format!(
                "backfill job {job_id} is already running"
            )));
        };
        self.run_inner(job_id).await
    }

    async fn load_job(&self, job_id: BackfillJobId) -> Result<BackfillJob> {
        self.integrations
            .get_backfill_job(job_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("backfill job {job_id} not found")))
    }

    async fn run_inner(&self, job_id: BackfillJobId) -> Result<BackfillJob> {
        let mut job = self.load_job(job_id).await?;
        match job.status {
            BackfillStatus::Completed => {
                tracing::debug!("backfill job already completed");
                return Ok(job);
            }
            BackfillStatus::Running => {
                tracing::warn!(
                    pages = job.pages_fetched,
                    "resuming backfill job left running by an interrupted run"
                );
            }
            BackfillStatus::Pending | BackfillStatus::Failed => {}
        }

        let integration = self
            .integrations
            .get_integration(job.integration_id)
            .await?
            .ok_or_else(|| {
                Error::NotFound(format!("integration {} not found", job.integration_id))
            })?;
        let replicator = self.registry.build(&integration)?;
        self.dependencies.require_parent(replicator.as_ref()).await?;
        let Some(source) = replicator.backfill_source() else {
            return Err(Error::InvalidInput(format!(
                "service '{}' does not support backfill",
                replicator.service_name()
            )));
        };

        job.status = BackfillStatus::Running;
        job.last_error = None;
        job.updated_at = Utc::now();
        if let Err(err) = self.integrations.update_backfill_job(&job).await {
            return Err(self.fail(&mut job, err).await);
        }

        let mut walker = PageWalker::new(source, job.cursor.clone(), job.incremental);
        let mut pages_this_run: u64 = 0;
        loop {
            if self.cancel.is_cancelled() {
                self.pause(&mut job).await?;
                tracing::info!(pages = job.pages_fetched, "backfill cancelled at page boundary");
                return Err(Error::Cancelled);
            }
            if self.config.max_pages.is_some_and(|max| pages_this_run >= max) {
                self.pause(&mut job).await?;
                tracing::info!(pages = pages_this_run, "backfill page budget reached");
                return Ok(job);
            }

            let page = match walker.next_page().await {
                Ok(Some(page)) => page,
                Ok(None) => break,
                Err(err) => return Err(self.fail(&mut job, err).await),
            };
            let summary = match self.engine.upsert_many(replicator.as_ref(), &page.items).await {
                Ok(summary) => summary,
                Err(err) => return Err(self.fail(&mut job, err).await),
            };

            pages_this_run += 1;
            job.pages_fetched += 1;
            job.items_upserted += summary.applied();
            job.cursor = walker.cursor().cloned();
            job.updated_at = Utc::now();
            if let Err(err) = self.integrations.update_backfill_job(&job).await {
                return Err(self.fail(&mut job, err).await);
            }
            tracing::debug!(
                items = page.items.len(),
                inserted = summary.inserted,
                updated = summary.updated,
                stale = summary.stale,
                "backfill page applied"
            );
        }

        job.status = BackfillStatus::Completed;
        job.cursor = None;
        job.updated_at = Utc::now();
        if let Err(err) = self.integrations.update_backfill_job(&job).await {
            return Err(self.fail(&mut job, err).await);
        }
        tracing::info!(
            pages = job.pages_fetched,
            items = job.items_upserted,
            "backfill completed"
        );
        Ok(job)
    }

    async fn pause(&self, job: &mut BackfillJob) -> Result<()> {
        job.status = BackfillStatus::Pending;
        job.updated_at = Utc::now();
        self.integrations.update_backfill_job(job).await
    }

    /// Mark the job failed at the cursor of its last applied page and hand back the cause.
    async fn fail(&self, job: &mut BackfillJob, err: Error) -> Error {
        tracing::warn!(error = %err, job_id = %job.id, "backfill run failed");
        job.status = BackfillStatus::Failed;
        job.last_error = Some(err.to_string());
        job.updated_at = Utc::now();
        if let Err(store_err) = self.integrations.update_backfill_job(job).await {
            tracing::warn!(error = %store_err, "failed to record backfill failure");
        }
        err
    }
}
