//! Dependency graph between integrations: a parent provisions its declared
//! dependents and triggers their backfills; a dependent refuses to run without
//! the parent it requires.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::backfill::runner::schedule_backfill;
use crate::models::{BackfillJob, IntegrationId, ServiceIntegration};
use crate::replicator::traits::Replicator;
use crate::store::traits::{IntegrationStore, JobScheduler};
use crate::upsert::diff::UpsertDiff;
use crate::{Error, Result};

/// Result of `DependencyGraph::build_dependents`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuiltDependents {
    pub created: Vec<ServiceIntegration>,
    pub jobs: Vec<BackfillJob>,
    /// Service names that already had a dependent and were skipped.
    pub existing: Vec<String>,
}

pub struct DependencyGraph {
    integrations: Arc<dyn IntegrationStore>,
    scheduler: Arc<dyn JobScheduler>,
}

impl DependencyGraph {
    pub fn new(integrations: Arc<dyn IntegrationStore>, scheduler: Arc<dyn JobScheduler>) -> Self {
        Self {
            integrations,
            scheduler,
        }
    }

    /// Create one dependent integration (and one incremental backfill job) per
    /// service the parent declares. Dependents that already exist are left alone,
    /// so calling this again creates nothing.
    ///
    /// Dependents inherit the parent's API url and backfill credentials.
    #[tracing::instrument(level = "info", skip_all, fields(parent = %parent.integration().id))]
    pub async fn build_dependents(&self, parent: &dyn Replicator) -> Result<BuiltDependents> {
        let parent_integration = parent.integration();
        let existing = self.integrations.list_dependents(parent_integration.id).await?;
        let mut out = BuiltDependents::default();

        let wanted: BTreeSet<String> = parent
            .dependent_services()
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        for service_name in wanted {
            if existing.iter().any(|d| d.service_name == service_name) {
                out.existing.push(service_name);
                continue;
            }

            let mut child = ServiceIntegration::new(parent_integration.org_id, service_name, None)?
                .with_depends_on(parent_integration.id);
            child.api_url = parent_integration.api_url.clone();
            child.backfill_key = parent_integration.backfill_key.clone();
            child.backfill_secret = parent_integration.backfill_secret.clone();
            self.integrations.insert_integration(&child).await?;

            let job = schedule_backfill(
                self.integrations.as_ref(),
                self.scheduler.as_ref(),
                &child,
                true,
            )
            .await?;
            tracing::info!(dependent = %child.id, service = %child.service_name, "dependent integration created");
            out.created.push(child);
            out.jobs.push(job);
        }
        Ok(out)
    }

    /// The single dependent of `parent` running `service_name`.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn get_dependent_integration(
        &self,
        parent: IntegrationId,
        service_name: &str,
    ) -> Result<ServiceIntegration> {
        let mut matches: Vec<ServiceIntegration> = self
            .integrations
            .list_dependents(parent)
            .await?
            .into_iter()
            .filter(|d| d.service_name == service_name)
            .collect();
        match matches.len() {
            0 => Err(Error::DependencyMissing(format!(
                "integration {parent} has no '{service_name}' dependent"
            ))),
            1 => Ok(matches.remove(0)),
            n => Err(Error::DependencyAmbiguous(format!(
                "integration {parent} has {n} '{service_name}' dependents"
            ))),
        }
    }

    /// Fail unless the replicator's required parent is linked and of the right service.
    #[tracing::instrument(level = "debug", skip_all, fields(integration = %replicator.integration().id))]
    pub async fn require_parent(
        &self,
        replicator: &dyn Replicator,
    ) -> Result<Option<ServiceIntegration>> {
        let Some(required) = replicator.required_dependency() else {
            return Ok(None);
        };
        let integration = replicator.integration();
        let Some(parent_id) = integration.depends_on else {
            return Err(Error::DependencyMissing(format!(
                "'{}' requires a '{required}' integration but none is linked",
                integration.service_name
            )));
        };
        let parent = self
            .integrations
            .get_integration(parent_id)
            .await?
            .ok_or_else(|| {
                Error::DependencyMissing(format!(
                    "'{}' depends on integration {parent_id}, which no longer exists",
                    integration.service_name
                ))
            })?;
        if parent.service_name != required {
            return Err(Error::DependencyMissing(format!(
                "'{}' requires a '{required}' parent but is linked to '{}'",
                integration.service_name, parent.service_name
            )));
        }
        Ok(Some(parent))
    }

    /// Schedule incremental backfills for dependents the parent asks to refresh
    /// after the applied diffs.
    #[tracing::instrument(level = "debug", skip_all, fields(parent = %parent.integration().id))]
    pub async fn refresh_dependents(
        &self,
        parent: &dyn Replicator,
        diffs: &[UpsertDiff],
    ) -> Result<Vec<BackfillJob>> {
        let names: BTreeSet<String> = diffs
            .iter()
            .filter(|d| d.is_applied())
            .flat_map(|d| parent.dependents_to_refresh(d))
            .collect();

        let mut jobs = Vec::with_capacity(names.len());
        for name in names {
            let child = self
                .get_dependent_integration(parent.integration().id, &name)
                .await?;
            jobs.push(
                schedule_backfill(
                    self.integrations.as_ref(),
                    self.scheduler.as_ref(),
                    &child,
                    true,
                )
                .await?,
            );
        }
        Ok(jobs)
    }
}
