//! Replicator core: the generic change-data-capture engine that replicates
//! third-party webhooks and paginated API data into per-integration tables.

pub mod backfill;
pub mod config;
pub mod dependencies;
pub mod error;
mod inflight;
pub mod models;
pub mod o11y;
pub mod organizations;
pub mod replicator;
pub mod stale_rows;
pub mod store;
pub mod upsert;
pub mod webhooks;

pub use backfill::{BackfillRunner, PageWalker, schedule_backfill};
pub use config::{
    BackfillConfig, PostgresConfig, ReplicatorConfig, StaleRowConfig, WebhookConfig,
};
pub use dependencies::{BuiltDependents, DependencyGraph};
pub use error::{Error, Result};
pub use models::{
    BackfillJob, BackfillJobId, BackfillStatus, Cursor, IntegrationId, OrgId, Organization,
    ServiceIntegration,
};
pub use organizations::Organizations;
pub use replicator::{
    BackfillSource, CredentialVerifier, Enricher, NormalizedRow, OnboardingRequirements, Page,
    PageRequest, Replicator, ReplicatorFactory, ReplicatorRegistry, StaleRowPolicy,
    StateMachineStep,
};
pub use stale_rows::{StaleRowDeleter, StaleRowReport};
pub use store::{IntegrationStore, JobScheduler, RowStore, RowStoreResolver, SharedRowStore};
pub use upsert::{EnrichmentStatus, UpsertDiff, UpsertEngine, UpsertSummary};
pub use webhooks::{
    RejectionReason, WebhookIngestor, WebhookRequest, WebhookResponse, WebhookValidation,
};
