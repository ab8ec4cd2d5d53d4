use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::models::{Cursor, ServiceIntegration};
use crate::store::schema::{ColumnValue, Columns, ExpiryPredicate, TableSchema};
use crate::upsert::diff::UpsertDiff;
use crate::webhooks::ingest::WebhookResponse;
use crate::webhooks::validation::WebhookValidation;
use crate::{Error, Result};

/// A source document reduced to what the row store needs.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRow {
    /// Stable identifier in the external system (unique per source).
    pub external_id: String,
    /// Value of the adapter's last-modified field; drives the ordering check.
    pub last_modified: DateTime<Utc>,
    /// Denormalized columns declared in the adapter's `TableSchema`.
    pub columns: Columns,
    /// The normalized document, stored as-is in the `data` column.
    pub data: serde_json::Value,
}

impl NormalizedRow {
    #[tracing::instrument(level = "debug", skip(data))]
    pub fn new(
        external_id: impl Into<String> + std::fmt::Debug,
        last_modified: DateTime<Utc>,
        data: serde_json::Value,
    ) -> Result<Self> {
        let external_id = external_id.into();
        if external_id.trim().is_empty() {
            return Err(Error::InvalidInput(
                "normalized row external_id is empty".to_string(),
            ));
        }
        Ok(Self {
            external_id,
            last_modified,
            columns: Columns::new(),
            data,
        })
    }

    pub fn with_column(mut self, name: impl Into<String>, value: impl Into<ColumnValue>) -> Self {
        self.columns.insert(name.into(), value.into());
        self
    }
}

/// Arguments for one paginated list call.
#[derive(Debug, Clone, PartialEq)]
pub struct PageRequest {
    /// `None` on the first call of a run.
    pub cursor: Option<Cursor>,
    pub incremental: bool,
}

/// One page of raw source documents.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Page {
    pub items: Vec<serde_json::Value>,
    pub next_cursor: Option<Cursor>,
}

impl Page {
    pub fn new(items: Vec<serde_json::Value>, next_cursor: Option<Cursor>) -> Self {
        Self { items, next_cursor }
    }

    /// Cursor to continue from, if the source reports more pages.
    pub fn continuation(&self) -> Option<&Cursor> {
        self.next_cursor.as_ref().filter(|c| !c.is_exhausted())
    }
}

/// Which configuration fields an adapter needs before it can operate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnboardingRequirements {
    pub api_url: bool,
    pub webhook_secret: bool,
    pub backfill_key: bool,
    pub backfill_secret: bool,
    /// Appended to the webhook completion text (where to paste the URL, etc.).
    #[serde(default)]
    pub webhook_instructions: Option<String>,
}

/// Secondary fetch that augments a row with extra columns.
#[async_trait]
pub trait Enricher: Send + Sync {
    /// `Ok(None)` when the source has nothing to add for this row.
    async fn fetch_enrichment(&self, row: &NormalizedRow) -> Result<Option<Columns>>;

    /// When true, an enrichment failure aborts the write.
    fn required(&self) -> bool {
        false
    }
}

/// Paginated historical list operation of the source API.
#[async_trait]
pub trait BackfillSource: Send + Sync {
    /// A non-success response must surface as `Error::UpstreamFetch`.
    async fn fetch_page(&self, request: &PageRequest) -> Result<Page>;
}

/// Read-only credential check against the source API.
#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    async fn verify(&self, integration: &ServiceIntegration) -> Result<()>;
}

pub trait StaleRowPolicy: Send + Sync {
    fn expiry_predicate(&self) -> ExpiryPredicate;
}

/// Adapter logic bound to exactly one `ServiceIntegration`.
///
/// Required operations are methods; optional capabilities are facets an
/// adapter exposes by overriding the `Option` accessors.
pub trait Replicator: Send + Sync {
    fn service_name(&self) -> &str;

    fn integration(&self) -> &ServiceIntegration;

    /// Table layout. The table name is normally `integration().table_name()`.
    fn table_schema(&self) -> TableSchema;

    fn webhook_validation(&self) -> WebhookValidation;

    fn normalize(&self, raw: &serde_json::Value) -> Result<NormalizedRow>;

    fn onboarding_requirements(&self) -> OnboardingRequirements {
        OnboardingRequirements::default()
    }

    /// Service name of the parent integration this adapter cannot run without.
    fn required_dependency(&self) -> Option<&str> {
        None
    }

    /// Service names of child integrations this adapter provisions.
    fn dependent_services(&self) -> Vec<String> {
        Vec::new()
    }

    /// Dependents whose data should be refreshed after `diff` was applied.
    fn dependents_to_refresh(&self, _diff: &UpsertDiff) -> Vec<String> {
        Vec::new()
    }

    /// Split a webhook body into source documents. Defaults to one JSON document.
    fn extract_payloads(&self, body: &[u8]) -> Result<Vec<serde_json::Value>> {
        let value: serde_json::Value = serde_json::from_slice(body)
            .map_err(|e| Error::InvalidInput(format!("webhook body is not json: {e}")))?;
        Ok(vec![value])
    }

    fn webhook_response(&self, _diffs: &[UpsertDiff]) -> WebhookResponse {
        WebhookResponse::ok()
    }

    fn enricher(&self) -> Option<&dyn Enricher> {
        None
    }

    fn backfill_source(&self) -> Option<&dyn BackfillSource> {
        None
    }

    fn credential_verifier(&self) -> Option<&dyn CredentialVerifier> {
        None
    }

    fn stale_row_policy(&self) -> Option<&dyn StaleRowPolicy> {
        None
    }
}

/// Builds a replicator bound to one integration. Registered per service name.
pub trait ReplicatorFactory: Send + Sync {
    fn service_name(&self) -> &str;

    fn build(&self, integration: &ServiceIntegration) -> Result<Arc<dyn Replicator>>;
}
