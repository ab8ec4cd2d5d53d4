//! Settings-driven JSON replicator.
//!
//! Everything service-specific comes from the integration's `settings`:
//!
//! ```json
//! {
//!   "id_pointer": "/id",
//!   "last_modified_pointer": "/updated_at",
//!   "status_pointer": "/status",
//!   "expired_statuses": ["deleted", "archived"],
//!   "list_path": "/v1/items",
//!   "items_pointer": "/data",
//!   "cursor_pointer": "/next_cursor",
//!   "item_path": "/v1/items/{id}",
//!   "enrich_columns": {"owner": "/owner/email"},
//!   "webhook_validation": "hmac",
//!   "signature_header": "x-signature",
//!   "nonce_header": "x-nonce"
//! }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use replicator_core::models::ServiceIntegration;
use replicator_core::replicator::traits::{
    BackfillSource, CredentialVerifier, Enricher, NormalizedRow, OnboardingRequirements,
    Replicator, ReplicatorFactory, StaleRowPolicy,
};
use replicator_core::store::schema::{
    ColumnType, ColumnValue, Columns, ExpiryPredicate, TableSchema,
};
use replicator_core::webhooks::validation::WebhookValidation;
use replicator_core::{Error, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::http_source::{HttpPagedSource, HttpSourceConfig};

pub const SERVICE_NAME: &str = "generic_json";

const LAST_MODIFIED_COLUMN: &str = "updated_at";
const STATUS_COLUMN: &str = "status";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct GenericSettings {
    id_pointer: String,
    last_modified_pointer: String,
    status_pointer: Option<String>,
    expired_statuses: Vec<String>,
    list_path: Option<String>,
    items_pointer: String,
    cursor_pointer: String,
    cursor_param: String,
    /// Single-item endpoint with an `{id}` placeholder; enables enrichment.
    item_path: Option<String>,
    /// Extra text columns filled from the fetched item, keyed by column name.
    enrich_columns: BTreeMap<String, String>,
    enrichment_required: bool,
    webhook_validation: String,
    secret_header: String,
    signature_header: String,
    nonce_header: String,
    allowed_cidrs: Vec<String>,
    forwarded_header: Option<String>,
}

impl Default for GenericSettings {
    fn default() -> Self {
        Self {
            id_pointer: "/id".to_string(),
            last_modified_pointer: "/updated_at".to_string(),
            status_pointer: None,
            expired_statuses: Vec::new(),
            list_path: None,
            items_pointer: "/data".to_string(),
            cursor_pointer: "/next_cursor".to_string(),
            cursor_param: "cursor".to_string(),
            item_path: None,
            enrich_columns: BTreeMap::new(),
            enrichment_required: false,
            webhook_validation: "none".to_string(),
            secret_header: "x-webhook-secret".to_string(),
            signature_header: "x-signature".to_string(),
            nonce_header: "x-nonce".to_string(),
            allowed_cidrs: Vec::new(),
            forwarded_header: None,
        }
    }
}

pub struct GenericJsonReplicator {
    integration: ServiceIntegration,
    settings: GenericSettings,
    validation: WebhookValidation,
    source: Option<HttpPagedSource>,
}

impl GenericJsonReplicator {
    pub fn new(integration: &ServiceIntegration) -> Result<Self> {
        let settings: GenericSettings = serde_json::from_value(integration.settings.clone())
            .map_err(|e| Error::InvalidInput(format!("generic_json settings: {e}")))?;

        let validation = match settings.webhook_validation.as_str() {
            "none" => WebhookValidation::None,
            "shared_secret" => WebhookValidation::SharedSecret {
                header: settings.secret_header.clone(),
            },
            "hmac" => WebhookValidation::HmacSignature {
                signature_header: settings.signature_header.clone(),
                nonce_header: settings.nonce_header.clone(),
            },
            "ip_allow_list" => {
                let entries: Vec<&str> = settings.allowed_cidrs.iter().map(String::as_str).collect();
                WebhookValidation::ip_allow_list(&entries, settings.forwarded_header.as_deref())?
            }
            other => {
                return Err(Error::InvalidInput(format!(
                    "unknown webhook_validation '{other}'"
                )));
            }
        };

        for column in settings.enrich_columns.keys() {
            if [STATUS_COLUMN, LAST_MODIFIED_COLUMN].contains(&column.as_str()) {
                return Err(Error::InvalidInput(format!(
                    "enrich column '{column}' collides with a built-in column"
                )));
            }
        }
        if !settings.enrich_columns.is_empty() && settings.item_path.is_none() {
            return Err(Error::InvalidInput(
                "enrich_columns needs an item_path".to_string(),
            ));
        }

        // Backfill needs both a list endpoint and a base url.
        let source = match (&settings.list_path, integration.api_url.as_deref()) {
            (Some(list_path), Some(api_url)) => {
                let mut config = HttpSourceConfig::new(api_url, list_path.clone())
                    .with_pointers(settings.items_pointer.clone(), settings.cursor_pointer.clone())
                    .with_cursor_param(settings.cursor_param.clone());
                if let Some(item_path) = &settings.item_path {
                    config = config.with_item_path(item_path.clone());
                }
                Some(HttpPagedSource::new(config.for_integration(integration))?)
            }
            _ => None,
        };

        Ok(Self {
            integration: integration.clone(),
            settings,
            validation,
            source,
        })
    }

    fn has_status(&self) -> bool {
        self.settings.status_pointer.is_some()
    }

    fn enriches(&self) -> bool {
        !self.settings.enrich_columns.is_empty()
            && self
                .source
                .as_ref()
                .is_some_and(|s| s.config().item_path.is_some())
    }
}

fn enrichment_value(value: Option<&serde_json::Value>) -> ColumnValue {
    match value {
        None | Some(serde_json::Value::Null) => ColumnValue::Null,
        Some(serde_json::Value::String(s)) => ColumnValue::Text(s.clone()),
        Some(other) => ColumnValue::Text(other.to_string()),
    }
}

fn parse_timestamp(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    match value {
        serde_json::Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        serde_json::Value::Number(n) => {
            let n = n.as_i64()?;
            // Values past 10^12 are epoch milliseconds.
            if n.abs() >= 1_000_000_000_000 {
                Utc.timestamp_millis_opt(n).single()
            } else {
                Utc.timestamp_opt(n, 0).single()
            }
        }
        _ => None,
    }
}

impl Replicator for GenericJsonReplicator {
    fn service_name(&self) -> &str {
        SERVICE_NAME
    }

    fn integration(&self) -> &ServiceIntegration {
        &self.integration
    }

    fn table_schema(&self) -> TableSchema {
        let mut schema = TableSchema::new(self.integration.table_name(), LAST_MODIFIED_COLUMN);
        if self.has_status() {
            schema = schema
                .column(STATUS_COLUMN, ColumnType::Text)
                .index(&[STATUS_COLUMN, LAST_MODIFIED_COLUMN]);
        }
        for column in self.settings.enrich_columns.keys() {
            schema = schema.column(column.clone(), ColumnType::Text);
        }
        schema
    }

    fn webhook_validation(&self) -> WebhookValidation {
        self.validation.clone()
    }

    fn normalize(&self, raw: &serde_json::Value) -> Result<NormalizedRow> {
        let external_id = match raw.pointer(&self.settings.id_pointer) {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(serde_json::Value::Number(n)) => n.to_string(),
            _ => {
                return Err(Error::InvalidInput(format!(
                    "document has no id at '{}'",
                    self.settings.id_pointer
                )));
            }
        };
        let last_modified = raw
            .pointer(&self.settings.last_modified_pointer)
            .and_then(parse_timestamp)
            .ok_or_else(|| {
                Error::InvalidInput(format!(
                    "document has no timestamp at '{}'",
                    self.settings.last_modified_pointer
                ))
            })?;

        let mut row = NormalizedRow::new(external_id, last_modified, raw.clone())?;
        if let Some(pointer) = &self.settings.status_pointer {
            if let Some(status) = raw.pointer(pointer).and_then(|v| v.as_str()) {
                row = row.with_column(STATUS_COLUMN, status);
            }
        }
        Ok(row)
    }

    fn onboarding_requirements(&self) -> OnboardingRequirements {
        OnboardingRequirements {
            api_url: self.settings.list_path.is_some(),
            webhook_secret: self.validation.needs_secret(),
            backfill_key: self.settings.list_path.is_some(),
            backfill_secret: false,
            webhook_instructions: None,
        }
    }

    /// Accepts a single document or an array of documents.
    fn extract_payloads(&self, body: &[u8]) -> Result<Vec<serde_json::Value>> {
        let value: serde_json::Value = serde_json::from_slice(body)
            .map_err(|e| Error::InvalidInput(format!("webhook body is not json: {e}")))?;
        Ok(match value {
            serde_json::Value::Array(items) => items,
            other => vec![other],
        })
    }

    fn enricher(&self) -> Option<&dyn Enricher> {
        self.enriches().then_some(self as &dyn Enricher)
    }

    fn backfill_source(&self) -> Option<&dyn BackfillSource> {
        self.source.as_ref().map(|s| s as &dyn BackfillSource)
    }

    fn credential_verifier(&self) -> Option<&dyn CredentialVerifier> {
        self.source.as_ref().map(|s| s as &dyn CredentialVerifier)
    }

    fn stale_row_policy(&self) -> Option<&dyn StaleRowPolicy> {
        (self.has_status() && !self.settings.expired_statuses.is_empty())
            .then_some(self as &dyn StaleRowPolicy)
    }
}

impl StaleRowPolicy for GenericJsonReplicator {
    fn expiry_predicate(&self) -> ExpiryPredicate {
        let values: Vec<&str> = self
            .settings
            .expired_statuses
            .iter()
            .map(String::as_str)
            .collect();
        ExpiryPredicate::new(STATUS_COLUMN, &values, LAST_MODIFIED_COLUMN)
    }
}

/// Fetches the item by external id and copies the configured fields.
#[async_trait]
impl Enricher for GenericJsonReplicator {
    async fn fetch_enrichment(&self, row: &NormalizedRow) -> Result<Option<Columns>> {
        let Some(source) = self.source.as_ref() else {
            return Ok(None);
        };
        let item = source.fetch_one(&row.external_id).await?;
        let columns: Columns = self
            .settings
            .enrich_columns
            .iter()
            .map(|(column, pointer)| (column.clone(), enrichment_value(item.pointer(pointer))))
            .collect();
        Ok((!columns.is_empty()).then_some(columns))
    }

    fn required(&self) -> bool {
        self.settings.enrichment_required
    }
}

pub struct GenericJsonFactory;

impl ReplicatorFactory for GenericJsonFactory {
    fn service_name(&self) -> &str {
        SERVICE_NAME
    }

    fn build(&self, integration: &ServiceIntegration) -> Result<Arc<dyn Replicator>> {
        Ok(Arc::new(GenericJsonReplicator::new(integration)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Path;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::{Json, Router};
    use replicator_core::models::OrgId;
    use replicator_core::store::memory::MemoryRowStore;
    use replicator_core::store::traits::SharedRowStore;
    use replicator_core::{EnrichmentStatus, UpsertDiff, UpsertEngine};
    use serde_json::json;

    fn integration(settings: serde_json::Value) -> ServiceIntegration {
        let mut i = ServiceIntegration::new(OrgId::new(), SERVICE_NAME, None).unwrap();
        i.settings = settings;
        i
    }

    #[test]
    fn normalizes_by_pointer() {
        let r = GenericJsonReplicator::new(&integration(json!({
            "id_pointer": "/ref/id",
            "last_modified_pointer": "/meta/modified",
            "status_pointer": "/state",
        })))
        .unwrap();
        let row = r
            .normalize(&json!({"ref": {"id": 42}, "meta": {"modified": "2024-05-01T10:00:00Z"}, "state": "open"}))
            .unwrap();
        assert_eq!(row.external_id, "42");
        assert_eq!(row.last_modified.to_rfc3339(), "2024-05-01T10:00:00+00:00");
        assert!(row.columns.contains_key(STATUS_COLUMN));
        assert!(r.normalize(&json!({"meta": {"modified": 1}})).is_err());
    }

    #[test]
    fn epoch_seconds_and_millis() {
        assert_eq!(
            parse_timestamp(&json!(1_700_000_000)).unwrap().timestamp(),
            1_700_000_000
        );
        assert_eq!(
            parse_timestamp(&json!(1_700_000_000_123i64))
                .unwrap()
                .timestamp_millis(),
            1_700_000_000_123
        );
        assert!(parse_timestamp(&json!(true)).is_none());
    }

    #[test]
    fn facets_follow_settings() {
        let bare = GenericJsonReplicator::new(&integration(json!({}))).unwrap();
        assert!(bare.backfill_source().is_none());
        assert!(bare.stale_row_policy().is_none());
        assert_eq!(bare.webhook_validation(), WebhookValidation::None);

        let mut i = integration(json!({
            "status_pointer": "/status",
            "expired_statuses": ["deleted"],
            "list_path": "/items",
            "webhook_validation": "hmac",
        }));
        i.api_url = Some("https://api.example.com".to_string());
        let full = GenericJsonReplicator::new(&i).unwrap();
        assert!(full.backfill_source().is_some());
        let policy = full.stale_row_policy().unwrap().expiry_predicate();
        assert!(policy.validate(&full.table_schema()).is_ok());
        assert!(full.onboarding_requirements().webhook_secret);
    }

    #[test]
    fn array_bodies_split_into_documents() {
        let r = GenericJsonReplicator::new(&integration(json!({}))).unwrap();
        assert_eq!(r.extract_payloads(br#"[{"id":1},{"id":2}]"#).unwrap().len(), 2);
        assert_eq!(r.extract_payloads(br#"{"id":1}"#).unwrap().len(), 1);
    }

    #[test]
    fn unknown_validation_is_rejected() {
        let err = GenericJsonReplicator::new(&integration(json!({"webhook_validation": "magic"})))
            .err()
            .unwrap();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    async fn item(Path(id): Path<String>) -> (StatusCode, Json<serde_json::Value>) {
        match id.as_str() {
            "t-1" => (
                StatusCode::OK,
                Json(json!({"owner": {"email": "ops@example.com"}, "priority": 3})),
            ),
            _ => (StatusCode::NOT_FOUND, Json(json!({"error": "missing"}))),
        }
    }

    async fn serve() -> String {
        let app = Router::new().route("/items/{id}", get(item));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn enriching(base: &str, required: bool) -> GenericJsonReplicator {
        let mut i = integration(json!({
            "list_path": "/items",
            "item_path": "/items/{id}",
            "enrich_columns": {"owner": "/owner/email", "priority": "/priority", "team": "/team"},
            "enrichment_required": required,
        }));
        i.api_url = Some(base.to_string());
        GenericJsonReplicator::new(&i).unwrap()
    }

    #[tokio::test]
    async fn enrichment_fills_configured_columns() {
        let base = serve().await;
        let r = enriching(&base, false);
        let enricher = r.enricher().unwrap();
        assert!(!enricher.required());

        let row = r
            .normalize(&json!({"id": "t-1", "updated_at": "2024-05-01T10:00:00Z"}))
            .unwrap();
        let columns = enricher.fetch_enrichment(&row).await.unwrap().unwrap();
        assert_eq!(
            columns.get("owner"),
            Some(&ColumnValue::Text("ops@example.com".to_string()))
        );
        assert_eq!(columns.get("priority"), Some(&ColumnValue::Text("3".to_string())));
        assert_eq!(columns.get("team"), Some(&ColumnValue::Null));
        assert!(r.table_schema().check_columns(&columns).is_ok());

        let rows = MemoryRowStore::new();
        let engine = UpsertEngine::new(Arc::new(SharedRowStore(Arc::new(rows.clone()))));
        let diff = engine
            .upsert(&r, &json!({"id": "t-1", "updated_at": "2024-05-01T10:00:00Z"}))
            .await
            .unwrap();
        assert!(matches!(
            diff,
            UpsertDiff::Inserted {
                enrichment: EnrichmentStatus::Applied,
                ..
            }
        ));
        let stored = rows.rows(&r.integration().table_name()).await;
        assert_eq!(
            stored[0].columns.get("owner"),
            Some(&ColumnValue::Text("ops@example.com".to_string()))
        );
    }

    #[tokio::test]
    async fn enrichment_failures_follow_the_required_flag() {
        let base = serve().await;
        let doc = json!({"id": "t-404", "updated_at": "2024-05-01T10:00:00Z"});

        let optional = enriching(&base, false);
        let engine = UpsertEngine::new(Arc::new(SharedRowStore(Arc::new(MemoryRowStore::new()))));
        let diff = engine.upsert(&optional, &doc).await.unwrap();
        assert!(matches!(
            diff,
            UpsertDiff::Inserted {
                enrichment: EnrichmentStatus::Failed(_),
                ..
            }
        ));

        let required = enriching(&base, true);
        let rows = MemoryRowStore::new();
        let engine = UpsertEngine::new(Arc::new(SharedRowStore(Arc::new(rows.clone()))));
        let err = engine.upsert(&required, &doc).await.unwrap_err();
        assert!(matches!(err, Error::UpstreamFetch { status: Some(404), .. }));
        assert!(rows.rows(&required.integration().table_name()).await.is_empty());
    }

    #[test]
    fn enrichment_needs_an_item_endpoint() {
        let without_item = integration(json!({"enrich_columns": {"owner": "/owner"}}));
        assert!(GenericJsonReplicator::new(&without_item).is_err());
        let collides = integration(json!({
            "item_path": "/items/{id}",
            "enrich_columns": {"status": "/status"},
        }));
        assert!(GenericJsonReplicator::new(&collides).is_err());

        // No api_url yet, so nothing to fetch from.
        let pending = GenericJsonReplicator::new(&integration(json!({
            "list_path": "/items",
            "item_path": "/items/{id}",
            "enrich_columns": {"owner": "/owner"},
        })))
        .unwrap();
        assert!(pending.enricher().is_none());
        assert!(pending.table_schema().columns.iter().any(|c| c.name == "owner"));
    }
}
