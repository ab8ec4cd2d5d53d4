//! Shared fixtures: a scripted replicator over in-memory stores.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, SubsecRound, Utc};
use replicator_core::models::{Cursor, Organization, ServiceIntegration};
use replicator_core::replicator::traits::{
    BackfillSource, NormalizedRow, Page, PageRequest, Replicator, ReplicatorFactory,
    StaleRowPolicy,
};
use replicator_core::store::memory::{MemoryIntegrationStore, MemoryJobScheduler, MemoryRowStore};
use replicator_core::store::schema::{ColumnType, ExpiryPredicate, TableSchema};
use replicator_core::store::traits::{IntegrationStore, SharedRowStore};
use replicator_core::{
    BackfillRunner, DependencyGraph, Error, ReplicatorRegistry, Result, UpsertDiff,
    UpsertEngine, WebhookIngestor, WebhookValidation,
};
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};

pub const TICKETS: &str = "tickets";
pub const COMMENTS: &str = "ticket_comments";
pub const PLAIN: &str = "plain";
pub const EXPIRED_STATUS: &str = "closed";

/// Paged source serving fixed pages; the cursor is the next page index.
#[derive(Default)]
pub struct ScriptedSource {
    pages: Vec<Vec<Value>>,
    fail_once_at: Mutex<Option<usize>>,
    delay: Mutex<Option<std::time::Duration>>,
    requests: Mutex<Vec<Option<Cursor>>>,
}

impl ScriptedSource {
    pub fn new(pages: Vec<Vec<Value>>) -> Self {
        Self {
            pages,
            ..Self::default()
        }
    }

    /// The next request for page `index` fails with a 500.
    pub fn fail_once_at(self, index: usize) -> Self {
        *self.fail_once_at.lock().unwrap() = Some(index);
        self
    }

    /// Sleep before answering each request; `None` removes the delay.
    pub fn set_delay(&self, delay: Option<std::time::Duration>) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn requests(&self) -> Vec<Option<Cursor>> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl BackfillSource for ScriptedSource {
    async fn fetch_page(&self, request: &PageRequest) -> Result<Page> {
        self.requests.lock().unwrap().push(request.cursor.clone());
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let index = match &request.cursor {
            None => 0,
            Some(cursor) => cursor
                .value
                .as_str()
                .and_then(|s| s.parse::<usize>().ok())
                .ok_or_else(|| Error::InvalidInput("bad cursor".to_string()))?,
        };
        {
            let mut fail = self.fail_once_at.lock().unwrap();
            if *fail == Some(index) {
                *fail = None;
                return Err(Error::upstream(Some(500), "scripted failure"));
            }
        }
        let Some(items) = self.pages.get(index) else {
            return Ok(Page::default());
        };
        let next = (index + 1 < self.pages.len())
            .then(|| Cursor::new(json!((index + 1).to_string())));
        Ok(Page::new(items.clone(), next))
    }
}

/// Behaviour shared by every replicator a [`FakeFactory`] builds.
#[derive(Clone, Default)]
pub struct FakeSpec {
    pub service: String,
    pub source: Option<Arc<ScriptedSource>>,
    pub requires: Option<String>,
    pub dependents: Vec<String>,
    pub refresh: Vec<String>,
    pub hmac: bool,
}

impl FakeSpec {
    pub fn new(service: &str) -> Self {
        Self {
            service: service.to_string(),
            ..Self::default()
        }
    }

    pub fn with_source(mut self, source: Arc<ScriptedSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn requiring(mut self, parent: &str) -> Self {
        self.requires = Some(parent.to_string());
        self
    }

    pub fn providing(mut self, child: &str) -> Self {
        self.dependents.push(child.to_string());
        self
    }

    pub fn refreshing(mut self, child: &str) -> Self {
        self.refresh.push(child.to_string());
        self
    }

    pub fn signed(mut self) -> Self {
        self.hmac = true;
        self
    }
}

pub struct FakeReplicator {
    spec: FakeSpec,
    integration: ServiceIntegration,
}

impl Replicator for FakeReplicator {
    fn service_name(&self) -> &str {
        &self.spec.service
    }

    fn integration(&self) -> &ServiceIntegration {
        &self.integration
    }

    fn table_schema(&self) -> TableSchema {
        TableSchema::new(self.integration.table_name(), "updated_at")
            .column("status", ColumnType::Text)
            .index(&["status", "updated_at"])
    }

    fn webhook_validation(&self) -> WebhookValidation {
        if self.spec.hmac {
            WebhookValidation::HmacSignature {
                signature_header: "x-signature".to_string(),
                nonce_header: "x-nonce".to_string(),
            }
        } else {
            WebhookValidation::None
        }
    }

    fn normalize(&self, raw: &Value) -> Result<NormalizedRow> {
        let id = raw["id"]
            .as_str()
            .ok_or_else(|| Error::InvalidInput("missing id".to_string()))?;
        let updated_at = raw["updated_at"]
            .as_str()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .ok_or_else(|| Error::InvalidInput("missing updated_at".to_string()))?
            .with_timezone(&Utc);
        let mut row = NormalizedRow::new(id, updated_at, raw.clone())?;
        if let Some(status) = raw["status"].as_str() {
            row = row.with_column("status", status);
        }
        Ok(row)
    }

    fn required_dependency(&self) -> Option<&str> {
        self.spec.requires.as_deref()
    }

    fn dependent_services(&self) -> Vec<String> {
        self.spec.dependents.clone()
    }

    fn dependents_to_refresh(&self, _diff: &UpsertDiff) -> Vec<String> {
        self.spec.refresh.clone()
    }

    fn backfill_source(&self) -> Option<&dyn BackfillSource> {
        self.spec
            .source
            .as_deref()
            .map(|s| s as &dyn BackfillSource)
    }

    fn stale_row_policy(&self) -> Option<&dyn StaleRowPolicy> {
        Some(self)
    }
}

impl StaleRowPolicy for FakeReplicator {
    fn expiry_predicate(&self) -> ExpiryPredicate {
        ExpiryPredicate::new("status", &[EXPIRED_STATUS], "updated_at")
    }
}

pub struct FakeFactory(pub FakeSpec);

impl ReplicatorFactory for FakeFactory {
    fn service_name(&self) -> &str {
        &self.0.service
    }

    fn build(&self, integration: &ServiceIntegration) -> Result<Arc<dyn Replicator>> {
        Ok(Arc::new(FakeReplicator {
            spec: self.0.clone(),
            integration: integration.clone(),
        }))
    }
}

pub fn registry(specs: Vec<FakeSpec>) -> ReplicatorRegistry {
    let mut registry = ReplicatorRegistry::new();
    for spec in specs {
        registry.register(Arc::new(FakeFactory(spec))).unwrap();
    }
    registry
}

/// Current time without sub-second precision, so RFC 3339 round trips are exact.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(0)
}

pub fn doc(id: &str, updated_at: DateTime<Utc>, status: &str) -> Value {
    json!({ "id": id, "updated_at": updated_at.to_rfc3339(), "status": status })
}

pub fn aged(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    now - age
}

pub struct Harness {
    pub rows: MemoryRowStore,
    pub integrations: MemoryIntegrationStore,
    pub scheduler: MemoryJobScheduler,
    pub registry: Arc<ReplicatorRegistry>,
    pub engine: Arc<UpsertEngine>,
    pub dependencies: Arc<DependencyGraph>,
    pub org: Organization,
}

impl Harness {
    pub async fn new(registry: ReplicatorRegistry) -> Self {
        let rows = MemoryRowStore::new();
        let integrations = MemoryIntegrationStore::new();
        let scheduler = MemoryJobScheduler::new();
        let engine = Arc::new(UpsertEngine::new(Arc::new(SharedRowStore(Arc::new(
            rows.clone(),
        )))));
        let dependencies = Arc::new(DependencyGraph::new(
            Arc::new(integrations.clone()),
            Arc::new(scheduler.clone()),
        ));
        let org = Organization::new("acme", None).unwrap();
        integrations.upsert_organization(&org).await.unwrap();
        Self {
            rows,
            integrations,
            scheduler,
            registry: Arc::new(registry),
            engine,
            dependencies,
            org,
        }
    }

    pub async fn integration(&self, service: &str) -> ServiceIntegration {
        let integration = ServiceIntegration::new(self.org.org_id, service, None).unwrap();
        self.integrations.insert_integration(&integration).await.unwrap();
        integration
    }

    pub async fn child_of(&self, service: &str, parent: &ServiceIntegration) -> ServiceIntegration {
        let integration = ServiceIntegration::new(self.org.org_id, service, None)
            .unwrap()
            .with_depends_on(parent.id);
        self.integrations.insert_integration(&integration).await.unwrap();
        integration
    }

    pub fn replicator(&self, integration: &ServiceIntegration) -> Arc<dyn Replicator> {
        self.registry.build(integration).unwrap()
    }

    pub fn runner(&self) -> BackfillRunner {
        BackfillRunner::new(
            Arc::new(self.integrations.clone()),
            Arc::new(self.scheduler.clone()),
            self.registry.clone(),
            self.engine.clone(),
            self.dependencies.clone(),
        )
    }

    pub fn ingestor(&self) -> WebhookIngestor {
        WebhookIngestor::new(
            Arc::new(self.integrations.clone()),
            self.registry.clone(),
            self.engine.clone(),
            self.dependencies.clone(),
        )
    }

    /// Upsert documents through the engine as a webhook would.
    pub async fn seed(&self, integration: &ServiceIntegration, docs: &[Value]) {
        let replicator = self.replicator(integration);
        for d in docs {
            self.engine.upsert(replicator.as_ref(), d).await.unwrap();
        }
    }

    pub async fn ids(&self, integration: &ServiceIntegration) -> Vec<String> {
        let mut ids: Vec<String> = self
            .rows
            .rows(&integration.table_name())
            .await
            .into_iter()
            .map(|r| r.external_id)
            .collect();
        ids.sort();
        ids
    }
}
