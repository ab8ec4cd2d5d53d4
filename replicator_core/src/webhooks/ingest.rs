use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

use crate::config::WebhookConfig;
use crate::dependencies::DependencyGraph;
use crate::replicator::registry::ReplicatorRegistry;
use crate::store::traits::IntegrationStore;
use crate::upsert::engine::UpsertEngine;
use crate::webhooks::validation::WebhookRequest;
use crate::{Error, Result};

/// What the webhook transport sends back to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookResponse {
    pub status: u16,
    pub body: serde_json::Value,
}

impl WebhookResponse {
    pub fn new(status: u16, body: serde_json::Value) -> Self {
        Self { status, body }
    }

    pub fn ok() -> Self {
        Self::new(200, json!({ "ok": true }))
    }

    pub fn from_error(err: &Error) -> Self {
        let body = match err {
            Error::ValidationRejected(reason) => {
                json!({ "error": err.kind(), "reason": reason.code() })
            }
            Error::Store { .. } | Error::StoreMessage(_) => json!({ "error": err.kind() }),
            _ => json!({ "error": err.kind(), "message": err.to_string() }),
        };
        Self::new(err.http_status(), body)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Request-scoped webhook handling: resolve, validate, normalize, upsert.
pub struct WebhookIngestor {
    integrations: Arc<dyn IntegrationStore>,
    registry: Arc<ReplicatorRegistry>,
    engine: Arc<UpsertEngine>,
    dependencies: Arc<DependencyGraph>,
    config: WebhookConfig,
}

impl WebhookIngestor {
    pub fn new(
        integrations: Arc<dyn IntegrationStore>,
        registry: Arc<ReplicatorRegistry>,
        engine: Arc<UpsertEngine>,
        dependencies: Arc<DependencyGraph>,
    ) -> Self {
        Self {
            integrations,
            registry,
            engine,
            dependencies,
            config: WebhookConfig::default(),
        }
    }

    pub fn with_config(mut self, config: WebhookConfig) -> Self {
        self.config = config;
        self
    }

    /// Handle one delivery. Never fails: errors become status + JSON body.
    #[tracing::instrument(level = "info", skip(self, request), fields(method = %request.method, bytes = request.body.len()))]
    pub async fn handle(&self, opaque_id: &str, request: WebhookRequest) -> WebhookResponse {
        match self.try_handle(opaque_id, &request).await {
            Ok(response) => response,
            Err(err) => {
                match &err {
                    Error::ValidationRejected(_) => {}
                    Error::Store { .. } | Error::StoreMessage(_) => {
                        tracing::error!(error = %err, "webhook failed")
                    }
                    _ => tracing::warn!(error = %err, "webhook refused"),
                }
                WebhookResponse::from_error(&err)
            }
        }
    }

    pub async fn try_handle(&self, opaque_id: &str, request: &WebhookRequest) -> Result<WebhookResponse> {
        let integration = self
            .integrations
            .get_integration_by_opaque_id(opaque_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("no integration for '{opaque_id}'")))?;
        let replicator = self.registry.build(&integration)?;
        self.dependencies.require_parent(replicator.as_ref()).await?;

        if request.body.len() > self.config.max_payload_bytes {
            return Ok(WebhookResponse::new(
                413,
                json!({
                    "error": "payload_too_large",
                    "limit": self.config.max_payload_bytes,
                }),
            ));
        }

        replicator
            .webhook_validation()
            .validate(&integration, request)
            .into_result()?;

        let payloads = replicator.extract_payloads(&request.body)?;
        let mut diffs = Vec::with_capacity(payloads.len());
        for payload in &payloads {
            diffs.push(self.engine.upsert(replicator.as_ref(), payload).await?);
        }

        let jobs = self
            .dependencies
            .refresh_dependents(replicator.as_ref(), &diffs)
            .await?;
        tracing::debug!(
            documents = diffs.len(),
            applied = diffs.iter().filter(|d| d.is_applied()).count(),
            dependent_jobs = jobs.len(),
            "webhook applied"
        );
        Ok(replicator.webhook_response(&diffs))
    }
}
