//! Tenant and integration provisioning.

use crate::error::ApiError;
use crate::server::AppState;
use axum::Extension;
use axum::Json;
use axum::extract::Path;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{delete, get, post};
use replicator_core::models::{IntegrationId, OrgId, Organization, ServiceIntegration};
use replicator_core::{BackfillJob, Error};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use subtle::ConstantTimeEq;

#[derive(Debug, Deserialize)]
pub struct CreateOrgRequest {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateIntegrationRequest {
    pub service_name: String,
    #[serde(default)]
    pub settings: Option<serde_json::Value>,
    #[serde(default)]
    pub depends_on: Option<IntegrationId>,
}

#[derive(Debug, Serialize)]
pub struct CreateIntegrationResponse {
    pub integration: IntegrationView,
    /// Dependents created alongside the integration.
    pub dependents: Vec<IntegrationView>,
    pub backfill_jobs: Vec<BackfillJob>,
}

/// Integration without its secrets.
#[derive(Debug, Serialize)]
pub struct IntegrationView {
    pub id: IntegrationId,
    pub org_id: OrgId,
    pub service_name: String,
    pub opaque_id: String,
    pub table_name: String,
    pub webhook_url: String,
    pub depends_on: Option<IntegrationId>,
}

impl IntegrationView {
    fn new(integration: &ServiceIntegration, state: &AppState) -> Self {
        Self {
            id: integration.id,
            org_id: integration.org_id,
            service_name: integration.service_name.clone(),
            opaque_id: integration.opaque_id.clone(),
            table_name: integration.table_name(),
            webhook_url: state.webhook_config.webhook_url(&integration.opaque_id),
            depends_on: integration.depends_on,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RemoveOrgResponse {
    pub dropped_tables: Vec<String>,
}

#[tracing::instrument(level = "debug", skip_all)]
pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/orgs", post(create_org))
        .route("/orgs/{org_id}", delete(remove_org))
        .route(
            "/orgs/{org_id}/integrations",
            get(list_integrations).post(create_integration),
        )
}

pub(crate) fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = state.admin_token.as_deref() else {
        return Ok(());
    };
    let presented = headers
        .get("x-replicator-admin-token")
        .and_then(|v| v.to_str().ok())
        .or_else(|| {
            headers
                .get(axum::http::header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.strip_prefix("Bearer "))
        })
        .map(str::trim)
        .unwrap_or_default();
    if bool::from(presented.as_bytes().ct_eq(expected.as_bytes())) {
        Ok(())
    } else {
        Err(ApiError::Unauthorized)
    }
}

#[tracing::instrument(level = "info", skip_all)]
pub async fn create_org(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreateOrgRequest>,
) -> Result<(StatusCode, Json<Organization>), ApiError> {
    require_admin(&state, &headers)?;
    let org = state.organizations.create_organization(&req.name).await?;
    Ok((StatusCode::CREATED, Json(org)))
}

#[tracing::instrument(level = "info", skip_all, fields(%org_id))]
pub async fn remove_org(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Path(org_id): Path<OrgId>,
) -> Result<Json<RemoveOrgResponse>, ApiError> {
    require_admin(&state, &headers)?;
    let dropped_tables = state.organizations.remove_organization(org_id).await?;
    Ok(Json(RemoveOrgResponse { dropped_tables }))
}

#[tracing::instrument(level = "debug", skip_all, fields(%org_id))]
pub async fn list_integrations(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Path(org_id): Path<OrgId>,
) -> Result<Json<Vec<IntegrationView>>, ApiError> {
    require_admin(&state, &headers)?;
    let integrations = state.integrations.list_integrations(org_id).await?;
    Ok(Json(
        integrations
            .iter()
            .map(|i| IntegrationView::new(i, &state))
            .collect(),
    ))
}

/// Create an integration, its table, and any dependent integrations.
#[tracing::instrument(level = "info", skip_all, fields(%org_id))]
pub async fn create_integration(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Path(org_id): Path<OrgId>,
    Json(req): Json<CreateIntegrationRequest>,
) -> Result<(StatusCode, Json<CreateIntegrationResponse>), ApiError> {
    require_admin(&state, &headers)?;
    if state.integrations.get_organization(org_id).await?.is_none() {
        return Err(Error::NotFound(format!("organization {org_id} not found")).into());
    }
    if !state.registry.contains(&req.service_name) {
        return Err(Error::NotFound(format!("no replicator for '{}'", req.service_name)).into());
    }

    let mut integration = ServiceIntegration::new(org_id, req.service_name.as_str(), None)?;
    if let Some(settings) = req.settings {
        integration.settings = settings;
    }
    if let Some(parent) = req.depends_on {
        integration = integration.with_depends_on(parent);
    }

    // Build before persisting so bad settings never leave a half-created integration.
    let replicator = state.registry.build(&integration)?;
    state.dependencies.require_parent(replicator.as_ref()).await?;
    state.integrations.insert_integration(&integration).await?;
    state.engine.ensure_table(replicator.as_ref()).await?;

    let built = state.dependencies.build_dependents(replicator.as_ref()).await?;
    for child in &built.created {
        let child_replicator = state.registry.build(child)?;
        state.engine.ensure_table(child_replicator.as_ref()).await?;
    }

    Ok((
        StatusCode::CREATED,
        Json(CreateIntegrationResponse {
            integration: IntegrationView::new(&integration, &state),
            dependents: built
                .created
                .iter()
                .map(|i| IntegrationView::new(i, &state))
                .collect(),
            backfill_jobs: built.jobs,
        }),
    ))
}
