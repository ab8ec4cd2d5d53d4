use crate::error::ApiError;
use crate::routes::admin::require_admin;
use crate::server::AppState;
use axum::Extension;
use axum::Json;
use axum::extract::Path;
use axum::http::HeaderMap;
use axum::routing::{get, post};
use replicator_core::models::ServiceIntegration;
use replicator_core::replicator::{
    OnboardingField, StateMachineStep, calculate_backfill_state_machine,
    calculate_webhook_state_machine, submit_value,
};
use replicator_core::Error;
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct SubmitValueRequest {
    pub value: String,
}

#[tracing::instrument(level = "debug", skip_all)]
pub fn router() -> axum::Router {
    axum::Router::new()
        .route(
            "/integrations/{opaque_id}/onboarding/webhook",
            get(webhook_step),
        )
        .route(
            "/integrations/{opaque_id}/onboarding/backfill",
            get(backfill_step),
        )
        .route(
            "/integrations/{opaque_id}/onboarding/{field}",
            post(submit_field),
        )
}

pub(crate) async fn resolve(state: &AppState, opaque_id: &str) -> Result<ServiceIntegration, ApiError> {
    state
        .integrations
        .get_integration_by_opaque_id(opaque_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("no integration for '{opaque_id}'")).into())
}

#[tracing::instrument(level = "debug", skip_all, fields(%opaque_id))]
pub async fn webhook_step(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Path(opaque_id): Path<String>,
) -> Result<Json<StateMachineStep>, ApiError> {
    require_admin(&state, &headers)?;
    let integration = resolve(&state, &opaque_id).await?;
    let replicator = state.registry.build(&integration)?;
    Ok(Json(calculate_webhook_state_machine(
        replicator.as_ref(),
        &state.webhook_config,
    )))
}

#[tracing::instrument(level = "debug", skip_all, fields(%opaque_id))]
pub async fn backfill_step(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Path(opaque_id): Path<String>,
) -> Result<Json<StateMachineStep>, ApiError> {
    require_admin(&state, &headers)?;
    let integration = resolve(&state, &opaque_id).await?;
    let replicator = state.registry.build(&integration)?;
    let step = calculate_backfill_state_machine(
        replicator.as_ref(),
        state.integrations.as_ref(),
        &state.webhook_config,
    )
    .await?;
    Ok(Json(step))
}

/// Store one value, then answer with whichever step that value belonged to.
#[tracing::instrument(level = "info", skip_all, fields(%opaque_id, %field))]
pub async fn submit_field(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Path((opaque_id, field)): Path<(String, String)>,
    Json(req): Json<SubmitValueRequest>,
) -> Result<Json<StateMachineStep>, ApiError> {
    require_admin(&state, &headers)?;
    let field = OnboardingField::parse_str(&field)
        .ok_or_else(|| ApiError::InvalidInput(format!("unknown onboarding field '{field}'")))?;
    let integration = resolve(&state, &opaque_id).await?;
    let updated = submit_value(state.integrations.as_ref(), integration.id, field, &req.value).await?;

    let replicator = state.registry.build(&updated)?;
    let step = match field {
        OnboardingField::WebhookSecret => {
            calculate_webhook_state_machine(replicator.as_ref(), &state.webhook_config)
        }
        OnboardingField::BackfillKey | OnboardingField::BackfillSecret => {
            calculate_backfill_state_machine(
                replicator.as_ref(),
                state.integrations.as_ref(),
                &state.webhook_config,
            )
            .await?
        }
        // The url feeds both flows; webhooks come first.
        OnboardingField::ApiUrl => {
            calculate_webhook_state_machine(replicator.as_ref(), &state.webhook_config)
        }
    };
    Ok(Json(step))
}
