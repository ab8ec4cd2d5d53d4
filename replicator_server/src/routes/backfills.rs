use crate::error::ApiError;
use crate::routes::admin::require_admin;
use crate::routes::onboarding::resolve;
use crate::server::AppState;
use axum::Extension;
use axum::Json;
use axum::extract::Path;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use replicator_core::models::BackfillJobId;
use replicator_core::{BackfillJob, Error};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Default, Deserialize)]
pub struct RequestBackfill {
    #[serde(default)]
    pub incremental: bool,
}

#[tracing::instrument(level = "debug", skip_all)]
pub fn router() -> axum::Router {
    axum::Router::new()
        .route(
            "/integrations/{opaque_id}/backfills",
            get(list_backfills).post(request_backfill),
        )
        .route("/backfills/{job_id}", get(get_backfill))
        .route("/backfills/{job_id}/release", post(release_backfill))
}

#[tracing::instrument(level = "info", skip_all, fields(%opaque_id))]
pub async fn request_backfill(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Path(opaque_id): Path<String>,
    Json(req): Json<RequestBackfill>,
) -> Result<(StatusCode, Json<BackfillJob>), ApiError> {
    require_admin(&state, &headers)?;
    let integration = resolve(&state, &opaque_id).await?;
    let job = state.runner.request(integration.id, req.incremental).await?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

#[tracing::instrument(level = "debug", skip_all, fields(%opaque_id))]
pub async fn list_backfills(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Path(opaque_id): Path<String>,
) -> Result<Json<Vec<BackfillJob>>, ApiError> {
    require_admin(&state, &headers)?;
    let integration = resolve(&state, &opaque_id).await?;
    Ok(Json(
        state.integrations.list_backfill_jobs(integration.id).await?,
    ))
}

#[tracing::instrument(level = "debug", skip_all, fields(%job_id))]
pub async fn get_backfill(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Path(job_id): Path<BackfillJobId>,
) -> Result<Json<BackfillJob>, ApiError> {
    require_admin(&state, &headers)?;
    let job = state
        .integrations
        .get_backfill_job(job_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("backfill job {job_id} not found")))?;
    Ok(Json(job))
}

#[tracing::instrument(level = "info", skip_all, fields(%job_id))]
pub async fn release_backfill(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Path(job_id): Path<BackfillJobId>,
) -> Result<Json<BackfillJob>, ApiError> {
    require_admin(&state, &headers)?;
    Ok(Json(state.runner.release(job_id).await?))
}
