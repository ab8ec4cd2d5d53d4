use crate::server::AppState;
use axum::Extension;
use axum::Json;
use axum::extract::{ConnectInfo, Path, Request};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use replicator_core::{WebhookRequest, WebhookResponse};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;

#[tracing::instrument(level = "debug", skip_all)]
pub fn router() -> axum::Router {
    axum::Router::new().route("/webhooks/{opaque_id}", post(receive_webhook))
}

#[tracing::instrument(level = "debug", skip_all, fields(%opaque_id))]
pub async fn receive_webhook(
    Extension(state): Extension<Arc<AppState>>,
    Path(opaque_id): Path<String>,
    request: Request,
) -> Response {
    let limit = state.webhook_config.max_payload_bytes;
    let remote_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let (parts, body) = request.into_parts();

    // Read one byte past the limit so oversize bodies reach the ingestor's 413.
    let body = match axum::body::to_bytes(body, limit.saturating_add(1)).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return into_response(WebhookResponse::new(
                413,
                json!({ "error": "payload_too_large", "limit": limit }),
            ));
        }
    };

    let mut inbound = WebhookRequest::new(parts.method.as_str(), parts.uri.path(), body);
    inbound.headers = parts.headers;
    inbound.remote_addr = remote_addr;

    into_response(state.ingestor.handle(&opaque_id, inbound).await)
}

fn into_response(response: WebhookResponse) -> Response {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(response.body)).into_response()
}
