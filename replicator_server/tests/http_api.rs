//! End-to-end checks of the HTTP surface over in-memory stores.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode, header};
use replicator_core::config::{BackfillConfig, WebhookConfig};
use replicator_core::store::memory::{MemoryIntegrationStore, MemoryJobScheduler, MemoryRowStore};
use replicator_core::store::traits::SharedRowStore;
use replicator_core::ReplicatorRegistry;
use replicator_server::server::{AppState, router};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

struct Harness {
    router: axum::Router,
    rows: MemoryRowStore,
}

fn harness(admin_token: Option<&str>) -> Harness {
    let rows = MemoryRowStore::new();
    let mut registry = ReplicatorRegistry::new();
    replicator_integrations::register_all(&mut registry).unwrap();
    let state = AppState::new(
        Arc::new(MemoryIntegrationStore::new()),
        Arc::new(SharedRowStore(Arc::new(rows.clone()))),
        Arc::new(MemoryJobScheduler::new()),
        registry,
        WebhookConfig {
            max_payload_bytes: 512,
            public_base_url: "https://replicator.test".to_string(),
        },
        BackfillConfig::default(),
        CancellationToken::new(),
    )
    .with_admin_token(admin_token.map(str::to_string));
    Harness {
        router: router(state),
        rows,
    }
}

async fn send(
    router: &axum::Router,
    method: Method,
    uri: &str,
    headers: &[(&str, &str)],
    body: Option<String>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .expect("request"),
        None => builder.body(Body::empty()).expect("request"),
    };
    let response = router.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

/// Creates an org plus a shared-secret `generic_json` integration; returns (opaque_id, table).
async fn provision(router: &axum::Router) -> (String, String) {
    provision_with(router, &[]).await
}

async fn provision_with(router: &axum::Router, headers: &[(&str, &str)]) -> (String, String) {
    let (status, org) = send(
        router,
        Method::POST,
        "/api/v1/orgs",
        headers,
        Some(json!({"name": "acme"}).to_string()),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let org_id = org["org_id"].as_str().unwrap().to_string();

    let (status, created) = send(
        router,
        Method::POST,
        &format!("/api/v1/orgs/{org_id}/integrations"),
        headers,
        Some(
            json!({
                "service_name": "generic_json",
                "settings": {
                    "webhook_validation": "shared_secret",
                    "status_pointer": "/status",
                    "expired_statuses": ["deleted"],
                }
            })
            .to_string(),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let integration = &created["integration"];
    (
        integration["opaque_id"].as_str().unwrap().to_string(),
        integration["table_name"].as_str().unwrap().to_string(),
    )
}

#[tokio::test]
async fn onboarding_then_webhook_delivery() {
    let h = harness(None);
    let (opaque_id, table) = provision(&h.router).await;
    assert!(h.rows.table_exists(&table).await);

    let (status, step) = send(
        &h.router,
        Method::GET,
        &format!("/integrations/{opaque_id}/onboarding/webhook"),
        &[],
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(step["needs_input"], json!(true));
    assert_eq!(step["prompt_is_secret"], json!(true));
    assert_eq!(
        step["post_to_url"],
        json!(format!(
            "https://replicator.test/integrations/{opaque_id}/onboarding/webhook_secret"
        ))
    );

    let (status, step) = send(
        &h.router,
        Method::POST,
        &format!("/integrations/{opaque_id}/onboarding/webhook_secret"),
        &[],
        Some(json!({"value": "s3cret"}).to_string()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(step["complete"], json!(true));

    let doc = json!({"id": "a1", "updated_at": "2024-03-01T00:00:00Z", "status": "open"});
    let (status, body) = send(
        &h.router,
        Method::POST,
        &format!("/webhooks/{opaque_id}"),
        &[("x-webhook-secret", "s3cret")],
        Some(doc.to_string()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"ok": true}));

    let rows = h.rows.rows(&table).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].external_id, "a1");
}

#[tokio::test]
async fn webhook_rejections_are_reported() {
    let h = harness(None);
    let (opaque_id, table) = provision(&h.router).await;
    send(
        &h.router,
        Method::POST,
        &format!("/integrations/{opaque_id}/onboarding/webhook_secret"),
        &[],
        Some(json!({"value": "s3cret"}).to_string()),
    )
    .await;

    let doc = json!({"id": "a1", "updated_at": "2024-03-01T00:00:00Z"}).to_string();
    let (status, body) = send(
        &h.router,
        Method::POST,
        &format!("/webhooks/{opaque_id}"),
        &[("x-webhook-secret", "wrong")],
        Some(doc.clone()),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(
        body,
        json!({"error": "validation_rejected", "reason": "invalid_shared_secret"})
    );
    assert!(h.rows.rows(&table).await.is_empty());

    let (status, body) = send(
        &h.router,
        Method::POST,
        &format!("/webhooks/{opaque_id}"),
        &[("x-webhook-secret", "s3cret")],
        Some(format!("{{\"pad\":\"{}\"}}", "x".repeat(600))),
    )
    .await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(body["error"], json!("payload_too_large"));

    let (status, body) = send(
        &h.router,
        Method::POST,
        "/webhooks/does-not-exist",
        &[],
        Some(doc),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], json!("not_found"));
}

#[tokio::test]
async fn admin_routes_require_token_when_configured() {
    let h = harness(Some("letmein"));
    let body = json!({"name": "acme"}).to_string();

    let (status, _) = send(&h.router, Method::POST, "/api/v1/orgs", &[], Some(body.clone())).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(
        &h.router,
        Method::POST,
        "/api/v1/orgs",
        &[("authorization", "Bearer letmein")],
        Some(body),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
}

#[tokio::test]
async fn onboarding_requires_token_when_configured() {
    let h = harness(Some("letmein"));
    let auth = [("authorization", "Bearer letmein")];
    let (opaque_id, _) = provision_with(&h.router, &auth).await;
    let submit = format!("/integrations/{opaque_id}/onboarding/webhook_secret");
    let value = json!({"value": "s3cret"}).to_string();

    let (status, body) = send(&h.router, Method::POST, &submit, &[], Some(value.clone())).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], json!("unauthorized"));
    let (status, _) = send(
        &h.router,
        Method::GET,
        &format!("/integrations/{opaque_id}/onboarding/backfill"),
        &[],
        None,
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // The secret was not stored, so an attacker-chosen value cannot sign deliveries.
    let doc = json!({"id": "a1", "updated_at": "2024-03-01T00:00:00Z"}).to_string();
    let (status, body) = send(
        &h.router,
        Method::POST,
        &format!("/webhooks/{opaque_id}"),
        &[("x-webhook-secret", "s3cret")],
        Some(doc),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], json!("validation_rejected"));

    let (status, step) = send(&h.router, Method::POST, &submit, &auth, Some(value)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(step["complete"], json!(true));
}

#[tokio::test]
async fn health_lists_registered_services_and_echoes_request_id() {
    let h = harness(None);
    let request = Request::builder()
        .uri("/health")
        .header("x-request-id", "req-health")
        .body(Body::empty())
        .expect("request");
    let response = h.router.clone().oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("x-request-id")
            .and_then(|v| v.to_str().ok()),
        Some("req-health")
    );
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let body: Value = serde_json::from_slice(&bytes).expect("json");
    assert_eq!(body["services"], json!(["generic_json"]));
}

#[tokio::test]
async fn unknown_service_is_not_found() {
    let h = harness(None);
    let (_, org) = send(
        &h.router,
        Method::POST,
        "/api/v1/orgs",
        &[],
        Some(json!({"name": "acme"}).to_string()),
    )
    .await;
    let org_id = org["org_id"].as_str().unwrap();
    let (status, body) = send(
        &h.router,
        Method::POST,
        &format!("/api/v1/orgs/{org_id}/integrations"),
        &[],
        Some(json!({"service_name": "nope"}).to_string()),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], json!("not_found"));
}
