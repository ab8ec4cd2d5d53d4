#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use chrono::Duration;
use common::{COMMENTS, FakeSpec, Harness, PLAIN, TICKETS, doc, now, registry};
use http::HeaderValue;
use replicator_core::config::WebhookConfig;
use replicator_core::models::ServiceIntegration;
use replicator_core::store::traits::IntegrationStore;
use replicator_core::webhooks::{WebhookRequest, sign_request};
use serde_json::json;

const SECRET: &str = "whsec";

async fn harness() -> Harness {
    Harness::new(registry(vec![
        FakeSpec::new(TICKETS).providing(COMMENTS).refreshing(COMMENTS),
        FakeSpec::new(COMMENTS).requiring(TICKETS),
        FakeSpec::new(PLAIN).signed(),
    ]))
    .await
}

async fn signed_integration(h: &Harness) -> ServiceIntegration {
    let mut integration = ServiceIntegration::new(h.org.org_id, PLAIN, None).unwrap();
    integration.webhook_secret = Some(SECRET.to_string());
    h.integrations.insert_integration(&integration).await.unwrap();
    integration
}

fn delivery(integration: &ServiceIntegration, body: &str) -> WebhookRequest {
    WebhookRequest::new(
        "POST",
        format!("/webhooks/{}", integration.opaque_id),
        body.to_string(),
    )
}

fn signed(integration: &ServiceIntegration, body: &str, nonce: &str) -> WebhookRequest {
    let mut request = delivery(integration, body);
    let signature = sign_request(SECRET, "POST", &request.path, nonce, body.as_bytes()).unwrap();
    request
        .headers
        .insert("x-signature", HeaderValue::from_str(&signature).unwrap());
    request
        .headers
        .insert("x-nonce", HeaderValue::from_str(nonce).unwrap());
    request
}

#[tokio::test]
async fn signed_delivery_is_stored() {
    let h = harness().await;
    let integration = signed_integration(&h).await;
    let body = doc("t-1", now(), "open").to_string();

    let response = h
        .ingestor()
        .handle(&integration.opaque_id, signed(&integration, &body, "n-1"))
        .await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, json!({"ok": true}));

    let rows = h.rows.rows(&integration.table_name()).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].external_id, "t-1");
}

#[tokio::test]
async fn bad_signatures_are_rejected_with_a_reason() {
    let h = harness().await;
    let integration = signed_integration(&h).await;
    let body = doc("t-1", now(), "open").to_string();
    let ingestor = h.ingestor();

    let response = ingestor
        .handle(&integration.opaque_id, delivery(&integration, &body))
        .await;
    assert_eq!(response.status, 401);
    assert_eq!(
        response.body,
        json!({"error": "validation_rejected", "reason": "missing_signature"})
    );

    // Signed for a different body.
    let mut tampered = signed(&integration, "{}", "n-2");
    tampered.body = body.clone().into();
    let response = ingestor.handle(&integration.opaque_id, tampered).await;
    assert_eq!(response.status, 401);
    assert_eq!(response.body["reason"], json!("invalid_signature"));

    let mut no_nonce = signed(&integration, &body, "n-3");
    no_nonce.headers.remove("x-nonce");
    let response = ingestor.handle(&integration.opaque_id, no_nonce).await;
    assert_eq!(response.body["reason"], json!("missing_nonce"));

    assert!(h.rows.rows(&integration.table_name()).await.is_empty());
}

#[tokio::test]
async fn oversized_payloads_are_refused_before_validation() {
    let h = harness().await;
    let integration = signed_integration(&h).await;
    let ingestor = h.ingestor().with_config(WebhookConfig {
        max_payload_bytes: 64,
        ..WebhookConfig::default()
    });
    let body = json!({"id": "t-1", "updated_at": now().to_rfc3339(), "pad": "x".repeat(100)})
        .to_string();

    let response = ingestor
        .handle(&integration.opaque_id, delivery(&integration, &body))
        .await;
    assert_eq!(response.status, 413);
    assert_eq!(response.body["error"], json!("payload_too_large"));
    assert_eq!(response.body["limit"], json!(64));
}

#[tokio::test]
async fn unknown_opaque_id_is_not_found() {
    let h = harness().await;
    let response = h
        .ingestor()
        .handle("missing", WebhookRequest::new("POST", "/webhooks/missing", "{}"))
        .await;
    assert_eq!(response.status, 404);
    assert_eq!(response.body["error"], json!("not_found"));
}

#[tokio::test]
async fn malformed_documents_are_bad_requests() {
    let h = harness().await;
    let integration = h.integration(TICKETS).await;
    let ingestor = h.ingestor();

    let response = ingestor
        .handle(&integration.opaque_id, delivery(&integration, "not json"))
        .await;
    assert_eq!(response.status, 400);
    assert_eq!(response.body["error"], json!("invalid_input"));

    let response = ingestor
        .handle(&integration.opaque_id, delivery(&integration, r#"{"id": "t-1"}"#))
        .await;
    assert_eq!(response.status, 400);
}

#[tokio::test]
async fn older_delivery_does_not_overwrite_newer_row() {
    let h = harness().await;
    let integration = h.integration(TICKETS).await;
    let ingestor = h.ingestor();
    let newer = now();
    let older = newer - Duration::minutes(5);

    let first = doc("t-1", newer, "closed").to_string();
    let late = doc("t-1", older, "open").to_string();
    for body in [&first, &late] {
        let response = ingestor
            .handle(&integration.opaque_id, delivery(&integration, body))
            .await;
        assert_eq!(response.status, 200);
    }

    let rows = h.rows.rows(&integration.table_name()).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].last_modified, newer);
    assert_eq!(rows[0].data["status"], json!("closed"));
}

#[tokio::test]
async fn parent_delivery_refreshes_its_dependent() {
    let h = harness().await;
    let parent = h.integration(TICKETS).await;
    let built = h
        .dependencies
        .build_dependents(h.replicator(&parent).as_ref())
        .await
        .unwrap();
    let child = built.created[0].clone();
    let before = h.scheduler.enqueued().await.len();

    let ingestor = h.ingestor();
    let body = doc("t-1", now(), "open").to_string();
    let response = ingestor
        .handle(&parent.opaque_id, delivery(&parent, &body))
        .await;
    assert_eq!(response.status, 200);

    let enqueued = h.scheduler.enqueued().await;
    assert_eq!(enqueued.len(), before + 1);
    let job = h
        .integrations
        .get_backfill_job(enqueued[before])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.integration_id, child.id);
    assert!(job.incremental);

    // A replay changes nothing, so nothing is refreshed.
    ingestor
        .handle(&parent.opaque_id, delivery(&parent, &body))
        .await;
    assert_eq!(h.scheduler.enqueued().await.len(), before + 1);
}

#[tokio::test]
async fn refresh_without_a_dependent_fails_the_delivery() {
    let h = harness().await;
    let parent = h.integration(TICKETS).await;
    let body = doc("t-1", now(), "open").to_string();

    let response = h
        .ingestor()
        .handle(&parent.opaque_id, delivery(&parent, &body))
        .await;
    assert_eq!(response.status, 412);
    assert_eq!(response.body["error"], json!("dependency_missing"));
}

#[tokio::test]
async fn dependent_without_parent_is_a_precondition_failure() {
    let h = harness().await;
    let orphan = h.integration(COMMENTS).await;
    let body = doc("c-1", now(), "open").to_string();

    let response = h
        .ingestor()
        .handle(&orphan.opaque_id, delivery(&orphan, &body))
        .await;
    assert_eq!(response.status, 412);
    assert_eq!(response.body["error"], json!("dependency_missing"));
    assert!(h.rows.rows(&orphan.table_name()).await.is_empty());
}
