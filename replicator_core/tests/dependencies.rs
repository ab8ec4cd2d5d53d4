#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use common::{COMMENTS, FakeSpec, Harness, PLAIN, TICKETS, registry};
use replicator_core::models::{BackfillStatus, ServiceIntegration};
use replicator_core::store::traits::IntegrationStore;
use replicator_core::Error;

async fn harness() -> Harness {
    Harness::new(registry(vec![
        FakeSpec::new(TICKETS).providing(COMMENTS),
        FakeSpec::new(COMMENTS).requiring(TICKETS),
        FakeSpec::new(PLAIN),
    ]))
    .await
}

async fn parent_with_credentials(h: &Harness) -> ServiceIntegration {
    let mut parent = ServiceIntegration::new(h.org.org_id, TICKETS, None).unwrap();
    parent.api_url = Some("https://tickets.example.com".to_string());
    parent.backfill_key = Some("key".to_string());
    parent.backfill_secret = Some("secret".to_string());
    h.integrations.insert_integration(&parent).await.unwrap();
    parent
}

#[tokio::test]
async fn building_dependents_is_idempotent() {
    let h = harness().await;
    let parent = parent_with_credentials(&h).await;
    let replicator = h.replicator(&parent);

    let first = h.dependencies.build_dependents(replicator.as_ref()).await.unwrap();
    assert_eq!(first.created.len(), 1);
    assert_eq!(first.jobs.len(), 1);
    assert!(first.existing.is_empty());

    let child = &first.created[0];
    assert_eq!(child.service_name, COMMENTS);
    assert_eq!(child.depends_on, Some(parent.id));
    assert_eq!(child.api_url, parent.api_url);
    assert_eq!(child.backfill_key, parent.backfill_key);
    assert_eq!(child.backfill_secret, parent.backfill_secret);

    let job = &first.jobs[0];
    assert_eq!(job.integration_id, child.id);
    assert!(job.incremental);
    assert_eq!(job.status, BackfillStatus::Pending);
    assert_eq!(h.scheduler.enqueued().await, vec![job.id]);

    let second = h.dependencies.build_dependents(replicator.as_ref()).await.unwrap();
    assert!(second.created.is_empty());
    assert!(second.jobs.is_empty());
    assert_eq!(second.existing, vec![COMMENTS.to_string()]);
    assert_eq!(h.integrations.list_dependents(parent.id).await.unwrap().len(), 1);
    assert_eq!(h.scheduler.enqueued().await.len(), 1);
}

#[tokio::test]
async fn services_without_dependents_build_nothing() {
    let h = harness().await;
    let plain = h.integration(PLAIN).await;
    let built = h
        .dependencies
        .build_dependents(h.replicator(&plain).as_ref())
        .await
        .unwrap();
    assert!(built.created.is_empty());
    assert!(h.scheduler.enqueued().await.is_empty());
}

#[tokio::test]
async fn dependent_lookup_requires_exactly_one_match() {
    let h = harness().await;
    let parent = h.integration(TICKETS).await;

    let err = h
        .dependencies
        .get_dependent_integration(parent.id, COMMENTS)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DependencyMissing(_)));

    let child = h.child_of(COMMENTS, &parent).await;
    let found = h
        .dependencies
        .get_dependent_integration(parent.id, COMMENTS)
        .await
        .unwrap();
    assert_eq!(found.id, child.id);

    h.child_of(COMMENTS, &parent).await;
    let err = h
        .dependencies
        .get_dependent_integration(parent.id, COMMENTS)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DependencyAmbiguous(_)));
    assert_eq!(err.http_status(), 412);
}

#[tokio::test]
async fn required_parent_must_exist_and_match() {
    let h = harness().await;

    let orphan = h.integration(COMMENTS).await;
    let err = h
        .dependencies
        .require_parent(h.replicator(&orphan).as_ref())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DependencyMissing(_)));

    let wrong_parent = h.integration(PLAIN).await;
    let misplaced = h.child_of(COMMENTS, &wrong_parent).await;
    let err = h
        .dependencies
        .require_parent(h.replicator(&misplaced).as_ref())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DependencyMissing(msg) if msg.contains("plain")));

    let parent = h.integration(TICKETS).await;
    let child = h.child_of(COMMENTS, &parent).await;
    let found = h
        .dependencies
        .require_parent(h.replicator(&child).as_ref())
        .await
        .unwrap();
    assert_eq!(found.map(|p| p.id), Some(parent.id));

    // Services without a declared parent pass trivially.
    let plain = h
        .dependencies
        .require_parent(h.replicator(&wrong_parent).as_ref())
        .await
        .unwrap();
    assert!(plain.is_none());
}
