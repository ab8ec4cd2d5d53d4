use crate::routes;
use axum::Extension;
use axum::Router;
use replicator_core::config::{BackfillConfig, WebhookConfig};
use replicator_core::store::traits::{IntegrationStore, JobScheduler, RowStoreResolver};
use replicator_core::{
    BackfillRunner, DependencyGraph, Organizations, ReplicatorRegistry, UpsertEngine,
    WebhookIngestor,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub integrations: Arc<dyn IntegrationStore>,
    pub registry: Arc<ReplicatorRegistry>,
    pub engine: Arc<UpsertEngine>,
    pub dependencies: Arc<DependencyGraph>,
    pub ingestor: Arc<WebhookIngestor>,
    pub runner: Arc<BackfillRunner>,
    pub organizations: Arc<Organizations>,
    pub webhook_config: WebhookConfig,
    /// Required on admin routes when set.
    pub admin_token: Option<String>,
    pub started_at: Instant,
}

impl AppState {
    #[tracing::instrument(level = "debug", skip_all)]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        integrations: Arc<dyn IntegrationStore>,
        rows: Arc<dyn RowStoreResolver>,
        scheduler: Arc<dyn JobScheduler>,
        registry: ReplicatorRegistry,
        webhook_config: WebhookConfig,
        backfill_config: BackfillConfig,
        cancel: CancellationToken,
    ) -> Self {
        let registry = Arc::new(registry);
        let engine = Arc::new(UpsertEngine::new(rows));
        let dependencies = Arc::new(DependencyGraph::new(
            integrations.clone(),
            scheduler.clone(),
        ));
        let ingestor = Arc::new(
            WebhookIngestor::new(
                integrations.clone(),
                registry.clone(),
                engine.clone(),
                dependencies.clone(),
            )
            .with_config(webhook_config.clone()),
        );
        let runner = Arc::new(
            BackfillRunner::new(
                integrations.clone(),
                scheduler,
                registry.clone(),
                engine.clone(),
                dependencies.clone(),
            )
            .with_config(backfill_config)
            .with_cancellation(cancel),
        );
        let organizations = Arc::new(Organizations::new(integrations.clone(), engine.clone()));

        Self {
            integrations,
            registry,
            engine,
            dependencies,
            ingestor,
            runner,
            organizations,
            webhook_config,
            admin_token: None,
            started_at: Instant::now(),
        }
    }

    pub fn with_admin_token(mut self, token: Option<String>) -> Self {
        self.admin_token = token.map(|t| t.trim().to_string()).filter(|t| !t.is_empty());
        self
    }
}

#[tracing::instrument(level = "debug", skip_all)]
pub fn router(state: AppState) -> Router {
    let request_id = axum::http::HeaderName::from_static("x-request-id");

    Router::new()
        .merge(routes::router())
        .layer(Extension(Arc::new(state)))
        .layer(PropagateRequestIdLayer::new(request_id.clone()))
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::new(request_id, MakeRequestUuid))
}

/// Serve until `shutdown` fires, then drain in-flight requests.
#[tracing::instrument(level = "info", skip_all, fields(%addr))]
pub async fn serve(
    addr: SocketAddr,
    state: AppState,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("replicator listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await?;
    Ok(())
}
