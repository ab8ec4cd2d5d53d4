use axum::Router;
use axum::routing::get;

pub mod admin;
pub mod backfills;
pub mod health;
pub mod onboarding;
pub mod webhooks;

#[tracing::instrument(level = "debug", skip_all)]
pub fn router() -> Router {
    Router::new()
        .route("/health", get(health::get_health))
        .merge(webhooks::router())
        .merge(onboarding::router())
        .merge(Router::new().nest(
            "/api/v1",
            Router::new()
                .merge(admin::router())
                .merge(backfills::router()),
        ))
}
