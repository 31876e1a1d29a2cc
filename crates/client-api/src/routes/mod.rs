mod control;
mod health;
mod metrics;
mod status;
mod tenant;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::AgentCtx;

pub fn router<S: AgentCtx>(ctx: S) -> Router {
    Router::new()
        .route("/health", get(health::health::<S>))
        .route("/status", get(status::status::<S>))
        .route("/collect", post(control::collect::<S>))
        .route("/upload", post(control::upload::<S>))
        .route("/sync", post(control::sync::<S>))
        .route("/tenant", get(tenant::tenant::<S>))
        .route("/metrics", get(metrics::metrics::<S>))
        // The UI is a browser app served from its own origin.
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}
