use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::AgentCtx;

static VERSION: &str = env!("CARGO_PKG_VERSION");

pub async fn health<S: AgentCtx>(State(ctx): State<S>) -> impl IntoResponse {
    let db_ok = ctx.db_ok().await;
    let remote_ok = ctx.connectivity().is_connected;
    let status = if db_ok { "ok" } else { "degraded" };
    Json(json!({
        "status": status,
        "version": VERSION,
        "dbOk": db_ok,
        "remoteOk": remote_ok,
    }))
}
