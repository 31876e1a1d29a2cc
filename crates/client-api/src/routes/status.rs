use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;

use crate::AgentCtx;

pub async fn status<S: AgentCtx>(State(ctx): State<S>) -> impl IntoResponse {
    Json(ctx.status())
}
