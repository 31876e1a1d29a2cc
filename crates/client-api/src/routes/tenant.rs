use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use http::StatusCode;

use crate::{log_and_500, AgentCtx};

pub async fn tenant<S: AgentCtx>(State(ctx): State<S>) -> axum::response::Result<impl IntoResponse> {
    match ctx.tenant().await.map_err(log_and_500)? {
        Some(tenant) => Ok(Json(tenant)),
        None => Err(StatusCode::NOT_FOUND.into()),
    }
}
