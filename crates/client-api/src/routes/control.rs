//! Manual cycle triggers. A trigger enqueues the cycle and returns 202; a
//! cycle already in flight is 409, an upload without connectivity is 503.

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use http::StatusCode;
use metersync::supervisor::TriggerError;
use serde_json::json;

use crate::AgentCtx;

fn respond(cycle: &str, outcome: Result<(), TriggerError>) -> impl IntoResponse {
    match outcome {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(json!({ "status": "accepted", "cycle": cycle })),
        ),
        Err(TriggerError::AlreadyRunning(name)) => (
            StatusCode::CONFLICT,
            Json(json!({ "error": "CYCLE_ALREADY_RUNNING", "cycle": name })),
        ),
        Err(TriggerError::Disconnected) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "REMOTE_DISCONNECTED", "cycle": cycle })),
        ),
    }
}

pub async fn collect<S: AgentCtx>(State(ctx): State<S>) -> impl IntoResponse {
    respond("collection", ctx.trigger_collection())
}

pub async fn upload<S: AgentCtx>(State(ctx): State<S>) -> impl IntoResponse {
    respond("upload", ctx.trigger_upload())
}

pub async fn sync<S: AgentCtx>(State(ctx): State<S>) -> impl IntoResponse {
    respond("sync", ctx.trigger_sync())
}
