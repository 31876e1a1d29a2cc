use axum::extract::State;
use axum::response::IntoResponse;

use crate::AgentCtx;

pub async fn metrics<S: AgentCtx>(State(ctx): State<S>) -> impl IntoResponse {
    let mut buf = String::new();
    if let Err(e) = prometheus::TextEncoder.encode_utf8(&ctx.gather_metrics(), &mut buf) {
        tracing::error!(error = %e, "could not encode metrics");
    }
    buf
}
