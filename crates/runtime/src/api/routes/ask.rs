//! Ask, preflight, and debug route handlers.

use std::time::Instant;

use axum::extract::State;
use axum::response::Response;
use axum::{Extension, Json};
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::rag::{pipeline, stream, AskRequest, PreflightRequest};
use crate::state::{AppState, RequestCtx};

pub async fn ask(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestCtx>,
    Json(req): Json<AskRequest>,
) -> Result<Json<Value>, ApiError> {
    pipeline::ask(&state, &ctx, &req).await.map(Json)
}

pub async fn ask_stream(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestCtx>,
    Json(req): Json<AskRequest>,
) -> Response {
    stream::ask_stream_response(state, ctx, req)
}

pub async fn preflight(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestCtx>,
    Json(req): Json<PreflightRequest>,
) -> Json<Value> {
    Json(pipeline::preflight(&state, &ctx, &req).await)
}

pub async fn debug_stream(Extension(ctx): Extension<RequestCtx>) -> Response {
    stream::debug_stream_response(ctx)
}

/// Short unary generation that warms the model; soft-fails so smoke checks
/// can observe latency even when the engine is down.
pub async fn debug_warmup(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestCtx>,
) -> Json<Value> {
    let mut options = serde_json::Map::new();
    options.insert("num_predict".to_string(), json!(8));
    let started = Instant::now();
    let result = state
        .generator
        .generate("warmup", Some(&state.settings.ollama_model), &options)
        .await;
    let latency_ms = (started.elapsed().as_secs_f64() * 100_000.0).round() / 100.0;
    let meta = json!({"tenant": ctx.tenant, "request_id": ctx.request_id});
    match result {
        Ok(_) => Json(json!({"ok": true, "latency_ms": latency_ms, "meta": meta})),
        Err(e) => Json(json!({
            "ok": false,
            "error": format!("{}: {e}", e.class_name()),
            "latency_ms": latency_ms,
            "meta": meta,
        })),
    }
}
