//! Router assembly and the HTTP listener.

use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use super::middleware::request_context;
use super::routes;
use crate::state::AppState;

/// Bulk import bodies can be large; everything else stays well below this.
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

/// Build the full gateway router with the request-context middleware and
/// tracing applied.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/ask", post(routes::ask::ask))
        .route("/api/v1/ask/stream", post(routes::ask::ask_stream))
        .route("/api/v1/rag/preflight", post(routes::ask::preflight))
        .route("/api/v1/debug/stream", get(routes::ask::debug_stream))
        .route("/api/v1/debug/warmup", get(routes::ask::debug_warmup))
        .route("/api/v1/tools/invoke", post(routes::tools::invoke))
        .route("/api/v1/tools/preview", post(routes::tools::preview))
        .route("/collections", get(routes::collections::list))
        .route("/collections/ensure", post(routes::collections::ensure))
        .route(
            "/collections/points/delete_by_ids",
            post(routes::collections::delete_points_by_ids),
        )
        .route(
            "/collections/points/delete_by_filter",
            post(routes::collections::delete_points_by_filter),
        )
        .route(
            "/collections/points/upsert_texts",
            post(routes::collections::upsert_texts),
        )
        .route("/collections/import", post(routes::collections::import))
        .route("/collections/import_file", post(routes::collections::import_file))
        .route("/collections/export", post(routes::collections::export))
        .route("/collections/export/start", post(routes::collections::export_start))
        .route("/collections/export/status", get(routes::collections::export_status))
        .route("/collections/export/task", delete(routes::collections::export_cancel))
        .route(
            "/collections/export/download_by_task",
            get(routes::collections::export_download_by_task),
        )
        .route(
            "/collections/export/download",
            get(routes::collections::export_download),
        )
        .route(
            "/collections/:name",
            get(routes::collections::info).delete(routes::collections::delete),
        )
        .route("/collections/:name/clear", post(routes::collections::clear))
        .layer(axum::middleware::from_fn_with_state(state.clone(), request_context))
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

/// Bind and serve until the process is stopped.
pub async fn serve(state: AppState) -> anyhow::Result<()> {
    state.exports.spawn_cleanup_loop();

    let addr = format!("0.0.0.0:{}", state.settings.api_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "gateway listening");

    let router = build_router(state);
    axum::serve(listener, router).await?;
    Ok(())
}
