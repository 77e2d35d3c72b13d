//! Collection administration, bulk import/export, and download handlers.

use axum::body::Body;
use axum::extract::{Multipart, Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::Response;
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::bulk::export::inline_export;
use crate::bulk::import::{import_jsonl, maybe_gunzip, parse_filters_param, ImportOptions};
use crate::bulk::{DownloadParams, ExportParams, ImportRequest, JobStatus};
use crate::engines::{DistanceKind, PointKey, PointRecord};
use crate::error::ApiError;
use crate::state::{AppState, RequestCtx};

#[derive(Debug, Deserialize)]
pub struct EnsureRequest {
    pub name: String,
    pub vector_size: u64,
    #[serde(default)]
    pub distance: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DeletePointsByIdsRequest {
    pub collection: String,
    pub ids: Vec<PointKey>,
}

#[derive(Debug, Deserialize)]
pub struct DeletePointsByFilterRequest {
    pub collection: String,
    pub filters: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
pub struct UpsertTextsRequest {
    pub collection: String,
    pub texts: Vec<String>,
    #[serde(default)]
    pub metadatas: Option<Vec<Map<String, Value>>>,
    #[serde(default)]
    pub ids: Option<Vec<PointKey>>,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TaskQuery {
    pub task_id: String,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    pub collection: String,
    #[serde(default = "default_true")]
    pub with_vectors: bool,
    #[serde(default = "default_true")]
    pub with_payload: bool,
    /// Flat JSON object, e.g. `{"tag":"faq"}`.
    #[serde(default)]
    pub filters: Option<String>,
    #[serde(default)]
    pub gzip: bool,
    #[serde(default)]
    pub delay_ms_per_point: u64,
}

async fn require_collection(state: &AppState, name: &str) -> Result<(), ApiError> {
    if state
        .index
        .collection_exists(name)
        .await
        .map_err(ApiError::from)?
    {
        Ok(())
    } else {
        Err(ApiError::NotFound("collection not found".to_string()))
    }
}

pub async fn list(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let collections = state.index.list().await.map_err(ApiError::from)?;
    Ok(Json(json!({"collections": collections})))
}

pub async fn info(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    require_collection(&state, &name).await?;
    let info = state.index.get_info(&name).await.map_err(ApiError::from)?;
    Ok(Json(json!({"name": name, "info": info})))
}

pub async fn ensure(
    State(state): State<AppState>,
    Json(req): Json<EnsureRequest>,
) -> Result<Json<Value>, ApiError> {
    let raw = req.distance.as_deref().unwrap_or("COSINE");
    let distance = DistanceKind::parse(raw)
        .ok_or_else(|| ApiError::BadRequest(format!("invalid distance: {raw}")))?;
    state
        .index
        .ensure(&req.name, req.vector_size, distance)
        .await
        .map_err(ApiError::from)?;
    Ok(Json(json!({
        "name": req.name,
        "distance": distance.to_string(),
        "vector_size": req.vector_size,
    })))
}

pub async fn delete(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if !state
        .index
        .collection_exists(&name)
        .await
        .map_err(ApiError::from)?
    {
        // Idempotent delete.
        return Ok(Json(json!({"name": name, "deleted": false, "reason": "not found"})));
    }
    state.index.drop_collection(&name).await.map_err(ApiError::from)?;
    Ok(Json(json!({"name": name, "deleted": true})))
}

pub async fn clear(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    require_collection(&state, &name).await?;
    state.index.clear(&name).await.map_err(ApiError::from)?;
    Ok(Json(json!({"name": name, "cleared": true})))
}

pub async fn delete_points_by_ids(
    State(state): State<AppState>,
    Json(req): Json<DeletePointsByIdsRequest>,
) -> Result<Json<Value>, ApiError> {
    require_collection(&state, &req.collection).await?;
    if req.ids.is_empty() {
        return Err(ApiError::BadRequest("ids is required".to_string()));
    }
    let deleted = state
        .index
        .delete_by_ids(&req.collection, &req.ids)
        .await
        .map_err(ApiError::from)?;
    Ok(Json(json!({
        "collection": req.collection,
        "deleted_ids": req.ids,
        "deleted_count": deleted,
    })))
}

pub async fn delete_points_by_filter(
    State(state): State<AppState>,
    Json(req): Json<DeletePointsByFilterRequest>,
) -> Result<Json<Value>, ApiError> {
    require_collection(&state, &req.collection).await?;
    if req.filters.is_empty() {
        return Err(ApiError::BadRequest("filters is required".to_string()));
    }
    let deleted = state
        .index
        .delete_by_filter(&req.collection, &req.filters)
        .await
        .map_err(ApiError::from)?;
    Ok(Json(json!({
        "collection": req.collection,
        "filters": req.filters,
        "deleted": true,
        "deleted_count": deleted,
    })))
}

pub async fn upsert_texts(
    State(state): State<AppState>,
    Json(req): Json<UpsertTextsRequest>,
) -> Result<Json<Value>, ApiError> {
    require_collection(&state, &req.collection).await?;
    if req.texts.is_empty() {
        return Err(ApiError::BadRequest("texts is required".to_string()));
    }

    let model = req.model.as_deref().unwrap_or(state.settings.embed_model());
    let vectors = state
        .embedder
        .embed(&req.texts, Some(model))
        .await
        .map_err(|e| ApiError::Internal(format!("failed to embed texts: {e}")))?;
    if vectors.len() != req.texts.len() {
        return Err(ApiError::Internal("failed to embed texts".to_string()));
    }

    let metadatas = req.metadatas.unwrap_or_default();
    let points: Vec<PointRecord> = req
        .texts
        .iter()
        .zip(vectors.into_iter())
        .enumerate()
        .map(|(i, (text, vector))| {
            // Payload always carries the text; metadata fields layer on top.
            let mut payload = Map::new();
            payload.insert("text".to_string(), Value::String(text.clone()));
            if let Some(meta) = metadatas.get(i) {
                for (k, v) in meta {
                    payload.insert(k.clone(), v.clone());
                }
            }
            let id = req
                .ids
                .as_ref()
                .and_then(|ids| ids.get(i).cloned())
                .unwrap_or_else(|| PointKey::Str(uuid::Uuid::new_v4().to_string()));
            PointRecord {
                id,
                vector: Some(vector),
                payload: Some(Value::Object(payload)),
            }
        })
        .collect();
    let upserted = points.len();

    state
        .index
        .upsert(&req.collection, points)
        .await
        .map_err(ApiError::from)?;

    Ok(Json(json!({
        "collection": req.collection,
        "upserted": upserted,
        "ids": req.ids.unwrap_or_default(),
    })))
}

pub async fn import(
    State(state): State<AppState>,
    Json(req): Json<ImportRequest>,
) -> Result<Json<Value>, ApiError> {
    let options = ImportOptions::from(&req);
    import_jsonl(&state.index, &req.collection, &req.jsonl, &options)
        .await
        .map(Json)
}

/// Multipart NDJSON upload; gzip payloads are detected by magic header and
/// inflated before the regular import pipeline runs.
pub async fn import_file(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    let mut collection: Option<String> = None;
    let mut raw: Option<Vec<u8>> = None;
    let mut options = ImportOptions {
        continue_on_error: false,
        max_error_examples: 5,
        batch_size: 1000,
        on_conflict: "upsert".to_string(),
    };

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("invalid multipart body: {e}")))?
    {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "collection" => {
                collection = Some(field.text().await.map_err(|e| {
                    ApiError::BadRequest(format!("invalid collection field: {e}"))
                })?)
            }
            "file" => {
                raw = Some(
                    field
                        .bytes()
                        .await
                        .map_err(|e| ApiError::BadRequest(format!("invalid file field: {e}")))?
                        .to_vec(),
                )
            }
            "continue_on_error" => {
                let text = field.text().await.unwrap_or_default();
                options.continue_on_error =
                    matches!(text.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on");
            }
            "max_error_examples" => {
                if let Ok(n) = field.text().await.unwrap_or_default().trim().parse() {
                    options.max_error_examples = n;
                }
            }
            "batch_size" => {
                if let Ok(n) = field.text().await.unwrap_or_default().trim().parse() {
                    options.batch_size = n;
                }
            }
            "on_conflict" => {
                options.on_conflict = field.text().await.unwrap_or_default().trim().to_string();
            }
            _ => {}
        }
    }

    let collection =
        collection.ok_or_else(|| ApiError::BadRequest("collection is required".to_string()))?;
    let raw = raw.ok_or_else(|| ApiError::BadRequest("file is required".to_string()))?;
    if raw.is_empty() {
        return Err(ApiError::BadRequest("empty file".to_string()));
    }

    let inflated = maybe_gunzip(&raw)?;
    let text = String::from_utf8_lossy(&inflated).to_string();
    import_jsonl(&state.index, &collection, &text, &options)
        .await
        .map(Json)
}

/// Synchronous whole-collection export as one NDJSON body.
pub async fn export(
    State(state): State<AppState>,
    Json(req): Json<ExportParams>,
) -> Result<Response, ApiError> {
    require_collection(&state, &req.collection).await?;
    let body = inline_export(&state.index, &req).await?;
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .body(Body::from(body))
        .map_err(|e| ApiError::Internal(format!("failed to build export response: {e}")))
}

pub async fn export_start(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestCtx>,
    Json(req): Json<ExportParams>,
) -> Result<Json<Value>, ApiError> {
    require_collection(&state, &req.collection).await?;
    let task_id = state
        .exports
        .start(
            state.index.clone(),
            req,
            ctx.tenant.clone(),
            Some(ctx.request_id.clone()),
        )
        .await;
    Ok(Json(json!({"task_id": task_id, "status": "pending"})))
}

/// Job record without the spool path, which stays server-side.
pub async fn export_status(
    State(state): State<AppState>,
    Query(query): Query<TaskQuery>,
) -> Result<Json<Value>, ApiError> {
    let job = state
        .exports
        .jobs
        .load(&query.task_id)
        .await
        .ok_or_else(|| ApiError::NotFound("task not found".to_string()))?;
    let mut body = serde_json::to_value(&job)
        .map_err(|e| ApiError::Internal(format!("failed to serialize job: {e}")))?;
    if let Some(map) = body.as_object_mut() {
        map.remove("file_path");
        map.insert("task_id".to_string(), Value::String(query.task_id.clone()));
    }
    Ok(Json(body))
}

pub async fn export_cancel(
    State(state): State<AppState>,
    Query(query): Query<TaskQuery>,
) -> Result<Json<Value>, ApiError> {
    let mut job = state
        .exports
        .jobs
        .load(&query.task_id)
        .await
        .ok_or_else(|| ApiError::NotFound("task not found".to_string()))?;
    if job.status.is_terminal() {
        return Ok(Json(json!({
            "task_id": query.task_id,
            "status": job.status,
            "message": "task already finished",
        })));
    }
    job.cancelled = true;
    state.exports.jobs.save(&query.task_id, &job, None).await;
    tracing::info!(
        task_id = %query.task_id,
        collection = %job.params.collection,
        "export_cancel"
    );
    Ok(Json(json!({"task_id": query.task_id, "status": "cancelling"})))
}

pub async fn export_download_by_task(
    State(state): State<AppState>,
    Query(query): Query<TaskQuery>,
) -> Result<Response, ApiError> {
    let job = state
        .exports
        .jobs
        .load(&query.task_id)
        .await
        .ok_or_else(|| ApiError::NotFound("task not found".to_string()))?;
    if job.status != JobStatus::Succeeded {
        return Err(ApiError::BadRequest("task not finished".to_string()));
    }
    let path = job
        .file_path
        .as_ref()
        .filter(|p| std::path::Path::new(p).exists())
        .ok_or_else(|| ApiError::NotFound("file not found".to_string()))?;

    let file = tokio::fs::File::open(path)
        .await
        .map_err(|_| ApiError::NotFound("file not found".to_string()))?;
    let stream = tokio_util::io::ReaderStream::new(file);

    let (ext, media) = if job.params.with_gzip {
        (".jsonl.gz", "application/gzip")
    } else {
        (".jsonl", "application/x-ndjson")
    };
    let filename = format!("{}_export_{}{}", job.params.collection, query.task_id, ext);

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, media)
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{filename}\""),
        )
        .body(Body::from_stream(stream))
        .map_err(|e| ApiError::Internal(format!("failed to build download response: {e}")))
}

pub async fn export_download(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestCtx>,
    Query(query): Query<DownloadQuery>,
) -> Result<Response, ApiError> {
    require_collection(&state, &query.collection).await?;
    let filters = parse_filters_param(query.filters.as_deref())?;
    let params = DownloadParams {
        collection: query.collection,
        with_vectors: query.with_vectors,
        with_payload: query.with_payload,
        filters,
        gzip: query.gzip,
        delay_ms_per_point: query.delay_ms_per_point,
    };
    state
        .exports
        .stream_download(state.index.clone(), ctx.tenant.clone(), params)
}
