//! Tool gateway handlers: guarded invocation and policy preview.

use axum::extract::State;
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ApiError;
use crate::state::{AppState, RequestCtx};
use crate::tools::PolicyLayers;

#[derive(Debug, Deserialize)]
pub struct ToolInvokeRequest {
    /// Explicit tenant wins over the resolved request tenant.
    #[serde(default)]
    pub tenant_id: Option<String>,
    pub tool_type: String,
    pub tool_name: String,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default)]
    pub options: Map<String, Value>,
}

#[derive(Debug, Serialize)]
pub struct ToolInvokeResponse {
    pub request_id: String,
    pub tool_type: String,
    pub tool_name: String,
    pub result: Value,
}

#[derive(Debug, Serialize)]
pub struct ToolPreviewResponse {
    pub tenant_id: String,
    pub tool_type: String,
    pub tool_name: String,
    pub merged_options: Map<String, Value>,
    pub layers: PolicyLayers,
}

fn effective_tenant(payload_tenant: Option<&str>, ctx: &RequestCtx) -> String {
    payload_tenant
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| ctx.tenant.clone())
}

pub async fn invoke(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestCtx>,
    Json(payload): Json<ToolInvokeRequest>,
) -> Result<Json<ToolInvokeResponse>, ApiError> {
    let tenant = effective_tenant(payload.tenant_id.as_deref(), &ctx);
    let merged =
        state
            .policies
            .merged_options(&tenant, &payload.tool_type, &payload.tool_name, &payload.options);
    let result = state
        .tools
        .execute(
            &tenant,
            &payload.tool_type,
            &payload.tool_name,
            &payload.params,
            &merged,
        )
        .await?;
    Ok(Json(ToolInvokeResponse {
        request_id: ctx.request_id,
        tool_type: payload.tool_type,
        tool_name: payload.tool_name,
        result,
    }))
}

/// Show the per-layer policy options and the merged result without invoking
/// anything.
pub async fn preview(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestCtx>,
    Json(payload): Json<ToolInvokeRequest>,
) -> Json<ToolPreviewResponse> {
    let tenant = effective_tenant(payload.tenant_id.as_deref(), &ctx);
    let layers =
        state
            .policies
            .layers(&tenant, &payload.tool_type, &payload.tool_name, &payload.options);
    Json(ToolPreviewResponse {
        tenant_id: tenant,
        tool_type: payload.tool_type,
        tool_name: payload.tool_name,
        merged_options: layers.merged.clone(),
        layers,
    })
}
