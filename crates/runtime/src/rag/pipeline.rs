//! Unary ask and retrieval preflight.

use std::time::Instant;

use serde_json::{json, Map, Value};

use super::prompt;
use super::{AskRequest, PreflightRequest};
use crate::error::ApiError;
use crate::metrics;
use crate::state::{AppState, RequestCtx};

/// Conservative generation defaults for fast, stable unary outputs.
pub(crate) fn apply_generate_defaults(options: &mut Map<String, Value>, num_predict_default: u64) {
    options
        .entry("num_predict".to_string())
        .or_insert(json!(num_predict_default));
    options.entry("temperature".to_string()).or_insert(json!(0.4));
    options.entry("top_p".to_string()).or_insert(json!(0.9));
    options
        .entry("repeat_penalty".to_string())
        .or_insert(json!(1.05));
}

/// Unary `/ask`: plain generation or embed → retrieve → generate.
pub async fn ask(state: &AppState, ctx: &RequestCtx, req: &AskRequest) -> Result<Value, ApiError> {
    if !req.use_rag {
        let mut options = req.options.clone().unwrap_or_default();
        apply_generate_defaults(&mut options, state.settings.default_num_predict);
        let model = req.model.as_deref().unwrap_or(&state.settings.ollama_model);

        let started = Instant::now();
        let outcome = state
            .generator
            .generate(&req.query, Some(model), &options)
            .await;
        metrics::LLM_GENERATE_DURATION_SECONDS
            .with_label_values(&[model, "false"])
            .observe(started.elapsed().as_secs_f64());
        let outcome = outcome
            .map_err(|e| ApiError::Internal(format!("plain generation failed: {e}")))?;

        return Ok(json!({
            "response": outcome.response,
            "sources": [],
            "meta": {
                "tenant": ctx.tenant,
                "request_id": ctx.request_id,
                "use_rag": false,
            },
        }));
    }

    let collection = req
        .collection
        .clone()
        .unwrap_or_else(|| state.settings.qdrant_collection.clone());
    let top_k = req.top_k.unwrap_or(state.settings.default_top_k);

    // Query embedding always uses the dedicated embed model so dimensions
    // match the indexed documents.
    let embed_model = state.settings.embed_model().to_string();
    let embed_started = Instant::now();
    let vectors = state
        .embedder
        .embed(std::slice::from_ref(&req.query), Some(&embed_model))
        .await
        .map_err(|e| ApiError::Internal(format!("failed to get query embedding: {e}")))?;
    metrics::EMBED_DURATION_SECONDS
        .with_label_values(&[embed_model.as_str()])
        .observe(embed_started.elapsed().as_secs_f64());
    let query_vector = vectors.into_iter().next().filter(|v| !v.is_empty());
    let Some(query_vector) = query_vector else {
        return Err(ApiError::Internal("failed to get query embedding".to_string()));
    };

    if !state
        .index
        .collection_exists(&collection)
        .await
        .map_err(ApiError::from)?
    {
        return Ok(json!({
            "response": prompt::NO_INFO_ANSWER,
            "sources": [],
            "meta": {
                "tenant": ctx.tenant,
                "request_id": ctx.request_id,
                "use_rag": true,
                "collection": collection,
                "matches": 0,
            },
        }));
    }

    let retrieval_started = Instant::now();
    let scored = state
        .index
        .search(&collection, query_vector, top_k, req.filters.as_ref())
        .await
        .map_err(|e| ApiError::Internal(format!("rag retrieval failed: {e}")))?;
    metrics::RAG_RETRIEVAL_DURATION_SECONDS
        .with_label_values(&[collection.as_str()])
        .observe(retrieval_started.elapsed().as_secs_f64());

    let bundle = prompt::prepare_contexts_default(&scored);
    if bundle.contexts.is_empty() {
        metrics::RAG_MATCHES_TOTAL
            .with_label_values(&[collection.as_str(), "false"])
            .inc();
        return Ok(json!({
            "response": prompt::NO_INFO_ANSWER,
            "sources": [],
            "meta": {
                "tenant": ctx.tenant,
                "request_id": ctx.request_id,
                "use_rag": true,
                "collection": collection,
                "top_k": top_k,
                "match": false,
            },
        }));
    }

    let llm_prompt = prompt::build_prompt(&req.query, &bundle.contexts);
    let mut options = req.options.clone().unwrap_or_default();
    apply_generate_defaults(&mut options, state.settings.default_num_predict);
    let model = req.model.as_deref().unwrap_or(&state.settings.ollama_model);

    let generate_started = Instant::now();
    let outcome = state.generator.generate(&llm_prompt, Some(model), &options).await;
    metrics::LLM_GENERATE_DURATION_SECONDS
        .with_label_values(&[model, "false"])
        .observe(generate_started.elapsed().as_secs_f64());
    let outcome =
        outcome.map_err(|e| ApiError::Internal(format!("rag generation failed: {e}")))?;

    let has_match = !scored.is_empty();
    metrics::RAG_MATCHES_TOTAL
        .with_label_values(&[collection.as_str(), if has_match { "true" } else { "false" }])
        .inc();

    Ok(json!({
        "response": outcome.response,
        "sources": bundle.sources,
        "meta": {
            "tenant": ctx.tenant,
            "request_id": ctx.request_id,
            "use_rag": true,
            "collection": collection,
            "top_k": top_k,
            "match": has_match,
        },
    }))
}

fn preflight_failure(
    error: String,
    collection: &str,
    ctx: &RequestCtx,
) -> Value {
    json!({
        "ok": false,
        "error": error,
        "contexts_count": 0,
        "ctx_total_len": 0,
        "max_score": Value::Null,
        "avg_score": Value::Null,
        "collection": collection,
        "meta": {"tenant": ctx.tenant, "request_id": ctx.request_id},
    })
}

/// Embedding + retrieval only. Dependency failures soft-fail (`ok=false`)
/// instead of erroring, so UIs can show hints without tripping alerting.
pub async fn preflight(state: &AppState, ctx: &RequestCtx, req: &PreflightRequest) -> Value {
    let collection = req
        .collection
        .clone()
        .unwrap_or_else(|| state.settings.qdrant_collection.clone());
    let top_k = req.top_k.unwrap_or(state.settings.default_top_k);

    let embed_model = state.settings.embed_model().to_string();
    let vectors = match state
        .embedder
        .embed(std::slice::from_ref(&req.query), Some(&embed_model))
        .await
    {
        Ok(vectors) => vectors,
        Err(e) => {
            return preflight_failure(format!("preflight embed failed: {e}"), &collection, ctx)
        }
    };
    let Some(query_vector) = vectors.into_iter().next().filter(|v| !v.is_empty()) else {
        return preflight_failure(
            "preflight embed returned empty vector".to_string(),
            &collection,
            ctx,
        );
    };

    match state.index.collection_exists(&collection).await {
        Ok(true) => {}
        Ok(false) => {
            return json!({
                "ok": true,
                "contexts_count": 0,
                "ctx_total_len": 0,
                "max_score": Value::Null,
                "avg_score": Value::Null,
                "collection": collection,
                "meta": {"tenant": ctx.tenant, "request_id": ctx.request_id},
            });
        }
        Err(e) => {
            return preflight_failure(format!("preflight retrieval failed: {e}"), &collection, ctx)
        }
    }

    let scored = match state
        .index
        .search(&collection, query_vector, top_k, req.filters.as_ref())
        .await
    {
        Ok(scored) => scored,
        Err(e) => {
            return preflight_failure(format!("preflight retrieval failed: {e}"), &collection, ctx)
        }
    };

    let bundle = prompt::prepare_contexts_default(&scored);
    let scores: Vec<f32> = scored.iter().map(|s| s.score).collect();
    let max_score = scores.iter().cloned().fold(None, |acc: Option<f32>, s| {
        Some(acc.map_or(s, |m| m.max(s)))
    });
    let avg_score = if scores.is_empty() {
        None
    } else {
        Some(scores.iter().sum::<f32>() / scores.len() as f32)
    };

    json!({
        "ok": true,
        "contexts_count": bundle.contexts.len(),
        "ctx_total_len": bundle.total_chars(),
        "max_score": max_score,
        "avg_score": avg_score,
        "collection": collection,
        "sources": bundle.sources,
        "meta": {"tenant": ctx.tenant, "request_id": ctx.request_id},
    })
}
