//! Ask pipeline behavior: unary answers, preflight soft-failure, and the SSE
//! stream state machine.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use serde_json::json;

use common::{
    body_bytes, get_request, json_call, json_request, seed_collection, send, sse_events, test_app,
    TestAppBuilder,
};
use ragway_runtime::engines::mock::{MockEmbedder, MockGenerator};
use ragway_runtime::engines::{DistanceKind, VectorIndex};

#[tokio::test]
async fn plain_ask_returns_answer_with_empty_sources() {
    let app = test_app();
    let (status, body) = json_call(
        &app.router,
        json_request(
            "POST",
            "/api/v1/ask",
            json!({"query": "你好", "use_rag": false}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["response"], "你好，世界");
    assert_eq!(body["sources"].as_array().unwrap().len(), 0);
    assert_eq!(body["meta"]["use_rag"], false);
    assert!(body["request_id"].is_string());
}

#[tokio::test]
async fn rag_ask_missing_collection_is_graceful() {
    let app = test_app();
    let (status, body) = json_call(
        &app.router,
        json_request(
            "POST",
            "/api/v1/ask",
            json!({"query": "问题", "use_rag": true, "collection": "absent"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["response"], "未在文档中找到相关信息");
    assert_eq!(body["meta"]["matches"], 0);
}

#[tokio::test]
async fn rag_ask_returns_sources_in_score_order() {
    let app = test_app();
    seed_collection(&app, "docs", 4, 6).await;

    let (status, body) = json_call(
        &app.router,
        json_request(
            "POST",
            "/api/v1/ask",
            json!({"query": "检索", "use_rag": true, "collection": "docs", "top_k": 3}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["meta"]["match"], true);
    let sources = body["sources"].as_array().unwrap();
    assert!(!sources.is_empty());
    assert!(sources[0]["payload"]["text"].is_string());
    assert!(sources[0]["score"].is_number());
}

#[tokio::test]
async fn preflight_soft_fails_on_embedding_error() {
    let app = TestAppBuilder::default()
        .embedder(Arc::new(MockEmbedder::failing()))
        .build();

    let (status, body) = json_call(
        &app.router,
        json_request("POST", "/api/v1/rag/preflight", json!({"query": "q"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], false);
    assert!(body["error"].as_str().unwrap().contains("preflight embed failed"));
    assert_eq!(body["contexts_count"], 0);
}

#[tokio::test]
async fn preflight_reports_context_stats() {
    let app = test_app();
    seed_collection(&app, "docs", 4, 4).await;

    let (status, body) = json_call(
        &app.router,
        json_request(
            "POST",
            "/api/v1/rag/preflight",
            json!({"query": "q", "collection": "docs"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
    assert!(body["contexts_count"].as_u64().unwrap() >= 1);
    assert!(body["ctx_total_len"].as_u64().unwrap() > 0);
    assert!(body["max_score"].is_number());
    assert!(body["avg_score"].is_number());
}

#[tokio::test]
async fn plain_stream_frames_start_data_done() {
    let app = test_app();
    let response = send(
        &app.router,
        json_request(
            "POST",
            "/api/v1/ask/stream",
            json!({
                "query": "你好",
                "use_rag": false,
                "options": {"num_predict": 8, "time_limit_ms": 4000, "max_tokens_streamed": 4},
            }),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/event-stream; charset=utf-8"
    );
    assert_eq!(response.headers().get("cache-control").unwrap(), "no-cache");
    assert_eq!(response.headers().get("x-accel-buffering").unwrap(), "no");
    assert!(response.headers().get("x-request-id").is_some());

    let events = sse_events(&body_bytes(response).await);
    assert_eq!(events.first().map(String::as_str), Some("[started]"));
    assert_eq!(events.last().map(String::as_str), Some("[done]"));
    let data: Vec<&String> = events
        .iter()
        .filter(|e| !e.starts_with('['))
        .collect();
    assert!(!data.is_empty(), "expected at least one data event: {events:?}");
}

#[tokio::test]
async fn stream_respects_max_tokens_budget() {
    let app = TestAppBuilder::default()
        .generator(Arc::new(MockGenerator::new(vec![
            "a", "b", "c", "d", "e", "f", "g", "h",
        ])))
        .build();

    let response = send(
        &app.router,
        json_request(
            "POST",
            "/api/v1/ask/stream",
            json!({"query": "q", "use_rag": false, "options": {"max_tokens_streamed": 3}}),
        ),
    )
    .await;
    let events = sse_events(&body_bytes(response).await);
    let data_count = events.iter().filter(|e| !e.starts_with('[')).count();
    assert_eq!(data_count, 3);
    assert_eq!(events.last().map(String::as_str), Some("[done]"));
}

#[tokio::test]
async fn slow_first_token_emits_heartbeats() {
    let app = TestAppBuilder::default()
        .generator(Arc::new(
            MockGenerator::new(vec!["late"]).with_first_chunk_delay(Duration::from_millis(300)),
        ))
        .build();

    let response = send(
        &app.router,
        json_request(
            "POST",
            "/api/v1/ask/stream",
            json!({"query": "q", "use_rag": false, "options": {"heartbeat_ms": 50}}),
        ),
    )
    .await;
    let events = sse_events(&body_bytes(response).await);
    let heartbeat_count = events.iter().filter(|e| *e == "[heartbeat]").count();
    assert!(heartbeat_count >= 2, "expected heartbeats while idle: {events:?}");
    assert!(events.iter().any(|e| e == "late"));
    assert_eq!(events.last().map(String::as_str), Some("[done]"));
}

#[tokio::test]
async fn rag_stream_answers_from_contexts() {
    let app = test_app();
    seed_collection(&app, "docs", 4, 4).await;

    let response = send(
        &app.router,
        json_request(
            "POST",
            "/api/v1/ask/stream",
            json!({"query": "检索", "use_rag": true, "collection": "docs"}),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let events = sse_events(&body_bytes(response).await);
    assert_eq!(events.first().map(String::as_str), Some("[started]"));
    assert_eq!(events.last().map(String::as_str), Some("[done]"));
    assert!(
        events.iter().any(|e| !e.starts_with('[')),
        "expected generated data events: {events:?}"
    );
    assert!(app.index.search_calls.load(Ordering::SeqCst) >= 1);
}

#[tokio::test]
async fn rag_stream_missing_collection_says_no_info() {
    let app = test_app();
    let response = send(
        &app.router,
        json_request(
            "POST",
            "/api/v1/ask/stream",
            json!({"query": "q", "use_rag": true, "collection": "absent"}),
        ),
    )
    .await;
    let events = sse_events(&body_bytes(response).await);
    assert_eq!(events.first().map(String::as_str), Some("[started]"));
    assert!(events.iter().any(|e| e == "未在文档中找到相关信息"));
    assert_eq!(events.last().map(String::as_str), Some("[done]"));
}

#[tokio::test]
async fn dimension_mismatch_skips_search_entirely() {
    // Collection expects 8-dimensional vectors; the embedder produces 4.
    let app = test_app();
    app.index.ensure("wide", 8, DistanceKind::Cosine).await.unwrap();

    let response = send(
        &app.router,
        json_request(
            "POST",
            "/api/v1/ask/stream",
            json!({"query": "q", "use_rag": true, "collection": "wide"}),
        ),
    )
    .await;
    let events = sse_events(&body_bytes(response).await);
    assert!(
        events.iter().any(|e| e.contains("向量维度不匹配")),
        "expected the dimension mismatch message: {events:?}"
    );
    assert_eq!(events.last().map(String::as_str), Some("[done]"));
    assert_eq!(
        app.index.search_calls.load(Ordering::SeqCst),
        0,
        "no search may run on dimension mismatch"
    );
}

#[tokio::test]
async fn stream_error_is_reported_then_done() {
    let app = TestAppBuilder::default()
        .generator(Arc::new(MockGenerator::new(vec!["ok", "boom"]).with_stream_failure()))
        .build();

    let response = send(
        &app.router,
        json_request(
            "POST",
            "/api/v1/ask/stream",
            json!({"query": "q", "use_rag": false}),
        ),
    )
    .await;
    let events = sse_events(&body_bytes(response).await);
    assert!(events.iter().any(|e| e.starts_with("[error]: ")));
    assert_eq!(events.last().map(String::as_str), Some("[done]"));
}

#[tokio::test]
async fn debug_stream_ticks_without_engines() {
    let app = test_app();
    let response = send(&app.router, get_request("/api/v1/debug/stream")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let events = sse_events(&body_bytes(response).await);
    assert_eq!(events.first().map(String::as_str), Some("[started]"));
    assert_eq!(events.last().map(String::as_str), Some("[done]"));
    assert_eq!(events.iter().filter(|e| e.starts_with("tick ")).count(), 10);
}

#[tokio::test]
async fn debug_warmup_reports_latency() {
    let app = test_app();
    let (status, body) = json_call(&app.router, get_request("/api/v1/debug/warmup")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
    assert!(body["latency_ms"].is_number());
}
