//! The streaming ask pipeline.
//!
//! One cooperative state machine per request, producing an SSE body:
//! `[started]` → embedding (heartbeats while pending) → dimension check →
//! retrieval (heartbeats) → short-circuit or first-token race → winner
//! streaming under the heartbeat/limit wrapper → `[done]` exactly once.
//! Reserved payloads: `[started]`, `[heartbeat]`, `[done]`,
//! `[error]: <class>: <msg>`.
//!
//! The whole pipeline runs in one spawned task feeding a bounded channel;
//! the client closing the response drops the receiver, which stops the task
//! and every engine stream it holds within a bounded time.

use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use futures::StreamExt;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

use super::pipeline::apply_generate_defaults;
use super::prompt;
use super::AskRequest;
use crate::engines::{extract_vector_size, EngineError, TokenStream};
use crate::state::{AppState, RequestCtx};

/// How long the first-token race waits before falling back to a fresh plain
/// stream.
const FIRST_TOKEN_RACE_TIMEOUT: Duration = Duration::from_secs(8);
/// Chunk budgets when the request does not set `max_tokens_streamed`.
const PLAIN_DEFAULT_MAX_TOKENS: usize = 12;
const RAG_DEFAULT_MAX_TOKENS: usize = 3;

/// The client closed the response; stop producing.
struct Closed;

struct Emitter {
    tx: mpsc::Sender<Result<Bytes, std::convert::Infallible>>,
}

impl Emitter {
    async fn event(&self, payload: &str) -> Result<(), Closed> {
        let frame = Bytes::from(format!("data: {payload}\n\n"));
        self.tx.send(Ok(frame)).await.map_err(|_| Closed)
    }

    async fn engine_error(&self, err: &EngineError) -> Result<(), Closed> {
        self.event(&format!("[error]: {}: {err}", err.class_name())).await
    }
}

/// Stream-level limits, stripped from the option map before it reaches the
/// engine.
struct StreamControls {
    time_limit: Option<Duration>,
    max_tokens: Option<usize>,
    heartbeat: Option<Duration>,
}

fn split_stream_controls(
    options: &mut Map<String, Value>,
    default_max_tokens: usize,
) -> StreamControls {
    let time_limit = options
        .remove("time_limit_ms")
        .and_then(|v| v.as_u64())
        .map(Duration::from_millis);
    let max_tokens = options
        .remove("max_tokens_streamed")
        .and_then(|v| v.as_u64())
        .map(|n| n as usize)
        .or(Some(default_max_tokens));
    let heartbeat = options
        .remove("heartbeat_ms")
        .and_then(|v| v.as_u64())
        .filter(|v| *v > 0)
        .map(Duration::from_millis);
    StreamControls {
        time_limit,
        max_tokens,
        heartbeat,
    }
}

fn clamp_num_predict(options: &mut Map<String, Value>, cap: u64) {
    let current = options.get("num_predict").and_then(Value::as_u64).unwrap_or(cap);
    options.insert("num_predict".to_string(), json!(current.min(cap)));
}

/// Pump a token stream into a bounded channel. Dropping the receiver (or
/// aborting the handle) stops the pump and drops the engine stream, which
/// releases its connection.
fn spawn_pump(stream: TokenStream) -> (mpsc::Receiver<Result<String, EngineError>>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel::<Result<String, EngineError>>(16);
    let handle = tokio::spawn(async move {
        let mut stream = stream;
        loop {
            tokio::select! {
                _ = tx.closed() => break,
                item = stream.next() => match item {
                    Some(item) => {
                        if tx.send(item).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    });
    (rx, handle)
}

/// Forward chunks as SSE data events, injecting `[heartbeat]` when idle and
/// enforcing the time/token limits after every data event and heartbeat.
/// `tokens` counts chunks already emitted by the caller (the race winner's
/// first chunk).
async fn forward_with_heartbeat(
    em: &Emitter,
    mut rx: mpsc::Receiver<Result<String, EngineError>>,
    controls: &StreamControls,
    mut tokens: usize,
) -> Result<(), Closed> {
    let started = Instant::now();
    let over_time = |controls: &StreamControls| {
        controls
            .time_limit
            .map(|limit| started.elapsed() >= limit)
            .unwrap_or(false)
    };

    loop {
        // Without a heartbeat the idle poll only serves the time limit.
        let poll = controls
            .heartbeat
            .or(controls.time_limit)
            .unwrap_or(Duration::from_secs(3600));
        match tokio::time::timeout(poll, rx.recv()).await {
            Err(_) => {
                if controls.heartbeat.is_some() {
                    em.event("[heartbeat]").await?;
                }
                if over_time(controls) {
                    break;
                }
            }
            Ok(Some(Ok(chunk))) => {
                if !chunk.is_empty() {
                    em.event(&chunk).await?;
                    tokens += 1;
                    if let Some(max) = controls.max_tokens {
                        if tokens >= max {
                            break;
                        }
                    }
                }
                if over_time(controls) {
                    break;
                }
            }
            Ok(Some(Err(err))) => {
                em.engine_error(&err).await?;
                break;
            }
            Ok(None) => break,
        }
    }
    Ok(())
}

/// Open a stream, forward it to completion, and make sure the pump dies.
async fn stream_and_forward(
    state: &AppState,
    em: &Emitter,
    prompt_text: &str,
    model: &str,
    options: &Map<String, Value>,
    controls: &StreamControls,
) -> Result<(), Closed> {
    match state.generator.generate_stream(prompt_text, Some(model), options).await {
        Ok(stream) => {
            let (rx, handle) = spawn_pump(stream);
            let result = forward_with_heartbeat(em, rx, controls, 0).await;
            handle.abort();
            result
        }
        Err(err) => em.engine_error(&err).await,
    }
}

/// Build the SSE response for `/ask/stream`.
pub fn ask_stream_response(state: AppState, ctx: RequestCtx, req: AskRequest) -> Response {
    let (tx, rx) = mpsc::channel::<Result<Bytes, std::convert::Infallible>>(32);
    let task_ctx = ctx.clone();
    tokio::spawn(async move {
        let em = Emitter { tx };
        // A Closed result means the client went away; nothing left to do.
        let _ = run(state, task_ctx, req, &em).await;
    });

    sse_response(&ctx, Body::from_stream(ReceiverStream::new(rx)))
}

fn sse_response(ctx: &RequestCtx, body: Body) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream; charset=utf-8")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .header("X-Accel-Buffering", "no")
        .header("x-request-id", ctx.request_id.clone())
        .header("x-tenant", ctx.tenant.clone())
        .body(body)
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

async fn run(state: AppState, _ctx: RequestCtx, req: AskRequest, em: &Emitter) -> Result<(), Closed> {
    // Immediate handshake so proxies flush headers before any slow work.
    em.event("[started]").await?;
    if req.use_rag {
        rag_flow(&state, &req, em).await?;
    } else {
        plain_flow(&state, &req, em).await?;
    }
    em.event("[done]").await
}

async fn plain_flow(state: &AppState, req: &AskRequest, em: &Emitter) -> Result<(), Closed> {
    let mut options = req.options.clone().unwrap_or_default();
    let controls = split_stream_controls(&mut options, PLAIN_DEFAULT_MAX_TOKENS);
    apply_generate_defaults(&mut options, state.settings.default_num_predict);
    options
        .entry("stop".to_string())
        .or_insert(json!(["\n\n["]));
    let model = req
        .model
        .clone()
        .unwrap_or_else(|| state.settings.ollama_model.clone());

    stream_and_forward(state, em, &req.query, &model, &options, &controls).await
}

async fn rag_flow(state: &AppState, req: &AskRequest, em: &Emitter) -> Result<(), Closed> {
    let collection = req
        .collection
        .clone()
        .unwrap_or_else(|| state.settings.qdrant_collection.clone());
    let top_k = req.top_k.unwrap_or(state.settings.default_top_k);

    let mut options = req.options.clone().unwrap_or_default();
    let controls = split_stream_controls(&mut options, RAG_DEFAULT_MAX_TOKENS);
    // Tight stream defaults favor a fast first token over long answers.
    options.entry("num_predict".to_string()).or_insert(json!(2));
    options.entry("temperature".to_string()).or_insert(json!(0.1));
    options.entry("top_p".to_string()).or_insert(json!(0.65));
    options
        .entry("repeat_penalty".to_string())
        .or_insert(json!(1.05));
    options.entry("num_ctx".to_string()).or_insert(json!(320));
    options
        .entry("stop".to_string())
        .or_insert(json!(["\n\n["]));

    let model = req
        .model
        .clone()
        .unwrap_or_else(|| state.settings.ollama_model.clone());

    // Embedding runs while heartbeats keep the stream alive. The dedicated
    // embed model keeps the query dimension aligned with the collection.
    let embed_model = state.settings.embed_model().to_string();
    let texts = [req.query.clone()];
    let embed_fut = state.embedder.embed(&texts, Some(&embed_model));
    tokio::pin!(embed_fut);
    let embed_result = loop {
        match controls.heartbeat {
            Some(interval) => tokio::select! {
                result = &mut embed_fut => break result,
                _ = tokio::time::sleep(interval) => em.event("[heartbeat]").await?,
            },
            None => break embed_fut.await,
        }
    };
    let query_vector = match embed_result {
        Ok(vectors) => vectors.into_iter().next().filter(|v| !v.is_empty()),
        Err(err) => {
            em.event(&format!("[error]: EmbeddingError: {err}")).await?;
            return Ok(());
        }
    };
    let Some(query_vector) = query_vector else {
        em.event("[error]: EmbeddingError: failed to get query embedding")
            .await?;
        return Ok(());
    };

    match state.index.collection_exists(&collection).await {
        Ok(true) => {}
        Ok(false) => {
            em.event(prompt::NO_INFO_ANSWER).await?;
            return Ok(());
        }
        Err(err) => {
            em.engine_error(&err).await?;
            return Ok(());
        }
    }

    // Dimension check before any search so a mismatched collection yields a
    // user-facing message instead of an engine 400.
    let expected = match state.index.get_info(&collection).await {
        Ok(info) => extract_vector_size(&info),
        Err(_) => 0,
    };
    if expected != 0 && expected != query_vector.len() as u64 {
        em.event(&prompt::dimension_mismatch_message(expected, query_vector.len()))
            .await?;
        return Ok(());
    }

    let search_fut = state
        .index
        .search(&collection, query_vector, top_k, req.filters.as_ref());
    tokio::pin!(search_fut);
    let search_result = loop {
        match controls.heartbeat {
            Some(interval) => tokio::select! {
                result = &mut search_fut => break result,
                _ = tokio::time::sleep(interval) => em.event("[heartbeat]").await?,
            },
            None => break search_fut.await,
        }
    };
    let scored = match search_result {
        Ok(scored) => scored,
        Err(err) => {
            em.event(&format!("[error]: VectorSearchError: {err}")).await?;
            return Ok(());
        }
    };

    let bundle = prompt::prepare_contexts_default(&scored);
    let ctx_total_len = bundle.total_chars();
    let llm_prompt = prompt::build_prompt(&req.query, &bundle.contexts);

    // Short-circuit: too little context to be worth a RAG prompt.
    if bundle.contexts.is_empty() || ctx_total_len < prompt::SHORT_CIRCUIT_MIN_CHARS {
        tracing::info!(
            reason = if bundle.contexts.is_empty() { "no_contexts" } else { "too_short" },
            ctx_total_len,
            "rag_short_circuit to_plain"
        );
        let mut plain_options = options.clone();
        clamp_num_predict(&mut plain_options, 3);
        return stream_and_forward(state, em, &req.query, &model, &plain_options, &controls).await;
    }

    // First-token race: RAG prompt vs the raw query, first chunk wins.
    let race_started = Instant::now();
    let mut plain_options = options.clone();
    clamp_num_predict(&mut plain_options, 4);
    let (rag_open, plain_open) = tokio::join!(
        state.generator.generate_stream(&llm_prompt, Some(&model), &options),
        state
            .generator
            .generate_stream(&req.query, Some(&model), &plain_options),
    );

    let (rag_stream, plain_stream) = match (rag_open, plain_open) {
        (Ok(rag), Ok(plain)) => (rag, plain),
        (Ok(rag), Err(_)) => {
            let (rx, handle) = spawn_pump(rag);
            let result = forward_with_heartbeat(em, rx, &controls, 0).await;
            handle.abort();
            return result;
        }
        (Err(_), Ok(plain)) => {
            let (rx, handle) = spawn_pump(plain);
            let result = forward_with_heartbeat(em, rx, &controls, 0).await;
            handle.abort();
            return result;
        }
        (Err(err), Err(_)) => {
            em.engine_error(&err).await?;
            return Ok(());
        }
    };

    enum First {
        Rag(Option<Result<String, EngineError>>),
        Plain(Option<Result<String, EngineError>>),
    }

    let (mut rag_rx, rag_handle) = spawn_pump(rag_stream);
    let (mut plain_rx, plain_handle) = spawn_pump(plain_stream);

    let first = tokio::time::timeout(FIRST_TOKEN_RACE_TIMEOUT, async {
        tokio::select! {
            item = rag_rx.recv() => First::Rag(item),
            item = plain_rx.recv() => First::Plain(item),
        }
    })
    .await;

    let first = match first {
        Err(_) => {
            // Neither side produced a token. Cancel both and run a fresh
            // short plain stream as the safety net.
            rag_handle.abort();
            plain_handle.abort();
            drop(rag_rx);
            drop(plain_rx);
            tracing::info!(
                elapsed_ms = race_started.elapsed().as_millis() as u64,
                fallback = "plain",
                "rag_race_no_first_token"
            );
            return stream_and_forward(state, em, &req.query, &model, &plain_options, &controls)
                .await;
        }
        Ok(first) => first,
    };

    let (winner, first_item, winner_rx, winner_handle) = match first {
        First::Rag(item) => {
            plain_handle.abort();
            drop(plain_rx);
            ("rag", item, rag_rx, rag_handle)
        }
        First::Plain(item) => {
            rag_handle.abort();
            drop(rag_rx);
            ("plain", item, plain_rx, plain_handle)
        }
    };
    tracing::info!(
        winner,
        elapsed_ms = race_started.elapsed().as_millis() as u64,
        "rag_race_winner"
    );

    let mut tokens = 0usize;
    match first_item {
        Some(Ok(chunk)) => {
            if !chunk.is_empty() {
                em.event(&chunk).await?;
                tokens = 1;
            }
        }
        Some(Err(err)) => {
            winner_handle.abort();
            em.engine_error(&err).await?;
            return Ok(());
        }
        // Immediate EOF: the wrapper below terminates right away.
        None => {}
    }

    let result = forward_with_heartbeat(em, winner_rx, &controls, tokens).await;
    winner_handle.abort();
    result
}

/// Engine-free SSE ticker for probing proxies and clients.
pub fn debug_stream_response(ctx: RequestCtx) -> Response {
    let (tx, rx) = mpsc::channel::<Result<Bytes, std::convert::Infallible>>(8);
    tokio::spawn(async move {
        let em = Emitter { tx };
        if em.event("[started]").await.is_err() {
            return;
        }
        for i in 1..=10 {
            if em.event(&format!("tick {i}")).await.is_err() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        let _ = em.event("[done]").await;
    });
    sse_response(&ctx, Body::from_stream(ReceiverStream::new(rx)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn controls_are_stripped_from_options() {
        let mut options = serde_json::json!({
            "time_limit_ms": 4000,
            "max_tokens_streamed": 4,
            "heartbeat_ms": 500,
            "num_predict": 8,
        })
        .as_object()
        .cloned()
        .unwrap();
        let controls = split_stream_controls(&mut options, 12);
        assert_eq!(controls.time_limit, Some(Duration::from_millis(4000)));
        assert_eq!(controls.max_tokens, Some(4));
        assert_eq!(controls.heartbeat, Some(Duration::from_millis(500)));
        assert!(options.contains_key("num_predict"));
        assert!(!options.contains_key("heartbeat_ms"));
    }

    #[test]
    fn controls_default_max_tokens_when_absent() {
        let mut options = Map::new();
        let controls = split_stream_controls(&mut options, 12);
        assert_eq!(controls.max_tokens, Some(12));
        assert_eq!(controls.time_limit, None);
        assert_eq!(controls.heartbeat, None);
    }

    #[test]
    fn num_predict_clamp_caps_but_keeps_small_values() {
        let mut options = serde_json::json!({"num_predict": 9}).as_object().cloned().unwrap();
        clamp_num_predict(&mut options, 4);
        assert_eq!(options["num_predict"], 4);

        let mut options = serde_json::json!({"num_predict": 2}).as_object().cloned().unwrap();
        clamp_num_predict(&mut options, 4);
        assert_eq!(options["num_predict"], 2);

        let mut options = Map::new();
        clamp_num_predict(&mut options, 3);
        assert_eq!(options["num_predict"], 3);
    }
}
