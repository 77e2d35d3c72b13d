//! Shared fixtures for the integration suites: an app state over the
//! in-memory engines and helpers for driving the router.

// Each integration binary uses a different subset of these helpers.
#![allow(dead_code)]

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use axum::Router;
use serde_json::Value;
use tower::ServiceExt;

use ragway_runtime::bulk::{ExportManager, JobStore};
use ragway_runtime::engines::mock::{MemoryVectorIndex, MockEmbedder, MockGenerator};
use ragway_runtime::engines::{Embedder, Generator};
use ragway_runtime::tools::{PolicyStore, ToolExecutor};
use ragway_runtime::{api, AppState, Settings};

pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub index: Arc<MemoryVectorIndex>,
}

pub struct TestAppBuilder {
    settings: Settings,
    generator: Arc<dyn Generator>,
    embedder: Arc<dyn Embedder>,
    policy_path: Option<std::path::PathBuf>,
}

impl Default for TestAppBuilder {
    fn default() -> Self {
        Self {
            settings: Settings::default(),
            generator: Arc::new(MockGenerator::new(vec!["你好", "，", "世界"])),
            embedder: Arc::new(MockEmbedder::new(4)),
            policy_path: None,
        }
    }
}

impl TestAppBuilder {
    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    pub fn generator(mut self, generator: Arc<dyn Generator>) -> Self {
        self.generator = generator;
        self
    }

    pub fn embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = embedder;
        self
    }

    pub fn policy_path(mut self, path: std::path::PathBuf) -> Self {
        self.policy_path = Some(path);
        self
    }

    pub fn build(self) -> TestApp {
        let index = MemoryVectorIndex::new();
        let jobs = Arc::new(JobStore::in_memory());
        let exports = ExportManager::new(
            jobs,
            self.settings.export_max_concurrency,
            self.settings.download_max_concurrency,
            self.settings.export_ttl,
        );
        let policy_path = self
            .policy_path
            .unwrap_or_else(|| self.settings.tools_policy_file.clone());
        let state = AppState {
            policies: Arc::new(PolicyStore::new(policy_path)),
            settings: Arc::new(self.settings),
            generator: self.generator,
            embedder: self.embedder,
            index: index.clone(),
            tools: Arc::new(ToolExecutor::new()),
            exports,
        };
        TestApp {
            router: api::build_router(state.clone()),
            state,
            index,
        }
    }
}

pub fn test_app() -> TestApp {
    TestAppBuilder::default().build()
}

pub fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("request builds")
}

pub fn get_request(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .expect("request builds")
}

pub async fn send(router: &Router, request: Request<Body>) -> Response {
    router.clone().oneshot(request).await.expect("router call")
}

pub async fn body_bytes(response: Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body collects")
        .to_vec()
}

pub async fn json_call(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = send(router, request).await;
    let status = response.status();
    let bytes = body_bytes(response).await;
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

/// Split an SSE body into its event payloads (the text after `data: `).
pub fn sse_events(raw: &[u8]) -> Vec<String> {
    let text = String::from_utf8_lossy(raw);
    text.split("\n\n")
        .filter_map(|frame| frame.strip_prefix("data: ").map(str::to_string))
        .collect()
}

/// Seed a collection with `count` points whose payload text is long enough
/// to pass the stream short-circuit threshold.
pub async fn seed_collection(app: &TestApp, name: &str, dim: u64, count: usize) {
    use ragway_runtime::engines::{DistanceKind, PointKey, PointRecord, VectorIndex};

    app.index.ensure(name, dim, DistanceKind::Cosine).await.unwrap();
    let points: Vec<PointRecord> = (0..count)
        .map(|i| PointRecord {
            id: PointKey::Num(i as u64),
            vector: Some((0..dim).map(|d| ((i + d as usize) % 7) as f32 + 0.5).collect()),
            payload: Some(serde_json::json!({
                "text": format!(
                    "document {i}: 检索增强生成需要足够长的上下文片段来支撑答案，\
                     这里填充一些说明文字以超过流式短路阈值。再补充一段背景描述，\
                     说明该文档覆盖的主题、适用范围以及引用来源，保证截断前的片段\
                     长度稳定超过短路判断所需的最小字符数。"
                ),
                "tag": if i % 2 == 0 { "even" } else { "odd" },
            })),
        })
        .collect();
    app.index.upsert(name, points).await.unwrap();
}
