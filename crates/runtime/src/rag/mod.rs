//! The ask pipeline: unary question answering, retrieval preflight, and the
//! SSE streaming state machine.

use serde::Deserialize;
use serde_json::{Map, Value};

pub mod pipeline;
pub mod prompt;
pub mod stream;

fn default_true() -> bool {
    true
}

/// Body accepted by `/ask` and `/ask/stream`.
#[derive(Debug, Clone, Deserialize)]
pub struct AskRequest {
    pub query: String,
    #[serde(default = "default_true")]
    pub use_rag: bool,
    #[serde(default)]
    pub top_k: Option<u64>,
    #[serde(default)]
    pub collection: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub options: Option<Map<String, Value>>,
    #[serde(default)]
    pub filters: Option<Map<String, Value>>,
}

/// Body accepted by `/rag/preflight`.
#[derive(Debug, Clone, Deserialize)]
pub struct PreflightRequest {
    pub query: String,
    #[serde(default)]
    pub top_k: Option<u64>,
    #[serde(default)]
    pub collection: Option<String>,
    #[serde(default)]
    pub filters: Option<Map<String, Value>>,
}
