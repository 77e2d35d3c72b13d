//! External-engine adapters.
//!
//! Three capability traits front the engines the gateway composes: a text
//! generator (unary + token stream), a batch embedder, and a vector index.
//! Production implementations talk to Ollama-compatible and Qdrant endpoints;
//! [`mock`] provides in-memory implementations for tests.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod embedding;
pub mod generation;
pub mod mock;
pub mod vector_db;

pub use embedding::OllamaEmbedder;
pub use generation::OllamaGenerator;
pub use vector_db::{extract_vector_size, QdrantIndex};

/// Failures raised by engine adapters.
#[derive(Debug, Error, Clone)]
pub enum EngineError {
    #[error("engine request failed: {reason}")]
    Request { reason: String },

    #[error("engine returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("failed to decode engine response: {reason}")]
    Decode { reason: String },

    #[error("collection not found: {name}")]
    CollectionNotFound { name: String },

    #[error("invalid engine input: {reason}")]
    InvalidInput { reason: String },
}

impl EngineError {
    /// Short class name used in user-visible SSE error frames.
    pub fn class_name(&self) -> &'static str {
        match self {
            EngineError::Request { .. } => "RequestError",
            EngineError::Status { .. } => "UpstreamStatusError",
            EngineError::Decode { .. } => "DecodeError",
            EngineError::CollectionNotFound { .. } => "CollectionNotFound",
            EngineError::InvalidInput { .. } => "InvalidInput",
        }
    }
}

/// A finite, non-restartable stream of decoded token fragments.
/// Dropping the stream releases the underlying connection.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, EngineError>> + Send>>;

/// Dynamic generation options forwarded to the engine
/// (`num_predict`, `temperature`, `top_p`, `repeat_penalty`, `num_ctx`,
/// `stop`, `keep_alive`, ...).
pub type GenerateOptions = serde_json::Map<String, serde_json::Value>;

/// Result of a unary generation call.
#[derive(Debug, Clone)]
pub struct GenerateOutcome {
    /// Decoded completion text.
    pub response: String,
    /// Full engine response for callers that need more than the text.
    pub raw: serde_json::Value,
}

/// Unary and streaming text generation.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(
        &self,
        prompt: &str,
        model: Option<&str>,
        options: &GenerateOptions,
    ) -> Result<GenerateOutcome, EngineError>;

    /// Open a token stream. The returned stream ends on EOF or error and is
    /// not restartable.
    async fn generate_stream(
        &self,
        prompt: &str,
        model: Option<&str>,
        options: &GenerateOptions,
    ) -> Result<TokenStream, EngineError>;
}

/// Batched text embeddings; the result is row-aligned with the input and all
/// rows share one dimension.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, texts: &[String], model: Option<&str>)
        -> Result<Vec<Vec<f32>>, EngineError>;
}

/// Point identifier as the index exposes it: an unsigned integer or a string
/// (usually a UUID).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PointKey {
    Num(u64),
    Str(String),
}

impl std::fmt::Display for PointKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PointKey::Num(n) => write!(f, "{n}"),
            PointKey::Str(s) => write!(f, "{s}"),
        }
    }
}

/// One stored point, as read from or written to the index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointRecord {
    pub id: PointKey,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vector: Option<Vec<f32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

/// A scored retrieval hit.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredHit {
    pub id: PointKey,
    pub score: f32,
    pub payload: Option<serde_json::Value>,
}

/// Distance metrics accepted by `ensure`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistanceKind {
    Cosine,
    Euclid,
    Dot,
}

impl DistanceKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_uppercase().as_str() {
            "COSINE" => Some(DistanceKind::Cosine),
            "EUCLID" => Some(DistanceKind::Euclid),
            "DOT" => Some(DistanceKind::Dot),
            _ => None,
        }
    }
}

impl std::fmt::Display for DistanceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DistanceKind::Cosine => write!(f, "Cosine"),
            DistanceKind::Euclid => write!(f, "Euclid"),
            DistanceKind::Dot => write!(f, "Dot"),
        }
    }
}

/// Filter over payload fields: a flat JSON object where every entry becomes
/// an equality condition.
pub type PayloadFilter = serde_json::Map<String, serde_json::Value>;

/// Vector index operations used by the gateway.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn collection_exists(&self, name: &str) -> Result<bool, EngineError>;

    /// Collection description as a JSON document. The vector dimension is
    /// recovered from it via [`extract_vector_size`].
    async fn get_info(&self, name: &str) -> Result<serde_json::Value, EngineError>;

    /// Create the collection if missing; drop and recreate it when the stored
    /// vector size disagrees with `size`.
    async fn ensure(&self, name: &str, size: u64, distance: DistanceKind)
        -> Result<(), EngineError>;

    async fn list(&self) -> Result<Vec<String>, EngineError>;

    async fn drop_collection(&self, name: &str) -> Result<(), EngineError>;

    /// Delete all points, keeping the collection schema.
    async fn clear(&self, name: &str) -> Result<(), EngineError>;

    async fn upsert(&self, name: &str, points: Vec<PointRecord>) -> Result<(), EngineError>;

    async fn search(
        &self,
        name: &str,
        vector: Vec<f32>,
        top_k: u64,
        filters: Option<&PayloadFilter>,
    ) -> Result<Vec<ScoredHit>, EngineError>;

    /// Paginated full scan. Returns the page and the offset for the next one
    /// (`None` when exhausted).
    #[allow(clippy::too_many_arguments)]
    async fn scroll(
        &self,
        name: &str,
        limit: u64,
        offset: Option<PointKey>,
        with_vectors: bool,
        with_payload: bool,
        filters: Option<&PayloadFilter>,
    ) -> Result<(Vec<PointRecord>, Option<PointKey>), EngineError>;

    async fn delete_by_ids(&self, name: &str, ids: &[PointKey]) -> Result<u64, EngineError>;

    /// Delete matching points; the affected count comes from an exact count
    /// taken before the delete.
    async fn delete_by_filter(&self, name: &str, filters: &PayloadFilter)
        -> Result<u64, EngineError>;

    async fn count(
        &self,
        name: &str,
        filters: Option<&PayloadFilter>,
        exact: bool,
    ) -> Result<u64, EngineError>;

    async fn retrieve(
        &self,
        name: &str,
        ids: &[PointKey],
        with_vectors: bool,
        with_payload: bool,
    ) -> Result<Vec<PointRecord>, EngineError>;
}
