//! Shared application state and the per-request context.

use std::sync::Arc;

use crate::bulk::ExportManager;
use crate::config::Settings;
use crate::engines::{Embedder, Generator, VectorIndex};
use crate::tools::{PolicyStore, ToolExecutor};

/// Everything a route handler needs, cloneable per request.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub generator: Arc<dyn Generator>,
    pub embedder: Arc<dyn Embedder>,
    pub index: Arc<dyn VectorIndex>,
    pub tools: Arc<ToolExecutor>,
    pub policies: Arc<PolicyStore>,
    pub exports: Arc<ExportManager>,
}

/// Per-request identity, resolved by the context middleware and injected as
/// an extension.
#[derive(Debug, Clone)]
pub struct RequestCtx {
    pub request_id: String,
    pub tenant: String,
}

/// Reserved tenant label for requests without a resolvable tenant.
pub const ANONYMOUS_TENANT: &str = "_anon_";
