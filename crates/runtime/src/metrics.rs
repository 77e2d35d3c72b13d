//! Prometheus metric families shared across the gateway.
//!
//! Registered once per process in the default registry. There is no scrape
//! endpoint here; the registry is observable from tests and embedders.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, GaugeVec,
    HistogramVec,
};

lazy_static! {
    // ------------------------------------------------------------------
    // HTTP surface
    // ------------------------------------------------------------------
    pub static ref HTTP_REQUESTS_TOTAL: CounterVec = register_counter_vec!(
        "http_requests_total",
        "Total HTTP requests",
        &["method", "path", "status"]
    )
    .unwrap();

    pub static ref HTTP_REQUEST_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "http_request_duration_seconds",
        "HTTP request latency in seconds",
        &["method", "path", "status"]
    )
    .unwrap();

    // ------------------------------------------------------------------
    // Tool gateway
    // ------------------------------------------------------------------
    pub static ref TOOLS_REQUESTS_TOTAL: CounterVec = register_counter_vec!(
        "tools_requests_total",
        "Total tool gateway requests",
        &["tool_type", "tool_name", "tenant"]
    )
    .unwrap();

    pub static ref TOOLS_ERRORS_TOTAL: CounterVec = register_counter_vec!(
        "tools_errors_total",
        "Total tool gateway errors",
        &["tool_type", "tool_name", "tenant", "reason"]
    )
    .unwrap();

    pub static ref TOOLS_RATE_LIMITED_TOTAL: CounterVec = register_counter_vec!(
        "tools_rate_limited_total",
        "Total requests rate-limited",
        &["tool_type", "tool_name", "tenant"]
    )
    .unwrap();

    pub static ref TOOLS_CIRCUIT_OPEN_TOTAL: CounterVec = register_counter_vec!(
        "tools_circuit_open_total",
        "Total requests blocked by circuit breaker",
        &["tool_type", "tool_name", "tenant"]
    )
    .unwrap();

    pub static ref TOOLS_CACHE_HIT_TOTAL: CounterVec = register_counter_vec!(
        "tools_cache_hit_total",
        "Total cache hits",
        &["tool_type", "tool_name", "tenant"]
    )
    .unwrap();

    pub static ref TOOLS_RETRIES_TOTAL: CounterVec = register_counter_vec!(
        "tools_retries_total",
        "Total retries executed",
        &["tool_type", "tool_name", "tenant"]
    )
    .unwrap();

    pub static ref TOOLS_REQUEST_LATENCY_SECONDS: HistogramVec = register_histogram_vec!(
        "tools_request_latency_seconds",
        "Tool request latency in seconds",
        &["tool_type", "tool_name", "tenant"]
    )
    .unwrap();

    // ------------------------------------------------------------------
    // Ask pipeline
    // ------------------------------------------------------------------
    pub static ref EMBED_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "embed_duration_seconds",
        "Time spent generating embeddings",
        &["model"]
    )
    .unwrap();

    pub static ref RAG_RETRIEVAL_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "rag_retrieval_duration_seconds",
        "Time spent retrieving top-k documents from the vector index",
        &["collection"]
    )
    .unwrap();

    pub static ref LLM_GENERATE_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "llm_generate_duration_seconds",
        "Time spent generating LLM responses",
        &["model", "stream"]
    )
    .unwrap();

    pub static ref RAG_MATCHES_TOTAL: CounterVec = register_counter_vec!(
        "rag_matches_total",
        "Number of RAG requests with/without matches",
        &["collection", "has_match"]
    )
    .unwrap();

    // ------------------------------------------------------------------
    // Bulk import
    // ------------------------------------------------------------------
    pub static ref IMPORT_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "import_duration_seconds",
        "Time spent importing vectors",
        &["collection"]
    )
    .unwrap();

    pub static ref IMPORT_ROWS_TOTAL: CounterVec = register_counter_vec!(
        "import_rows_total",
        "Number of rows imported (accepted)",
        &["collection"]
    )
    .unwrap();

    pub static ref IMPORT_BATCHES_TOTAL: CounterVec = register_counter_vec!(
        "import_batches_total",
        "Number of import batches executed",
        &["collection"]
    )
    .unwrap();

    pub static ref IMPORT_SKIPPED_TOTAL: CounterVec = register_counter_vec!(
        "import_skipped_total",
        "Number of rows skipped during import",
        &["collection", "reason"]
    )
    .unwrap();

    // ------------------------------------------------------------------
    // Background export
    // ------------------------------------------------------------------
    pub static ref EXPORT_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "export_duration_seconds",
        "Time spent exporting points to NDJSON",
        &["collection", "tenant"]
    )
    .unwrap();

    pub static ref EXPORT_ROWS_TOTAL: CounterVec = register_counter_vec!(
        "export_rows_total",
        "Number of rows exported",
        &["collection", "tenant"]
    )
    .unwrap();

    pub static ref EXPORT_STATUS_TOTAL: CounterVec = register_counter_vec!(
        "export_status_total",
        "Number of export tasks by final status",
        &["collection", "status", "tenant"]
    )
    .unwrap();

    pub static ref EXPORT_RUNNING: GaugeVec = register_gauge_vec!(
        "export_running",
        "Number of export tasks currently running",
        &["collection", "tenant"]
    )
    .unwrap();

    // ------------------------------------------------------------------
    // Direct download
    // ------------------------------------------------------------------
    pub static ref DOWNLOAD_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "download_duration_seconds",
        "Time spent streaming NDJSON or gzip downloads",
        &["collection", "gzip", "tenant"]
    )
    .unwrap();

    pub static ref DOWNLOAD_BYTES_TOTAL: CounterVec = register_counter_vec!(
        "download_bytes_total",
        "Total bytes streamed in download responses",
        &["collection", "gzip", "tenant"]
    )
    .unwrap();

    pub static ref DOWNLOAD_ROWS_TOTAL: CounterVec = register_counter_vec!(
        "download_rows_total",
        "Total rows streamed in download responses",
        &["collection", "tenant"]
    )
    .unwrap();

    pub static ref DOWNLOAD_RUNNING: GaugeVec = register_gauge_vec!(
        "download_running",
        "Number of concurrent download requests in progress",
        &["collection", "gzip", "tenant"]
    )
    .unwrap();
}
