//! Runtime configuration resolved from environment variables.
//!
//! Every knob has a default so the gateway can start with nothing but the
//! engine endpoints configured. The binary loads `.env` via dotenvy before
//! calling [`Settings::from_env`].

use std::path::PathBuf;
use std::time::Duration;

/// Gateway settings, resolved once at startup and shared behind an `Arc`.
#[derive(Debug, Clone)]
pub struct Settings {
    /// HTTP listen port.
    pub api_port: u16,

    /// Base URL of the generation/embedding engine (Ollama-compatible).
    pub ollama_url: String,
    /// Default generation model.
    pub ollama_model: String,
    /// Dedicated embedding model; falls back to the generation model.
    pub ollama_embed_model: Option<String>,
    /// Model keep-alive, threaded through to the engine as-is ("5m" or seconds).
    pub ollama_keep_alive: serde_json::Value,
    /// Overall timeout for unary generation calls.
    pub generate_timeout: Duration,
    /// Overall timeout for embedding calls.
    pub embed_timeout: Duration,

    /// Vector index endpoint.
    pub qdrant_url: String,
    /// Default collection for ask/RAG requests.
    pub qdrant_collection: String,

    /// Optional external job store. Absent means process-local jobs only.
    pub redis_url: Option<String>,

    /// Default top-k for retrieval.
    pub default_top_k: u64,
    /// Default `num_predict` for generation when the request omits it.
    pub default_num_predict: u64,

    /// Concurrent background exports allowed per process.
    pub export_max_concurrency: usize,
    /// Concurrent direct downloads allowed per process.
    pub download_max_concurrency: usize,
    /// Retention for terminal export jobs and their spool files.
    pub export_ttl: Duration,

    /// Header carrying the tenant id.
    pub header_tenant_key: String,
    /// Enables the bearer-claim tenant cross-check when set.
    pub auth_jwt_secret: Option<String>,
    pub auth_jwt_alg: String,
    /// Claim name holding the tenant in bearer tokens.
    pub auth_tenant_claim: String,
    /// Reject requests without a valid tenant header.
    pub auth_require_tenant: bool,
    /// Reject requests whose header tenant disagrees with the token claim.
    pub auth_enforce_jwt_tenant: bool,

    /// Probability of logging a response-body preview on success paths.
    pub log_response_body_sample_rate: f64,

    /// Layered tool policy file.
    pub tools_policy_file: PathBuf,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_port: 8000,
            ollama_url: "http://localhost:11434".to_string(),
            ollama_model: "qwen2.5:7b".to_string(),
            ollama_embed_model: None,
            ollama_keep_alive: serde_json::Value::String("5m".to_string()),
            generate_timeout: Duration::from_secs(300),
            embed_timeout: Duration::from_secs(120),
            qdrant_url: "http://localhost:6334".to_string(),
            qdrant_collection: "default_collection".to_string(),
            redis_url: None,
            default_top_k: 5,
            default_num_predict: 256,
            export_max_concurrency: 2,
            download_max_concurrency: 4,
            export_ttl: Duration::from_secs(3600),
            header_tenant_key: "X-Tenant-Id".to_string(),
            auth_jwt_secret: None,
            auth_jwt_alg: "HS256".to_string(),
            auth_tenant_claim: "tenant".to_string(),
            auth_require_tenant: false,
            auth_enforce_jwt_tenant: false,
            log_response_body_sample_rate: 0.0,
            tools_policy_file: PathBuf::from("configs/tools_policies.json"),
        }
    }
}

impl Settings {
    /// Resolve settings from the process environment.
    pub fn from_env() -> Self {
        let defaults = Settings::default();

        // Keep-alive may be a duration string ("5m") or a bare integer.
        let keep_alive = match env_opt("OLLAMA_KEEP_ALIVE") {
            Some(raw) => match raw.parse::<i64>() {
                Ok(n) => serde_json::Value::from(n),
                Err(_) => serde_json::Value::String(raw),
            },
            None => defaults.ollama_keep_alive.clone(),
        };

        Self {
            api_port: env_or("API_PORT", defaults.api_port),
            ollama_url: env_string("OLLAMA_URL", &defaults.ollama_url),
            ollama_model: env_string("OLLAMA_MODEL", &defaults.ollama_model),
            ollama_embed_model: env_opt("OLLAMA_EMBED_MODEL"),
            ollama_keep_alive: keep_alive,
            generate_timeout: Duration::from_secs_f64(env_or("GENERATE_TIMEOUT", 300.0)),
            embed_timeout: Duration::from_secs_f64(env_or("EMBED_TIMEOUT", 120.0)),
            qdrant_url: env_string("QDRANT_URL", &defaults.qdrant_url),
            qdrant_collection: env_string("QDRANT_COLLECTION", &defaults.qdrant_collection),
            redis_url: env_opt("REDIS_URL"),
            default_top_k: env_or("DEFAULT_TOP_K", defaults.default_top_k),
            default_num_predict: env_or("DEFAULT_NUM_PREDICT", defaults.default_num_predict),
            export_max_concurrency: env_or("EXPORT_MAX_CONCURRENCY", defaults.export_max_concurrency)
                .max(1),
            download_max_concurrency: env_or(
                "DOWNLOAD_MAX_CONCURRENCY",
                defaults.download_max_concurrency,
            )
            .max(1),
            export_ttl: Duration::from_secs(env_or("EXPORT_TTL_SECONDS", 3600u64)),
            header_tenant_key: env_string("HEADER_TENANT_KEY", &defaults.header_tenant_key),
            auth_jwt_secret: env_opt("AUTH_JWT_SECRET"),
            auth_jwt_alg: env_string("AUTH_JWT_ALG", &defaults.auth_jwt_alg),
            auth_tenant_claim: env_string("AUTH_TENANT_CLAIM", &defaults.auth_tenant_claim),
            auth_require_tenant: env_bool("AUTH_REQUIRE_TENANT", false),
            auth_enforce_jwt_tenant: env_bool("AUTH_ENFORCE_JWT_TENANT", false),
            log_response_body_sample_rate: env_or("LOG_RESPONSE_BODY_SAMPLE_RATE", 0.0),
            tools_policy_file: PathBuf::from(env_string(
                "TOOLS_POLICY_FILE",
                "configs/tools_policies.json",
            )),
        }
    }

    /// The model used for query embeddings; a dedicated embed model wins over
    /// the generation model so dimensions stay stable across model swaps.
    pub fn embed_model(&self) -> &str {
        self.ollama_embed_model
            .as_deref()
            .unwrap_or(&self.ollama_model)
    }
}
