//! The tool guard stack.
//!
//! Wraps every tool invocation behind a fixed sequence keyed by a stable
//! fingerprint: validate → request metric → rate limit → breaker precheck →
//! cache → single-flight → bounded retry. All guard state is process-local
//! and resets on restart.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::error::ApiError;
use crate::metrics;
use crate::tools::http;
use crate::tools::masking::mask_json;

const RATE_DEFAULT_PER_SEC: u64 = 5;
const CIRCUIT_THRESHOLD_DEFAULT: u64 = 3;
const CIRCUIT_COOLDOWN_MS_DEFAULT: u64 = 5000;
/// Breaker never opens for less than this, so a tiny cooldown still blocks
/// the immediately following call.
const CIRCUIT_COOLDOWN_FLOOR: Duration = Duration::from_millis(100);
const RETRY_BACKOFF_MS_DEFAULT: u64 = 100;

#[derive(Clone, Copy, Default)]
struct BreakerState {
    failures: u64,
    open_until: Option<Instant>,
}

pub struct ToolExecutor {
    client: reqwest::Client,
    rate_buckets: DashMap<String, (u64, u64)>,
    breakers: DashMap<String, BreakerState>,
    cache: DashMap<String, (Instant, Value)>,
    single_flight: DashMap<String, Arc<Mutex<()>>>,
}

impl Default for ToolExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolExecutor {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            rate_buckets: DashMap::new(),
            breakers: DashMap::new(),
            cache: DashMap::new(),
            single_flight: DashMap::new(),
        }
    }

    /// Stable fingerprint over the normalized invocation. Canonical JSON
    /// (sorted keys, compact separators) keeps it insensitive to key order.
    fn stable_key(
        tenant: &str,
        tool_type: &str,
        tool_name: &str,
        params: &Map<String, Value>,
        normalized: &Map<String, Value>,
    ) -> String {
        let base = serde_json::json!({
            "params": params,
            "normalized": normalized,
        });
        // serde_json objects serialize with sorted keys and no whitespace.
        let blob = serde_json::to_string(&base).unwrap_or_default();
        let digest = hex::encode(Sha256::digest(blob.as_bytes()));
        format!(
            "{}:{}:{}:{}",
            tenant,
            tool_type.to_lowercase(),
            tool_name.to_lowercase(),
            digest
        )
    }

    fn validate(
        tool_type: &str,
        tool_name: &str,
        params: &Map<String, Value>,
        options: &Map<String, Value>,
    ) -> Result<Map<String, Value>, ApiError> {
        match tool_type.to_lowercase().as_str() {
            "http_get" => http::validate_http_get(params, options),
            "http_post" => http::validate_http_post(params, options),
            _ => {
                if tool_type.is_empty() || tool_name.is_empty() {
                    return Err(ApiError::BadRequest(
                        "tool_type/tool_name is required".to_string(),
                    ));
                }
                Ok(Map::new())
            }
        }
    }

    /// Post-increment rate check on the wall-second bucket. The bucket resets
    /// when the observed second changes; no smoothing across boundaries.
    fn rate_limit_check(&self, key: &str, options: &Map<String, Value>) -> Result<(), ApiError> {
        let limit = options
            .get("rate_limit_per_sec")
            .and_then(Value::as_u64)
            .filter(|v| *v > 0)
            .unwrap_or(RATE_DEFAULT_PER_SEC);
        let window = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        let mut entry = self.rate_buckets.entry(key.to_string()).or_insert((0, window));
        let (count, win) = *entry;
        let count = if win == window { count + 1 } else { 1 };
        *entry = (count, window);
        drop(entry);

        if count > limit {
            return Err(ApiError::RateLimited(
                "Too Many Requests (rate limited)".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns false while the breaker is open.
    fn breaker_is_closed(&self, key: &str) -> bool {
        match self.breakers.get(key) {
            Some(state) => match state.open_until {
                Some(until) => Instant::now() >= until,
                None => true,
            },
            None => true,
        }
    }

    fn breaker_mark(&self, key: &str, ok: bool, threshold: u64, cooldown_ms: u64) {
        let mut entry = self.breakers.entry(key.to_string()).or_default();
        if ok {
            *entry = BreakerState::default();
            return;
        }
        entry.failures += 1;
        if entry.failures >= threshold.max(1) {
            let cooldown = Duration::from_millis(cooldown_ms).max(CIRCUIT_COOLDOWN_FLOOR);
            entry.open_until = Some(Instant::now() + cooldown);
        } else {
            entry.open_until = None;
        }
    }

    fn cache_get(&self, key: &str) -> Option<Value> {
        let expired = match self.cache.get(key) {
            Some(entry) => {
                let (expire_at, value) = entry.value();
                if Instant::now() <= *expire_at {
                    return Some(value.clone());
                }
                true
            }
            None => false,
        };
        if expired {
            self.cache.remove(key);
        }
        None
    }

    fn cache_put(&self, key: &str, value: &Value, ttl_ms: u64) {
        if ttl_ms == 0 {
            return;
        }
        self.cache.insert(
            key.to_string(),
            (Instant::now() + Duration::from_millis(ttl_ms), value.clone()),
        );
    }

    fn single_flight_lock(&self, key: &str) -> Arc<Mutex<()>> {
        self.single_flight
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn invoke_transport(
        &self,
        tool_type: &str,
        params: &Map<String, Value>,
        options: &Map<String, Value>,
        normalized: &Map<String, Value>,
    ) -> Result<Value, String> {
        match tool_type.to_lowercase().as_str() {
            "http_get" => http::do_http_get(&self.client, params, options, normalized).await,
            "http_post" => http::do_http_post(&self.client, params, options, normalized).await,
            _ => Ok(serde_json::json!({
                "message": "tool invoked (validated)",
                "normalized": normalized,
            })),
        }
    }

    /// Run one guarded tool invocation.
    pub async fn execute(
        &self,
        tenant: &str,
        tool_type: &str,
        tool_name: &str,
        params: &Map<String, Value>,
        options: &Map<String, Value>,
    ) -> Result<Value, ApiError> {
        let normalized = Self::validate(tool_type, tool_name, params, options)?;

        let type_label = tool_type.to_lowercase();
        let name_label = tool_name.to_lowercase();
        let labels = [type_label.as_str(), name_label.as_str(), tenant];
        metrics::TOOLS_REQUESTS_TOTAL.with_label_values(&labels).inc();
        let start = Instant::now();
        let observe_latency = || {
            metrics::TOOLS_REQUEST_LATENCY_SECONDS
                .with_label_values(&labels)
                .observe(start.elapsed().as_secs_f64());
        };

        let key = Self::stable_key(tenant, tool_type, tool_name, params, &normalized);

        if let Err(err) = self.rate_limit_check(&key, options) {
            metrics::TOOLS_RATE_LIMITED_TOTAL.with_label_values(&labels).inc();
            observe_latency();
            return Err(err);
        }

        let threshold = options
            .get("circuit_threshold")
            .and_then(Value::as_u64)
            .unwrap_or(CIRCUIT_THRESHOLD_DEFAULT);
        let cooldown_ms = options
            .get("circuit_cooldown_ms")
            .and_then(Value::as_u64)
            .unwrap_or(CIRCUIT_COOLDOWN_MS_DEFAULT);
        if !self.breaker_is_closed(&key) {
            metrics::TOOLS_CIRCUIT_OPEN_TOTAL.with_label_values(&labels).inc();
            observe_latency();
            return Err(ApiError::ServiceUnavailable(
                "Service temporarily unavailable (circuit open)".to_string(),
            ));
        }

        let cache_ttl_ms = options.get("cache_ttl_ms").and_then(Value::as_u64).unwrap_or(0);
        if cache_ttl_ms > 0 {
            if let Some(mut cached) = self.cache_get(&key) {
                metrics::TOOLS_CACHE_HIT_TOTAL.with_label_values(&labels).inc();
                observe_latency();
                tracing::info!(key = %key, tenant = tenant, "cache_hit");
                if let Some(obj) = cached.as_object_mut() {
                    obj.insert("from_cache".to_string(), Value::Bool(true));
                }
                return Ok(cached);
            }
        }

        let lock = self.single_flight_lock(&key);
        let _guard = lock.lock().await;

        let masked_params = mask_json(&Value::Object(params.clone()));
        let masked_options = mask_json(&Value::Object(options.clone()));

        let retry_max = options.get("retry_max").and_then(Value::as_u64).unwrap_or(0);
        let backoff_ms = options
            .get("retry_backoff_ms")
            .and_then(Value::as_u64)
            .unwrap_or(RETRY_BACKOFF_MS_DEFAULT);
        let simulate_fail = options
            .get("simulate_fail")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let mut attempt: u64 = 0;
        loop {
            attempt += 1;
            let outcome = if simulate_fail {
                Err("RuntimeError: simulated failure".to_string())
            } else {
                self.invoke_transport(tool_type, params, options, &normalized).await
            };

            match outcome {
                Ok(mut result) => {
                    if cache_ttl_ms > 0 {
                        self.cache_put(&key, &result, cache_ttl_ms);
                    }
                    self.breaker_mark(&key, true, threshold, cooldown_ms);
                    observe_latency();
                    tracing::info!(tenant = tenant, tool_type = %type_label, tool_name = %name_label, attempt, "tool_success");
                    if let Some(obj) = result.as_object_mut() {
                        obj.insert("from_cache".to_string(), Value::Bool(false));
                        obj.insert("echo".to_string(), masked_params);
                        obj.insert("options".to_string(), masked_options);
                    }
                    return Ok(result);
                }
                Err(err_text) => {
                    if attempt > retry_max {
                        self.breaker_mark(&key, false, threshold, cooldown_ms);
                        metrics::TOOLS_ERRORS_TOTAL
                            .with_label_values(&[
                                type_label.as_str(),
                                name_label.as_str(),
                                tenant,
                                "exec_failure",
                            ])
                            .inc();
                        observe_latency();
                        tracing::warn!(tenant = tenant, tool_type = %type_label, tool_name = %name_label, attempt, error = %err_text, "tool_failure");
                        return Err(ApiError::Upstream(format!(
                            "tool execution failed: {err_text}"
                        )));
                    }
                    metrics::TOOLS_RETRIES_TOTAL.with_label_values(&labels).inc();
                    tracing::info!(tenant = tenant, tool_type = %type_label, tool_name = %name_label, attempt, error = %err_text, "tool_retry");
                    tokio::time::sleep(Duration::from_millis(backoff_ms * attempt)).await;
                }
            }
        }
    }
}
