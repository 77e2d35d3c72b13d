//! HTTP tool transports (`http_get` / `http_post`) used by the guard stack.

use std::time::Duration;

use serde_json::{Map, Value};

use crate::error::ApiError;

/// Default per-call timeouts and response budget.
const GET_TIMEOUT_MS_DEFAULT: u64 = 2000;
const POST_TIMEOUT_MS_DEFAULT: u64 = 5000;
const RESP_MAX_CHARS_DEFAULT: u64 = 2048;

fn opt_u64(options: &Map<String, Value>, key: &str, default: u64) -> u64 {
    options.get(key).and_then(Value::as_u64).unwrap_or(default)
}

fn host_of(url: &str) -> Option<String> {
    url::Url::parse(url).ok()?.host_str().map(str::to_string)
}

fn string_list(value: Option<&Value>) -> Option<Vec<String>> {
    let items = value?.as_array()?;
    Some(
        items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
    )
}

/// Host allow/deny policy, applied before any guard state is touched.
pub fn check_host_policy(url: &str, options: &Map<String, Value>) -> Result<(), ApiError> {
    let Some(host) = host_of(url) else {
        return Err(ApiError::BadRequest("params.url has no host".to_string()));
    };
    if let Some(allow) = string_list(options.get("allow_hosts")) {
        if !allow.iter().any(|h| h == &host) {
            return Err(ApiError::Forbidden(format!(
                "host '{host}' not permitted by allow_hosts"
            )));
        }
    }
    if let Some(deny) = string_list(options.get("deny_hosts")) {
        if deny.iter().any(|h| h == &host) {
            return Err(ApiError::Forbidden(format!(
                "host '{host}' blocked by deny_hosts"
            )));
        }
    }
    Ok(())
}

/// Validate `http_get` inputs, returning the normalized form.
pub fn validate_http_get(
    params: &Map<String, Value>,
    options: &Map<String, Value>,
) -> Result<Map<String, Value>, ApiError> {
    let url = params
        .get("url")
        .and_then(Value::as_str)
        .filter(|u| u.starts_with("http://") || u.starts_with("https://"))
        .ok_or_else(|| ApiError::BadRequest("params.url must be http(s) URL".to_string()))?;
    let timeout_ms = opt_u64(options, "timeout_ms", GET_TIMEOUT_MS_DEFAULT);
    if !(1..=10_000).contains(&timeout_ms) {
        return Err(ApiError::BadRequest(
            "options.timeout_ms must be int in [1,10000]".to_string(),
        ));
    }
    check_host_policy(url, options)?;
    let mut normalized = Map::new();
    normalized.insert("url".to_string(), Value::String(url.to_string()));
    Ok(normalized)
}

/// Validate `http_post` inputs, returning the normalized form.
pub fn validate_http_post(
    params: &Map<String, Value>,
    options: &Map<String, Value>,
) -> Result<Map<String, Value>, ApiError> {
    let url = params
        .get("url")
        .and_then(Value::as_str)
        .filter(|u| u.starts_with("http://") || u.starts_with("https://"))
        .ok_or_else(|| ApiError::BadRequest("params.url must be http(s) URL".to_string()))?;
    let body = params.get("body");
    if let Some(body) = body {
        if !(body.is_object() || body.is_array() || body.is_string() || body.is_null()) {
            return Err(ApiError::BadRequest(
                "params.body must be object/array/string if provided".to_string(),
            ));
        }
    }
    let timeout_ms = opt_u64(options, "timeout_ms", POST_TIMEOUT_MS_DEFAULT);
    if !(1..=15_000).contains(&timeout_ms) {
        return Err(ApiError::BadRequest(
            "options.timeout_ms must be int in [1,15000]".to_string(),
        ));
    }
    check_host_policy(url, options)?;
    let mut normalized = Map::new();
    normalized.insert("url".to_string(), Value::String(url.to_string()));
    normalized.insert(
        "has_body".to_string(),
        Value::Bool(body.map(|b| !b.is_null()).unwrap_or(false)),
    );
    Ok(normalized)
}

fn header_map(params: &Map<String, Value>) -> Result<Vec<(String, String)>, String> {
    match params.get("headers") {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Object(map)) => Ok(map
            .iter()
            .map(|(k, v)| {
                let value = match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.clone(), value)
            })
            .collect()),
        Some(_) => Err("params.headers must be an object".to_string()),
    }
}

fn truncate_chars(body: String, max_chars: u64) -> String {
    if max_chars == 0 {
        return body;
    }
    let max = max_chars as usize;
    if body.chars().count() <= max {
        return body;
    }
    body.chars().take(max).collect()
}

fn shape_response(
    resp_status: u16,
    resp_url: String,
    body: String,
    message: &str,
    normalized: &Map<String, Value>,
) -> Value {
    serde_json::json!({
        "http": {
            "status_code": resp_status,
            "ok": (200..300).contains(&resp_status),
            "url": resp_url,
        },
        "message": message,
        "body": body,
        "normalized": normalized,
    })
}

/// Execute an `http_get` call. Errors are returned as plain text for the
/// guard stack's retry loop to classify.
pub async fn do_http_get(
    client: &reqwest::Client,
    params: &Map<String, Value>,
    options: &Map<String, Value>,
    normalized: &Map<String, Value>,
) -> Result<Value, String> {
    let url = params
        .get("url")
        .and_then(Value::as_str)
        .ok_or_else(|| "params.url missing".to_string())?;
    let headers = header_map(params)?;
    let timeout_ms = opt_u64(options, "timeout_ms", GET_TIMEOUT_MS_DEFAULT);
    let max_chars = opt_u64(options, "resp_max_chars", RESP_MAX_CHARS_DEFAULT);

    let mut request = client
        .get(url)
        .timeout(Duration::from_millis(timeout_ms));
    for (name, value) in headers {
        request = request.header(name, value);
    }
    let resp = request
        .send()
        .await
        .map_err(|e| format!("HttpError: {e}"))?;
    let status = resp.status().as_u16();
    let final_url = resp.url().to_string();
    let body = resp.text().await.unwrap_or_default();
    Ok(shape_response(
        status,
        final_url,
        truncate_chars(body, max_chars),
        "http_get executed",
        normalized,
    ))
}

/// Execute an `http_post` call with content-type-aware body handling.
pub async fn do_http_post(
    client: &reqwest::Client,
    params: &Map<String, Value>,
    options: &Map<String, Value>,
    normalized: &Map<String, Value>,
) -> Result<Value, String> {
    let url = params
        .get("url")
        .and_then(Value::as_str)
        .ok_or_else(|| "params.url missing".to_string())?;
    let headers = header_map(params)?;
    let timeout_ms = opt_u64(options, "timeout_ms", POST_TIMEOUT_MS_DEFAULT);
    let max_chars = opt_u64(options, "resp_max_chars", RESP_MAX_CHARS_DEFAULT);
    let content_type = options
        .get("content_type")
        .and_then(Value::as_str)
        .unwrap_or("application/json")
        .to_lowercase();
    let raw_body = params.get("body").cloned().unwrap_or(Value::Null);

    let mut request = client
        .post(url)
        .timeout(Duration::from_millis(timeout_ms));
    for (name, value) in headers {
        request = request.header(name, value);
    }

    let mut message = "http_post executed";
    if content_type == "application/json" {
        match &raw_body {
            Value::Object(_) | Value::Array(_) => {
                request = request.json(&raw_body);
            }
            Value::String(s) if !s.trim().is_empty() => {
                match serde_json::from_str::<Value>(s) {
                    Ok(parsed) => request = request.json(&parsed),
                    Err(_) => {
                        // Not valid JSON: forward the raw string with the
                        // declared content type.
                        message = "http_post executed (raw content)";
                        request = request
                            .header("Content-Type", "application/json")
                            .body(s.clone());
                    }
                }
            }
            // No body provided: send an empty request.
            _ => {}
        }
    } else {
        let data = match &raw_body {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        };
        request = request.header("Content-Type", content_type).body(data);
    }

    let resp = request
        .send()
        .await
        .map_err(|e| format!("HttpError: {e}"))?;
    let status = resp.status().as_u16();
    let final_url = resp.url().to_string();
    let body = resp.text().await.unwrap_or_default();
    Ok(shape_response(
        status,
        final_url,
        truncate_chars(body, max_chars),
        message,
        normalized,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn get_validation_rejects_bad_urls_and_timeouts() {
        let err = validate_http_get(&map(json!({"url": "ftp://x"})), &Map::new()).unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));

        let err = validate_http_get(
            &map(json!({"url": "https://x/"})),
            &map(json!({"timeout_ms": 0})),
        )
        .unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));

        let normalized =
            validate_http_get(&map(json!({"url": "https://x/"})), &Map::new()).unwrap();
        assert_eq!(normalized["url"], "https://x/");
    }

    #[test]
    fn post_validation_checks_body_type() {
        let err = validate_http_post(
            &map(json!({"url": "https://x/", "body": 12})),
            &Map::new(),
        )
        .unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));

        let normalized = validate_http_post(
            &map(json!({"url": "https://x/", "body": {"a": 1}})),
            &Map::new(),
        )
        .unwrap();
        assert_eq!(normalized["has_body"], true);
    }

    #[test]
    fn host_policy_enforces_allow_and_deny_lists() {
        let allow = map(json!({"allow_hosts": ["example.com"]}));
        assert!(check_host_policy("https://example.com/ok", &allow).is_ok());
        let err = check_host_policy("https://other.example/", &allow).unwrap_err();
        assert!(err.to_string().contains("allow_hosts"));

        let deny = map(json!({"deny_hosts": ["blocked.example"]}));
        let err = check_host_policy("https://blocked.example/path", &deny).unwrap_err();
        assert!(err.to_string().contains("deny_hosts"));
        assert!(check_host_policy("https://fine.example/", &deny).is_ok());
    }

    #[test]
    fn truncation_counts_characters() {
        assert_eq!(truncate_chars("abcdef".to_string(), 4), "abcd");
        assert_eq!(truncate_chars("abcdef".to_string(), 0), "abcdef");
        assert_eq!(truncate_chars("中文字符测试".to_string(), 3), "中文字");
    }
}
