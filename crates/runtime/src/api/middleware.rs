//! Request-context middleware.
//!
//! Assigns the request id, resolves the tenant (header plus optional bearer
//! claim), records HTTP metrics on every path, echoes `X-Request-Id`, and
//! injects `request_id` into non-streaming JSON object bodies. Streaming
//! responses pass through untouched.

use std::time::Instant;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderValue, Method};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde_json::Value;

use crate::config::Settings;
use crate::error::ApiError;
use crate::metrics;
use crate::state::{AppState, RequestCtx, ANONYMOUS_TENANT};

const BODY_PREVIEW_BYTES: usize = 500;

fn valid_tenant(raw: &str) -> bool {
    !raw.is_empty()
        && raw.len() <= 64
        && raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn decode_claims(
    token: &str,
    secret: &str,
    alg: &str,
) -> Result<Value, jsonwebtoken::errors::Error> {
    let algorithm = alg.parse().unwrap_or(jsonwebtoken::Algorithm::HS256);
    let mut validation = jsonwebtoken::Validation::new(algorithm);
    validation.required_spec_claims.clear();
    validation.validate_aud = false;
    let data = jsonwebtoken::decode::<Value>(
        token,
        &jsonwebtoken::DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )?;
    Ok(data.claims)
}

/// Resolve the request tenant per the configured header and optional JWT
/// claim. Invalid or missing values degrade to the anonymous label unless
/// strict modes are enabled.
pub fn resolve_tenant(settings: &Settings, headers: &HeaderMap) -> Result<String, ApiError> {
    let raw = headers
        .get(settings.header_tenant_key.as_str())
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .unwrap_or("");
    let mut tenant: Option<String> = (!raw.is_empty()).then(|| raw.to_string());

    if let Some(candidate) = &tenant {
        if !valid_tenant(candidate) {
            tracing::warn!(tenant = %candidate, "invalid_tenant_header");
            if settings.auth_require_tenant {
                return Err(ApiError::BadRequest("invalid tenant header".to_string()));
            }
            tenant = None;
        }
    } else if settings.auth_require_tenant {
        return Err(ApiError::BadRequest("tenant header required".to_string()));
    }

    if let Some(secret) = &settings.auth_jwt_secret {
        let bearer = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        if let Some(token) = bearer {
            match decode_claims(token, secret, &settings.auth_jwt_alg) {
                Ok(claims) => {
                    let claim_value = claims
                        .get(settings.auth_tenant_claim.as_str())
                        .and_then(Value::as_str)
                        .filter(|s| !s.is_empty());
                    if let Some(claim) = claim_value {
                        match &tenant {
                            None => tenant = Some(claim.to_string()),
                            Some(header_tenant) if header_tenant != claim => {
                                tracing::warn!(header = %header_tenant, claim = %claim, "tenant_mismatch");
                                if settings.auth_enforce_jwt_tenant {
                                    return Err(ApiError::Unauthorized(
                                        "tenant mismatch with token".to_string(),
                                    ));
                                }
                                // Lenient mode trusts the signed claim.
                                tenant = Some(claim.to_string());
                            }
                            Some(_) => {}
                        }
                    }
                }
                Err(e) => tracing::warn!(error = %e, "jwt_decode_failed"),
            }
        }
    }

    Ok(tenant.unwrap_or_else(|| ANONYMOUS_TENANT.to_string()))
}

pub async fn request_context(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started = Instant::now();

    let response = match resolve_tenant(&state.settings, request.headers()) {
        Ok(tenant) => {
            let ctx = RequestCtx {
                request_id: request_id.clone(),
                tenant,
            };
            request.extensions_mut().insert(ctx);
            next.run(request).await
        }
        Err(err) => err.into_response(),
    };

    finalize(&state, response, &request_id, &method, &path, started).await
}

/// Post-process one response: JSON body injection, preview logging, metrics,
/// and the `X-Request-Id` echo.
async fn finalize(
    state: &AppState,
    response: Response,
    request_id: &str,
    method: &Method,
    path: &str,
    started: Instant,
) -> Response {
    let status = response.status();
    let is_json = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.to_ascii_lowercase().starts_with("application/json"))
        .unwrap_or(false);

    let mut preview: Option<String> = None;
    let mut response = if is_json {
        // JSON bodies here are small by construction; buffering lets the
        // request id be injected and previews captured.
        let (mut parts, body) = response.into_parts();
        match axum::body::to_bytes(body, usize::MAX).await {
            Ok(bytes) => {
                let mut out = bytes;
                if let Ok(mut value) = serde_json::from_slice::<Value>(&out) {
                    if let Some(map) = value.as_object_mut() {
                        if !map.contains_key("request_id") {
                            map.insert(
                                "request_id".to_string(),
                                Value::String(request_id.to_string()),
                            );
                            if let Ok(rewritten) = serde_json::to_vec(&value) {
                                out = Bytes::from(rewritten);
                            }
                        }
                    }
                }
                let preview_len = out.len().min(BODY_PREVIEW_BYTES);
                preview = Some(String::from_utf8_lossy(&out[..preview_len]).to_string());
                parts.headers.remove(header::CONTENT_LENGTH);
                Response::from_parts(parts, Body::from(out))
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to buffer json response body");
                Response::from_parts(parts, Body::empty())
            }
        }
    } else {
        response
    };

    let duration = started.elapsed();
    let status_label = status.as_u16().to_string();
    metrics::HTTP_REQUESTS_TOTAL
        .with_label_values(&[method.as_str(), path, status_label.as_str()])
        .inc();
    metrics::HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&[method.as_str(), path, status_label.as_str()])
        .observe(duration.as_secs_f64());

    let sample_rate = state.settings.log_response_body_sample_rate;
    let sampled = sample_rate > 0.0 && rand::random::<f64>() < sample_rate;
    if status.is_client_error() || status.is_server_error() || sampled {
        tracing::info!(
            request_id = request_id,
            path = path,
            method = %method,
            status_code = status.as_u16(),
            duration_ms = duration.as_millis() as u64,
            resp_body_preview = preview.as_deref().unwrap_or(""),
            "request_done"
        );
    } else {
        tracing::info!(
            request_id = request_id,
            path = path,
            method = %method,
            status_code = status.as_u16(),
            duration_ms = duration.as_millis() as u64,
            "request_done"
        );
    }

    if let Ok(value) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> Settings {
        Settings::default()
    }

    fn headers_with(name: &str, value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
            HeaderValue::from_str(value).unwrap(),
        );
        headers
    }

    #[test]
    fn tenant_charset_is_enforced() {
        assert!(valid_tenant("tenant-a_1"));
        assert!(!valid_tenant(""));
        assert!(!valid_tenant("bad tenant"));
        assert!(!valid_tenant(&"x".repeat(65)));
    }

    #[test]
    fn missing_tenant_degrades_to_anonymous() {
        let resolved = resolve_tenant(&settings(), &HeaderMap::new()).unwrap();
        assert_eq!(resolved, ANONYMOUS_TENANT);
    }

    #[test]
    fn invalid_tenant_rejected_when_required() {
        let mut s = settings();
        s.auth_require_tenant = true;
        let err = resolve_tenant(&s, &headers_with("X-Tenant-Id", "bad tenant")).unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));
        let err = resolve_tenant(&s, &HeaderMap::new()).unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));
    }

    #[test]
    fn jwt_claim_fills_missing_tenant() {
        let mut s = settings();
        s.auth_jwt_secret = Some("secret".to_string());

        let claims = serde_json::json!({"tenant": "acme"});
        let token = jsonwebtoken::encode(
            &jsonwebtoken::Header::default(),
            &claims,
            &jsonwebtoken::EncodingKey::from_secret(b"secret"),
        )
        .unwrap();

        let headers = headers_with("Authorization", &format!("Bearer {token}"));
        assert_eq!(resolve_tenant(&s, &headers).unwrap(), "acme");
    }

    #[test]
    fn jwt_mismatch_behavior_depends_on_enforcement() {
        let mut s = settings();
        s.auth_jwt_secret = Some("secret".to_string());

        let claims = serde_json::json!({"tenant": "acme"});
        let token = jsonwebtoken::encode(
            &jsonwebtoken::Header::default(),
            &claims,
            &jsonwebtoken::EncodingKey::from_secret(b"secret"),
        )
        .unwrap();

        let mut headers = headers_with("Authorization", &format!("Bearer {token}"));
        headers.insert("x-tenant-id", HeaderValue::from_static("other"));

        // Lenient: the signed claim wins.
        assert_eq!(resolve_tenant(&s, &headers).unwrap(), "acme");

        s.auth_enforce_jwt_tenant = true;
        let err = resolve_tenant(&s, &headers).unwrap_err();
        assert!(matches!(err, ApiError::Unauthorized(_)));
    }

    #[test]
    fn undecodable_jwt_is_ignored() {
        let mut s = settings();
        s.auth_jwt_secret = Some("secret".to_string());
        let mut headers = headers_with("Authorization", "Bearer not-a-token");
        headers.insert("x-tenant-id", HeaderValue::from_static("acme"));
        assert_eq!(resolve_tenant(&s, &headers).unwrap(), "acme");
    }
}
