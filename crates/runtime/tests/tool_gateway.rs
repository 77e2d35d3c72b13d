//! Guard-stack behavior through the tool gateway surface: metrics
//! accounting, rate limiting, caching, circuit breaking, retries, masking,
//! host policy, and layered policy merging.

mod common;

use axum::http::StatusCode;
use serde_json::json;

use common::{json_call, json_request, test_app, TestAppBuilder};
use ragway_runtime::metrics;

fn unique_tenant(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::new_v4().simple())
}

#[tokio::test]
async fn invoke_validated_tool_and_count_request() {
    let app = test_app();
    let tenant = unique_tenant("t-count");

    let (status, body) = json_call(
        &app.router,
        json_request(
            "POST",
            "/api/v1/tools/invoke",
            json!({
                "tenant_id": tenant,
                "tool_type": "custom",
                "tool_name": "echo",
                "params": {"a": 1},
                "options": {},
            }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"]["message"], "tool invoked (validated)");
    assert_eq!(body["result"]["from_cache"], false);
    assert!(body["request_id"].is_string());
    assert_eq!(
        metrics::TOOLS_REQUESTS_TOTAL
            .with_label_values(&["custom", "echo", tenant.as_str()])
            .get(),
        1.0
    );
}

#[tokio::test]
async fn missing_tool_name_is_bad_request() {
    let app = test_app();
    let (status, body) = json_call(
        &app.router,
        json_request(
            "POST",
            "/api/v1/tools/invoke",
            json!({"tool_type": "custom", "tool_name": "", "params": {}, "options": {}}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "BadRequest");
    assert!(body["request_id"].is_string());
}

#[tokio::test]
async fn second_identical_call_hits_cache() {
    let app = test_app();
    let tenant = unique_tenant("t-cache");
    let request = || {
        json_request(
            "POST",
            "/api/v1/tools/invoke",
            json!({
                "tenant_id": tenant,
                "tool_type": "custom",
                "tool_name": "cache_demo",
                "params": {"q": "same"},
                "options": {"cache_ttl_ms": 60000},
            }),
        )
    };

    let (status, first) = json_call(&app.router, request()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["result"]["from_cache"], false);

    let (status, second) = json_call(&app.router, request()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["result"]["from_cache"], true);

    assert_eq!(
        metrics::TOOLS_CACHE_HIT_TOTAL
            .with_label_values(&["custom", "cache_demo", tenant.as_str()])
            .get(),
        1.0
    );
}

#[tokio::test]
async fn burst_over_rate_limit_yields_429() {
    let app = test_app();
    let tenant = unique_tenant("t-rate");

    let mut limited = 0;
    for _ in 0..5 {
        let (status, _) = json_call(
            &app.router,
            json_request(
                "POST",
                "/api/v1/tools/invoke",
                json!({
                    "tenant_id": tenant,
                    "tool_type": "custom",
                    "tool_name": "rl_demo",
                    "params": {"q": 1},
                    "options": {"rate_limit_per_sec": 1},
                }),
            ),
        )
        .await;
        if status == StatusCode::TOO_MANY_REQUESTS {
            limited += 1;
        }
    }
    assert!(limited >= 1, "at least one burst call must be rate limited");
    assert!(
        metrics::TOOLS_RATE_LIMITED_TOTAL
            .with_label_values(&["custom", "rl_demo", tenant.as_str()])
            .get()
            >= 1.0
    );
}

#[tokio::test]
async fn breaker_opens_after_failure_and_closes_after_cooldown() {
    let app = test_app();
    let tenant = unique_tenant("t-breaker");
    let request = |options: serde_json::Value| {
        json_request(
            "POST",
            "/api/v1/tools/invoke",
            json!({
                "tenant_id": tenant,
                "tool_type": "custom",
                "tool_name": "cb_demo",
                "params": {"q": 1},
                "options": options,
            }),
        )
    };
    let failing = json!({"simulate_fail": true, "retry_max": 0, "circuit_threshold": 1, "circuit_cooldown_ms": 1000});
    let passing = json!({"circuit_threshold": 1, "circuit_cooldown_ms": 1000});

    // Failure marks the breaker.
    let (status, body) = json_call(&app.router, request(failing)).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["error"], "Upstream");

    // Identical fingerprint, immediately after: blocked without invoking.
    let (status, body) = json_call(&app.router, request(passing.clone())).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "ServiceUnavailable");
    assert_eq!(
        metrics::TOOLS_CIRCUIT_OPEN_TOTAL
            .with_label_values(&["custom", "cb_demo", tenant.as_str()])
            .get(),
        1.0
    );

    // After the cooldown a success closes the breaker again.
    tokio::time::sleep(std::time::Duration::from_millis(1200)).await;
    let (status, body) = json_call(&app.router, request(passing.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"]["from_cache"], false);
    let (status, _) = json_call(&app.router, request(passing)).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn retries_are_counted_per_attempt() {
    let app = test_app();
    let tenant = unique_tenant("t-retry");

    let (status, _) = json_call(
        &app.router,
        json_request(
            "POST",
            "/api/v1/tools/invoke",
            json!({
                "tenant_id": tenant,
                "tool_type": "custom",
                "tool_name": "retry_demo",
                "params": {},
                "options": {"simulate_fail": true, "retry_max": 2, "retry_backoff_ms": 1},
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(
        metrics::TOOLS_RETRIES_TOTAL
            .with_label_values(&["custom", "retry_demo", tenant.as_str()])
            .get(),
        2.0
    );
    assert_eq!(
        metrics::TOOLS_ERRORS_TOTAL
            .with_label_values(&["custom", "retry_demo", tenant.as_str(), "exec_failure"])
            .get(),
        1.0
    );
}

#[tokio::test]
async fn sensitive_options_are_masked_in_echo() {
    let app = test_app();
    let (status, body) = json_call(
        &app.router,
        json_request(
            "POST",
            "/api/v1/tools/invoke",
            json!({
                "tenant_id": unique_tenant("t-mask"),
                "tool_type": "custom",
                "tool_name": "mask_demo",
                "params": {"token": "supersecretvalue", "plain": "visible"},
                "options": {"api_key": "abcd"},
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"]["echo"]["token"], "su***ue");
    assert_eq!(body["result"]["echo"]["plain"], "visible");
    assert_eq!(body["result"]["options"]["api_key"], "****");
}

#[tokio::test]
async fn host_policy_blocks_before_any_network_call() {
    let app = test_app();

    let (status, body) = json_call(
        &app.router,
        json_request(
            "POST",
            "/api/v1/tools/invoke",
            json!({
                "tenant_id": unique_tenant("t-allow"),
                "tool_type": "http_get",
                "tool_name": "simple",
                "params": {"url": "https://not-allowed.example/"},
                "options": {"allow_hosts": ["example.com"]},
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(body["detail"].as_str().unwrap().contains("allow_hosts"));

    let (status, body) = json_call(
        &app.router,
        json_request(
            "POST",
            "/api/v1/tools/invoke",
            json!({
                "tenant_id": unique_tenant("t-deny"),
                "tool_type": "http_get",
                "tool_name": "simple",
                "params": {"url": "https://blocked.example/path"},
                "options": {"deny_hosts": ["blocked.example"]},
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(body["detail"].as_str().unwrap().contains("deny_hosts"));
}

#[tokio::test]
async fn http_get_truncates_large_upstream_bodies() {
    // A local upstream returning far more than the cap.
    let upstream = axum::Router::new().route(
        "/large",
        axum::routing::get(|| async { "x".repeat(10_000) }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, upstream).await.unwrap();
    });

    let app = test_app();
    let (status, body) = json_call(
        &app.router,
        json_request(
            "POST",
            "/api/v1/tools/invoke",
            json!({
                "tenant_id": unique_tenant("t-trunc"),
                "tool_type": "http_get",
                "tool_name": "simple",
                "params": {"url": format!("http://{addr}/large")},
                "options": {"resp_max_chars": 4096, "timeout_ms": 5000},
            }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"]["http"]["status_code"], 200);
    assert_eq!(body["result"]["http"]["ok"], true);
    assert_eq!(body["result"]["body"].as_str().unwrap().len(), 4096);
}

#[tokio::test]
async fn policy_layers_merge_with_request_override() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tools_policies.json");
    std::fs::write(
        &path,
        json!({
            "default": {"options": {"timeout_ms": 1500}},
            "tenants": {
                "acme": {
                    "default": {"options": {"retry_max": 1}},
                    "tools": {
                        "http_get": {
                            "options": {"rate_limit_per_sec": 9},
                            "names": {"simple": {"options": {"resp_max_chars": 4096}}}
                        }
                    }
                }
            }
        })
        .to_string(),
    )
    .unwrap();

    let app = TestAppBuilder::default().policy_path(path).build();

    let (status, body) = json_call(
        &app.router,
        json_request(
            "POST",
            "/api/v1/tools/preview",
            json!({
                "tenant_id": "acme",
                "tool_type": "http_get",
                "tool_name": "simple",
                "params": {},
                "options": {},
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["merged_options"]["resp_max_chars"], 4096);
    assert_eq!(body["merged_options"]["timeout_ms"], 1500);
    assert_eq!(body["merged_options"]["retry_max"], 1);
    assert_eq!(body["merged_options"]["rate_limit_per_sec"], 9);
    assert_eq!(body["layers"]["global"]["timeout_ms"], 1500);
    assert_eq!(body["layers"]["name"]["resp_max_chars"], 4096);

    // Request options override the file layers.
    let (_, body) = json_call(
        &app.router,
        json_request(
            "POST",
            "/api/v1/tools/preview",
            json!({
                "tenant_id": "acme",
                "tool_type": "http_get",
                "tool_name": "simple",
                "params": {},
                "options": {"resp_max_chars": 1000},
            }),
        ),
    )
    .await;
    assert_eq!(body["merged_options"]["resp_max_chars"], 1000);
}
