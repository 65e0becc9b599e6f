//! End-to-end tests for the non-streaming pipeline: provider resolution,
//! transformer chains, key injection, usage capture, and the error
//! surface.

mod common;

use std::sync::atomic::Ordering;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use common::{build_gateway, provider_config, spawn_mock_upstream, Scripted};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

async fn post_json(
    router: axum::Router,
    uri: &str,
    body: Value,
    extra_headers: &[(&str, &str)],
) -> (StatusCode, Value) {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json");
    for (name, value) in extra_headers {
        builder = builder.header(*name, *value);
    }
    let response = router
        .oneshot(builder.body(Body::from(body.to_string())).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

fn messages_body() -> Value {
    json!({
        "model": "openai,gpt-4o-mini",
        "messages": [{"role": "user", "content": "ping"}],
        "stream": false
    })
}

/// Transparent non-stream round-trip through the `openai` transformer:
/// `messages` -> `input` outgoing, `output` -> `content` incoming, usage
/// cached for the request's session.
#[tokio::test]
async fn test_non_stream_transparent_roundtrip() {
    let upstream = spawn_mock_upstream(vec![Scripted::Json(
        StatusCode::OK,
        json!({
            "output": [{"type": "text", "text": "pong"}],
            "usage": {"input_tokens": 1, "output_tokens": 1}
        }),
    )])
    .await;

    let gateway = build_gateway(
        provider_config("openai", &upstream.base_url, Some(json!({"use": ["openai"]}))),
        None,
    );

    let (status, body) = post_json(
        gateway.router,
        "/v1/messages",
        messages_body(),
        &[("mcp-session-id", "sess-s1")],
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["content"][0]["text"], "pong");
    assert_eq!(body["usage"]["input_tokens"], 1);

    // The outgoing rewrite really happened on the wire.
    let sent = upstream.bodies.lock();
    assert!(sent[0].get("messages").is_none());
    assert_eq!(sent[0]["input"][0]["content"], "ping");
    assert_eq!(sent[0]["model"], "gpt-4o-mini");

    // Usage cache updated for the session.
    let usage = gateway.usage.get("sess-s1").unwrap();
    assert_eq!(usage.input_tokens, 1);
    assert_eq!(usage.output_tokens, 1);
}

#[tokio::test]
async fn test_provider_key_round_robin_reaches_upstream() {
    let upstream = spawn_mock_upstream(vec![Scripted::Json(
        StatusCode::OK,
        json!({"content": [], "usage": {"input_tokens": 0, "output_tokens": 0}}),
    )])
    .await;

    let gateway = build_gateway(provider_config("openai", &upstream.base_url, None), None);

    for _ in 0..2 {
        let (status, _) = post_json(
            gateway.router.clone(),
            "/v1/messages",
            messages_body(),
            &[],
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    let auths = upstream.auth_headers.lock();
    assert_eq!(auths[0].as_deref(), Some("Bearer sk-test-1"));
    assert_eq!(auths[1].as_deref(), Some("Bearer sk-test-2"));
}

#[tokio::test]
async fn test_invalid_model_is_400() {
    let gateway = build_gateway(provider_config("openai", "http://127.0.0.1:9", None), None);
    let (status, body) = post_json(
        gateway.router,
        "/v1/messages",
        json!({"model": "gpt-4o-mini", "messages": []}),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["type"], "invalid-request");
}

#[tokio::test]
async fn test_unknown_and_disabled_provider_are_404() {
    let mut disabled = provider_config("openai", "http://127.0.0.1:9", None);
    disabled.enabled = false;
    disabled.api_keys.clear();
    let gateway = build_gateway(disabled, None);

    let (status, body) = post_json(
        gateway.router.clone(),
        "/v1/messages",
        json!({"model": "missing,m", "messages": []}),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["type"], "unknown-provider");

    let (status, body) = post_json(gateway.router, "/v1/messages", messages_body(), &[]).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["type"], "unknown-provider");
}

#[tokio::test]
async fn test_upstream_error_passes_through() {
    let upstream = spawn_mock_upstream(vec![Scripted::Json(
        StatusCode::TOO_MANY_REQUESTS,
        json!({"error": {"type": "rate_limit_error", "message": "slow down"}}),
    )])
    .await;
    let gateway = build_gateway(provider_config("openai", &upstream.base_url, None), None);

    let (status, body) = post_json(gateway.router, "/v1/messages", messages_body(), &[]).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"]["type"], "rate_limit_error");
}

#[tokio::test]
async fn test_auth_rejected_before_upstream() {
    let upstream = spawn_mock_upstream(vec![Scripted::Json(StatusCode::OK, json!({}))]).await;
    let gateway = build_gateway(
        provider_config("openai", &upstream.base_url, None),
        Some("relay-secret"),
    );

    let (status, _) = post_json(
        gateway.router.clone(),
        "/v1/messages",
        messages_body(),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = post_json(
        gateway.router.clone(),
        "/v1/messages",
        messages_body(),
        &[("authorization", "Bearer wrong")],
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // The upstream was never contacted.
    assert_eq!(upstream.hits.load(Ordering::SeqCst), 0);

    let (status, _) = post_json(
        gateway.router,
        "/v1/messages",
        messages_body(),
        &[("authorization", "Bearer relay-secret")],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(upstream.hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_client_service_key_never_forwarded() {
    let upstream = spawn_mock_upstream(vec![Scripted::Json(
        StatusCode::OK,
        json!({"content": [], "usage": {"input_tokens": 0, "output_tokens": 0}}),
    )])
    .await;
    let gateway = build_gateway(
        provider_config("openai", &upstream.base_url, None),
        Some("relay-secret"),
    );

    let (status, _) = post_json(
        gateway.router,
        "/v1/messages",
        messages_body(),
        &[("authorization", "Bearer relay-secret")],
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // Upstream saw the provider key, not the relay's service key.
    let auths = upstream.auth_headers.lock();
    assert_eq!(auths[0].as_deref(), Some("Bearer sk-test-1"));
}

#[tokio::test]
async fn test_count_tokens_endpoint() {
    let gateway = build_gateway(provider_config("openai", "http://127.0.0.1:9", None), None);
    let (status, body) = post_json(
        gateway.router,
        "/v1/messages/count_tokens",
        json!({"model": "openai,gpt-4o-mini", "messages": [{"role": "user", "content": "hello world"}]}),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["input_tokens"].as_u64().unwrap() > 0);
}

#[tokio::test]
async fn test_health_endpoint() {
    let gateway = build_gateway(provider_config("openai", "http://127.0.0.1:9", None), None);
    let response = gateway
        .router
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_admin_provider_crud() {
    let gateway = build_gateway(provider_config("openai", "http://127.0.0.1:9", None), None);

    let (status, listed) = {
        let response = gateway
            .router
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/providers")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice::<Value>(&bytes).unwrap())
    };
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed.as_array().unwrap().len(), 1);

    let (status, _) = post_json(
        gateway.router.clone(),
        "/providers",
        json!({
            "name": "deepseek",
            "baseUrl": "https://api.deepseek.test",
            "apiKeys": ["sk-ds"],
            "models": ["deepseek-chat"]
        }),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    // Duplicate create is rejected.
    let (status, _) = post_json(
        gateway.router.clone(),
        "/providers",
        json!({
            "name": "deepseek",
            "baseUrl": "https://api.deepseek.test",
            "apiKeys": ["sk-ds"]
        }),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = post_json(
        gateway.router.clone(),
        "/api/providers/enabled",
        json!({"name": "deepseek", "enabled": false}),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let response = gateway
        .router
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/providers/deepseek")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
