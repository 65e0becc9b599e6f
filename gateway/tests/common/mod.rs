//! Shared test harness: a scripted mock upstream provider and a fully
//! wired gateway router pointed at it.

// Each test binary uses a subset of the harness.
#![allow(dead_code)]

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use relay::{
    agent::AgentRegistry,
    build_router,
    config::{AppConfig, ConfigState, ProviderConfig},
    router::{Dispatcher, ProviderRegistry, RouterSettings},
    transform::{register_builtins, TransformerRegistry},
    AppState, UsageCache,
};
use relay_mcp::{Aggregator, AggregatorConfig, UpstreamManager};
use serde_json::Value;
use tokio::sync::watch;

/// One scripted upstream response.
#[derive(Clone)]
pub enum Scripted {
    Json(StatusCode, Value),
    Sse(String),
}

/// Mock upstream provider: answers `/v1/messages` from a script, one entry
/// per call, and records every request body it sees.
pub struct MockUpstream {
    pub base_url: String,
    pub hits: Arc<AtomicUsize>,
    pub bodies: Arc<parking_lot::Mutex<Vec<Value>>>,
    pub auth_headers: Arc<parking_lot::Mutex<Vec<Option<String>>>>,
}

struct MockState {
    script: Vec<Scripted>,
    hits: Arc<AtomicUsize>,
    bodies: Arc<parking_lot::Mutex<Vec<Value>>>,
    auth_headers: Arc<parking_lot::Mutex<Vec<Option<String>>>>,
}

async fn mock_messages(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let call = state.hits.fetch_add(1, Ordering::SeqCst);
    if let Ok(value) = serde_json::from_str::<Value>(&body) {
        state.bodies.lock().push(value);
    }
    state.auth_headers.lock().push(
        headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    );

    match state.script.get(call.min(state.script.len().saturating_sub(1))) {
        Some(Scripted::Json(status, value)) => {
            (*status, axum::Json(value.clone())).into_response()
        }
        Some(Scripted::Sse(frames)) => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/event-stream")
            .body(Body::from(frames.clone()))
            .unwrap(),
        None => (StatusCode::INTERNAL_SERVER_ERROR, "unscripted call").into_response(),
    }
}

pub async fn spawn_mock_upstream(script: Vec<Scripted>) -> MockUpstream {
    let hits = Arc::new(AtomicUsize::new(0));
    let bodies = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let auth_headers = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let state = Arc::new(MockState {
        script,
        hits: Arc::clone(&hits),
        bodies: Arc::clone(&bodies),
        auth_headers: Arc::clone(&auth_headers),
    });

    let app = Router::new()
        .route("/v1/messages", post(mock_messages))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock upstream");
    let addr = listener.local_addr().expect("mock addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    MockUpstream {
        base_url: format!("http://{addr}"),
        hits,
        bodies,
        auth_headers,
    }
}

/// A gateway wired to the mock upstream under provider name `openai`.
pub struct TestGateway {
    pub router: Router,
    pub usage: Arc<UsageCache>,
    pub agents: Arc<AgentRegistry>,
}

pub fn build_gateway(provider: ProviderConfig, apikey: Option<&str>) -> TestGateway {
    build_gateway_with(vec![provider], apikey, Arc::new(AgentRegistry::new()))
}

pub fn build_gateway_with(
    providers: Vec<ProviderConfig>,
    apikey: Option<&str>,
    agents: Arc<AgentRegistry>,
) -> TestGateway {
    let transformers = Arc::new(TransformerRegistry::new());
    register_builtins(&transformers);

    let usage = Arc::new(UsageCache::default());
    let registry = Arc::new(ProviderRegistry::new(providers.clone(), 4).expect("providers"));
    let dispatcher = Dispatcher::new(
        Arc::clone(&registry),
        Arc::clone(&transformers),
        Arc::clone(&agents),
        Arc::clone(&usage),
        RouterSettings::default(),
    );

    let config = AppConfig {
        apikey: apikey.map(str::to_string),
        providers,
        ..AppConfig::default()
    };
    let mcp = Arc::new(UpstreamManager::new(vec![]));
    let aggregator = Aggregator::new(Arc::clone(&mcp), AggregatorConfig::default());
    let (restart, _) = watch::channel(false);

    let state = AppState {
        dispatcher,
        providers: registry,
        transformers,
        agents: Arc::clone(&agents),
        usage: Arc::clone(&usage),
        config: Arc::new(ConfigState::new(config, None)),
        mcp,
        restart,
    };

    TestGateway {
        router: build_router(state, &aggregator),
        usage,
        agents,
    }
}

pub fn provider_config(name: &str, base_url: &str, transformer: Option<Value>) -> ProviderConfig {
    let transformer = transformer.map(|t| serde_json::from_value(t).expect("binding"));
    ProviderConfig {
        name: name.to_string(),
        base_url: base_url.to_string(),
        api_keys: vec!["sk-test-1".to_string(), "sk-test-2".to_string()],
        models: vec!["gpt-4o-mini".to_string()],
        enabled: true,
        sort: 0,
        transformer,
        limit: None,
    }
}
