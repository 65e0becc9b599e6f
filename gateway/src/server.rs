//! HTTP surface: route table and request entry points.

use std::{collections::HashMap, sync::Arc};

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::HeaderMap,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use relay_mcp::{Aggregator, UpstreamManager};
use serde_json::{json, Value};
use tokio::sync::watch;

use crate::{
    admin,
    agent::AgentRegistry,
    auth::{bearer_auth, AuthState},
    config::ConfigState,
    error::RelayError,
    router::{Dispatcher, ProviderRegistry},
    transform::TransformerRegistry,
    usage::UsageCache,
};

/// Shared state behind every route.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub providers: Arc<ProviderRegistry>,
    pub transformers: Arc<TransformerRegistry>,
    pub agents: Arc<AgentRegistry>,
    pub usage: Arc<UsageCache>,
    pub config: Arc<ConfigState>,
    pub mcp: Arc<UpstreamManager>,
    pub restart: watch::Sender<bool>,
}

/// Assemble the full route table.
pub fn build_router(state: AppState, aggregator: &Arc<Aggregator>) -> Router {
    let auth = AuthState::new(state.config.snapshot().apikey.clone());

    let api = Router::new()
        .route("/v1/messages", post(handle_messages))
        .route("/v1/messages/count_tokens", post(handle_count_tokens))
        .route(
            "/providers",
            get(admin::list_providers).post(admin::create_provider),
        )
        .route(
            "/providers/{name}",
            put(admin::update_provider).delete(admin::delete_provider),
        )
        .route("/api/providers/enabled", post(admin::toggle_provider))
        .route(
            "/api/config",
            get(admin::get_config).post(admin::replace_config),
        )
        .route("/api/restart", post(admin::restart))
        .route("/api/transformers", get(admin::list_transformers))
        .route(
            "/api/mcp/servers",
            get(admin::list_mcp_servers).post(admin::create_mcp_server),
        )
        .route(
            "/api/mcp/servers/{name}",
            get(admin::get_mcp_server)
                .put(admin::update_mcp_server)
                .delete(admin::delete_mcp_server),
        )
        .route("/api/mcp/servers/{name}/tools", get(admin::get_mcp_tools))
        .route(
            "/api/mcp/servers/{name}/tools/refresh",
            post(admin::refresh_mcp_tools),
        )
        .route("/health", get(health))
        .with_state(state);

    api.merge(aggregator.routes())
        .layer(middleware::from_fn_with_state(auth, bearer_auth))
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

async fn health() -> Json<Value> {
    Json(json!({"ok": true}))
}

/// `POST /v1/messages`
async fn handle_messages(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    raw: Bytes,
) -> Response {
    let body: Value = match serde_json::from_slice(&raw) {
        Ok(body) => body,
        Err(e) => {
            return RelayError::InvalidRequest(format!("malformed JSON body: {e}"))
                .into_response()
        }
    };

    let session_id = extract_session_id(&headers, &query, &body);
    state.dispatcher.handle_messages(body, session_id).await
}

/// `POST /v1/messages/count_tokens`
async fn handle_count_tokens(State(state): State<AppState>, raw: Bytes) -> Response {
    let body: Value = match serde_json::from_slice(&raw) {
        Ok(body) => body,
        Err(e) => {
            return RelayError::InvalidRequest(format!("malformed JSON body: {e}"))
                .into_response()
        }
    };
    Json(state.dispatcher.count_tokens(&body)).into_response()
}

/// Session correlation id: `mcp-session-id` header, `sessionId` query
/// parameter, or a body field, in that order. Opaque to the relay.
pub fn extract_session_id(
    headers: &HeaderMap,
    query: &HashMap<String, String>,
    body: &Value,
) -> Option<String> {
    if let Some(id) = headers
        .get("mcp-session-id")
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
    {
        return Some(id.to_string());
    }
    if let Some(id) = query.get("sessionId").filter(|s| !s.is_empty()) {
        return Some(id.clone());
    }
    for field in ["sessionId", "session_id"] {
        if let Some(id) = body.get(field).and_then(Value::as_str) {
            if !id.is_empty() {
                return Some(id.to_string());
            }
        }
    }
    None
}
