//! The MCP aggregator server.
//!
//! Exposes every configured upstream server as its own group:
//! `GET /mcp/{group}` opens a per-session SSE stream and
//! `POST /mcp/{group}/messages` accepts JSON-RPC frames whose responses are
//! written back through the stream (the POST itself answers `202`). Tool
//! names are prefixed `server__tool`; dispatch splits on the leftmost `__`
//! and asserts the server half matches the group.

mod rpc;
mod session;

use std::{
    collections::HashMap,
    convert::Infallible,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::{stream, Stream, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::WaitForCancellationFutureOwned;
use tracing::{debug, info, warn};

pub use rpc::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};
pub use session::{AggregatorSession, SessionEvent, SessionStore};

use crate::{manager::UpstreamManager, split_aggregated_tool_name, TOOL_NAME_DELIMITER};

/// MCP protocol revision the aggregator speaks.
const PROTOCOL_VERSION: &str = "2024-11-05";

/// Aggregator tuning knobs.
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Idle sessions are destroyed after this long without traffic.
    pub idle_timeout: Duration,
    /// Capacity of each session's outbound event channel.
    pub channel_capacity: usize,
    /// SSE keep-alive ping interval.
    pub keep_alive: Duration,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(600),
            channel_capacity: 64,
            keep_alive: Duration::from_secs(15),
        }
    }
}

/// Multiplexes upstream MCP servers behind per-group, per-session endpoints.
pub struct Aggregator {
    manager: Arc<UpstreamManager>,
    sessions: Arc<SessionStore>,
    config: AggregatorConfig,
}

impl Aggregator {
    pub fn new(manager: Arc<UpstreamManager>, config: AggregatorConfig) -> Arc<Self> {
        let sessions = Arc::new(SessionStore::new(
            config.idle_timeout,
            config.channel_capacity,
        ));
        sessions.spawn_expiry_task(Duration::from_secs(60));
        Arc::new(Self {
            manager,
            sessions,
            config,
        })
    }

    /// Routes mounted onto the gateway's router.
    pub fn routes(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/mcp/{group}", get(handle_sse_open))
            .route("/mcp/{group}/messages", post(handle_messages))
            .with_state(Arc::clone(self))
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    // ========================================================================
    // JSON-RPC dispatch
    // ========================================================================

    async fn dispatch(&self, session: &AggregatorSession, req: JsonRpcRequest) -> JsonRpcResponse {
        match req.method.as_str() {
            "initialize" => self.handle_initialize(session, req),
            "tools/list" => self.handle_tools_list(session, req.id),
            "tools/call" => self.handle_tools_call(session, req.id, &req.params).await,
            "ping" => JsonRpcResponse::success(req.id, json!({})),
            method => {
                JsonRpcResponse::error(req.id, -32601, format!("Method not found: {method}"))
            }
        }
    }

    fn handle_initialize(&self, session: &AggregatorSession, req: JsonRpcRequest) -> JsonRpcResponse {
        let client_version = req
            .params
            .get("protocolVersion")
            .and_then(|v| v.as_str())
            .unwrap_or(PROTOCOL_VERSION);
        info!(
            session = %session.session_id,
            group = %session.group,
            client_version = %client_version,
            "Aggregator session initialize"
        );

        JsonRpcResponse::success(
            req.id,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {
                    "tools": {"listChanged": false}
                },
                "serverInfo": {
                    "name": format!("relay-aggregator/{}", session.group),
                    "version": env!("CARGO_PKG_VERSION")
                }
            }),
        )
    }

    fn handle_tools_list(&self, session: &AggregatorSession, id: Option<Value>) -> JsonRpcResponse {
        let tools = match self.manager.get_tools(&session.group) {
            Ok(tools) => tools,
            Err(e) => return JsonRpcResponse::error(id, e.json_rpc_code(), e.to_string()),
        };

        let listed: Vec<Value> = tools
            .iter()
            .filter_map(|tool| {
                let mut value = serde_json::to_value(tool).ok()?;
                let prefixed =
                    format!("{}{}{}", session.group, TOOL_NAME_DELIMITER, tool.name);
                value
                    .as_object_mut()?
                    .insert("name".to_string(), Value::String(prefixed));
                Some(value)
            })
            .collect();

        JsonRpcResponse::success(id, json!({"tools": listed}))
    }

    async fn handle_tools_call(
        &self,
        session: &AggregatorSession,
        id: Option<Value>,
        params: &Value,
    ) -> JsonRpcResponse {
        let Some(name) = params.get("name").and_then(|v| v.as_str()) else {
            return JsonRpcResponse::error(id, -32602, "Missing 'name' parameter");
        };

        let Some((server, tool)) = split_aggregated_tool_name(name) else {
            return JsonRpcResponse::error(
                id,
                -32602,
                format!("Tool name '{name}' is not of the form server{TOOL_NAME_DELIMITER}tool"),
            );
        };

        if server != session.group {
            return JsonRpcResponse::error(
                id,
                -32602,
                format!("Tool '{name}' does not belong to group '{}'", session.group),
            );
        }

        let arguments = params
            .get("arguments")
            .and_then(Value::as_object)
            .cloned();

        match self
            .manager
            .call_tool(server, tool, arguments, Some(&session.session_id))
            .await
        {
            Ok(result) => match serde_json::to_value(&result) {
                Ok(value) => JsonRpcResponse::success(id, value),
                Err(e) => JsonRpcResponse::error(id, -32000, format!("Serialize result: {e}")),
            },
            Err(e) => {
                warn!(
                    session = %session.session_id,
                    tool = %name,
                    error = %e,
                    "Aggregated tool call failed"
                );
                JsonRpcResponse::error(id, e.json_rpc_code(), e.to_string())
            }
        }
    }
}

// ============================================================================
// HTTP handlers
// ============================================================================

fn session_id_from(query: &HashMap<String, String>, headers: &HeaderMap) -> Option<String> {
    if let Some(id) = query.get("sessionId").filter(|s| !s.is_empty()) {
        return Some(id.clone());
    }
    headers
        .get("mcp-session-id")
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn not_found(error_type: &str, message: impl Into<String>) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": {"type": error_type, "message": message.into()}})),
    )
        .into_response()
}

/// `GET /mcp/{group}` — open the session's SSE stream.
async fn handle_sse_open(
    State(aggregator): State<Arc<Aggregator>>,
    Path(group): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    if !aggregator.manager.has_server(&group) {
        return not_found("not_found", format!("unknown MCP server group '{group}'"));
    }

    let session_id = session_id_from(&query, &headers)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let (session, rx) = aggregator.sessions.open(&session_id, &group);
    debug!(session = %session_id, group = %group, "SSE stream opened");

    // Handshake: announce where JSON-RPC frames for this session go.
    let endpoint = format!("/mcp/{group}/messages?sessionId={session_id}");
    let first = stream::iter([Ok::<_, Infallible>(
        Event::default().event("endpoint").data(endpoint),
    )]);

    let live = SessionStream {
        rx,
        cancelled: Box::pin(session.cancellation().cancelled_owned()),
        store: Arc::clone(&aggregator.sessions),
        session,
    };

    let mut response = Sse::new(first.chain(live))
        .keep_alive(
            KeepAlive::new()
                .interval(aggregator.config.keep_alive)
                .text("ping"),
        )
        .into_response();

    if let Ok(value) = session_id.parse() {
        response.headers_mut().insert("mcp-session-id", value);
    }
    response
}

/// `POST /mcp/{group}/messages` — accept one JSON-RPC frame.
///
/// The response frame travels back over the session's SSE stream; the POST
/// itself only acknowledges acceptance.
async fn handle_messages(
    State(aggregator): State<Arc<Aggregator>>,
    Path(group): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(request): Json<JsonRpcRequest>,
) -> Response {
    let Some(session_id) = session_id_from(&query, &headers) else {
        return not_found("session-not-found", "missing sessionId");
    };

    let Some(session) = aggregator.sessions.get(&session_id) else {
        return not_found("session-not-found", format!("unknown session '{session_id}'"));
    };

    if session.group != group {
        return not_found(
            "session-not-found",
            format!("session '{session_id}' does not belong to group '{group}'"),
        );
    }

    session.touch();

    if request.is_notification() {
        debug!(session = %session_id, method = %request.method, "Notification accepted");
        return StatusCode::ACCEPTED.into_response();
    }

    // Dispatch off the request path so slow tool calls never hold the POST
    // open; a destroyed session abandons the call via its token.
    tokio::spawn(async move {
        let cancellation = session.cancellation();
        let response = tokio::select! {
            _ = cancellation.cancelled() => return,
            response = aggregator.dispatch(&session, request) => response,
        };

        match serde_json::to_string(&response) {
            Ok(data) => {
                if !session.send("message", data).await {
                    debug!(session = %session.session_id, "SSE stream gone, response dropped");
                }
            }
            Err(e) => warn!(error = %e, "Failed to serialize JSON-RPC response"),
        }
    });

    StatusCode::ACCEPTED.into_response()
}

// ============================================================================
// Session-bound SSE stream
// ============================================================================

/// Wraps the session's event channel as an SSE stream. Dropping the stream
/// (client disconnect) destroys the session; a cancelled session (replaced
/// or expired) ends the stream.
struct SessionStream {
    rx: mpsc::Receiver<SessionEvent>,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    store: Arc<SessionStore>,
    session: Arc<AggregatorSession>,
}

impl Stream for SessionStream {
    type Item = Result<Event, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        use std::future::Future;

        if self.cancelled.as_mut().poll(cx).is_ready() {
            return Poll::Ready(None);
        }

        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(event)) => Poll::Ready(Some(Ok(Event::default()
                .event(event.event)
                .data(event.data)))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for SessionStream {
    fn drop(&mut self) {
        self.store.close(&self.session);
    }
}

#[cfg(test)]
mod tests {
    use std::borrow::Cow;

    use rmcp::model::Tool;
    use serde_json::json;

    use super::*;

    fn tool(name: &str) -> Tool {
        Tool {
            name: Cow::Owned(name.to_string()),
            title: None,
            description: Some(Cow::Owned(format!("{name} tool"))),
            input_schema: Arc::new(serde_json::Map::new()),
            output_schema: None,
            annotations: None,
            icons: None,
        }
    }

    fn aggregator_with(group: &str, tools: Vec<Tool>) -> Arc<Aggregator> {
        let manager = Arc::new(UpstreamManager::stub_connected(group, tools));
        Aggregator::new(manager, AggregatorConfig::default())
    }

    fn rpc(method: &str, params: Value) -> JsonRpcRequest {
        serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_tools_list_prefixes_group_name() {
        let aggregator = aggregator_with("db", vec![tool("query"), tool("explain")]);
        let (session, _rx) = aggregator.sessions.open("abc", "db");

        let response = aggregator.dispatch(&session, rpc("tools/list", json!({}))).await;
        let tools = response.result.unwrap()["tools"].as_array().unwrap().clone();
        let names: Vec<&str> = tools.iter().map(|t| t["name"].as_str().unwrap()).collect();
        assert_eq!(names, vec!["db__query", "db__explain"]);
    }

    #[tokio::test]
    async fn test_tools_call_rejects_foreign_group() {
        let aggregator = aggregator_with("db", vec![tool("query")]);
        let (session, _rx) = aggregator.sessions.open("abc", "db");

        let response = aggregator
            .dispatch(&session, rpc("tools/call", json!({"name": "web__fetch"})))
            .await;
        assert_eq!(response.error.unwrap().code, -32602);
    }

    #[tokio::test]
    async fn test_tools_call_rejects_unprefixed_name() {
        let aggregator = aggregator_with("db", vec![tool("query")]);
        let (session, _rx) = aggregator.sessions.open("abc", "db");

        let response = aggregator
            .dispatch(&session, rpc("tools/call", json!({"name": "query"})))
            .await;
        assert_eq!(response.error.unwrap().code, -32602);
    }

    #[tokio::test]
    async fn test_tools_call_without_client_reports_unavailable() {
        let aggregator = aggregator_with("db", vec![tool("query")]);
        let (session, _rx) = aggregator.sessions.open("abc", "db");

        let response = aggregator
            .dispatch(
                &session,
                rpc("tools/call", json!({"name": "db__query", "arguments": {}})),
            )
            .await;
        assert_eq!(response.error.unwrap().code, -32002);
    }

    #[tokio::test]
    async fn test_initialize_reports_group_server_info() {
        let aggregator = aggregator_with("db", vec![]);
        let (session, _rx) = aggregator.sessions.open("abc", "db");

        let response = aggregator
            .dispatch(&session, rpc("initialize", json!({"protocolVersion": "2024-11-05"})))
            .await;
        let result = response.result.unwrap();
        assert_eq!(result["serverInfo"]["name"], "relay-aggregator/db");
        assert_eq!(result["protocolVersion"], PROTOCOL_VERSION);
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let aggregator = aggregator_with("db", vec![]);
        let (session, _rx) = aggregator.sessions.open("abc", "db");

        let response = aggregator
            .dispatch(&session, rpc("resources/list", json!({})))
            .await;
        assert_eq!(response.error.unwrap().code, -32601);
    }

    #[test]
    fn test_session_id_prefers_query() {
        let mut query = HashMap::new();
        query.insert("sessionId".to_string(), "from-query".to_string());
        let mut headers = HeaderMap::new();
        headers.insert("mcp-session-id", "from-header".parse().unwrap());
        assert_eq!(
            session_id_from(&query, &headers).as_deref(),
            Some("from-query")
        );
    }

    #[test]
    fn test_session_id_falls_back_to_header() {
        let query = HashMap::new();
        let mut headers = HeaderMap::new();
        headers.insert("mcp-session-id", "abc".parse().unwrap());
        assert_eq!(session_id_from(&query, &headers).as_deref(), Some("abc"));
    }

    #[test]
    fn test_session_id_absent() {
        assert_eq!(session_id_from(&HashMap::new(), &HeaderMap::new()), None);
    }
}
