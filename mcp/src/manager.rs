//! Upstream MCP client management.
//!
//! Holds one entry per configured server, opens the matching transport
//! (stdio child process, streamable HTTP, or SSE), performs the MCP
//! handshake, and caches each server's tool catalog. Network transports
//! reconnect with exponential backoff; stdio entries stay down until an
//! explicit restart.

use std::{borrow::Cow, collections::HashMap, sync::Arc, time::Duration};

use backoff::ExponentialBackoffBuilder;
use dashmap::DashMap;
use rmcp::{
    model::{CallToolRequestParam, CallToolResult, Tool},
    service::RunningService,
    transport::{
        sse_client::SseClientConfig, streamable_http_client::StreamableHttpClientTransportConfig,
        ConfigureCommandExt, SseClientTransport, StreamableHttpClientTransport, TokioChildProcess,
    },
    RoleClient, ServiceExt,
};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::{
    config::{EnvContext, McpServerConfig, McpTransport},
    error::{McpError, McpResult},
};

/// Type alias for a connected MCP client.
type McpClient = RunningService<RoleClient, ()>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection state of one upstream server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

/// Snapshot of an upstream server entry, as exposed by the admin API.
#[derive(Debug, Clone, Serialize)]
pub struct ServerEntry {
    pub name: String,
    pub status: ServerStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub tool_count: usize,
    #[serde(flatten)]
    pub config: serde_json::Value,
}

struct SlotState {
    status: ServerStatus,
    tools: Vec<Tool>,
    last_error: Option<String>,
    client: Option<Arc<McpClient>>,
    reconnecting: bool,
}

struct ServerSlot {
    config: McpServerConfig,
    state: parking_lot::RwLock<SlotState>,
}

impl ServerSlot {
    fn new(config: McpServerConfig) -> Self {
        Self {
            config,
            state: parking_lot::RwLock::new(SlotState {
                status: ServerStatus::Connecting,
                tools: Vec::new(),
                last_error: None,
                client: None,
                reconnecting: false,
            }),
        }
    }

    fn snapshot(&self, name: &str) -> ServerEntry {
        let state = self.state.read();
        ServerEntry {
            name: name.to_string(),
            status: state.status,
            last_error: state.last_error.clone(),
            tool_count: state.tools.len(),
            config: self.config.to_value(),
        }
    }

    fn client(&self) -> Option<Arc<McpClient>> {
        self.state.read().client.clone()
    }

    fn is_network(&self) -> bool {
        matches!(
            self.config.transport,
            McpTransport::Http { .. } | McpTransport::Sse { .. }
        )
    }
}

/// Manages the set of upstream MCP servers and their tool catalogs.
pub struct UpstreamManager {
    servers: DashMap<String, Arc<ServerSlot>>,
}

impl UpstreamManager {
    pub fn new(configs: Vec<McpServerConfig>) -> Self {
        let servers = DashMap::new();
        for config in configs {
            servers.insert(config.name.clone(), Arc::new(ServerSlot::new(config)));
        }
        Self { servers }
    }

    /// Connect every configured server concurrently. Failures are recorded
    /// on the entry; a failed server never blocks the others.
    pub async fn connect_all(self: &Arc<Self>) {
        let names: Vec<String> = self.servers.iter().map(|e| e.key().clone()).collect();
        let mut handles = Vec::with_capacity(names.len());
        for name in names {
            let manager = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                if let Err(e) = manager.connect_server(&name).await {
                    error!(server = %name, error = %e, "Failed to connect MCP server");
                }
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// (Re)connect one server: open the transport, handshake, and load the
    /// tool catalog. Network transports retry with exponential backoff
    /// (1 s initial, 30 s cap, +/-20% jitter); stdio connects exactly once.
    pub async fn connect_server(&self, name: &str) -> McpResult<()> {
        let slot = self.slot(name)?;

        {
            let mut state = slot.state.write();
            state.status = ServerStatus::Connecting;
            state.last_error = None;
        }

        let resolved = slot.config.resolved(&EnvContext::default());
        let result = if slot.is_network() {
            Self::open_transport_with_retry(&resolved).await
        } else {
            Self::open_transport(&resolved).await
        };

        match result {
            Ok(client) => {
                let client = Arc::new(client);
                let tools = Self::query_tools(&resolved.name, &client).await;
                let mut state = slot.state.write();
                state.client = Some(client);
                state.tools = tools;
                state.status = ServerStatus::Connected;
                state.last_error = None;
                info!(server = %name, tools = state.tools.len(), "Connected to MCP server");
                Ok(())
            }
            Err(e) => {
                let mut state = slot.state.write();
                state.client = None;
                state.tools.clear();
                state.status = ServerStatus::Error;
                state.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Register a new server and connect it.
    pub async fn add_server(&self, config: McpServerConfig) -> McpResult<()> {
        let name = config.name.clone();
        if self.servers.contains_key(&name) {
            return Err(McpError::Config(format!("server '{name}' already exists")));
        }
        self.servers
            .insert(name.clone(), Arc::new(ServerSlot::new(config)));
        self.connect_server(&name).await
    }

    /// Replace a server's config and reconnect it.
    pub async fn update_server(&self, config: McpServerConfig) -> McpResult<()> {
        let name = config.name.clone();
        let old = self
            .servers
            .remove(&name)
            .ok_or_else(|| McpError::ServerNotFound(name.clone()))?
            .1;
        Self::close_slot(&old).await;
        self.servers
            .insert(name.clone(), Arc::new(ServerSlot::new(config)));
        self.connect_server(&name).await
    }

    /// Remove a server and close its transport.
    pub async fn remove_server(&self, name: &str) -> McpResult<()> {
        let (_, slot) = self
            .servers
            .remove(name)
            .ok_or_else(|| McpError::ServerNotFound(name.to_string()))?;
        Self::close_slot(&slot).await;
        info!(server = %name, "Removed MCP server");
        Ok(())
    }

    /// Snapshot of all entries with statuses.
    pub fn list_servers(&self) -> Vec<ServerEntry> {
        let mut entries: Vec<ServerEntry> = self
            .servers
            .iter()
            .map(|e| e.value().snapshot(e.key()))
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }

    pub fn get_server(&self, name: &str) -> Option<ServerEntry> {
        self.servers.get(name).map(|e| e.value().snapshot(name))
    }

    pub fn has_server(&self, name: &str) -> bool {
        self.servers.contains_key(name)
    }

    /// Cached tool catalog. Populated only while the server is connected.
    pub fn get_tools(&self, name: &str) -> McpResult<Vec<Tool>> {
        let slot = self.slot(name)?;
        let state = slot.state.read();
        match state.status {
            ServerStatus::Connected => Ok(state.tools.clone()),
            _ => Ok(Vec::new()),
        }
    }

    /// Force a re-query of the server's tool list.
    pub async fn refresh_tools(&self, name: &str) -> McpResult<Vec<Tool>> {
        let slot = self.slot(name)?;
        let client = slot
            .client()
            .ok_or_else(|| McpError::ServerUnavailable(name.to_string()))?;

        let tools = client
            .peer()
            .list_all_tools()
            .await
            .map_err(|e| McpError::Transport(format!("list tools on '{name}': {e}")))?;

        let mut state = slot.state.write();
        state.tools = tools.clone();
        info!(server = %name, tools = tools.len(), "Refreshed tool catalog");
        Ok(tools)
    }

    /// Route a `tools/call` to the upstream server.
    ///
    /// `session_id` correlates the call in logs; it does not select a
    /// transport (clients live for the process lifetime). stdio transports
    /// serialize concurrent calls internally; HTTP/SSE parallelize.
    pub async fn call_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: Option<serde_json::Map<String, serde_json::Value>>,
        session_id: Option<&str>,
    ) -> McpResult<CallToolResult> {
        let slot = self.slot(server)?;
        let client = slot
            .client()
            .ok_or_else(|| McpError::ServerUnavailable(server.to_string()))?;

        debug!(
            server = %server,
            tool = %tool,
            session = session_id.unwrap_or("-"),
            "Dispatching tools/call"
        );

        let request = CallToolRequestParam {
            name: Cow::Owned(tool.to_string()),
            arguments,
        };

        match client.call_tool(request).await {
            Ok(result) => Ok(result),
            Err(e) => {
                self.handle_call_failure(server, &slot);
                Err(McpError::ToolExecution(format!(
                    "call '{tool}' on '{server}': {e}"
                )))
            }
        }
    }

    /// Disconnect from all servers.
    pub async fn shutdown(&self) {
        let names: Vec<String> = self.servers.iter().map(|e| e.key().clone()).collect();
        for name in names {
            if let Some((_, slot)) = self.servers.remove(&name) {
                Self::close_slot(&slot).await;
            }
        }
    }

    // ========================================================================
    // Internal
    // ========================================================================

    fn slot(&self, name: &str) -> McpResult<Arc<ServerSlot>> {
        self.servers
            .get(name)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| McpError::ServerNotFound(name.to_string()))
    }

    /// After a failed call, mark the entry down. Network entries get a
    /// background reconnect; stdio waits for an explicit restart.
    fn handle_call_failure(&self, name: &str, slot: &Arc<ServerSlot>) {
        let should_reconnect = {
            let mut state = slot.state.write();
            state.status = ServerStatus::Disconnected;
            state.client = None;
            state.tools.clear();
            if slot.is_network() && !state.reconnecting {
                state.reconnecting = true;
                true
            } else {
                false
            }
        };

        if !should_reconnect {
            return;
        }

        let name = name.to_string();
        let slot = Arc::clone(slot);
        tokio::spawn(async move {
            warn!(server = %name, "Upstream call failed, reconnecting");
            let resolved = slot.config.resolved(&EnvContext::default());
            let result = Self::open_transport_with_retry(&resolved).await;
            match result {
                Ok(client) => {
                    let client = Arc::new(client);
                    {
                        let mut state = slot.state.write();
                        state.reconnecting = false;
                        state.client = Some(Arc::clone(&client));
                        state.status = ServerStatus::Connected;
                        state.last_error = None;
                    }
                    let tools = Self::query_tools(&name, &client).await;
                    slot.state.write().tools = tools;
                    info!(server = %name, "Reconnected to MCP server");
                }
                Err(e) => {
                    let mut state = slot.state.write();
                    state.reconnecting = false;
                    state.status = ServerStatus::Error;
                    state.last_error = Some(e.to_string());
                    error!(server = %name, error = %e, "Reconnect failed");
                }
            }
        });
    }

    async fn close_slot(slot: &Arc<ServerSlot>) {
        let client = slot.state.write().client.take();
        if let Some(client) = client {
            match Arc::try_unwrap(client) {
                Ok(client) => {
                    if let Err(e) = client.cancel().await {
                        warn!("Error closing MCP client: {e}");
                    }
                }
                Err(_) => {
                    warn!("MCP client still has active references on close");
                }
            }
        }
    }

    async fn query_tools(name: &str, client: &Arc<McpClient>) -> Vec<Tool> {
        match client.peer().list_all_tools().await {
            Ok(tools) => {
                info!(server = %name, count = tools.len(), "Discovered tools");
                tools
            }
            Err(e) => {
                warn!(server = %name, error = %e, "Failed to list tools");
                Vec::new()
            }
        }
    }

    /// Connect with exponential backoff for network transports.
    async fn open_transport_with_retry(config: &McpServerConfig) -> McpResult<McpClient> {
        let backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_secs(1))
            .with_max_interval(Duration::from_secs(30))
            .with_randomization_factor(0.2)
            .with_max_elapsed_time(Some(Duration::from_secs(30)))
            .build();

        backoff::future::retry(backoff, || async {
            match Self::open_transport(config).await {
                Ok(client) => Ok(client),
                Err(e) => {
                    warn!(server = %config.name, error = %e, "Connect failed, retrying");
                    Err(backoff::Error::transient(e))
                }
            }
        })
        .await
    }

    async fn open_transport(config: &McpServerConfig) -> McpResult<McpClient> {
        info!(server = %config.name, "Connecting to MCP server");

        match &config.transport {
            McpTransport::Stdio { command, args, env } => {
                let transport = TokioChildProcess::new(
                    tokio::process::Command::new(command).configure(|cmd| {
                        cmd.args(args)
                            .envs(env.iter())
                            .stderr(std::process::Stdio::inherit());
                    }),
                )
                .map_err(|e| McpError::Transport(format!("create stdio transport: {e}")))?;

                ().serve(transport).await.map_err(|e| {
                    McpError::ConnectionFailed(format!("initialize stdio client: {e}"))
                })
            }

            McpTransport::Sse { url, headers } => {
                let client = http_client_with_headers(headers)?;
                let cfg = SseClientConfig {
                    sse_endpoint: url.clone().into(),
                    ..Default::default()
                };

                let transport = SseClientTransport::start_with_client(client, cfg)
                    .await
                    .map_err(|e| McpError::Transport(format!("create SSE transport: {e}")))?;

                ().serve(transport)
                    .await
                    .map_err(|e| McpError::ConnectionFailed(format!("initialize SSE client: {e}")))
            }

            McpTransport::Http { url, headers } => {
                let mut cfg = StreamableHttpClientTransportConfig::with_uri(url.as_str());
                let mut extra = 0usize;
                for (key, value) in headers {
                    if key.eq_ignore_ascii_case("authorization") {
                        cfg.auth_header = Some(value.clone());
                    } else {
                        extra += 1;
                    }
                }
                if extra > 0 {
                    warn!(
                        server = %config.name,
                        "Streamable HTTP transport only honors the authorization header; {extra} header(s) ignored"
                    );
                }
                let transport = StreamableHttpClientTransport::from_config(cfg);

                ().serve(transport).await.map_err(|e| {
                    McpError::ConnectionFailed(format!("initialize streamable client: {e}"))
                })
            }
        }
    }
}

fn http_client_with_headers(headers: &HashMap<String, String>) -> McpResult<reqwest::Client> {
    let mut header_map = reqwest::header::HeaderMap::new();
    for (key, value) in headers {
        let name: reqwest::header::HeaderName = key
            .parse()
            .map_err(|_| McpError::Config(format!("invalid header name '{key}'")))?;
        let value = value
            .parse()
            .map_err(|_| McpError::Config(format!("invalid value for header '{key}'")))?;
        header_map.insert(name, value);
    }

    reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .default_headers(header_map)
        .build()
        .map_err(|e| McpError::Transport(format!("build HTTP client: {e}")))
}

#[cfg(test)]
impl UpstreamManager {
    /// Build a manager whose entry reports `Connected` with the given tool
    /// catalog but holds no client. Lets catalog-level code be exercised
    /// without a live upstream; calls still fail with `ServerUnavailable`.
    pub(crate) fn stub_connected(name: &str, tools: Vec<Tool>) -> Self {
        let config = McpServerConfig::from_value(name, serde_json::json!({"command": "true"}))
            .expect("stub config");
        let manager = Self::new(vec![config]);
        {
            let slot = manager.slot(name).expect("stub slot");
            let mut state = slot.state.write();
            state.status = ServerStatus::Connected;
            state.tools = tools;
        }
        manager
    }
}
