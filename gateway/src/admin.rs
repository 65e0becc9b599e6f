//! Admin API: provider and MCP server CRUD, config document access, and
//! the restart signal.
//!
//! Mutations apply to the live registries where they can (provider edits,
//! MCP server edits) and always persist through the config state; a full
//! config replacement additionally raises `needsRestart` since listener
//! settings cannot change in place.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use relay_mcp::{McpError, McpServerConfig};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::{
    config::{AppConfig, ProviderConfig},
    error::{error_body, RelayError},
    server::AppState,
};

fn mcp_error_response(e: McpError) -> Response {
    let status = match &e {
        McpError::ServerNotFound(_) | McpError::SessionNotFound(_) => StatusCode::NOT_FOUND,
        McpError::Config(_) | McpError::InvalidArguments(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::BAD_GATEWAY,
    };
    (status, Json(error_body("mcp-upstream-unavailable", &e.to_string()))).into_response()
}

// ============================================================================
// Providers
// ============================================================================

pub async fn list_providers(State(state): State<AppState>) -> Json<Vec<ProviderConfig>> {
    Json(state.providers.list())
}

pub async fn create_provider(
    State(state): State<AppState>,
    Json(config): Json<ProviderConfig>,
) -> Response {
    if state.providers.get(&config.name).is_some() {
        return RelayError::InvalidRequest(format!("provider '{}' already exists", config.name))
            .into_response();
    }
    if let Err(e) = state.providers.upsert(config.clone()) {
        return e.into_response();
    }
    persist_providers(&state);
    info!(provider = %config.name, "Provider created");
    (StatusCode::CREATED, Json(config)).into_response()
}

pub async fn update_provider(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(mut config): Json<ProviderConfig>,
) -> Response {
    if state.providers.get(&name).is_none() {
        return RelayError::UnknownProvider(name).into_response();
    }
    config.name = name.clone();
    if let Err(e) = state.providers.upsert(config.clone()) {
        return e.into_response();
    }
    persist_providers(&state);
    info!(provider = %name, "Provider updated");
    Json(config).into_response()
}

pub async fn delete_provider(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    if !state.providers.remove(&name) {
        return RelayError::UnknownProvider(name).into_response();
    }
    persist_providers(&state);
    info!(provider = %name, "Provider deleted");
    Json(json!({"ok": true})).into_response()
}

#[derive(Debug, Deserialize)]
pub struct ToggleRequest {
    pub name: String,
    pub enabled: bool,
}

pub async fn toggle_provider(
    State(state): State<AppState>,
    Json(toggle): Json<ToggleRequest>,
) -> Response {
    match state.providers.set_enabled(&toggle.name, toggle.enabled) {
        Ok(true) => {
            persist_providers(&state);
            info!(provider = %toggle.name, enabled = toggle.enabled, "Provider toggled");
            Json(json!({"ok": true})).into_response()
        }
        Ok(false) => RelayError::UnknownProvider(toggle.name).into_response(),
        Err(e) => e.into_response(),
    }
}

/// Mirror the live provider registry back into the persisted document.
fn persist_providers(state: &AppState) {
    let providers = state.providers.list();
    let _ = state.config.mutate(|config| config.providers = providers);
}

// ============================================================================
// Config document
// ============================================================================

pub async fn get_config(State(state): State<AppState>) -> Json<Value> {
    let snapshot = state.config.snapshot();
    Json(json!({
        "config": &*snapshot,
        "version": state.config.version(),
        "needsRestart": state.config.needs_restart(),
    }))
}

pub async fn replace_config(
    State(state): State<AppState>,
    Json(config): Json<AppConfig>,
) -> Response {
    let providers = config.providers.clone();
    let version = match state.config.replace(config) {
        Ok(version) => version,
        Err(e) => return e.into_response(),
    };
    // Providers can follow the new document live; listener settings and
    // MCP transports wait for the restart.
    if let Err(e) = state.providers.replace_all(providers) {
        return e.into_response();
    }
    state.config.set_needs_restart();
    info!(version, "Config document replaced");
    Json(json!({"ok": true, "version": version, "needsRestart": true})).into_response()
}

pub async fn restart(State(state): State<AppState>) -> Json<Value> {
    info!("Restart requested via admin API");
    let _ = state.restart.send(true);
    Json(json!({"ok": true}))
}

pub async fn list_transformers(State(state): State<AppState>) -> Json<Value> {
    Json(json!({"transformers": state.transformers.names()}))
}

// ============================================================================
// MCP servers
// ============================================================================

pub async fn list_mcp_servers(State(state): State<AppState>) -> Json<Value> {
    Json(json!({"servers": state.mcp.list_servers()}))
}

pub async fn create_mcp_server(
    State(state): State<AppState>,
    Json(config): Json<McpServerConfig>,
) -> Response {
    let name = config.name.clone();
    if let Err(e) = state.mcp.add_server(config.clone()).await {
        // Config-level failures abort; a connect failure leaves the entry
        // registered in error state, matching startup behavior.
        if matches!(e, McpError::Config(_)) {
            return mcp_error_response(e);
        }
    }
    persist_mcp_servers(&state);
    info!(server = %name, "MCP server created");
    match state.mcp.get_server(&name) {
        Some(entry) => (StatusCode::CREATED, Json(entry)).into_response(),
        None => (StatusCode::CREATED, Json(json!({"name": name}))).into_response(),
    }
}

pub async fn get_mcp_server(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    match state.mcp.get_server(&name) {
        Some(entry) => Json(entry).into_response(),
        None => mcp_error_response(McpError::ServerNotFound(name)),
    }
}

pub async fn update_mcp_server(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(value): Json<Value>,
) -> Response {
    let config = match McpServerConfig::from_value(&name, value) {
        Ok(config) => config,
        Err(e) => return mcp_error_response(e),
    };
    if let Err(e) = state.mcp.update_server(config).await {
        if matches!(e, McpError::ServerNotFound(_) | McpError::Config(_)) {
            return mcp_error_response(e);
        }
    }
    persist_mcp_servers(&state);
    info!(server = %name, "MCP server updated");
    match state.mcp.get_server(&name) {
        Some(entry) => Json(entry).into_response(),
        None => Json(json!({"name": name})).into_response(),
    }
}

pub async fn delete_mcp_server(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Response {
    if let Err(e) = state.mcp.remove_server(&name).await {
        return mcp_error_response(e);
    }
    persist_mcp_servers(&state);
    info!(server = %name, "MCP server deleted");
    Json(json!({"ok": true})).into_response()
}

pub async fn get_mcp_tools(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    match state.mcp.get_tools(&name) {
        Ok(tools) => match serde_json::to_value(&tools) {
            Ok(tools) => Json(json!({"tools": tools})).into_response(),
            Err(e) => RelayError::Internal(e.to_string()).into_response(),
        },
        Err(e) => mcp_error_response(e),
    }
}

pub async fn refresh_mcp_tools(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Response {
    match state.mcp.refresh_tools(&name).await {
        Ok(tools) => match serde_json::to_value(&tools) {
            Ok(tools) => Json(json!({"tools": tools})).into_response(),
            Err(e) => RelayError::Internal(e.to_string()).into_response(),
        },
        Err(e) => mcp_error_response(e),
    }
}

fn persist_mcp_servers(state: &AppState) {
    let servers: Vec<McpServerConfig> = state
        .mcp
        .list_servers()
        .into_iter()
        .filter_map(|entry| {
            let mut value = entry.config;
            if let Some(map) = value.as_object_mut() {
                map.insert("name".to_string(), json!(entry.name));
            }
            serde_json::from_value(value).ok()
        })
        .collect();
    let _ = state.config.mutate(|config| config.mcp_servers = servers);
}
