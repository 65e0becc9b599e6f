//! Gateway configuration: the config document, validation, and the shared
//! mutable state the admin API operates on.
//!
//! Admin writes take the writer lock, validate a full replacement
//! snapshot, publish it atomically with a bumped version stamp, and
//! optionally persist the document. Readers clone the current `Arc` and
//! never block.

use std::{
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    sync::Arc,
};

use parking_lot::RwLock;
use relay_mcp::McpServerConfig;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    error::{RelayError, RelayResult},
    transform::TransformerBinding,
};

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 3457;

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_max_tool_rounds() -> usize {
    crate::agent::tool_loop::DEFAULT_MAX_TOOL_ROUNDS
}

fn default_queue_depth() -> usize {
    32
}

fn default_usage_cache_capacity() -> usize {
    crate::usage::DEFAULT_CAPACITY
}

/// One upstream LLM provider.
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    pub name: String,

    pub base_url: String,

    #[serde(default)]
    pub api_keys: Vec<String>,

    #[serde(default)]
    pub models: Vec<String>,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub sort: i32,

    /// Global and per-model transformer chains.
    pub transformer: Option<TransformerBinding>,

    /// Optional cap on concurrent in-flight requests.
    pub limit: Option<usize>,
}

impl ProviderConfig {
    pub fn validate(&self) -> RelayResult<()> {
        if self.name.trim().is_empty() {
            return Err(RelayError::InvalidRequest(
                "provider name must not be empty".to_string(),
            ));
        }
        if self.base_url.trim().is_empty() {
            return Err(RelayError::InvalidRequest(format!(
                "provider '{}': baseUrl must not be empty",
                self.name
            )));
        }
        if self.enabled && self.api_keys.is_empty() {
            return Err(RelayError::InvalidRequest(format!(
                "provider '{}': apiKeys must not be empty while enabled",
                self.name
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for model in &self.models {
            if !seen.insert(model.as_str()) {
                return Err(RelayError::InvalidRequest(format!(
                    "provider '{}': duplicate model '{model}'",
                    self.name
                )));
            }
        }
        if self.limit == Some(0) {
            return Err(RelayError::InvalidRequest(format!(
                "provider '{}': limit must be at least 1",
                self.name
            )));
        }
        Ok(())
    }
}

/// The full config document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Shared bearer token; unset disables auth.
    pub apikey: Option<String>,

    pub providers: Vec<ProviderConfig>,

    pub mcp_servers: Vec<McpServerConfig>,

    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: usize,

    /// Requests queued per provider beyond its `limit` before 429.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,

    #[serde(default = "default_usage_cache_capacity")]
    pub usage_cache_capacity: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            apikey: None,
            providers: Vec::new(),
            mcp_servers: Vec::new(),
            max_tool_rounds: default_max_tool_rounds(),
            queue_depth: default_queue_depth(),
            usage_cache_capacity: default_usage_cache_capacity(),
        }
    }
}

impl AppConfig {
    pub fn validate(&self) -> RelayResult<()> {
        let mut names = std::collections::HashSet::new();
        for provider in &self.providers {
            provider.validate()?;
            if !names.insert(provider.name.as_str()) {
                return Err(RelayError::InvalidRequest(format!(
                    "duplicate provider '{}'",
                    provider.name
                )));
            }
        }
        let mut servers = std::collections::HashSet::new();
        for server in &self.mcp_servers {
            server
                .validate()
                .map_err(|e| RelayError::InvalidRequest(e.to_string()))?;
            if !servers.insert(server.name.as_str()) {
                return Err(RelayError::InvalidRequest(format!(
                    "duplicate MCP server '{}'",
                    server.name
                )));
            }
        }
        if self.max_tool_rounds == 0 {
            return Err(RelayError::InvalidRequest(
                "maxToolRounds must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn load(path: &Path) -> RelayResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| RelayError::Internal(format!("read config {}: {e}", path.display())))?;
        let config: AppConfig = serde_json::from_str(&raw)
            .map_err(|e| RelayError::InvalidRequest(format!("parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> RelayResult<()> {
        let raw = serde_json::to_string_pretty(self)
            .map_err(|e| RelayError::Internal(format!("serialize config: {e}")))?;
        std::fs::write(path, raw)
            .map_err(|e| RelayError::Internal(format!("write config {}: {e}", path.display())))
    }
}

/// Shared, versioned config state.
pub struct ConfigState {
    path: Option<PathBuf>,
    current: RwLock<Arc<AppConfig>>,
    version: AtomicU64,
    needs_restart: AtomicBool,
}

impl ConfigState {
    pub fn new(config: AppConfig, path: Option<PathBuf>) -> Self {
        Self {
            path,
            current: RwLock::new(Arc::new(config)),
            version: AtomicU64::new(1),
            needs_restart: AtomicBool::new(false),
        }
    }

    pub fn snapshot(&self) -> Arc<AppConfig> {
        Arc::clone(&self.current.read())
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub fn needs_restart(&self) -> bool {
        self.needs_restart.load(Ordering::Acquire)
    }

    pub fn set_needs_restart(&self) {
        self.needs_restart.store(true, Ordering::Release);
    }

    /// Validate, publish, persist. Returns the new version stamp.
    pub fn replace(&self, config: AppConfig) -> RelayResult<u64> {
        config.validate()?;
        let mut guard = self.current.write();
        *guard = Arc::new(config);
        let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;
        self.persist(&guard);
        Ok(version)
    }

    /// Apply a delta to a snapshot of the current config and publish the
    /// result atomically.
    pub fn mutate(&self, apply: impl FnOnce(&mut AppConfig)) -> RelayResult<u64> {
        let mut guard = self.current.write();
        let mut next = (**guard).clone();
        apply(&mut next);
        next.validate()?;
        *guard = Arc::new(next);
        let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;
        self.persist(&guard);
        Ok(version)
    }

    fn persist(&self, config: &Arc<AppConfig>) {
        let Some(path) = &self.path else { return };
        match config.save(path) {
            Ok(()) => info!(path = %path.display(), "Config persisted"),
            Err(e) => warn!(error = %e, "Failed to persist config"),
        }
    }
}
