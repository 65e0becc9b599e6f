//! MCP server configuration types and `${NAME}` substitution.
//!
//! A server config on the wire is a flat JSON object; the transport is
//! detected rather than explicitly tagged: presence of `command` means
//! stdio, otherwise presence of `url` means HTTP (or SSE when `type` says
//! so). Serialization writes the same flat shape back.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{McpError, McpResult};

/// Environment bindings available to `${NAME}` substitution.
///
/// Process environment variables are always visible. `STREAMING_ID` and
/// `MCP_STREAMING_ID` resolve to the per-session id when one is bound.
#[derive(Debug, Clone, Default)]
pub struct EnvContext {
    pub streaming_id: Option<String>,
}

impl EnvContext {
    pub fn for_session(streaming_id: impl Into<String>) -> Self {
        Self {
            streaming_id: Some(streaming_id.into()),
        }
    }

    fn lookup(&self, name: &str) -> Option<String> {
        if name == "STREAMING_ID" || name == "MCP_STREAMING_ID" {
            return self.streaming_id.clone();
        }
        std::env::var(name).ok()
    }

    /// Resolve only the session bindings, leaving every other `${NAME}`
    /// untouched. Used for HTTP header values.
    fn lookup_session_only(&self, name: &str) -> Option<String> {
        if name == "STREAMING_ID" || name == "MCP_STREAMING_ID" {
            return self.streaming_id.clone();
        }
        None
    }
}

/// Substitute `${NAME}` occurrences in `input` against the context.
///
/// Unknown names are left as-is so that config typos surface verbatim in
/// upstream errors instead of silently becoming empty strings.
pub fn substitute(input: &str, ctx: &EnvContext) -> String {
    substitute_with(input, |name| ctx.lookup(name))
}

/// Narrow substitution for header values: only the per-session bindings
/// are resolved, never arbitrary process env.
pub fn substitute_session_only(input: &str, ctx: &EnvContext) -> String {
    substitute_with(input, |name| ctx.lookup_session_only(name))
}

fn substitute_with(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                match lookup(name) {
                    Some(value) => out.push_str(&value),
                    None => {
                        out.push_str("${");
                        out.push_str(name);
                        out.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                return out;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Transport selection for an upstream MCP server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum McpTransport {
    Stdio {
        command: String,
        args: Vec<String>,
        env: HashMap<String, String>,
    },
    Http {
        url: String,
        headers: HashMap<String, String>,
    },
    Sse {
        url: String,
        headers: HashMap<String, String>,
    },
}

/// A configured upstream MCP server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct McpServerConfig {
    pub name: String,
    pub transport: McpTransport,
}

impl McpServerConfig {
    /// Resolve `${NAME}` substitutions, producing the concrete config used
    /// to open a transport. stdio `command`/`args`/`env` values and URLs
    /// get full process-env substitution; HTTP header values only resolve
    /// the per-session bindings.
    pub fn resolved(&self, ctx: &EnvContext) -> Self {
        let transport = match &self.transport {
            McpTransport::Stdio { command, args, env } => McpTransport::Stdio {
                command: substitute(command, ctx),
                args: args.iter().map(|a| substitute(a, ctx)).collect(),
                env: env
                    .iter()
                    .map(|(k, v)| (k.clone(), substitute(v, ctx)))
                    .collect(),
            },
            McpTransport::Http { url, headers } => McpTransport::Http {
                url: substitute(url, ctx),
                headers: headers
                    .iter()
                    .map(|(k, v)| (k.clone(), substitute_session_only(v, ctx)))
                    .collect(),
            },
            McpTransport::Sse { url, headers } => McpTransport::Sse {
                url: substitute(url, ctx),
                headers: headers
                    .iter()
                    .map(|(k, v)| (k.clone(), substitute_session_only(v, ctx)))
                    .collect(),
            },
        };
        Self {
            name: self.name.clone(),
            transport,
        }
    }

    /// Validate URL shape for network transports.
    pub fn validate(&self) -> McpResult<()> {
        match &self.transport {
            McpTransport::Stdio { command, .. } => {
                if command.trim().is_empty() {
                    return Err(McpError::Config(format!(
                        "server '{}': command must not be empty",
                        self.name
                    )));
                }
            }
            McpTransport::Http { url, .. } | McpTransport::Sse { url, .. } => {
                url::Url::parse(url).map_err(|e| {
                    McpError::Config(format!("server '{}': invalid url: {e}", self.name))
                })?;
            }
        }
        Ok(())
    }
}

// Flat wire shape. `type` is only consulted to distinguish SSE from
// streamable HTTP; the stdio/network split comes from which fields are set.
#[derive(Debug, Default, Serialize, Deserialize)]
struct RawServerConfig {
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    args: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    url: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    headers: HashMap<String, String>,
}

impl McpServerConfig {
    /// Parse a named server from its flat JSON value.
    pub fn from_value(name: &str, value: serde_json::Value) -> McpResult<Self> {
        let raw: RawServerConfig = serde_json::from_value(value)
            .map_err(|e| McpError::Config(format!("server '{name}': {e}")))?;
        Self::from_raw(name.to_string(), raw)
    }

    fn from_raw(name: String, raw: RawServerConfig) -> McpResult<Self> {
        let transport = if let Some(command) = raw.command {
            McpTransport::Stdio {
                command,
                args: raw.args,
                env: raw.env,
            }
        } else if let Some(url) = raw.url {
            let explicit_sse = raw.kind.as_deref() == Some("sse")
                || url.trim_end_matches('/').ends_with("/sse");
            if explicit_sse {
                McpTransport::Sse {
                    url,
                    headers: raw.headers,
                }
            } else {
                McpTransport::Http {
                    url,
                    headers: raw.headers,
                }
            }
        } else {
            return Err(McpError::Config(format!(
                "server '{name}': either command or url is required"
            )));
        };

        let config = Self { name, transport };
        config.validate()?;
        Ok(config)
    }

    /// Serialize back to the flat wire shape (without the name).
    pub fn to_value(&self) -> serde_json::Value {
        let raw = match &self.transport {
            McpTransport::Stdio { command, args, env } => RawServerConfig {
                command: Some(command.clone()),
                args: args.clone(),
                env: env.clone(),
                ..RawServerConfig::default()
            },
            McpTransport::Http { url, headers } => RawServerConfig {
                url: Some(url.clone()),
                headers: headers.clone(),
                ..RawServerConfig::default()
            },
            McpTransport::Sse { url, headers } => RawServerConfig {
                kind: Some("sse".to_string()),
                url: Some(url.clone()),
                headers: headers.clone(),
                ..RawServerConfig::default()
            },
        };
        serde_json::to_value(raw).unwrap_or(serde_json::Value::Null)
    }
}

impl Serialize for McpServerConfig {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut value = self.to_value();
        if let serde_json::Value::Object(map) = &mut value {
            map.insert(
                "name".to_string(),
                serde_json::Value::String(self.name.clone()),
            );
        }
        value.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for McpServerConfig {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawServerConfig::deserialize(deserializer)?;
        let name = raw
            .name
            .clone()
            .ok_or_else(|| serde::de::Error::missing_field("name"))?;
        Self::from_raw(name, raw).map_err(serde::de::Error::custom)
    }
}
