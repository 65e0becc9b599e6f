//! llm-relay: a local-host router between LLM clients, upstream provider
//! APIs, and MCP tool servers.
//!
//! Clients speak a single Anthropic-flavored `/v1/messages` dialect; the
//! relay picks the upstream from the `"<provider>,<model>"` model id,
//! rewrites requests and responses through named transformer chains,
//! executes locally-registered tool handlers mid-stream, and multiplexes
//! upstream MCP tool catalogs behind per-group SSE endpoints.

pub mod admin;
pub mod agent;
pub mod auth;
pub mod config;
pub mod error;
pub mod router;
pub mod server;
pub mod sse;
pub mod transform;
pub mod usage;

pub use config::{AppConfig, ConfigState, ProviderConfig};
pub use error::{RelayError, RelayResult};
pub use router::{Dispatcher, ProviderRegistry, RouterSettings};
pub use server::{build_router, AppState};
pub use transform::{Transformer, TransformerChain, TransformerRegistry};
pub use usage::UsageCache;
