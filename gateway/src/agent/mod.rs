//! Local agents: tool handlers the gateway executes on the model's behalf.
//!
//! An agent registers one tool handler per tool name. When an assistant
//! stream emits a `tool_use` block bound to a registered name, the tool
//! loop intercepts it, runs the handler, and continues the conversation
//! with the result appended.

pub mod lenient;
pub mod tool_loop;

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use futures::stream::BoxStream;
use parking_lot::RwLock;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::{
    error::RelayResult,
    sse::{EventSink, SseEvent},
};

pub use tool_loop::AgentLoopHandler;

/// One locally-registered tool handler.
#[async_trait]
pub trait AgentTool: Send + Sync {
    /// The tool name this handler intercepts.
    fn name(&self) -> &str;

    /// Run the tool. The token is cancelled when the client disconnects.
    async fn execute(&self, input: Value, cancel: CancellationToken) -> RelayResult<Value>;
}

/// Process-wide tool name -> handler mapping.
#[derive(Default)]
pub struct AgentRegistry {
    tools: RwLock<HashMap<String, Arc<dyn AgentTool>>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, tool: Arc<dyn AgentTool>) {
        self.tools.write().insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn AgentTool>> {
        self.tools.read().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.tools.read().is_empty()
    }

    /// Whether any of the given tool names is handled locally.
    pub fn handles_any<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> bool {
        let tools = self.tools.read();
        names.into_iter().any(|n| tools.contains_key(n))
    }
}

/// Issues continuation requests back into the dispatch layer.
///
/// The tool loop holds this instead of the router itself, so continuation
/// is a direct function call that never re-enters agent interception.
#[async_trait]
pub trait ContinuationDispatcher: Send + Sync {
    /// Dispatch a continuation body (`stream: true`) and return the
    /// incoming event stream with the provider's transformer chain already
    /// applied. Synthesized chain events go through `sink`.
    async fn continuation_stream(
        &self,
        body: Value,
        sink: &EventSink,
    ) -> RelayResult<BoxStream<'static, RelayResult<SseEvent>>>;
}
