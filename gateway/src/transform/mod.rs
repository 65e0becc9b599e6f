//! Named request/response transformers.
//!
//! A transformer is a closed record of up to four optional hooks: rewrite
//! the outgoing request body, rewrite the outgoing HTTP request, transform
//! the incoming (non-stream) response body, and transform the incoming
//! event stream. The registry maps names to factories; providers bind
//! chains of names (globally and per model) in their config.
//!
//! Chains compose symmetrically: outgoing hooks run in array order and
//! incoming hooks run in reverse order, so the innermost transformer sees
//! the wire-most representation on both sides.

mod builtin;

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::{RelayError, RelayResult},
    sse::{EventSink, SseEvent},
};

pub use builtin::register_builtins;

// ============================================================================
// Hook capabilities
// ============================================================================

/// Outgoing HTTP request under construction.
#[derive(Debug, Clone)]
pub struct HttpRequestParts {
    pub url: String,
    pub method: http::Method,
    pub headers: http::HeaderMap,
    pub body: Value,
}

/// Result of an outgoing HTTP rewrite.
pub enum OutgoingAction {
    /// Keep walking the chain.
    Next(HttpRequestParts),
    /// Short-circuit: dispatch this request as-is, skipping the rest of
    /// the outgoing chain.
    Ready(HttpRequestParts),
}

#[async_trait]
pub trait RequestBodyHook: Send + Sync {
    async fn rewrite(&self, body: Value) -> RelayResult<Value>;
}

#[async_trait]
pub trait RequestHttpHook: Send + Sync {
    async fn rewrite(&self, parts: HttpRequestParts) -> RelayResult<OutgoingAction>;
}

#[async_trait]
pub trait ResponseBodyHook: Send + Sync {
    async fn transform(&self, body: Value) -> RelayResult<Value>;
}

#[async_trait]
pub trait ResponseStreamHook: Send + Sync {
    /// Transform one incoming event. `None` swallows the event; the sink
    /// can carry synthesized events.
    async fn on_event(&self, event: SseEvent, sink: &EventSink) -> RelayResult<Option<SseEvent>>;
}

/// A named transformer: a closed record of optional hooks.
#[derive(Clone, Default)]
pub struct Transformer {
    pub name: String,
    pub request_body: Option<Arc<dyn RequestBodyHook>>,
    pub request_http: Option<Arc<dyn RequestHttpHook>>,
    pub response_body: Option<Arc<dyn ResponseBodyHook>>,
    pub response_stream: Option<Arc<dyn ResponseStreamHook>>,
}

impl Transformer {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

impl std::fmt::Debug for Transformer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transformer")
            .field("name", &self.name)
            .field("request_body", &self.request_body.is_some())
            .field("request_http", &self.request_http.is_some())
            .field("response_body", &self.response_body.is_some())
            .field("response_stream", &self.response_stream.is_some())
            .finish()
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Constructs a transformer instance, optionally from per-model options.
pub type TransformerFactory =
    Arc<dyn Fn(Option<&Value>) -> RelayResult<Transformer> + Send + Sync>;

/// Process-wide name -> factory mapping.
#[derive(Default)]
pub struct TransformerRegistry {
    factories: RwLock<HashMap<String, TransformerFactory>>,
}

impl TransformerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, factory: TransformerFactory) {
        self.factories.write().insert(name.into(), factory);
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn build(&self, name: &str, options: Option<&Value>) -> RelayResult<Transformer> {
        let factory = self
            .factories
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| RelayError::Transformer(format!("unknown transformer '{name}'")))?;
        factory(options)
    }
}

// ============================================================================
// Provider bindings
// ============================================================================

/// One entry of a `use` list: either a bare name or `[name, options]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum TransformerUse {
    Name(String),
    Entry(Vec<Value>),
}

impl TransformerUse {
    pub fn name(&self) -> Option<&str> {
        match self {
            TransformerUse::Name(name) => Some(name),
            TransformerUse::Entry(entry) => entry.first().and_then(Value::as_str),
        }
    }

    pub fn options(&self) -> Option<&Value> {
        match self {
            TransformerUse::Name(_) => None,
            TransformerUse::Entry(entry) => entry.get(1),
        }
    }
}

/// Per-model chain extension.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ModelTransformerBinding {
    #[serde(default, rename = "use", skip_serializing_if = "Vec::is_empty")]
    pub use_: Vec<TransformerUse>,
}

/// The `transformer` field of a provider config: a global chain plus
/// per-model chains appended when the bound model matches.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TransformerBinding {
    #[serde(default, rename = "use", skip_serializing_if = "Vec::is_empty")]
    pub use_: Vec<TransformerUse>,

    #[serde(flatten)]
    pub models: HashMap<String, ModelTransformerBinding>,
}

// ============================================================================
// Chain
// ============================================================================

/// The transformer chain built for one request.
#[derive(Default)]
pub struct TransformerChain {
    transformers: Vec<Transformer>,
}

impl std::fmt::Debug for TransformerChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformerChain")
            .field("transformers", &self.transformers.iter().map(|t| &t.name).collect::<Vec<_>>())
            .finish()
    }
}

impl TransformerChain {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_transformers(transformers: Vec<Transformer>) -> Self {
        Self { transformers }
    }

    /// Resolve a provider binding against the registry for one model.
    pub fn build(
        registry: &TransformerRegistry,
        binding: Option<&TransformerBinding>,
        model: &str,
    ) -> RelayResult<Self> {
        let mut uses: Vec<&TransformerUse> = Vec::new();
        if let Some(binding) = binding {
            uses.extend(binding.use_.iter());
            if let Some(model_binding) = binding.models.get(model) {
                uses.extend(model_binding.use_.iter());
            }
        }

        let mut transformers = Vec::with_capacity(uses.len());
        for entry in uses {
            let name = entry.name().ok_or_else(|| {
                RelayError::Transformer("transformer entry is missing a name".to_string())
            })?;
            transformers.push(registry.build(name, entry.options())?);
        }
        Ok(Self { transformers })
    }

    pub fn is_empty(&self) -> bool {
        self.transformers.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.transformers.iter().map(|t| t.name.as_str()).collect()
    }

    /// Whether any transformer carries a stream hook.
    pub fn has_stream_hooks(&self) -> bool {
        self.transformers.iter().any(|t| t.response_stream.is_some())
    }

    /// Outgoing rewrite: body hooks in array order, then HTTP hooks in
    /// array order. A `Ready` return short-circuits the remaining HTTP
    /// hooks.
    pub async fn apply_outgoing(&self, mut parts: HttpRequestParts) -> RelayResult<HttpRequestParts> {
        for transformer in &self.transformers {
            if let Some(hook) = &transformer.request_body {
                parts.body = hook.rewrite(parts.body).await?;
            }
        }
        for transformer in &self.transformers {
            if let Some(hook) = &transformer.request_http {
                match hook.rewrite(parts).await? {
                    OutgoingAction::Next(next) => parts = next,
                    OutgoingAction::Ready(ready) => return Ok(ready),
                }
            }
        }
        Ok(parts)
    }

    /// Incoming non-stream transform, reverse order.
    pub async fn apply_response_body(&self, mut body: Value) -> RelayResult<Value> {
        for transformer in self.transformers.iter().rev() {
            if let Some(hook) = &transformer.response_body {
                body = hook.transform(body).await?;
            }
        }
        Ok(body)
    }

    /// Incoming stream transform, reverse order. A hook swallowing the
    /// event stops the walk.
    pub async fn apply_stream_event(
        &self,
        event: SseEvent,
        sink: &EventSink,
    ) -> RelayResult<Option<SseEvent>> {
        let mut current = event;
        for transformer in self.transformers.iter().rev() {
            if let Some(hook) = &transformer.response_stream {
                match hook.on_event(current, sink).await? {
                    Some(next) => current = next,
                    None => return Ok(None),
                }
            }
        }
        Ok(Some(current))
    }
}
