//! Built-in transformers registered at startup.
//!
//! - `anthropic`: stamps the `anthropic-version` header on the outgoing
//!   request; the body already speaks the native dialect.
//! - `openai`: bridges the Messages dialect to an OpenAI-style responses
//!   endpoint (`messages` -> `input`, `max_tokens` -> `max_output_tokens`
//!   outgoing; `output` -> `content` incoming).
//! - `max-tokens`: clamps `max_tokens` to a configured ceiling, option
//!   `{"max": N}`.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::{
    HttpRequestParts, OutgoingAction, RequestBodyHook, RequestHttpHook, ResponseBodyHook,
    Transformer, TransformerRegistry,
};
use crate::error::{RelayError, RelayResult};

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub fn register_builtins(registry: &TransformerRegistry) {
    registry.register("anthropic", Arc::new(|_| Ok(anthropic())));
    registry.register("openai", Arc::new(|_| Ok(openai())));
    registry.register("max-tokens", Arc::new(|options| max_tokens(options)));
}

// ============================================================================
// anthropic
// ============================================================================

struct AnthropicVersionHeader;

#[async_trait]
impl RequestHttpHook for AnthropicVersionHeader {
    async fn rewrite(&self, mut parts: HttpRequestParts) -> RelayResult<OutgoingAction> {
        parts.headers.insert(
            "anthropic-version",
            http::HeaderValue::from_static(ANTHROPIC_VERSION),
        );
        Ok(OutgoingAction::Next(parts))
    }
}

fn anthropic() -> Transformer {
    let mut t = Transformer::named("anthropic");
    t.request_http = Some(Arc::new(AnthropicVersionHeader));
    t
}

// ============================================================================
// openai
// ============================================================================

struct OpenAiRequest;

#[async_trait]
impl RequestBodyHook for OpenAiRequest {
    async fn rewrite(&self, mut body: Value) -> RelayResult<Value> {
        let Some(map) = body.as_object_mut() else {
            return Err(RelayError::Transformer(
                "openai: request body is not an object".to_string(),
            ));
        };
        if let Some(messages) = map.remove("messages") {
            map.insert("input".to_string(), messages);
        }
        if let Some(max_tokens) = map.remove("max_tokens") {
            map.insert("max_output_tokens".to_string(), max_tokens);
        }
        Ok(body)
    }
}

struct OpenAiResponse;

#[async_trait]
impl ResponseBodyHook for OpenAiResponse {
    async fn transform(&self, mut body: Value) -> RelayResult<Value> {
        let Some(map) = body.as_object_mut() else {
            return Ok(body);
        };
        if let Some(output) = map.remove("output") {
            map.insert("content".to_string(), output);
        }
        Ok(body)
    }
}

fn openai() -> Transformer {
    let mut t = Transformer::named("openai");
    t.request_body = Some(Arc::new(OpenAiRequest));
    t.response_body = Some(Arc::new(OpenAiResponse));
    t
}

// ============================================================================
// max-tokens
// ============================================================================

struct MaxTokensClamp {
    max: u64,
}

#[async_trait]
impl RequestBodyHook for MaxTokensClamp {
    async fn rewrite(&self, mut body: Value) -> RelayResult<Value> {
        if let Some(map) = body.as_object_mut() {
            let requested = map.get("max_tokens").and_then(Value::as_u64);
            match requested {
                Some(n) if n > self.max => {
                    map.insert("max_tokens".to_string(), Value::from(self.max));
                }
                None => {
                    map.insert("max_tokens".to_string(), Value::from(self.max));
                }
                _ => {}
            }
        }
        Ok(body)
    }
}

fn max_tokens(options: Option<&Value>) -> RelayResult<Transformer> {
    let max = options
        .and_then(|o| o.get("max"))
        .and_then(Value::as_u64)
        .ok_or_else(|| {
            RelayError::Transformer("max-tokens requires options {\"max\": N}".to_string())
        })?;

    let mut t = Transformer::named("max-tokens");
    t.request_body = Some(Arc::new(MaxTokensClamp { max }));
    Ok(t)
}
