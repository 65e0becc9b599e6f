//! Anthropic Messages API protocol definitions
//!
//! Rust types for the `/v1/messages` dialect spoken by clients of the relay.
//! See: https://docs.anthropic.com/en/api/messages

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Request Types
// ============================================================================

/// Request to create a message using the Anthropic Messages API.
///
/// This is the main request type for the `/v1/messages` endpoint.
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateMessageRequest {
    /// The model that will complete the prompt.
    ///
    /// Clients of the relay address models as `"<provider>,<model>"`.
    pub model: String,

    /// Input messages for the conversation.
    pub messages: Vec<InputMessage>,

    /// The maximum number of tokens to generate before stopping.
    pub max_tokens: Option<u32>,

    /// An object describing metadata about the request.
    pub metadata: Option<Metadata>,

    /// Custom text sequences that will cause the model to stop generating.
    pub stop_sequences: Option<Vec<String>>,

    /// Whether to incrementally stream the response using server-sent events.
    pub stream: Option<bool>,

    /// System prompt for providing context and instructions.
    pub system: Option<SystemContent>,

    /// Amount of randomness injected into the response (0.0 to 1.0).
    pub temperature: Option<f64>,

    /// Configuration for extended thinking.
    pub thinking: Option<ThinkingConfig>,

    /// How the model should use the provided tools.
    pub tool_choice: Option<ToolChoice>,

    /// Definitions of tools that the model may use.
    pub tools: Option<Vec<Tool>>,

    /// Only sample from the top K options for each subsequent token.
    pub top_k: Option<u32>,

    /// Use nucleus sampling.
    pub top_p: Option<f64>,
}

impl CreateMessageRequest {
    pub fn is_streaming(&self) -> bool {
        self.stream.unwrap_or(false)
    }

    /// Names of all custom tools declared on the request.
    pub fn tool_names(&self) -> Vec<&str> {
        self.tools
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(|t| t.name.as_str())
            .collect()
    }
}

/// Request metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    /// An external identifier for the user associated with the request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// System content can be a string or an array of text blocks
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SystemContent {
    String(String),
    Blocks(Vec<TextBlock>),
}

/// Extended thinking configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ThinkingConfig {
    Enabled { budget_tokens: u32 },
    Disabled,
}

/// A single input message in a conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputMessage {
    /// The role of the message sender (user or assistant)
    pub role: Role,

    /// The content of the message
    pub content: InputContent,
}

/// Role of a message sender
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Input content can be a string or an array of content blocks
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputContent {
    String(String),
    Blocks(Vec<InputContentBlock>),
}

// ============================================================================
// Input Content Blocks
// ============================================================================

/// Input content block types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputContentBlock {
    /// Text content
    Text(TextBlock),
    /// Image content
    Image(ImageBlock),
    /// Tool use block (for assistant messages)
    ToolUse(ToolUseBlock),
    /// Tool result block (for user messages)
    ToolResult(ToolResultBlock),
    /// Thinking block
    Thinking(ThinkingBlock),
    /// Redacted thinking block
    RedactedThinking(RedactedThinkingBlock),
}

/// Text content block
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextBlock {
    /// The text content
    pub text: String,
}

/// Image content block
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageBlock {
    /// The image source
    pub source: ImageSource,
}

/// Image source (base64 or URL)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ImageSource {
    Base64 { media_type: String, data: String },
    Url { url: String },
}

/// Tool use block (in assistant messages)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolUseBlock {
    /// Unique identifier for this tool use
    pub id: String,

    /// Name of the tool being used
    pub name: String,

    /// Input arguments for the tool
    pub input: Value,
}

/// Tool result block (in user messages)
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResultBlock {
    /// The ID of the tool use this is a result for
    pub tool_use_id: String,

    /// The result content (string or blocks)
    pub content: Option<ToolResultContent>,

    /// Whether this result indicates an error
    pub is_error: Option<bool>,
}

/// Tool result content (string or blocks)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolResultContent {
    String(String),
    Blocks(Vec<TextBlock>),
}

/// Thinking block
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThinkingBlock {
    /// The thinking content
    pub thinking: String,

    /// Signature for the thinking block
    pub signature: String,
}

/// Redacted thinking block
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedactedThinkingBlock {
    /// The encrypted/redacted data
    pub data: String,
}

// ============================================================================
// Tool Definitions
// ============================================================================

/// Tool definition
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    /// Name of the tool
    pub name: String,

    /// Description of what this tool does
    pub description: Option<String>,

    /// JSON schema for the tool's input
    pub input_schema: InputSchema,
}

/// JSON Schema for tool input
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputSchema {
    #[serde(rename = "type")]
    pub schema_type: String,

    pub properties: Option<HashMap<String, Value>>,

    pub required: Option<Vec<String>>,

    /// Additional schema keywords are preserved here
    #[serde(flatten)]
    pub additional: HashMap<String, Value>,
}

impl InputSchema {
    /// An empty `{"type": "object"}` schema.
    pub fn empty_object() -> Self {
        Self {
            schema_type: "object".to_string(),
            properties: None,
            required: None,
            additional: HashMap::new(),
        }
    }
}

/// How the model should use the provided tools
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolChoice {
    Auto {
        #[serde(skip_serializing_if = "Option::is_none")]
        disable_parallel_tool_use: Option<bool>,
    },
    Any,
    Tool {
        name: String,
    },
    None,
}

// ============================================================================
// Response Types
// ============================================================================

/// Response message from the API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique object identifier
    pub id: String,

    /// Object type (always "message")
    #[serde(rename = "type")]
    pub message_type: String,

    /// Conversational role (always "assistant")
    pub role: String,

    /// Content generated by the model
    pub content: Vec<ContentBlock>,

    /// The model that generated the message
    pub model: String,

    /// The reason the model stopped generating
    pub stop_reason: Option<StopReason>,

    /// Which custom stop sequence was generated (if any)
    pub stop_sequence: Option<String>,

    /// Billing and rate-limit usage
    pub usage: Usage,
}

/// Output content block types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Text content
    Text { text: String },
    /// Tool use by the model
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    /// Thinking content
    Thinking { thinking: String, signature: String },
    /// Redacted thinking content
    RedactedThinking { data: String },
}

/// Stop reasons
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The model reached a natural stopping point
    EndTurn,
    /// The requested max_tokens was exceeded
    MaxTokens,
    /// One of the custom stop_sequences was generated
    StopSequence,
    /// The model invoked one or more tools
    ToolUse,
    /// Streaming classifiers intervened
    Refusal,
}

/// Billing and rate-limit usage
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    /// The number of input tokens used
    pub input_tokens: u32,

    /// The number of output tokens used
    pub output_tokens: u32,

    /// The number of input tokens used to create the cache entry
    pub cache_creation_input_tokens: Option<u32>,

    /// The number of input tokens read from the cache
    pub cache_read_input_tokens: Option<u32>,
}

// ============================================================================
// Streaming Event Types
// ============================================================================

/// Server-sent event payloads on a streaming `/v1/messages` response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageStreamEvent {
    /// Start of a new message
    MessageStart { message: Message },
    /// Update to a message
    MessageDelta {
        delta: MessageDelta,
        usage: MessageDeltaUsage,
    },
    /// End of a message
    MessageStop,
    /// Start of a content block
    ContentBlockStart {
        index: u32,
        content_block: ContentBlock,
    },
    /// Update to a content block
    ContentBlockDelta {
        index: u32,
        delta: ContentBlockDelta,
    },
    /// End of a content block
    ContentBlockStop { index: u32 },
    /// Ping event (for keep-alive)
    Ping,
    /// Error event
    Error { error: ErrorResponse },
}

/// Message delta for streaming updates
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageDelta {
    pub stop_reason: Option<StopReason>,

    pub stop_sequence: Option<String>,
}

/// Usage delta for streaming updates
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageDeltaUsage {
    pub output_tokens: u32,

    pub input_tokens: Option<u32>,

    pub cache_creation_input_tokens: Option<u32>,

    pub cache_read_input_tokens: Option<u32>,
}

/// Content block delta for streaming updates
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlockDelta {
    /// Text delta
    TextDelta { text: String },
    /// JSON input delta (for tool use)
    InputJsonDelta { partial_json: String },
    /// Thinking delta
    ThinkingDelta { thinking: String },
    /// Signature delta
    SignatureDelta { signature: String },
}

// ============================================================================
// Error Types
// ============================================================================

/// Error payload carried in error responses and synthesized `error` events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    #[serde(rename = "type")]
    pub error_type: String,

    pub message: String,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_request_roundtrip_string_content() {
        let req: CreateMessageRequest = serde_json::from_value(json!({
            "model": "openai,gpt-4o-mini",
            "max_tokens": 256,
            "messages": [{"role": "user", "content": "ping"}]
        }))
        .unwrap();

        assert_eq!(req.model, "openai,gpt-4o-mini");
        assert_eq!(req.messages.len(), 1);
        assert_eq!(req.messages[0].role, Role::User);
        match &req.messages[0].content {
            InputContent::String(s) => assert_eq!(s, "ping"),
            _ => panic!("expected string content"),
        }
    }

    #[test]
    fn test_tool_use_block_parses() {
        let block: InputContentBlock = serde_json::from_value(json!({
            "type": "tool_use",
            "id": "toolu_01",
            "name": "current_time",
            "input": {}
        }))
        .unwrap();

        match block {
            InputContentBlock::ToolUse(t) => {
                assert_eq!(t.id, "toolu_01");
                assert_eq!(t.name, "current_time");
            }
            _ => panic!("expected tool_use"),
        }
    }

    #[test]
    fn test_stream_event_tagging() {
        let event: MessageStreamEvent = serde_json::from_value(json!({
            "type": "content_block_delta",
            "index": 0,
            "delta": {"type": "input_json_delta", "partial_json": "{\"a\":"}
        }))
        .unwrap();

        match event {
            MessageStreamEvent::ContentBlockDelta { index, delta } => {
                assert_eq!(index, 0);
                match delta {
                    ContentBlockDelta::InputJsonDelta { partial_json } => {
                        assert_eq!(partial_json, "{\"a\":");
                    }
                    _ => panic!("expected input_json_delta"),
                }
            }
            _ => panic!("expected content_block_delta"),
        }
    }

    #[test]
    fn test_usage_optional_cache_fields_omitted() {
        let usage = Usage {
            input_tokens: 1,
            output_tokens: 2,
            ..Usage::default()
        };
        let v = serde_json::to_value(&usage).unwrap();
        assert!(v.get("cache_creation_input_tokens").is_none());
    }

    #[test]
    fn test_stop_reason_wire_names() {
        assert_eq!(
            serde_json::to_value(StopReason::ToolUse).unwrap(),
            json!("tool_use")
        );
        assert_eq!(
            serde_json::to_value(StopReason::EndTurn).unwrap(),
            json!("end_turn")
        );
    }
}
