//! The request/response pipeline behind `/v1/messages`.
//!
//! Resolves the provider from the model id, rotates API keys, applies the
//! transformer chain, dispatches upstream, and routes the response back:
//! non-stream bodies through the incoming body chain, streams through the
//! SSE parser, the incoming stream chain, the agent loop, the usage sink,
//! and the serializer feeding the client connection.

use std::{io, sync::Arc, time::Duration};

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use futures::{stream::BoxStream, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    model::parse_model_id,
    providers::{ProviderHandle, ProviderRegistry},
};
use crate::{
    agent::{tool_loop::INTERNAL_CONTINUE_MARKER, AgentLoopHandler, AgentRegistry, ContinuationDispatcher},
    error::{error_body, RelayError, RelayResult},
    sse::{
        encode_event, response_events, rewrite_stream, rewriter::CompositeHandler, EventSink,
        SseEvent, StreamHandler,
    },
    transform::{HttpRequestParts, TransformerChain, TransformerRegistry},
    usage::UsageCache,
};

/// Buffer size of the channel feeding a client SSE connection.
const SSE_CHANNEL_SIZE: usize = 128;

/// Pipeline timeouts and bounds.
#[derive(Debug, Clone)]
pub struct RouterSettings {
    pub max_tool_rounds: usize,
    pub request_timeout: Duration,
    pub stream_idle_timeout: Duration,
    pub tool_timeout: Duration,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            max_tool_rounds: crate::agent::tool_loop::DEFAULT_MAX_TOOL_ROUNDS,
            request_timeout: Duration::from_secs(120),
            stream_idle_timeout: crate::sse::STREAM_IDLE_TIMEOUT,
            tool_timeout: crate::agent::tool_loop::DEFAULT_TOOL_TIMEOUT,
        }
    }
}

/// A request resolved against a provider, transformed, and ready to send.
struct PreparedRequest {
    parts: HttpRequestParts,
    chain: Arc<TransformerChain>,
    permit: Option<tokio::sync::OwnedSemaphorePermit>,
    provider: String,
    model: String,
}

/// The dispatch layer shared by the HTTP surface and the agent loop.
pub struct Dispatcher {
    providers: Arc<ProviderRegistry>,
    transformers: Arc<TransformerRegistry>,
    agents: Arc<AgentRegistry>,
    usage: Arc<UsageCache>,
    http: reqwest::Client,
    settings: RouterSettings,
}

impl Dispatcher {
    pub fn new(
        providers: Arc<ProviderRegistry>,
        transformers: Arc<TransformerRegistry>,
        agents: Arc<AgentRegistry>,
        usage: Arc<UsageCache>,
        settings: RouterSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            providers,
            transformers,
            agents,
            usage,
            http: reqwest::Client::new(),
            settings,
        })
    }

    pub fn usage_cache(&self) -> &Arc<UsageCache> {
        &self.usage
    }

    // ========================================================================
    // Entry point
    // ========================================================================

    /// Handle one `/v1/messages` request body.
    pub async fn handle_messages(
        self: &Arc<Self>,
        mut body: Value,
        session_id: Option<String>,
    ) -> Response {
        let is_internal = strip_internal_marker(&mut body);
        let is_streaming = body.get("stream").and_then(Value::as_bool).unwrap_or(false);

        if is_streaming {
            self.handle_streaming(body, session_id, is_internal).await
        } else {
            match self.request_non_stream(body, session_id.as_deref()).await {
                Ok((status, value)) => (status, Json(value)).into_response(),
                Err(e) => e.into_response(),
            }
        }
    }

    /// Best-effort token estimate: serialized prompt length / 4 plus a
    /// small per-message overhead.
    pub fn count_tokens(&self, body: &Value) -> Value {
        let mut chars = 0usize;
        let mut blocks = 0usize;

        if let Some(messages) = body.get("messages").and_then(Value::as_array) {
            blocks += messages.len();
            for message in messages {
                if let Some(content) = message.get("content") {
                    chars += json_text_len(content);
                }
            }
        }
        if let Some(system) = body.get("system") {
            chars += json_text_len(system);
        }
        if let Some(tools) = body.get("tools").and_then(Value::as_array) {
            blocks += tools.len();
            for tool in tools {
                chars += tool.to_string().len();
            }
        }

        json!({ "input_tokens": (chars / 4) + blocks * 3 })
    }

    // ========================================================================
    // Non-streaming path
    // ========================================================================

    async fn request_non_stream(
        &self,
        body: Value,
        session_id: Option<&str>,
    ) -> RelayResult<(StatusCode, Value)> {
        let prepared = self.prepare(body).await?;
        let chain = Arc::clone(&prepared.chain);
        let provider = prepared.provider.clone();
        let model = prepared.model.clone();

        let started = std::time::Instant::now();
        let response = self
            .send(prepared, Some(self.settings.request_timeout))
            .await?;
        let status = response.status();
        let text = response.text().await.map_err(RelayError::from)?;

        info!(
            provider = %provider,
            model = %model,
            status = %status,
            streaming = false,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Completed messages request"
        );

        if !status.is_success() {
            // Pass upstream status and body through untouched.
            let value = serde_json::from_str(&text)
                .unwrap_or_else(|_| error_body("upstream-error", &text));
            return Ok((status, value));
        }

        let value: Value = serde_json::from_str(&text)
            .map_err(|e| RelayError::UpstreamNetwork(format!("invalid JSON from upstream: {e}")))?;
        let transformed = chain.apply_response_body(value).await?;

        if let Some(session_id) = session_id {
            if let Some(usage) = transformed.get("usage") {
                if let Ok(usage) = serde_json::from_value(usage.clone()) {
                    self.usage.put(session_id, usage);
                }
            }
        }

        Ok((status, transformed))
    }

    // ========================================================================
    // Streaming path
    // ========================================================================

    async fn handle_streaming(
        self: &Arc<Self>,
        body: Value,
        session_id: Option<String>,
        is_internal: bool,
    ) -> Response {
        let agent_body = (!is_internal && self.wants_agent_loop(&body)).then(|| body.clone());

        let prepared = match self.prepare(body).await {
            Ok(prepared) => prepared,
            // Nothing has streamed yet: plain HTTP errors.
            Err(e) => return e.into_response(),
        };

        let provider = prepared.provider.clone();
        let model = prepared.model.clone();
        let chain = Arc::clone(&prepared.chain);
        let permit = prepared.permit;
        let parts = prepared.parts;

        let response = match self.send_parts(parts, None).await {
            Ok(response) => response,
            Err(e) => {
                warn!(provider = %provider, model = %model, error = %e, "Upstream dispatch failed");
                return sse_error_response(&e);
            }
        };

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            warn!(provider = %provider, model = %model, status = %status, "Upstream stream error");
            return sse_error_response(&RelayError::Upstream {
                status: status.as_u16(),
                body: text,
            });
        }

        info!(provider = %provider, model = %model, streaming = true, "Streaming response started");

        let (tx, rx) = mpsc::channel::<Result<Bytes, io::Error>>(SSE_CHANNEL_SIZE);
        let cancel = CancellationToken::new();
        let sink = EventSink::new(tx, cancel.clone());

        let dispatcher = Arc::clone(self);
        let idle_timeout = self.settings.stream_idle_timeout;
        tokio::spawn(async move {
            let _permit = permit;

            let events = transformed_events(
                response_events(response, idle_timeout),
                Arc::clone(&chain),
                sink.clone(),
            );

            let mut handlers: Vec<Box<dyn StreamHandler>> = vec![Box::new(UsageTap {
                usage: Arc::clone(&dispatcher.usage),
                session_id: session_id.clone(),
            })];
            if let Some(original_body) = agent_body {
                let continuation = Arc::new(ContinuationContext {
                    dispatcher: Arc::clone(&dispatcher),
                    session_id,
                });
                handlers.push(Box::new(AgentLoopHandler::new(
                    Arc::clone(&dispatcher.agents),
                    continuation,
                    original_body,
                    dispatcher.settings.max_tool_rounds,
                    dispatcher.settings.tool_timeout,
                    cancel.clone(),
                )));
            }
            let mut handler = CompositeHandler::new(handlers);

            if let Err(e) = rewrite_stream(events, &mut handler, &sink, &cancel).await {
                warn!(error = %e, "Stream pipeline failed");
                sink.safe_enqueue(&error_event(&e)).await;
            }
        });

        sse_response(Body::from_stream(tokio_stream::wrappers::ReceiverStream::new(rx)))
    }

    /// The agent loop engages when the request declares tools and at least
    /// one of them is handled by a registered agent.
    fn wants_agent_loop(&self, body: &Value) -> bool {
        if self.agents.is_empty() {
            return false;
        }
        let Some(tools) = body.get("tools").and_then(Value::as_array) else {
            return false;
        };
        self.agents.handles_any(
            tools
                .iter()
                .filter_map(|t| t.get("name").and_then(Value::as_str)),
        )
    }

    // ========================================================================
    // Shared preparation and dispatch
    // ========================================================================

    /// Steps 1-4 of the pipeline: resolve provider, rotate key, build and
    /// apply the outgoing transformer chain.
    async fn prepare(&self, mut body: Value) -> RelayResult<PreparedRequest> {
        let model_field = body
            .get("model")
            .and_then(Value::as_str)
            .ok_or_else(|| RelayError::InvalidRequest("missing 'model' field".to_string()))?;
        let model_ref = parse_model_id(model_field)?;

        let handle = self
            .providers
            .get(&model_ref.provider)
            .filter(|h| h.config.enabled)
            .ok_or_else(|| RelayError::UnknownProvider(model_ref.provider.clone()))?;

        let key = handle
            .next_key()
            .ok_or_else(|| RelayError::NoCredentials(model_ref.provider.clone()))?;

        let permit = handle.acquire().await?;

        // Upstream sees the bare model name.
        body["model"] = Value::String(model_ref.model.clone());

        let chain = Arc::new(TransformerChain::build(
            &self.transformers,
            handle.config.transformer.as_ref(),
            &model_ref.model,
        )?);

        let parts = chain
            .apply_outgoing(base_request(&handle, &key, body)?)
            .await?;

        Ok(PreparedRequest {
            parts,
            chain,
            permit,
            provider: model_ref.provider,
            model: model_ref.model,
        })
    }

    async fn send(
        &self,
        prepared: PreparedRequest,
        timeout: Option<Duration>,
    ) -> RelayResult<reqwest::Response> {
        // The permit, if any, covers the upstream call.
        let _permit = prepared.permit;
        self.send_parts(prepared.parts, timeout).await
    }

    async fn send_parts(
        &self,
        parts: HttpRequestParts,
        timeout: Option<Duration>,
    ) -> RelayResult<reqwest::Response> {
        debug!(url = %parts.url, method = %parts.method, "Dispatching upstream");
        let mut request = self
            .http
            .request(parts.method, &parts.url)
            .headers(parts.headers)
            .json(&parts.body);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        request.send().await.map_err(RelayError::from)
    }
}

/// Binds a continuation back-reference to one client request: the
/// dispatch handle plus the session whose usage the continuation rounds
/// keep feeding.
struct ContinuationContext {
    dispatcher: Arc<Dispatcher>,
    session_id: Option<String>,
}

#[async_trait]
impl ContinuationDispatcher for ContinuationContext {
    async fn continuation_stream(
        &self,
        body: Value,
        sink: &EventSink,
    ) -> RelayResult<BoxStream<'static, RelayResult<SseEvent>>> {
        let stream = self.dispatcher.open_continuation(body, sink).await?;

        let Some(session_id) = self.session_id.clone() else {
            return Ok(stream);
        };
        let usage = Arc::clone(&self.dispatcher.usage);
        Ok(stream
            .map(move |item| {
                if let Ok(event) = &item {
                    record_message_delta_usage(event, &usage, &session_id);
                }
                item
            })
            .boxed())
    }
}

impl Dispatcher {
    /// Continuation requests re-enter the pipeline as a direct call; agent
    /// interception is never re-applied because the loop itself consumes
    /// the continuation events.
    async fn open_continuation(
        &self,
        mut body: Value,
        sink: &EventSink,
    ) -> RelayResult<BoxStream<'static, RelayResult<SseEvent>>> {
        strip_internal_marker(&mut body);
        body["stream"] = Value::Bool(true);

        let prepared = self.prepare(body).await?;
        let chain = Arc::clone(&prepared.chain);
        let permit = prepared.permit;

        let response = self.send_parts(prepared.parts, None).await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(RelayError::Upstream {
                status: status.as_u16(),
                body: text,
            });
        }

        let events = transformed_events(
            response_events(response, self.settings.stream_idle_timeout),
            chain,
            sink.clone(),
        );
        Ok(hold_guard(events, permit))
    }
}

// ============================================================================
// Stream helpers
// ============================================================================

/// Map an incoming event stream through the chain's stream hooks
/// (reverse order), dropping swallowed events.
fn transformed_events(
    events: BoxStream<'static, RelayResult<SseEvent>>,
    chain: Arc<TransformerChain>,
    sink: EventSink,
) -> BoxStream<'static, RelayResult<SseEvent>> {
    if chain.is_empty() || !chain.has_stream_hooks() {
        return events;
    }
    events
        .filter_map(move |item| {
            let chain = Arc::clone(&chain);
            let sink = sink.clone();
            async move {
                match item {
                    Ok(event) => match chain.apply_stream_event(event, &sink).await {
                        Ok(Some(event)) => Some(Ok(event)),
                        Ok(None) => None,
                        Err(e) => Some(Err(e)),
                    },
                    Err(e) => Some(Err(e)),
                }
            }
        })
        .boxed()
}

/// Keep `guard` alive for as long as the stream is being consumed.
fn hold_guard<T: Send + 'static>(
    stream: BoxStream<'static, T>,
    guard: impl Send + 'static,
) -> BoxStream<'static, T> {
    futures::stream::unfold((stream, guard), |(mut stream, guard)| async move {
        stream.next().await.map(|item| (item, (stream, guard)))
    })
    .boxed()
}

fn strip_internal_marker(body: &mut Value) -> bool {
    body.as_object_mut()
        .and_then(|map| map.remove(INTERNAL_CONTINUE_MARKER))
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
}

fn json_text_len(value: &Value) -> usize {
    match value {
        Value::String(s) => s.len(),
        _ => value.to_string().len(),
    }
}

fn base_request(
    handle: &ProviderHandle,
    key: &str,
    body: Value,
) -> RelayResult<HttpRequestParts> {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, header::HeaderValue::from_static("application/json"));
    // The provider's own key replaces the client's service key; both
    // common auth header conventions are set so a transformer only has to
    // remove the one its provider rejects.
    let bearer = format!("Bearer {key}")
        .parse()
        .map_err(|_| RelayError::Internal("API key is not a valid header value".to_string()))?;
    headers.insert(header::AUTHORIZATION, bearer);
    let api_key = key
        .parse()
        .map_err(|_| RelayError::Internal("API key is not a valid header value".to_string()))?;
    headers.insert("x-api-key", api_key);

    Ok(HttpRequestParts {
        url: format!(
            "{}/v1/messages",
            handle.config.base_url.trim_end_matches('/')
        ),
        method: http::Method::POST,
        headers,
        body,
    })
}

// ============================================================================
// Response builders
// ============================================================================

fn sse_response(body: Body) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(body)
        .unwrap_or_else(|e| {
            warn!("Failed to build streaming response: {e}");
            RelayError::Internal("failed to build response".to_string()).into_response()
        })
}

fn error_event(error: &RelayError) -> SseEvent {
    SseEvent::named(
        "error",
        json!({
            "type": "error",
            "error": {
                "type": error.error_type(),
                "message": error.to_string(),
            }
        }),
    )
}

/// A one-event SSE stream carrying a synthesized error, for failures after
/// the client asked for a stream.
fn sse_error_response(error: &RelayError) -> Response {
    let bytes = encode_event(&error_event(error));
    sse_response(Body::from(bytes))
}

// ============================================================================
// Usage sink
// ============================================================================

/// Record a `message_delta` event's usage for a session. Other event
/// types never touch the cache.
fn record_message_delta_usage(event: &SseEvent, usage: &UsageCache, session_id: &str) {
    if event.event_type() != Some("message_delta") {
        return;
    }
    let Some(delta_usage) = event.data_json().and_then(|d| d.get("usage")) else {
        return;
    };
    if let Ok(delta) =
        serde_json::from_value::<relay_protocol::MessageDeltaUsage>(delta_usage.clone())
    {
        usage.put(
            session_id,
            relay_protocol::Usage {
                input_tokens: delta.input_tokens.unwrap_or(0),
                output_tokens: delta.output_tokens,
                cache_creation_input_tokens: delta.cache_creation_input_tokens,
                cache_read_input_tokens: delta.cache_read_input_tokens,
            },
        );
    }
}

/// Taps `message_delta` events into the usage cache. Only `message_delta`
/// carries usage on the stream; everything else passes through untouched.
struct UsageTap {
    usage: Arc<UsageCache>,
    session_id: Option<String>,
}

#[async_trait]
impl StreamHandler for UsageTap {
    async fn on_event(
        &mut self,
        event: SseEvent,
        _sink: &EventSink,
    ) -> RelayResult<Option<SseEvent>> {
        if let Some(session_id) = &self.session_id {
            record_message_delta_usage(&event, &self.usage, session_id);
        }
        Ok(Some(event))
    }
}
