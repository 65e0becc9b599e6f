//! The tool interception loop.
//!
//! Wraps a streaming `/v1/messages` response. Tool-use blocks bound to a
//! registered agent are captured while their events pass through to the
//! client untouched; when a block completes, its handler runs in its own
//! task so other events are never blocked. Once the upstream turn ends
//! with collected results, the loop re-issues the request with the tool
//! results appended and forwards the continuation stream (minus
//! `message_start`/`message_stop`) to the same client connection.

use std::{collections::HashMap, sync::Arc, time::Duration};

use futures::StreamExt;
use relay_protocol::{InputContentBlock, ToolResultBlock, ToolResultContent, ToolUseBlock};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{lenient::parse_lenient, AgentRegistry, ContinuationDispatcher};
use crate::{
    error::{RelayError, RelayResult},
    sse::{EventSink, SseEvent, StreamHandler},
};

/// Default bound on continuation rounds per original request.
pub const DEFAULT_MAX_TOOL_ROUNDS: usize = 8;

/// Default per-handler execution timeout.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

/// Body marker identifying a continuation re-issue. Recognized (and
/// stripped) by the dispatch layer so recursion never re-enters the loop.
pub const INTERNAL_CONTINUE_MARKER: &str = "_internalToolContinue";

/// A tool_use block being captured from the stream.
struct ToolCapture {
    id: String,
    name: String,
    partial_json: String,
}

/// Outcome of one executed tool call.
struct ToolOutcome {
    tool_use_id: String,
    tool_name: String,
    index: u32,
    result: Result<Value, String>,
}

type SharedOutcomes = Arc<parking_lot::Mutex<Vec<ToolOutcome>>>;

/// Stateful stream handler implementing the interception loop.
pub struct AgentLoopHandler {
    agents: Arc<AgentRegistry>,
    dispatcher: Arc<dyn ContinuationDispatcher>,
    /// Conversation body the next continuation extends.
    body: Value,
    max_rounds: usize,
    tool_timeout: Duration,
    cancel: CancellationToken,

    round: usize,
    message_delta_seen: bool,
    intercepted_this_round: bool,
    captures: HashMap<u32, ToolCapture>,
    assistant_blocks: Vec<Value>,
    pending: Vec<JoinHandle<()>>,
    outcomes: SharedOutcomes,
}

impl AgentLoopHandler {
    pub fn new(
        agents: Arc<AgentRegistry>,
        dispatcher: Arc<dyn ContinuationDispatcher>,
        original_body: Value,
        max_rounds: usize,
        tool_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            agents,
            dispatcher,
            body: original_body,
            max_rounds,
            tool_timeout,
            cancel,
            round: 0,
            message_delta_seen: false,
            intercepted_this_round: false,
            captures: HashMap::new(),
            assistant_blocks: Vec::new(),
            pending: Vec::new(),
            outcomes: Arc::new(parking_lot::Mutex::new(Vec::new())),
        }
    }

    /// Handle one event. Returns the event to forward, or `None` when the
    /// handler forwarded (or suppressed) it itself. `in_continuation`
    /// additionally suppresses `message_start`/`message_stop`.
    async fn handle_event(
        &mut self,
        event: SseEvent,
        sink: &EventSink,
        in_continuation: bool,
    ) -> RelayResult<Option<SseEvent>> {
        let event_type = event.event_type().map(str::to_string);

        match event_type.as_deref() {
            Some("message_start") if in_continuation => Ok(None),
            Some("message_stop") => {
                if in_continuation || self.intercepted_this_round {
                    Ok(None)
                } else {
                    Ok(Some(event))
                }
            }
            Some("message_delta") => {
                self.message_delta_seen = true;
                Ok(Some(event))
            }
            Some("content_block_start") => {
                self.on_block_start(&event);
                Ok(Some(event))
            }
            Some("content_block_delta") => {
                self.on_block_delta(&event);
                Ok(Some(event))
            }
            Some("content_block_stop") => {
                let index = event
                    .data_json()
                    .and_then(|d| d.get("index"))
                    .and_then(Value::as_u64)
                    .unwrap_or(0) as u32;
                if !self.captures.contains_key(&index) {
                    return Ok(Some(event));
                }
                // Forward the stop before launching the handler so its
                // tool:result can never precede it on the stream.
                if !sink.send(&event).await {
                    return Ok(None);
                }
                self.on_block_stop(&event, sink).await;
                Ok(None)
            }
            _ => Ok(Some(event)),
        }
    }

    fn on_block_start(&mut self, event: &SseEvent) {
        let Some(data) = event.data_json() else { return };
        let Some(block) = data.get("content_block") else { return };
        if block.get("type").and_then(Value::as_str) != Some("tool_use") {
            return;
        }
        let Some(name) = block.get("name").and_then(Value::as_str) else { return };
        if self.agents.get(name).is_none() {
            // Not a local tool; it streams through for the client to run.
            return;
        }
        let index = data.get("index").and_then(Value::as_u64).unwrap_or(0) as u32;
        let id = block
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        debug!(tool = %name, index, "Capturing tool_use block");
        self.intercepted_this_round = true;
        self.captures.insert(
            index,
            ToolCapture {
                id,
                name: name.to_string(),
                partial_json: String::new(),
            },
        );
    }

    fn on_block_delta(&mut self, event: &SseEvent) {
        let Some(data) = event.data_json() else { return };
        let index = data.get("index").and_then(Value::as_u64).unwrap_or(0) as u32;
        let Some(capture) = self.captures.get_mut(&index) else { return };
        let Some(delta) = data.get("delta") else { return };
        if delta.get("type").and_then(Value::as_str) != Some("input_json_delta") {
            return;
        }
        if let Some(partial) = delta.get("partial_json").and_then(Value::as_str) {
            capture.partial_json.push_str(partial);
        }
    }

    /// Finalize a captured block: parse arguments, record the assistant
    /// block, and launch the handler without blocking the passthrough.
    async fn on_block_stop(&mut self, event: &SseEvent, sink: &EventSink) {
        let Some(data) = event.data_json() else { return };
        let index = data.get("index").and_then(Value::as_u64).unwrap_or(0) as u32;
        let Some(capture) = self.captures.remove(&index) else { return };

        let input = match parse_lenient(&capture.partial_json) {
            Ok(value) => value,
            Err(e) => {
                warn!(tool = %capture.name, error = %e, "Tool arguments unparseable, using {{}}");
                Value::Object(serde_json::Map::new())
            }
        };

        let block = InputContentBlock::ToolUse(ToolUseBlock {
            id: capture.id.clone(),
            name: capture.name.clone(),
            input: input.clone(),
        });
        self.assistant_blocks
            .push(serde_json::to_value(block).unwrap_or_default());

        self.spawn_tool(capture, input, index, sink.clone());
    }

    fn spawn_tool(&mut self, capture: ToolCapture, input: Value, index: u32, sink: EventSink) {
        let Some(agent) = self.agents.get(&capture.name) else { return };
        let outcomes = Arc::clone(&self.outcomes);
        let cancel = self.cancel.clone();
        let timeout = self.tool_timeout;

        self.pending.push(tokio::spawn(async move {
            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                result = tokio::time::timeout(timeout, agent.execute(input, cancel.clone())) => {
                    match result {
                        Err(_) => Err(format!(
                            "tool '{}' timed out after {}s",
                            capture.name,
                            timeout.as_secs()
                        )),
                        Ok(Ok(value)) => Ok(value),
                        Ok(Err(e)) => Err(e.to_string()),
                    }
                }
            };

            let event = match &result {
                Ok(value) => SseEvent::named(
                    "tool:result",
                    json!({
                        "type": "tool:result",
                        "tool_use_id": capture.id.clone(),
                        "tool_name": capture.name.clone(),
                        "result": value,
                        "index": index,
                    }),
                ),
                Err(message) => SseEvent::named(
                    "tool:error",
                    json!({
                        "type": "tool:error",
                        "tool_use_id": capture.id.clone(),
                        "tool_name": capture.name.clone(),
                        "error": message,
                        "index": index,
                    }),
                ),
            };
            sink.safe_enqueue(&event).await;

            outcomes.lock().push(ToolOutcome {
                tool_use_id: capture.id,
                tool_name: capture.name,
                index,
                result,
            });
        }));
    }

    /// Wait for every in-flight handler of the current round.
    async fn drain_pending(&mut self) {
        for handle in self.pending.drain(..) {
            let _ = handle.await;
        }
    }

    fn take_outcomes(&mut self) -> Vec<ToolOutcome> {
        let mut outcomes = std::mem::take(&mut *self.outcomes.lock());
        // Stable order for the continuation messages.
        outcomes.sort_by_key(|o| o.index);
        outcomes
    }

    /// Extend the conversation with the assistant's tool calls and the
    /// collected results, producing the next request body.
    fn build_continuation_body(&mut self, outcomes: &[ToolOutcome]) -> Value {
        let assistant_blocks = std::mem::take(&mut self.assistant_blocks);

        let tool_results: Vec<Value> = outcomes
            .iter()
            .map(|o| {
                let (content, is_error) = match &o.result {
                    Ok(Value::String(s)) => (s.clone(), false),
                    Ok(value) => (value.to_string(), false),
                    Err(message) => (message.clone(), true),
                };
                let block = InputContentBlock::ToolResult(ToolResultBlock {
                    tool_use_id: o.tool_use_id.clone(),
                    content: Some(ToolResultContent::String(content)),
                    is_error: is_error.then_some(true),
                });
                serde_json::to_value(block).unwrap_or_default()
            })
            .collect();

        if let Some(messages) = self
            .body
            .get_mut("messages")
            .and_then(Value::as_array_mut)
        {
            messages.push(json!({"role": "assistant", "content": assistant_blocks}));
            messages.push(json!({"role": "user", "content": tool_results}));
        }

        let mut body = self.body.clone();
        body["stream"] = json!(true);
        body[INTERNAL_CONTINUE_MARKER] = json!(true);
        body
    }

    /// Run continuation rounds until a turn produces no further local tool
    /// calls, the round bound is hit, or the client goes away.
    async fn run_continuations(&mut self, sink: &EventSink) -> RelayResult<()> {
        loop {
            let outcomes = self.take_outcomes();
            if outcomes.is_empty() {
                sink.safe_enqueue(&SseEvent::named(
                    "tool:continue_complete",
                    json!({"type": "tool:continue_complete"}),
                ))
                .await;
                return Ok(());
            }

            self.round += 1;
            if self.round > self.max_rounds {
                warn!(rounds = self.round, "Tool loop exceeded max rounds");
                sink.safe_enqueue(&continue_error(format!(
                    "tool loop exceeded maximum of {} rounds",
                    self.max_rounds
                )))
                .await;
                return Ok(());
            }

            let tool_names: Vec<&str> = outcomes.iter().map(|o| o.tool_name.as_str()).collect();
            info!(
                round = self.round,
                tools = ?tool_names,
                "Issuing tool-loop continuation"
            );

            let body = self.build_continuation_body(&outcomes);
            let mut stream = match self.dispatcher.continuation_stream(body, sink).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(error = %e, "Continuation dispatch failed");
                    sink.safe_enqueue(&continue_error(e.to_string())).await;
                    return Ok(());
                }
            };

            self.message_delta_seen = false;
            self.intercepted_this_round = false;
            self.captures.clear();

            loop {
                let item = tokio::select! {
                    _ = self.cancel.cancelled() => return Ok(()),
                    item = stream.next() => item,
                };
                let Some(item) = item else { break };

                match item {
                    Ok(event) => {
                        if let Some(event) = self.handle_event(event, sink, true).await? {
                            if !sink.send(&event).await {
                                return Ok(());
                            }
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Continuation stream failed");
                        sink.safe_enqueue(&continue_error(e.to_string())).await;
                        return Ok(());
                    }
                }
            }

            self.drain_pending().await;
        }
    }
}

fn continue_error(message: String) -> SseEvent {
    SseEvent::named(
        "tool:continue_error",
        json!({"type": "tool:continue_error", "message": message}),
    )
}

#[async_trait::async_trait]
impl StreamHandler for AgentLoopHandler {
    async fn on_event(
        &mut self,
        event: SseEvent,
        sink: &EventSink,
    ) -> RelayResult<Option<SseEvent>> {
        self.handle_event(event, sink, false).await
    }

    async fn on_end(&mut self, sink: &EventSink) -> RelayResult<()> {
        self.drain_pending().await;

        if !self.message_delta_seen && !self.outcomes.lock().is_empty() {
            // The upstream turn ended abnormally; results were already
            // surfaced as tool:result events, but there is no turn to
            // continue from.
            warn!("Tool results collected without a message_delta; skipping continuation");
            return Ok(());
        }

        if self.outcomes.lock().is_empty() {
            return Ok(());
        }

        self.run_continuations(sink).await
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::stream::BoxStream;
    use tokio::sync::mpsc;

    use super::*;
    use crate::agent::AgentTool;
    use crate::sse::rewrite_stream;

    struct TimeAgent;

    #[async_trait]
    impl AgentTool for TimeAgent {
        fn name(&self) -> &str {
            "current_time"
        }

        async fn execute(&self, _input: Value, _cancel: CancellationToken) -> RelayResult<Value> {
            Ok(json!("2024-01-01T00:00:00Z"))
        }
    }

    struct FailingAgent;

    #[async_trait]
    impl AgentTool for FailingAgent {
        fn name(&self) -> &str {
            "broken"
        }

        async fn execute(&self, _input: Value, _cancel: CancellationToken) -> RelayResult<Value> {
            Err(RelayError::Tool("disk on fire".into()))
        }
    }

    /// Scripted continuation upstream: returns one canned event stream per
    /// call and records the bodies it was asked to dispatch.
    struct ScriptedDispatcher {
        rounds: parking_lot::Mutex<Vec<Vec<SseEvent>>>,
        seen_bodies: parking_lot::Mutex<Vec<Value>>,
    }

    impl ScriptedDispatcher {
        fn new(rounds: Vec<Vec<SseEvent>>) -> Arc<Self> {
            Arc::new(Self {
                rounds: parking_lot::Mutex::new(rounds),
                seen_bodies: parking_lot::Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ContinuationDispatcher for ScriptedDispatcher {
        async fn continuation_stream(
            &self,
            body: Value,
            _sink: &EventSink,
        ) -> RelayResult<BoxStream<'static, RelayResult<SseEvent>>> {
            self.seen_bodies.lock().push(body);
            let mut rounds = self.rounds.lock();
            if rounds.is_empty() {
                return Err(RelayError::ToolContinue("no more scripted rounds".into()));
            }
            let events = rounds.remove(0);
            Ok(futures::stream::iter(events.into_iter().map(Ok)).boxed())
        }
    }

    fn ev(name: &str, data: Value) -> SseEvent {
        SseEvent::named(name, data)
    }

    /// An upstream turn issuing one current_time tool call.
    fn tool_turn() -> Vec<RelayResult<SseEvent>> {
        vec![
            Ok(ev("message_start", json!({"type": "message_start", "message": {"id": "m1"}}))),
            Ok(ev(
                "content_block_start",
                json!({
                    "type": "content_block_start",
                    "index": 0,
                    "content_block": {"type": "tool_use", "id": "t1", "name": "current_time", "input": {}}
                }),
            )),
            Ok(ev(
                "content_block_delta",
                json!({
                    "type": "content_block_delta",
                    "index": 0,
                    "delta": {"type": "input_json_delta", "partial_json": "{}"}
                }),
            )),
            Ok(ev(
                "content_block_stop",
                json!({"type": "content_block_stop", "index": 0}),
            )),
            Ok(ev(
                "message_delta",
                json!({
                    "type": "message_delta",
                    "delta": {"stop_reason": "tool_use"},
                    "usage": {"output_tokens": 5}
                }),
            )),
            Ok(ev("message_stop", json!({"type": "message_stop"}))),
        ]
    }

    fn final_turn() -> Vec<SseEvent> {
        vec![
            ev("message_start", json!({"type": "message_start", "message": {"id": "m2"}})),
            ev(
                "content_block_start",
                json!({
                    "type": "content_block_start",
                    "index": 0,
                    "content_block": {"type": "text", "text": ""}
                }),
            ),
            ev(
                "content_block_delta",
                json!({
                    "type": "content_block_delta",
                    "index": 0,
                    "delta": {"type": "text_delta", "text": "It is midnight."}
                }),
            ),
            ev(
                "content_block_stop",
                json!({"type": "content_block_stop", "index": 0}),
            ),
            ev(
                "message_delta",
                json!({"type": "message_delta", "delta": {"stop_reason": "end_turn"}, "usage": {"output_tokens": 4}}),
            ),
            ev("message_stop", json!({"type": "message_stop"})),
        ]
    }

    fn agents_with_time() -> Arc<AgentRegistry> {
        let agents = Arc::new(AgentRegistry::new());
        agents.register(Arc::new(TimeAgent));
        agents
    }

    fn request_body() -> Value {
        json!({
            "model": "openai,gpt-4o-mini",
            "messages": [{"role": "user", "content": "what time is it"}],
            "stream": true,
            "tools": [{"name": "current_time", "input_schema": {"type": "object"}}]
        })
    }

    async fn run_loop(
        upstream: Vec<RelayResult<SseEvent>>,
        dispatcher: Arc<ScriptedDispatcher>,
        agents: Arc<AgentRegistry>,
    ) -> String {
        let (tx, mut rx) = mpsc::channel::<Result<Bytes, io::Error>>(256);
        let cancel = CancellationToken::new();
        let sink = EventSink::new(tx, cancel.clone());

        let mut handler = AgentLoopHandler::new(
            agents,
            dispatcher,
            request_body(),
            DEFAULT_MAX_TOOL_ROUNDS,
            DEFAULT_TOOL_TIMEOUT,
            cancel.clone(),
        );

        rewrite_stream(
            futures::stream::iter(upstream),
            &mut handler,
            &sink,
            &cancel,
        )
        .await
        .unwrap();
        drop(handler);
        drop(sink);

        let mut out = String::new();
        while let Some(chunk) = rx.recv().await {
            out.push_str(std::str::from_utf8(&chunk.unwrap()).unwrap());
        }
        out
    }

    #[tokio::test]
    async fn test_tool_loop_full_round() {
        let dispatcher = ScriptedDispatcher::new(vec![final_turn()]);
        let out = run_loop(tool_turn(), Arc::clone(&dispatcher), agents_with_time()).await;

        // Passthrough events reached the client.
        assert!(out.contains("event: content_block_start"));
        assert!(out.contains("\"name\":\"current_time\""));
        assert!(out.contains("event: content_block_stop"));

        // Exactly one tool:result, carrying the handler's value.
        assert_eq!(out.matches("event: tool:result").count(), 1);
        assert!(out.contains("2024-01-01T00:00:00Z"));
        assert!(out.contains("\"tool_use_id\":\"t1\""));

        // Result comes after the originating block stop.
        let stop_at = out.find("event: content_block_stop").unwrap();
        let result_at = out.find("event: tool:result").unwrap();
        assert!(result_at > stop_at);

        // Continuation text arrives, its message_start/stop suppressed.
        assert!(out.contains("It is midnight."));
        assert_eq!(out.matches("event: message_start").count(), 1);
        assert!(!out.contains("event: message_stop"));
        assert!(out.contains("event: tool:continue_complete"));

        // The continuation body extended the conversation.
        let bodies = dispatcher.seen_bodies.lock();
        assert_eq!(bodies.len(), 1);
        let messages = bodies[0]["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1]["role"], "assistant");
        assert_eq!(messages[1]["content"][0]["type"], "tool_use");
        assert_eq!(messages[2]["role"], "user");
        assert_eq!(messages[2]["content"][0]["type"], "tool_result");
        assert_eq!(bodies[0][INTERNAL_CONTINUE_MARKER], json!(true));
        assert_eq!(bodies[0]["stream"], json!(true));
    }

    #[tokio::test]
    async fn test_tool_error_still_continues() {
        let agents = Arc::new(AgentRegistry::new());
        agents.register(Arc::new(FailingAgent));

        let mut upstream = tool_turn();
        // Rewrite the turn to call the failing tool instead.
        for item in &mut upstream {
            if let Ok(event) = item {
                if let Some(crate::sse::SseData::Json(data)) = &mut event.data {
                    if data["content_block"]["name"] == json!("current_time") {
                        data["content_block"]["name"] = json!("broken");
                    }
                }
            }
        }

        let dispatcher = ScriptedDispatcher::new(vec![final_turn()]);
        let out = run_loop(upstream, Arc::clone(&dispatcher), agents).await;

        assert_eq!(out.matches("event: tool:error").count(), 1);
        assert!(out.contains("disk on fire"));
        // The continuation still ran, carrying the error as the result.
        let bodies = dispatcher.seen_bodies.lock();
        assert_eq!(bodies.len(), 1);
        let result_block = &bodies[0]["messages"][2]["content"][0];
        assert_eq!(result_block["is_error"], json!(true));
        assert!(result_block["content"].as_str().unwrap().contains("disk on fire"));
        assert!(out.contains("event: tool:continue_complete"));
    }

    #[tokio::test]
    async fn test_transparent_when_no_local_tools() {
        let agents = Arc::new(AgentRegistry::new()); // nothing registered
        let dispatcher = ScriptedDispatcher::new(vec![]);
        let out = run_loop(tool_turn(), dispatcher.clone(), agents).await;

        // Everything passes through, including message_stop; no synthesis.
        assert!(out.contains("event: message_stop"));
        assert!(!out.contains("tool:result"));
        assert!(!out.contains("tool:continue_complete"));
        assert!(dispatcher.seen_bodies.lock().is_empty());
    }

    #[tokio::test]
    async fn test_round_bound_emits_continue_error() {
        // Every continuation round issues another tool call, forever.
        let looping_round: Vec<SseEvent> = tool_turn()
            .into_iter()
            .map(Result::unwrap)
            .collect();
        let rounds = vec![looping_round.clone(); DEFAULT_MAX_TOOL_ROUNDS + 2];
        let dispatcher = ScriptedDispatcher::new(rounds);
        let out = run_loop(tool_turn(), Arc::clone(&dispatcher), agents_with_time()).await;

        assert!(out.contains("event: tool:continue_error"));
        assert!(out.contains("maximum"));
        assert_eq!(
            dispatcher.seen_bodies.lock().len(),
            DEFAULT_MAX_TOOL_ROUNDS
        );
    }

    #[tokio::test]
    async fn test_continuation_failure_surfaces() {
        let dispatcher = ScriptedDispatcher::new(vec![]); // dispatch always errors
        let out = run_loop(tool_turn(), dispatcher, agents_with_time()).await;
        assert!(out.contains("event: tool:continue_error"));
    }

    #[tokio::test]
    async fn test_cancellation_aborts_running_tool() {
        /// Sleeps far longer than the test budget; only cancellation can
        /// bring it back quickly.
        struct HangingAgent;

        #[async_trait]
        impl AgentTool for HangingAgent {
            fn name(&self) -> &str {
                "hang"
            }

            async fn execute(
                &self,
                _input: Value,
                _cancel: CancellationToken,
            ) -> RelayResult<Value> {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(json!("too late"))
            }
        }

        let agents = Arc::new(AgentRegistry::new());
        agents.register(Arc::new(HangingAgent));

        let (tx, _rx) = mpsc::channel::<Result<Bytes, io::Error>>(64);
        let cancel = CancellationToken::new();
        let sink = EventSink::new(tx, cancel.clone());
        let dispatcher = ScriptedDispatcher::new(vec![]);

        let mut handler = AgentLoopHandler::new(
            agents,
            dispatcher,
            request_body(),
            DEFAULT_MAX_TOOL_ROUNDS,
            DEFAULT_TOOL_TIMEOUT,
            cancel.clone(),
        );

        let start = ev(
            "content_block_start",
            json!({
                "type": "content_block_start",
                "index": 0,
                "content_block": {"type": "tool_use", "id": "t1", "name": "hang", "input": {}}
            }),
        );
        let stop = ev(
            "content_block_stop",
            json!({"type": "content_block_stop", "index": 0}),
        );
        handler.handle_event(start, &sink, false).await.unwrap();
        handler.handle_event(stop, &sink, false).await.unwrap();
        assert_eq!(handler.pending.len(), 1);

        // The client goes away: the handler task must wind down promptly.
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handler.drain_pending())
            .await
            .expect("cancelled tool task did not finish");

        // A cancelled tool contributes no outcome.
        assert!(handler.outcomes.lock().is_empty());
    }

    #[tokio::test]
    async fn test_parallel_tools_all_resolve_before_continuation() {
        let upstream = vec![
            Ok(ev("message_start", json!({"type": "message_start", "message": {"id": "m1"}}))),
            Ok(ev(
                "content_block_start",
                json!({
                    "type": "content_block_start",
                    "index": 0,
                    "content_block": {"type": "tool_use", "id": "t1", "name": "current_time", "input": {}}
                }),
            )),
            Ok(ev(
                "content_block_stop",
                json!({"type": "content_block_stop", "index": 0}),
            )),
            Ok(ev(
                "content_block_start",
                json!({
                    "type": "content_block_start",
                    "index": 1,
                    "content_block": {"type": "tool_use", "id": "t2", "name": "current_time", "input": {}}
                }),
            )),
            Ok(ev(
                "content_block_stop",
                json!({"type": "content_block_stop", "index": 1}),
            )),
            Ok(ev(
                "message_delta",
                json!({"type": "message_delta", "delta": {"stop_reason": "tool_use"}, "usage": {"output_tokens": 2}}),
            )),
        ];

        let dispatcher = ScriptedDispatcher::new(vec![final_turn()]);
        let out = run_loop(upstream, Arc::clone(&dispatcher), agents_with_time()).await;

        assert_eq!(out.matches("event: tool:result").count(), 2);

        // One continuation, carrying both results in index order.
        let bodies = dispatcher.seen_bodies.lock();
        assert_eq!(bodies.len(), 1);
        let results = bodies[0]["messages"][2]["content"].as_array().unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["tool_use_id"], "t1");
        assert_eq!(results[1]["tool_use_id"], "t2");
    }
}
