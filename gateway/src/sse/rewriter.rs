//! Event stream rewriting.
//!
//! [`rewrite_stream`] pumps a parsed SSE event stream through a stateful
//! handler and into an [`EventSink`]. The handler may rewrite events, drop
//! them, or push synthesized events out of band through the sink. The sink
//! is backed by the bounded channel feeding the client connection, so a
//! slow client suspends upstream reads end to end.

use std::{collections::VecDeque, io, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream::BoxStream, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::codec::{encode_event, SseEvent, SseParser};
use crate::error::{RelayError, RelayResult};

/// Write half of a client SSE connection.
///
/// Serializes events onto the outbound byte channel. Once the client is
/// gone the sink reports closure and cancels its token so in-flight work
/// can stop; `safe_enqueue` then becomes a silent no-op.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<Result<Bytes, io::Error>>,
    cancel: CancellationToken,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<Result<Bytes, io::Error>>, cancel: CancellationToken) -> Self {
        Self { tx, cancel }
    }

    /// Send one event, waiting for buffer space (back-pressure).
    ///
    /// Returns `false` when the client connection is gone.
    pub async fn send(&self, event: &SseEvent) -> bool {
        if self.tx.send(Ok(encode_event(event))).await.is_err() {
            self.cancel.cancel();
            return false;
        }
        true
    }

    /// Enqueue an event, silently dropping it if the client is gone.
    pub async fn safe_enqueue(&self, event: &SseEvent) {
        if !self.send(event).await {
            debug!("Client stream closed, synthesized event dropped");
        }
    }

    /// Token cancelled when the client disconnects (or the request is
    /// otherwise torn down).
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Stateful per-event rewriter driven by [`rewrite_stream`].
#[async_trait]
pub trait StreamHandler: Send {
    /// Handle one upstream event. Returning `Some` forwards the event,
    /// `None` swallows it. Synthesized events go through the sink.
    async fn on_event(
        &mut self,
        event: SseEvent,
        sink: &EventSink,
    ) -> RelayResult<Option<SseEvent>>;

    /// Called once after the upstream stream ends (not on cancellation).
    async fn on_end(&mut self, _sink: &EventSink) -> RelayResult<()> {
        Ok(())
    }
}

/// Pump `upstream` through `handler` into `sink` until the upstream ends,
/// the client disconnects, or the token is cancelled.
///
/// Handler errors of kind [`RelayError::StreamClosed`] are recovered (the
/// event is dropped and the stream continues); every other error tears the
/// stream down and propagates to the caller.
pub async fn rewrite_stream<S>(
    mut upstream: S,
    handler: &mut dyn StreamHandler,
    sink: &EventSink,
    cancel: &CancellationToken,
) -> RelayResult<()>
where
    S: Stream<Item = RelayResult<SseEvent>> + Unpin + Send,
{
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Stream rewrite cancelled");
                return Ok(());
            }
            next = upstream.next() => next,
        };

        let Some(item) = next else { break };

        match handler.on_event(item?, sink).await {
            Ok(Some(event)) => {
                if !sink.send(&event).await {
                    return Ok(());
                }
            }
            Ok(None) => {}
            Err(RelayError::StreamClosed) => {
                warn!("Handler reported closed stream, recovering");
            }
            Err(e) => return Err(e),
        }
    }

    handler.on_end(sink).await
}

/// Runs several handlers as one: events flow through them in order (a
/// `None` stops the walk), and every `on_end` runs in order.
pub struct CompositeHandler {
    handlers: Vec<Box<dyn StreamHandler>>,
}

impl CompositeHandler {
    pub fn new(handlers: Vec<Box<dyn StreamHandler>>) -> Self {
        Self { handlers }
    }
}

#[async_trait]
impl StreamHandler for CompositeHandler {
    async fn on_event(
        &mut self,
        event: SseEvent,
        sink: &EventSink,
    ) -> RelayResult<Option<SseEvent>> {
        let mut current = event;
        for handler in &mut self.handlers {
            match handler.on_event(current, sink).await? {
                Some(next) => current = next,
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    async fn on_end(&mut self, sink: &EventSink) -> RelayResult<()> {
        for handler in &mut self.handlers {
            handler.on_end(sink).await?;
        }
        Ok(())
    }
}

/// Default idle timeout between upstream stream reads.
pub const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Turn an upstream HTTP response into a parsed SSE event stream, applying
/// an idle timeout to every read.
pub fn response_events(
    response: reqwest::Response,
    idle_timeout: Duration,
) -> BoxStream<'static, RelayResult<SseEvent>> {
    struct State {
        bytes: BoxStream<'static, reqwest::Result<Bytes>>,
        parser: SseParser,
        pending: VecDeque<SseEvent>,
        done: bool,
    }

    let state = State {
        bytes: response.bytes_stream().boxed(),
        parser: SseParser::new(),
        pending: VecDeque::new(),
        done: false,
    };

    futures::stream::unfold(state, move |mut st| async move {
        loop {
            if let Some(event) = st.pending.pop_front() {
                return Some((Ok(event), st));
            }
            if st.done {
                return None;
            }

            match tokio::time::timeout(idle_timeout, st.bytes.next()).await {
                Err(_) => {
                    st.done = true;
                    return Some((
                        Err(RelayError::UpstreamTimeout(
                            "no stream data within idle timeout".to_string(),
                        )),
                        st,
                    ));
                }
                Ok(None) => {
                    st.done = true;
                    if let Some(event) = st.parser.finish() {
                        return Some((Ok(event), st));
                    }
                    return None;
                }
                Ok(Some(Err(e))) => {
                    st.done = true;
                    return Some((Err(e.into()), st));
                }
                Ok(Some(Ok(chunk))) => match st.parser.push(&chunk) {
                    Ok(events) => st.pending.extend(events),
                    Err(e) => {
                        st.done = true;
                        return Some((Err(e), st));
                    }
                },
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::sse::codec::SseData;

    fn sink_pair(capacity: usize) -> (EventSink, mpsc::Receiver<Result<Bytes, io::Error>>) {
        let (tx, rx) = mpsc::channel(capacity);
        (EventSink::new(tx, CancellationToken::new()), rx)
    }

    struct Passthrough;

    #[async_trait]
    impl StreamHandler for Passthrough {
        async fn on_event(
            &mut self,
            event: SseEvent,
            _sink: &EventSink,
        ) -> RelayResult<Option<SseEvent>> {
            Ok(Some(event))
        }
    }

    /// Swallows pings, annotates everything else, and injects one
    /// synthesized event at end of stream.
    struct Annotator;

    #[async_trait]
    impl StreamHandler for Annotator {
        async fn on_event(
            &mut self,
            mut event: SseEvent,
            _sink: &EventSink,
        ) -> RelayResult<Option<SseEvent>> {
            if event.event_type() == Some("ping") {
                return Ok(None);
            }
            if let Some(SseData::Json(value)) = &mut event.data {
                value["seen"] = json!(true);
            }
            Ok(Some(event))
        }

        async fn on_end(&mut self, sink: &EventSink) -> RelayResult<()> {
            sink.safe_enqueue(&SseEvent::named("done", json!({"type": "done"})))
                .await;
            Ok(())
        }
    }

    fn collect(rx: &mut mpsc::Receiver<Result<Bytes, io::Error>>) -> String {
        let mut out = String::new();
        while let Ok(chunk) = rx.try_recv() {
            out.push_str(std::str::from_utf8(&chunk.unwrap()).unwrap());
        }
        out
    }

    #[tokio::test]
    async fn test_passthrough_preserves_order() {
        let (sink, mut rx) = sink_pair(16);
        let events = vec![
            Ok(SseEvent::named("a", json!({"n": 1}))),
            Ok(SseEvent::named("b", json!({"n": 2}))),
        ];
        let cancel = CancellationToken::new();
        rewrite_stream(
            futures::stream::iter(events),
            &mut Passthrough,
            &sink,
            &cancel,
        )
        .await
        .unwrap();

        let out = collect(&mut rx);
        let a = out.find("event: a").unwrap();
        let b = out.find("event: b").unwrap();
        assert!(a < b);
    }

    #[tokio::test]
    async fn test_handler_can_swallow_and_synthesize() {
        let (sink, mut rx) = sink_pair(16);
        let events = vec![
            Ok(SseEvent::named("ping", json!({"type": "ping"}))),
            Ok(SseEvent::named("msg", json!({"type": "msg"}))),
        ];
        let cancel = CancellationToken::new();
        rewrite_stream(
            futures::stream::iter(events),
            &mut Annotator,
            &sink,
            &cancel,
        )
        .await
        .unwrap();

        let out = collect(&mut rx);
        assert!(!out.contains("event: ping"));
        assert!(out.contains("\"seen\":true"));
        assert!(out.contains("event: done"));
    }

    #[tokio::test]
    async fn test_closed_sink_stops_pump() {
        let (sink, rx) = sink_pair(1);
        drop(rx);
        let events = vec![Ok(SseEvent::named("a", json!({})))];
        let cancel = sink.cancellation();
        rewrite_stream(
            futures::stream::iter(events),
            &mut Passthrough,
            &sink,
            &cancel,
        )
        .await
        .unwrap();
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancellation_is_idempotent() {
        let (sink, _rx) = sink_pair(1);
        let cancel = sink.cancellation();
        cancel.cancel();
        cancel.cancel();
        let events: Vec<RelayResult<SseEvent>> = vec![Ok(SseEvent::named("a", json!({})))];
        rewrite_stream(
            futures::stream::iter(events),
            &mut Passthrough,
            &sink,
            &cancel,
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_handler_error_tears_down() {
        struct Failing;

        #[async_trait]
        impl StreamHandler for Failing {
            async fn on_event(
                &mut self,
                _event: SseEvent,
                _sink: &EventSink,
            ) -> RelayResult<Option<SseEvent>> {
                Err(RelayError::Transformer("boom".into()))
            }
        }

        let (sink, _rx) = sink_pair(4);
        let events = vec![Ok(SseEvent::named("a", json!({})))];
        let cancel = CancellationToken::new();
        let err = rewrite_stream(futures::stream::iter(events), &mut Failing, &sink, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Transformer(_)));
    }

    #[tokio::test]
    async fn test_stream_closed_error_recovered() {
        struct ClosedOnce(bool);

        #[async_trait]
        impl StreamHandler for ClosedOnce {
            async fn on_event(
                &mut self,
                event: SseEvent,
                _sink: &EventSink,
            ) -> RelayResult<Option<SseEvent>> {
                if !self.0 {
                    self.0 = true;
                    return Err(RelayError::StreamClosed);
                }
                Ok(Some(event))
            }
        }

        let (sink, mut rx) = sink_pair(8);
        let events = vec![
            Ok(SseEvent::named("first", json!({}))),
            Ok(SseEvent::named("second", json!({}))),
        ];
        let cancel = CancellationToken::new();
        rewrite_stream(
            futures::stream::iter(events),
            &mut ClosedOnce(false),
            &sink,
            &cancel,
        )
        .await
        .unwrap();

        let out = collect(&mut rx);
        assert!(!out.contains("event: first"));
        assert!(out.contains("event: second"));
    }
}
