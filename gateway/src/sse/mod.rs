//! SSE infrastructure: the wire codec and the event stream rewriter.

pub mod codec;
pub mod rewriter;

pub use codec::{encode_event, SseData, SseEvent, SseParser};
pub use rewriter::{
    response_events, rewrite_stream, EventSink, StreamHandler, STREAM_IDLE_TIMEOUT,
};
