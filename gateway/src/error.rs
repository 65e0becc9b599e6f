//! Gateway error taxonomy.
//!
//! Every failure surfaced to a client carries one of the wire `error.type`
//! strings below, either in a JSON error body (before streaming begins) or
//! in a synthesized `error` SSE event (mid-stream).

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

pub type RelayResult<T> = Result<T, RelayError>;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("{0}")]
    InvalidRequest(String),

    #[error("unknown or disabled provider '{0}'")]
    UnknownProvider(String),

    #[error("provider '{0}' has no usable API key")]
    NoCredentials(String),

    #[error("transformer failed: {0}")]
    Transformer(String),

    #[error("upstream returned {status}")]
    Upstream { status: u16, body: String },

    #[error("upstream timed out: {0}")]
    UpstreamTimeout(String),

    #[error("upstream network error: {0}")]
    UpstreamNetwork(String),

    #[error("tool handler failed: {0}")]
    Tool(String),

    #[error("tool continuation failed: {0}")]
    ToolContinue(String),

    #[error("provider concurrency limit exceeded")]
    RateLimited,

    #[error("stream closed prematurely")]
    StreamClosed,

    #[error("SSE codec error: {0}")]
    Codec(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// Wire name carried in `error.type`.
    pub fn error_type(&self) -> &'static str {
        match self {
            RelayError::InvalidRequest(_) => "invalid-request",
            RelayError::UnknownProvider(_) => "unknown-provider",
            RelayError::NoCredentials(_) => "no-credentials",
            RelayError::Transformer(_) => "transformer-error",
            // Timeouts and network faults are distinguished in logs but
            // surface to clients as a plain upstream failure.
            RelayError::Upstream { .. }
            | RelayError::UpstreamTimeout(_)
            | RelayError::UpstreamNetwork(_) => "upstream-error",
            RelayError::Tool(_) => "tool-error",
            RelayError::ToolContinue(_) => "tool-continue-error",
            RelayError::RateLimited => "rate-limited",
            RelayError::StreamClosed | RelayError::Codec(_) | RelayError::Internal(_) => {
                "api_error"
            }
        }
    }

    /// HTTP status used when the error is raised before streaming begins.
    pub fn status_code(&self) -> StatusCode {
        match self {
            RelayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            RelayError::UnknownProvider(_) => StatusCode::NOT_FOUND,
            RelayError::NoCredentials(_) => StatusCode::SERVICE_UNAVAILABLE,
            RelayError::Transformer(_) => StatusCode::INTERNAL_SERVER_ERROR,
            RelayError::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            RelayError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            RelayError::UpstreamNetwork(_) => StatusCode::BAD_GATEWAY,
            RelayError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// JSON body for the error, matching the Anthropic error envelope.
    pub fn to_body(&self) -> serde_json::Value {
        match self {
            // Upstream bodies pass through verbatim when they are JSON.
            RelayError::Upstream { body, .. } => serde_json::from_str(body)
                .unwrap_or_else(|_| error_body(self.error_type(), body)),
            _ => error_body(self.error_type(), &self.to_string()),
        }
    }
}

pub fn error_body(error_type: &str, message: &str) -> serde_json::Value {
    json!({
        "type": "error",
        "error": {
            "type": error_type,
            "message": message,
        }
    })
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        tracing::debug!(error_type = self.error_type(), status = %status, "Request failed: {self}");
        (status, Json(self.to_body())).into_response()
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(e: serde_json::Error) -> Self {
        RelayError::InvalidRequest(format!("malformed JSON: {e}"))
    }
}

impl From<reqwest::Error> for RelayError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            RelayError::UpstreamTimeout(e.to_string())
        } else {
            RelayError::UpstreamNetwork(e.to_string())
        }
    }
}
