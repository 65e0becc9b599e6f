//! Shared bearer-token authentication.
//!
//! When `APIKEY` is configured, every route except `/health` requires
//! `Authorization: Bearer <APIKEY>`. The check runs before any routing
//! work, so an unauthenticated request never touches an upstream. The
//! client's bearer is a service credential for the relay only; it is
//! never forwarded upstream.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};

use crate::error::error_body;

#[derive(Clone, Default)]
pub struct AuthState {
    pub api_key: Option<Arc<String>>,
}

impl AuthState {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            api_key: api_key.map(Arc::new),
        }
    }
}

pub async fn bearer_auth(
    State(state): State<AuthState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = &state.api_key else {
        return next.run(request).await;
    };

    if request.uri().path() == "/health" {
        return next.run(request).await;
    }

    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match presented {
        Some(token) if token == expected.as_str() => next.run(request).await,
        _ => (
            StatusCode::UNAUTHORIZED,
            Json(error_body(
                "authentication_error",
                "missing or invalid bearer token",
            )),
        )
            .into_response(),
    }
}
