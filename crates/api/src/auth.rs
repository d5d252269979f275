//! Single shared-key header check.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;

use crate::AppState;
use crate::error::ApiError;

pub const API_KEY_HEADER: &str = "x-api-key";

/// Rejects requests whose `x-api-key` does not match the configured key.
/// Does nothing when no key is configured.
pub async fn require_api_key(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(expected) = state.api_key.as_deref() else {
        return Ok(next.run(request).await);
    };

    let rejection = match request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
    {
        None => Some("missing"),
        Some(provided) if provided != expected => Some("invalid"),
        Some(_) => None,
    };

    if let Some(reason) = rejection {
        metrics::counter!("api_auth_failures_total", "reason" => reason).increment(1);
        tracing::debug!(path = %request.uri().path(), reason, "rejected request");
        return Err(ApiError::Unauthorized(format!("{reason} API key")));
    }
    Ok(next.run(request).await)
}
