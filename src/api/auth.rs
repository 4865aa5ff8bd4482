//! API-key boundary filter
//!
//! Requests must carry one of the configured keys in `X-API-Key`. When keys
//! are required but none are configured every request is admitted; the
//! server warns about this once at startup.

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};

use super::{error::ApiError, state::AppState};

pub const API_KEY_HEADER: &str = "x-api-key";

pub async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let security = &state.config.security;
    if !security.enforces_keys() {
        return Ok(next.run(request).await);
    }

    let presented = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim);

    match presented {
        Some(key) if security.api_keys.iter().any(|k| k == key) => Ok(next.run(request).await),
        _ => {
            tracing::debug!(path = %request.uri().path(), "Rejected request without valid API key");
            Err(ApiError::Unauthorized)
        }
    }
}
