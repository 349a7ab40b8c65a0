//! Service-token authentication for internal endpoints.

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use subtle::ConstantTimeEq;

use crate::error::ApiError;
use crate::state::AppState;

pub const SERVICE_TOKEN_HEADER: &str = "x-service-token";

/// Rejects requests whose `X-Service-Token` header does not match the
/// configured secret. Comparison is constant time.
pub async fn require_service_token(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let provided = request
        .headers()
        .get(SERVICE_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    let expected = state.config.service_token.as_bytes();
    if expected.is_empty() || !bool::from(provided.as_bytes().ct_eq(expected)) {
        tracing::warn!(path = %request.uri().path(), "Rejected request with bad service token");
        return Err(ApiError::Unauthorized);
    }

    Ok(next.run(request).await)
}
