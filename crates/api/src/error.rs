//! HTTP error mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use keygate_billing::BillingError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Billing(#[from] BillingError),

    #[error("unauthorized")]
    Unauthorized,

    #[error("bad request: {0}")]
    BadRequest(String),
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Billing(err) => match err {
                BillingError::Validation(_) => StatusCode::BAD_REQUEST,
                BillingError::NotFound(_) => StatusCode::NOT_FOUND,
                BillingError::Conflict(_) => StatusCode::CONFLICT,
                BillingError::Signature => StatusCode::UNAUTHORIZED,
                BillingError::Upstream(_) => StatusCode::BAD_GATEWAY,
                // Misconfiguration means the capability is unavailable, not
                // that the server blew up; clients may retry after a fix.
                BillingError::Configuration(_) => StatusCode::SERVICE_UNAVAILABLE,
                BillingError::Database(_) => StatusCode::SERVICE_UNAVAILABLE,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        // Internal detail stays in the logs; clients get the category.
        let message = match &self {
            ApiError::Billing(BillingError::Database(err)) => {
                tracing::error!(error = %err, "Database error");
                "database unavailable".to_string()
            }
            ApiError::Billing(BillingError::Configuration(err)) => {
                tracing::error!(error = %err, "Configuration error");
                "internal configuration error".to_string()
            }
            other => other.to_string(),
        };

        (status, Json(json!({"ok": false, "error": message}))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_faults_are_service_unavailable() {
        let err = ApiError::Billing(BillingError::Configuration(
            "messenger is not configured".to_string(),
        ));
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn billing_taxonomy_maps_to_expected_statuses() {
        let cases = [
            (
                ApiError::Billing(BillingError::validation("bad plan")),
                StatusCode::BAD_REQUEST,
            ),
            (
                ApiError::Billing(BillingError::not_found("payment x")),
                StatusCode::NOT_FOUND,
            ),
            (
                ApiError::Billing(BillingError::Conflict("dup".to_string())),
                StatusCode::CONFLICT,
            ),
            (
                ApiError::Billing(BillingError::Signature),
                StatusCode::UNAUTHORIZED,
            ),
            (
                ApiError::Billing(BillingError::upstream("gateway down")),
                StatusCode::BAD_GATEWAY,
            ),
            (ApiError::Unauthorized, StatusCode::UNAUTHORIZED),
            (
                ApiError::bad_request("missing field"),
                StatusCode::BAD_REQUEST,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(err.status(), expected, "{err}");
        }
    }
}
