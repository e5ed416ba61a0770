use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use stowage_types::StowageError;

/// Wrapper that maps the core error taxonomy onto HTTP responses.
///
/// Bodies are `{code, error}`; internal kinds are redacted to a generic
/// message so stack details never leave the process.
#[derive(Debug)]
pub struct ApiError(pub StowageError);

impl From<StowageError> for ApiError {
    fn from(e: StowageError) -> Self {
        ApiError(e)
    }
}

fn status_for(e: &StowageError) -> StatusCode {
    match e {
        StowageError::Validation(_) | StowageError::UnsupportedType(_) => StatusCode::BAD_REQUEST,
        StowageError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        StowageError::QuotaExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
        StowageError::NotFound(_) | StowageError::SessionNotFound(_) => StatusCode::NOT_FOUND,
        StowageError::FileIncomplete { .. } => StatusCode::CONFLICT,
        StowageError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        StowageError::LedgerUnavailable(_)
        | StowageError::Connection(_)
        | StowageError::RetryExhausted { .. }
        | StowageError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        StowageError::IntegrityFailed(_)
        | StowageError::Config(_)
        | StowageError::Serialization(_)
        | StowageError::Io(_)
        | StowageError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        let code = self.0.code();
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(code, "internal error: {}", self.0);
            "internal error".to_string()
        } else {
            tracing::warn!(code, status = %status, "{}", self.0);
            self.0.to_string()
        };

        (
            status,
            Json(serde_json::json!({ "code": code, "error": message })),
        )
            .into_response()
    }
}
