use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use okvm_core::OkvmError;
use serde_json::json;

/// Errors a handler can answer with.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Core(#[from] OkvmError),

    #[error("Bad request: {0}")]
    BadRequest(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Core(e) => match e {
                OkvmError::TurnInProgress(_) | OkvmError::SnapshotsDisabled => StatusCode::CONFLICT,
                OkvmError::InvalidClientKey(_) | OkvmError::SandboxViolation(_) => {
                    StatusCode::BAD_REQUEST
                }
                OkvmError::UnknownSnapshot(_) | OkvmError::NotFound(_) => StatusCode::NOT_FOUND,
                OkvmError::QuotaExceeded { .. } => StatusCode::PAYLOAD_TOO_LARGE,
                OkvmError::ResourceExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
                OkvmError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "bad_request",
            ApiError::Core(e) => e.kind(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(kind = self.kind(), error = %self, "Request failed");
        } else {
            tracing::debug!(kind = self.kind(), error = %self, "Request rejected");
        }
        let body = json!({ "error": { "kind": self.kind(), "message": self.to_string() } });
        (status, Json(body)).into_response()
    }
}
