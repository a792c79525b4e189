//! Error responses: `{"error": {"kind", "message"}}` with a status per error kind.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use qcc_core::{Error, ErrorKind};
use tracing::error;

pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::VerificationFailure => StatusCode::FORBIDDEN,
        ErrorKind::Wiring | ErrorKind::Lifecycle => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::ResourceExhaustion
        | ErrorKind::CapabilityUnavailable
        | ErrorKind::LedgerUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Provider => StatusCode::BAD_GATEWAY,
        ErrorKind::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        // Client closed request.
        ErrorKind::Cancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::CONFLICT),
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = status_for(kind);
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        }
        (
            status,
            Json(serde_json::json!({
                "error": {
                    "kind": kind,
                    "message": self.0.to_string(),
                }
            })),
        )
            .into_response()
    }
}
