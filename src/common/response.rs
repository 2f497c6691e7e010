use axum::{
    extract::multipart::{MultipartError, MultipartRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};
use utoipa::ToSchema;

use crate::infrastructure::storage::local::StageError;
use crate::modules::caption::service::FailureReason;

/// Body of every non-2xx response.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorBody {
    pub error: String,
    pub code: String,
}

/// An error on its way to the caller. Only the coarse message and code are
/// serialized; details belong in the logs.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }

    pub fn payload_too_large(limit: u64) -> Self {
        Self::new(
            StatusCode::PAYLOAD_TOO_LARGE,
            "PAYLOAD_TOO_LARGE",
            format!("Upload exceeds the maximum size of {limit} bytes"),
        )
    }

    pub fn internal() -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            FailureReason::Internal.code(),
            FailureReason::Internal.message(),
        )
    }
}

impl From<FailureReason> for ApiError {
    fn from(reason: FailureReason) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, reason.code(), reason.message())
    }
}

impl From<StageError> for ApiError {
    fn from(err: StageError) -> Self {
        match err {
            StageError::TooLarge { limit } => Self::payload_too_large(limit),
            StageError::Stream(detail) => {
                warn!(error = %detail, "Upload stream failed");
                Self::bad_request("Upload was interrupted")
            }
            StageError::Storage(e) => {
                error!(error = %e, "Failed to stage upload");
                Self::internal()
            }
        }
    }
}

impl From<MultipartError> for ApiError {
    fn from(err: MultipartError) -> Self {
        warn!(error = %err.body_text(), "Malformed multipart request");
        if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
            return Self::new(
                StatusCode::PAYLOAD_TOO_LARGE,
                "PAYLOAD_TOO_LARGE",
                "Upload exceeds the maximum size",
            );
        }
        Self::bad_request("Invalid multipart request")
    }
}

impl From<MultipartRejection> for ApiError {
    fn from(rejection: MultipartRejection) -> Self {
        warn!(error = %rejection.body_text(), "Rejected upload request");
        Self::bad_request("Expected a multipart/form-data request")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.message,
            code: self.code.to_string(),
        };
        (self.status, Json(body)).into_response()
    }
}
