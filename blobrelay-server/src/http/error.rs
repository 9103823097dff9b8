//! API error types with IntoResponse
//!
//! Errors are converted to JSON responses with appropriate status codes.

use axum::extract::multipart::MultipartError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use blobrelay_core::TransferError;
use serde_json::json;

/// Non-standard "client closed request"
const CLIENT_CLOSED_REQUEST: u16 = 499;

/// API error type with automatic HTTP status mapping
#[derive(Debug)]
pub enum ApiError {
    /// Engine failure, mapped by variant
    Transfer(TransferError),

    /// Malformed request the engine never saw (400)
    BadRequest { message: String },

    /// Internal error (500)
    Internal { message: String },
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Transfer(e) => match e {
                TransferError::PoolExhausted { .. }
                | TransferError::ConnectFailed { .. }
                | TransferError::RegistryFull { .. } => StatusCode::SERVICE_UNAVAILABLE,
                TransferError::NotFound { .. } => StatusCode::NOT_FOUND,
                TransferError::Denied { .. } => StatusCode::FORBIDDEN,
                TransferError::InvalidInput { .. } => StatusCode::BAD_REQUEST,
                TransferError::Cancelled => {
                    StatusCode::from_u16(CLIENT_CLOSED_REQUEST).unwrap_or(StatusCode::BAD_REQUEST)
                }
                TransferError::Io { .. } | TransferError::Store { .. } => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            Self::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::Transfer(TransferError::RegistryFull { .. }) => "registry_full",
            Self::Transfer(e) => e.outcome().as_str(),
            Self::BadRequest { .. } => "bad_request",
            Self::Internal { .. } => "internal_error",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            Self::Transfer(e) if status.is_server_error() && !e.is_retryable() => {
                // Log the actual error, return generic message
                tracing::error!(error = %e, "transfer failed");
                "an internal error occurred".to_string()
            }
            Self::Transfer(e) => e.to_string(),
            Self::BadRequest { message } => message.clone(),
            Self::Internal { message } => {
                tracing::error!("Internal error: {}", message);
                "an internal error occurred".to_string()
            }
        };

        let body = json!({
            "error": self.code(),
            "message": message
        });
        (status, Json(body)).into_response()
    }
}

impl From<TransferError> for ApiError {
    fn from(e: TransferError) -> Self {
        Self::Transfer(e)
    }
}

impl From<MultipartError> for ApiError {
    fn from(e: MultipartError) -> Self {
        Self::BadRequest {
            message: e.body_text(),
        }
    }
}
