//! Request-level errors and their HTTP mapping.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::ocr::EngineError;
use crate::stats::{round_to, unix_now};

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("No file provided")]
    MissingFile,

    #[error("Invalid file: {0}")]
    InvalidFile(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("File too large (max {max_bytes} bytes)")]
    FileTooLarge { max_bytes: u64 },

    #[error("Rate limit exceeded")]
    RateLimited { window_seconds: u64 },

    #[error("OCR not available")]
    EngineUnavailable,

    #[error("OCR timed out after {0}s")]
    Timeout(u64),

    #[error("{0}")]
    Unexpected(#[from] anyhow::Error),
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Unavailable => ApiError::EngineUnavailable,
            EngineError::Timeout(secs) => ApiError::Timeout(secs),
            EngineError::Failed(e) => ApiError::Unexpected(e),
        }
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::MissingFile | ApiError::InvalidFile(_) | ApiError::UnsupportedFormat(_) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::FileTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::EngineUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Unexpected(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the request got far enough to count as a failed outcome.
    pub fn is_pipeline_failure(&self) -> bool {
        matches!(self, ApiError::Timeout(_) | ApiError::Unexpected(_))
    }

    /// Attach the elapsed time for the error body.
    pub fn with_time(self, processing_time: f64) -> ErrorReply {
        ErrorReply {
            error: self,
            processing_time,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
    processing_time: f64,
    timestamp: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    window_seconds: Option<u64>,
}

/// An [`ApiError`] plus the time spent before it happened.
#[derive(Debug)]
pub struct ErrorReply {
    pub error: ApiError,
    pub processing_time: f64,
}

impl IntoResponse for ErrorReply {
    fn into_response(self) -> Response {
        let status = self.error.status();
        if status.is_server_error() {
            tracing::error!("Request failed: {:#}", self.error);
        }

        let window_seconds = match &self.error {
            ApiError::RateLimited { window_seconds } => Some(*window_seconds),
            _ => None,
        };
        let error = match &self.error {
            ApiError::Unexpected(e) => format!("{:#}", e),
            other => other.to_string(),
        };

        let body = Json(ErrorBody {
            success: false,
            error,
            processing_time: round_to(self.processing_time, 3),
            timestamp: unix_now(),
            window_seconds,
        });

        let mut response = (status, body).into_response();
        if let Some(secs) = window_seconds {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}
