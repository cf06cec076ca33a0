//! API error handling.
//!
//! Provides consistent error responses for the API.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::error::Error;

/// API error response body.
#[derive(Debug, Serialize)]
pub struct ApiErrorResponse {
    /// Error code for programmatic handling
    pub code: String,
    /// Human-readable error message
    pub message: String,
    /// Additional error details (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// API error type that can be converted to HTTP responses.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// 400 Bad Request.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }

    /// 404 Not Found.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
    }

    /// 502 Bad Gateway: an external tool failed.
    pub fn upstream_failed(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, "UPSTREAM_FAILED", message)
    }

    /// 504 Gateway Timeout: resolution took too long.
    pub fn resolve_timeout(message: impl Into<String>) -> Self {
        Self::new(StatusCode::GATEWAY_TIMEOUT, "RESOLVE_TIMEOUT", message)
    }

    /// 500 with a code telling operators a tool is missing or unusable.
    pub fn tool_unavailable(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "TOOL_UNAVAILABLE",
            message,
        )
    }

    /// 500 Internal Server Error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorResponse {
            code: self.code,
            message: self.message,
            details: self.details,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        match err {
            Error::Validation(msg) => ApiError::bad_request(msg),
            Error::Resolution(msg) => ApiError::not_found(msg),
            Error::Pipeline {
                exit_code,
                stderr_excerpt,
            } => {
                let message = if stderr_excerpt.is_empty() {
                    "Extractor failed".to_string()
                } else {
                    stderr_excerpt.clone()
                };
                ApiError::upstream_failed(message).with_details(serde_json::json!({
                    "exit_code": exit_code,
                    "stderr": stderr_excerpt,
                }))
            }
            Error::Launch { program, reason } => {
                tracing::error!(program = %program, reason = %reason, "Failed to launch tool");
                ApiError::tool_unavailable(format!("Failed to launch {}: {}", program, reason))
            }
            Error::Timeout { phase, after_secs } => ApiError::resolve_timeout(format!(
                "Timed out during {} after {}s",
                phase, after_secs
            )),
            Error::Io(e) => {
                tracing::error!("IO error: {}", e);
                ApiError::internal("IO error occurred")
            }
            _ => {
                tracing::error!("Unexpected error: {}", err);
                ApiError::internal("An unexpected error occurred")
            }
        }
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LaunchFailure;

    #[test]
    fn test_api_error_creation() {
        let err = ApiError::not_found("No matching tracks found");
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        assert_eq!(err.code, "NOT_FOUND");
    }

    #[test]
    fn test_pipeline_error_mapping() {
        let api_err: ApiError = Error::Pipeline {
            exit_code: Some(1),
            stderr_excerpt: "ERROR: Video unavailable".to_string(),
        }
        .into();
        assert_eq!(api_err.status, StatusCode::BAD_GATEWAY);
        assert_eq!(api_err.code, "UPSTREAM_FAILED");
        assert!(api_err.message.contains("Video unavailable"));
        assert_eq!(api_err.details.unwrap()["exit_code"], 1);
    }

    #[test]
    fn test_launch_error_names_only_executable() {
        let api_err: ApiError =
            Error::launch("yt-dlp", LaunchFailure::ExecutableNotFound).into();
        assert_eq!(api_err.code, "TOOL_UNAVAILABLE");
        assert_eq!(api_err.message, "Failed to launch yt-dlp: executable not found");
    }

    #[test]
    fn test_timeout_and_validation_mapping() {
        let api_err: ApiError = Error::Timeout {
            phase: "resolve",
            after_secs: 30,
        }
        .into();
        assert_eq!(api_err.status, StatusCode::GATEWAY_TIMEOUT);

        let api_err: ApiError = Error::validation("Missing required parameter 'query'").into();
        assert_eq!(api_err.status, StatusCode::BAD_REQUEST);
        assert_eq!(api_err.code, "BAD_REQUEST");
    }

    #[test]
    fn test_internal_errors_are_generic() {
        let api_err: ApiError = Error::Other("secret detail".to_string()).into();
        assert_eq!(api_err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!api_err.message.contains("secret"));
    }
}
