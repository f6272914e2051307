//! Actix Web error adapters for gateway errors.
//!
//! Maps each [`Error`] kind onto the HTTP status a gateway client expects:
//! unknown server 404, server down 503, lifecycle contention 409, broken or
//! misbehaving server 502, timeout 504.

use crate::error::Error;
use actix_web::{HttpResponse, ResponseError, http::StatusCode};
use serde_json::json;

impl ResponseError for Error {
    fn error_response(&self) -> HttpResponse {
        let status_code = self.status_code();

        HttpResponse::build(status_code)
            .content_type("application/json")
            .json(json!({
                "error": self.to_string(),
                "code": status_code.as_u16()
            }))
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Error::ServerNotFound(_) => StatusCode::NOT_FOUND,
            Error::NotRunning(_) | Error::RestartExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::OperationInProgress(_)
            | Error::AlreadyRunning(_)
            | Error::ProcessReplaced(_)
            | Error::InvalidTransition { .. } => StatusCode::CONFLICT,
            Error::Transport(_)
            | Error::Protocol(_)
            | Error::JsonRpc { .. }
            | Error::Spawn(_)
            | Error::HandshakeFailed(_)
            | Error::HandshakeTimeout(_) => StatusCode::BAD_GATEWAY,
            Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::ConfigInvalid(_) | Error::ConfigParse(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Errors raised while validating a client request
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The request body is unusable
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A gateway error
    #[error(transparent)]
    Gateway(#[from] Error),
}

impl ResponseError for ApiError {
    fn error_response(&self) -> HttpResponse {
        match self {
            ApiError::Gateway(e) => e.error_response(),
            ApiError::InvalidRequest(_) => HttpResponse::build(StatusCode::BAD_REQUEST)
                .content_type("application/json")
                .json(json!({
                    "error": self.to_string(),
                    "code": StatusCode::BAD_REQUEST.as_u16()
                })),
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Gateway(e) => e.status_code(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (Error::ServerNotFound("a".into()), StatusCode::NOT_FOUND),
            (Error::NotRunning("a".into()), StatusCode::SERVICE_UNAVAILABLE),
            (Error::OperationInProgress("a".into()), StatusCode::CONFLICT),
            (Error::Transport("transport lost".into()), StatusCode::BAD_GATEWAY),
            (Error::HandshakeTimeout(Duration::from_secs(1)), StatusCode::BAD_GATEWAY),
            (Error::Timeout("slow".into()), StatusCode::GATEWAY_TIMEOUT),
            (Error::Storage("disk".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (error, status) in cases {
            assert_eq!(error.status_code(), status, "{}", error);
        }
    }

    #[test]
    fn test_api_error_delegates() {
        let error = ApiError::from(Error::ServerNotFound("a".into()));
        assert_eq!(error.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            ApiError::InvalidRequest("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
    }
}
