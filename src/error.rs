use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Terminal outcome of a rejected gateway request.
///
/// Every admission gate converts its failure into exactly one of these
/// variants. The `String` payloads are diagnostic detail for server-side
/// logs and are never written to the response body.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("rate limit exceeded")]
    RateLimited { retry_after: Option<u64> },

    #[error("invalid API key")]
    Unauthorized,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::Unauthorized => StatusCode::UNAUTHORIZED,
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::UpstreamUnreachable(_) | GatewayError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Machine-readable reason carried in the error body.
    pub fn reason(&self) -> &'static str {
        match self {
            GatewayError::RateLimited { .. } => "rate_limit_exceeded",
            GatewayError::Unauthorized => "unauthorized",
            GatewayError::BadRequest(_) => "bad_request",
            GatewayError::UpstreamUnreachable(_) => "upstream_unreachable",
            GatewayError::Internal(_) => "internal_error",
        }
    }

    fn public_message(&self) -> &'static str {
        match self {
            GatewayError::RateLimited { .. } => "Rate limit exceeded",
            GatewayError::Unauthorized => "Invalid API key",
            GatewayError::BadRequest(_) => "Invalid backend",
            GatewayError::UpstreamUnreachable(_) => "Upstream unreachable",
            GatewayError::Internal(_) => "Internal server error",
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse::from_gateway_error(&self);
        let mut response = (status, Json(body)).into_response();

        if let GatewayError::RateLimited {
            retry_after: Some(secs),
        } = self
        {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }

        response
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub code: u16,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str, code: u16) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
            code,
        }
    }

    pub fn from_gateway_error(err: &GatewayError) -> Self {
        Self::new(err.reason(), err.public_message(), err.status_code().as_u16())
    }
}

/// Failures raised by credential storage backends.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("API key not found")]
    NotFound,

    #[error("API key already exists")]
    AlreadyExists,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<redis::RedisError> for CredentialError {
    fn from(err: redis::RedisError) -> Self {
        CredentialError::Storage(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("environment error: {0}")]
    Env(#[from] envconfig::Error),

    #[error("validation error: {0}")]
    Validation(#[from] validator::ValidationErrors),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Errors surfaced while building or running the server.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error(transparent)]
    Metrics(#[from] prometheus::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_are_stable() {
        assert_eq!(
            GatewayError::RateLimited { retry_after: None }.status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(GatewayError::Unauthorized.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            GatewayError::BadRequest("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayError::UpstreamUnreachable("x".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            GatewayError::Internal("x".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_error_body_hides_detail() {
        let err = GatewayError::UpstreamUnreachable("connect to http://10.0.0.7:8545 refused".into());
        let body = ErrorResponse::from_gateway_error(&err);
        let json = serde_json::to_string(&body).unwrap();

        assert_eq!(body.error, "upstream_unreachable");
        assert_eq!(body.code, 500);
        assert!(!json.contains("10.0.0.7"));
    }

    #[test]
    fn test_rate_limited_sets_retry_after() {
        let response = GatewayError::RateLimited {
            retry_after: Some(3),
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "3");
    }
}
