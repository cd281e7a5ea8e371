use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// Structured error body returned to clients:
/// `{"error":{"code","message","details"?},"request_id"?}`.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<HashMap<String, Value>>,
}

/// Request-path errors surfaced to clients through the uniform envelope.
#[derive(Debug)]
pub enum AppError {
    /// No route matched the request path
    NotFound(String),
    /// Missing, malformed, or invalid credentials
    Unauthorized(String),
    /// Sliding-window limit exceeded; carries the Retry-After seconds
    RateLimited { message: String, retry_after: i64 },
    /// Upstream dial or request-construction failure
    BadGateway(String),
    /// Forward exceeded the route's deadline
    GatewayTimeout(String),
    /// Circuit breaker is open for the matched service
    ServiceUnavailable(String),
    /// Unclassified internal failure
    Internal(String),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::BadGateway(_) => StatusCode::BAD_GATEWAY,
            Self::GatewayTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::RateLimited { .. } => "RATE_LIMITED",
            Self::BadGateway(_) => "BAD_GATEWAY",
            Self::GatewayTimeout(_) => "GATEWAY_TIMEOUT",
            Self::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::NotFound(msg)
            | Self::Unauthorized(msg)
            | Self::BadGateway(msg)
            | Self::GatewayTimeout(msg)
            | Self::ServiceUnavailable(msg)
            | Self::Internal(msg) => msg,
            Self::RateLimited { message, .. } => message,
        }
    }

    /// Build the full client response, echoing the client-supplied request
    /// id when present. Rate-limit rejections also carry `Retry-After`.
    pub fn into_response_with_request_id(self, request_id: Option<String>) -> Response {
        let status = self.status();
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code(),
                message: self.message().to_string(),
                details: None,
            },
            request_id,
        };

        let mut response = (status, Json(body)).into_response();
        if let Self::RateLimited { retry_after, .. } = self {
            if let Ok(value) = retry_after.to_string().parse() {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code(), self.message())
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        self.into_response_with_request_id(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    #[test]
    fn test_status_and_code_mapping() {
        assert_eq!(AppError::NotFound("x".into()).status(), StatusCode::NOT_FOUND);
        assert_eq!(AppError::NotFound("x".into()).code(), "NOT_FOUND");
        assert_eq!(
            AppError::Unauthorized("x".into()).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AppError::ServiceUnavailable("x".into()).code(),
            "SERVICE_UNAVAILABLE"
        );
        assert_eq!(
            AppError::GatewayTimeout("x".into()).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(AppError::Internal("x".into()).code(), "INTERNAL_ERROR");
    }

    #[tokio::test]
    async fn test_envelope_shape() {
        let err = AppError::NotFound("Route not found".into());
        let response = err.into_response_with_request_id(Some("req-1".into()));
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["error"]["code"], "NOT_FOUND");
        assert_eq!(json["error"]["message"], "Route not found");
        assert_eq!(json["request_id"], "req-1");
    }

    #[tokio::test]
    async fn test_envelope_omits_missing_request_id() {
        let response = AppError::Unauthorized("invalid token".into()).into_response();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert!(json.as_object().unwrap().get("request_id").is_none());
    }

    #[tokio::test]
    async fn test_rate_limited_sets_retry_after() {
        let err = AppError::RateLimited {
            message: "rate limit exceeded".into(),
            retry_after: 30,
        };
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "30");
    }
}
