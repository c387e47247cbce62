//! Admission errors and their HTTP mapping.

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use std::time::Duration;
use thiserror::Error;

/// Structured rejection from the admission pipeline or a handler.
#[derive(Debug, Error)]
pub enum AdmissionError {
    /// No valid credentials. 401.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Credentials valid but the request crosses a tenant boundary. 403.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The tenant's token bucket is empty. 429 with `retry-after`.
    #[error("rate limited")]
    RateLimited {
        /// Suggested wait before retrying.
        retry_after: Duration,
    },

    /// The edge breaker is open. 503.
    #[error("circuit open")]
    CircuitOpen,

    /// The request body or query is malformed. 400.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// A downstream dependency is unavailable. 503.
    #[error("service unavailable: {0}")]
    Unavailable(String),

    /// Unexpected handler fault. 500.
    #[error("internal error: {0}")]
    Internal(String),
}

impl AdmissionError {
    /// The stable kind token used in response bodies.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::RateLimited { .. } => "rate_limited",
            Self::CircuitOpen => "circuit_open",
            Self::BadRequest(_) => "bad_request",
            Self::Unavailable(_) => "service_unavailable",
            Self::Internal(_) => "internal_error",
        }
    }

    /// The HTTP status this error maps to.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::CircuitOpen | Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AdmissionError {
    fn into_response(self) -> Response {
        let body = axum::Json(serde_json::json!({
            "error": self.kind(),
            "message": self.to_string(),
        }));
        let mut response = (self.status(), body).into_response();
        if let Self::RateLimited { retry_after } = self {
            let seconds = retry_after.as_secs().max(1).to_string();
            if let Ok(value) = HeaderValue::from_str(&seconds) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            AdmissionError::Unauthorized("no token".to_string()).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AdmissionError::Forbidden("tenant mismatch".to_string()).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            AdmissionError::RateLimited {
                retry_after: Duration::from_secs(2)
            }
            .status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(AdmissionError::CircuitOpen.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_retry_after_header() {
        let response = AdmissionError::RateLimited {
            retry_after: Duration::from_secs(7),
        }
        .into_response();
        assert_eq!(
            response.headers().get(header::RETRY_AFTER).unwrap(),
            &HeaderValue::from_static("7")
        );
    }

    #[test]
    fn test_kind_tokens() {
        assert_eq!(AdmissionError::CircuitOpen.kind(), "circuit_open");
        assert_eq!(
            AdmissionError::RateLimited {
                retry_after: Duration::ZERO
            }
            .kind(),
            "rate_limited"
        );
    }
}
