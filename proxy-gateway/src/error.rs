use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

/// One machine-readable error kind per spec.md §7, each mapped to exactly
/// one HTTP status (spec.md §6's status mapping table).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidRequest,
    AuthMissing,
    AuthInvalid,
    AuthRevoked,
    NotFound,
    Forbidden,
    QuotaExhausted,
    RateLimited,
    UpstreamTimeout,
    UpstreamError,
    BreakerOpen,
    Internal,
}

impl ErrorKind {
    pub fn status(self) -> StatusCode {
        match self {
            ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
            ErrorKind::AuthMissing | ErrorKind::AuthInvalid | ErrorKind::AuthRevoked => {
                StatusCode::UNAUTHORIZED
            }
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Forbidden => StatusCode::FORBIDDEN,
            // Open question (a) in spec.md §9: 402 vs 429 for quota exhaustion.
            // We pick 402 Payment Required — it is unambiguous and does not
            // collide with the rate-limiter's own 429, so a client can tell
            // the two failure modes apart from status alone.
            ErrorKind::QuotaExhausted => StatusCode::PAYMENT_REQUIRED,
            ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::UpstreamError => StatusCode::BAD_GATEWAY,
            ErrorKind::BreakerOpen => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::AuthMissing => "auth_missing",
            ErrorKind::AuthInvalid => "auth_invalid",
            ErrorKind::AuthRevoked => "auth_revoked",
            ErrorKind::NotFound => "agent_not_found",
            ErrorKind::Forbidden => "agent_not_active",
            ErrorKind::QuotaExhausted => "quota_exhausted",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::UpstreamTimeout => "upstream_timeout",
            ErrorKind::UpstreamError => "upstream_error",
            ErrorKind::BreakerOpen => "circuit_breaker_open",
            ErrorKind::Internal => "internal_error",
        }
    }

    /// Per spec.md §7: only these classes are safe for a client to retry.
    pub fn retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimited
                | ErrorKind::UpstreamTimeout
                | ErrorKind::UpstreamError
                | ErrorKind::BreakerOpen
        )
    }
}

#[derive(Debug)]
pub struct ApiError {
    pub kind: ErrorKind,
    pub message: String,
    pub request_id: Option<Uuid>,
    pub correlation_id: Option<String>,
    pub path: String,
    pub method: String,
    pub retry_after_secs: Option<u64>,
    pub rate_limit: Option<u32>,
    pub rate_remaining: Option<u32>,
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            request_id: None,
            correlation_id: None,
            path: String::new(),
            method: String::new(),
            retry_after_secs: None,
            rate_limit: None,
            rate_remaining: None,
        }
    }

    pub fn with_request(mut self, request_id: Uuid, correlation_id: String, path: String, method: String) -> Self {
        self.request_id = Some(request_id);
        self.correlation_id = Some(correlation_id);
        self.path = path;
        self.method = method;
        self
    }

    pub fn with_retry_after(mut self, secs: u64) -> Self {
        self.retry_after_secs = Some(secs.max(1));
        self
    }

    /// Sets `X-RateLimit-Limit`/`X-RateLimit-Remaining` per spec.md §6 — only
    /// known once the rate-limiter stage of the pipeline has run.
    pub fn with_rate_limit(mut self, limit: u32, remaining: u32) -> Self {
        self.rate_limit = Some(limit);
        self.rate_remaining = Some(remaining);
        self
    }
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
    timestamp: chrono::DateTime<Utc>,
    path: String,
    method: String,
}

#[derive(Serialize)]
struct ErrorEnvelope {
    error: ErrorDetail,
    request_id: Option<Uuid>,
    correlation_id: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.kind.status();
        let code = self.kind.code();
        let body = ErrorEnvelope {
            error: ErrorDetail {
                code,
                message: self.message,
                timestamp: Utc::now(),
                path: self.path,
                method: self.method,
            },
            request_id: self.request_id,
            correlation_id: self.correlation_id,
        };
        let mut resp = (status, Json(body)).into_response();
        if let Ok(val) = axum::http::HeaderValue::from_str(code) {
            resp.headers_mut().insert("X-Error-Code", val);
        }
        if let Some(secs) = self.retry_after_secs {
            if let Ok(val) = axum::http::HeaderValue::from_str(&secs.to_string()) {
                resp.headers_mut().insert("Retry-After", val);
            }
        }
        if let Some(limit) = self.rate_limit {
            resp.headers_mut().insert("X-RateLimit-Limit", axum::http::HeaderValue::from(limit));
        }
        if let Some(remaining) = self.rate_remaining {
            resp.headers_mut().insert("X-RateLimit-Remaining", axum::http::HeaderValue::from(remaining));
        }
        resp
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
