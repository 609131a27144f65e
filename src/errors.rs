use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use thiserror::Error;

/// Error taxonomy for the whole service. Every failure that crosses a
/// component boundary is one of these kinds; handlers map them to HTTP
/// statuses in one place instead of ad-hoc per route.
#[derive(Debug, Clone, Error)]
pub enum ApiError {
    #[error("bad credentials: {0}")]
    BadCredentials(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("rate limited by upstream")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("call timed out: {0}")]
    Timeout(String),

    #[error("job deadline exceeded")]
    Deadline,

    #[error("cancelled")]
    Cancelled,

    #[error("required tool missing: {0}")]
    ToolMissing(String),

    #[error("svn authentication rejected")]
    SvnAuth,

    #[error("svn repository unavailable: {0}")]
    SvnUnavailable(String),

    #[error("svn layout probe failed: {0}")]
    SvnLayout(String),

    #[error("migration verification mismatch: {0}")]
    MigrationMismatch(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// Stable machine-readable kind, used in job item results and wire
    /// error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::BadCredentials(_) => "bad-credentials",
            ApiError::Forbidden(_) => "forbidden",
            ApiError::NotFound(_) => "not-found",
            ApiError::Conflict(_) => "conflict",
            ApiError::Validation(_) => "validation",
            ApiError::RateLimited { .. } => "rate-limited",
            ApiError::UpstreamUnavailable(_) => "upstream-unavailable",
            ApiError::Timeout(_) => "timeout",
            ApiError::Deadline => "deadline",
            ApiError::Cancelled => "cancelled",
            ApiError::ToolMissing(_) => "tool-missing",
            ApiError::SvnAuth => "svn-auth",
            ApiError::SvnUnavailable(_) => "svn-unavailable",
            ApiError::SvnLayout(_) => "svn-layout",
            ApiError::MigrationMismatch(_) => "migration-mismatch",
            ApiError::Internal(_) => "internal",
        }
    }

    /// Whether a bulk item that failed with this kind should go back on
    /// the queue. Only failures the upstream may recover from on its own.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ApiError::RateLimited { .. }
                | ApiError::UpstreamUnavailable(_)
                | ApiError::Timeout(_)
        )
    }

    pub fn http_status(&self) -> StatusCode {
        match self {
            ApiError::BadCredentials(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            ApiError::Timeout(_) | ApiError::Deadline => StatusCode::GATEWAY_TIMEOUT,
            // 499 (client closed / cancelled) is not a named constant
            ApiError::Cancelled => {
                StatusCode::from_u16(499).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
            ApiError::ToolMissing(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::SvnAuth => StatusCode::UNAUTHORIZED,
            ApiError::SvnUnavailable(_) => StatusCode::BAD_GATEWAY,
            ApiError::SvnLayout(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::MigrationMismatch(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        self.http_status()
    }

    fn error_response(&self) -> HttpResponse {
        let mut body = json!({
            "error": self.kind(),
            "message": self.to_string(),
        });
        if let ApiError::RateLimited {
            retry_after_secs: Some(secs),
        } = self
        {
            body["retry_after"] = json!(secs);
        }
        HttpResponse::build(self.http_status()).json(body)
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ApiError::Timeout(err.to_string())
        } else if err.is_connect() {
            ApiError::UpstreamUnavailable(err.to_string())
        } else {
            ApiError::Internal(err.to_string())
        }
    }
}

impl From<std::io::Error> for ApiError {
    fn from(err: std::io::Error) -> Self {
        ApiError::Internal(err.to_string())
    }
}
