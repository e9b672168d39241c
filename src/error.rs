//! Error types surfaced at the API boundary.
//!
//! Every failure that can cross the HTTP surface is one of the kinds below.
//! Handlers build these directly; plumbing code uses `anyhow` and is folded
//! into `Internal` at the boundary.
//!
//! # Error Contract
//!
//! All error responses share one JSON schema:
//!
//! ```json
//! { "error": { "code": "not_found", "message": "archive 'foo' not found" } }
//! ```

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Errors surfaced by the search, reader, download, and management paths.
#[derive(Debug, Error)]
pub enum ZimiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("{0}")]
    Conflict(String),

    #[error("rate limited")]
    RateLimited { retry_after: u64 },

    /// The archive file disappeared while a request was using it.
    #[error("archive '{0}' is gone")]
    ArchiveGone(String),

    /// Title index missing, still building, or quarantined after repeated
    /// build failures.
    #[error("title index unavailable for '{0}'")]
    IndexUnavailable(String),

    #[error("download failed: {0}")]
    DownloadFailed(String),

    #[error("{0}")]
    Internal(String),
}

impl ZimiError {
    /// Machine-readable code carried in the response body.
    pub fn code(&self) -> &'static str {
        match self {
            ZimiError::BadRequest(_) => "bad_request",
            ZimiError::NotFound(_) => "not_found",
            ZimiError::Unauthorized => "unauthorized",
            ZimiError::Conflict(_) => "conflict",
            ZimiError::RateLimited { .. } => "rate_limited",
            ZimiError::ArchiveGone(_) => "archive_gone",
            ZimiError::IndexUnavailable(_) => "index_unavailable",
            ZimiError::DownloadFailed(_) => "download_failed",
            ZimiError::Internal(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ZimiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ZimiError::NotFound(_) | ZimiError::ArchiveGone(_) => StatusCode::NOT_FOUND,
            ZimiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ZimiError::Conflict(_) => StatusCode::CONFLICT,
            ZimiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ZimiError::IndexUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ZimiError::DownloadFailed(_) => StatusCode::BAD_GATEWAY,
            ZimiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<anyhow::Error> for ZimiError {
    fn from(err: anyhow::Error) -> Self {
        ZimiError::Internal(err.to_string())
    }
}

impl From<sqlx::Error> for ZimiError {
    fn from(err: sqlx::Error) -> Self {
        ZimiError::Internal(err.to_string())
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

impl IntoResponse for ZimiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code().to_string(),
                message: self.to_string(),
            },
        };
        let mut response = (status, Json(body)).into_response();
        if let ZimiError::RateLimited { retry_after } = self {
            if let Ok(value) = retry_after.to_string().parse() {
                response.headers_mut().insert("Retry-After", value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_kinds() {
        assert_eq!(ZimiError::BadRequest("x".into()).code(), "bad_request");
        assert_eq!(ZimiError::Unauthorized.code(), "unauthorized");
        assert_eq!(
            ZimiError::RateLimited { retry_after: 3 }.code(),
            "rate_limited"
        );
        assert_eq!(ZimiError::ArchiveGone("a".into()).code(), "archive_gone");
    }

    #[test]
    fn statuses() {
        assert_eq!(
            ZimiError::NotFound("x".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ZimiError::Conflict("x".into()).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ZimiError::RateLimited { retry_after: 1 }.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
    }

    #[test]
    fn anyhow_folds_to_internal() {
        let err: ZimiError = anyhow::anyhow!("boom").into();
        assert_eq!(err.code(), "internal");
    }
}
