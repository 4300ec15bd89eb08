use axum::{Json, http::StatusCode, response::IntoResponse};
use serde_json::json;
use thiserror::Error;
use tracing::error;

pub type ApiResult<T> = Result<Json<T>, ApiError>;

/// The submission API's error taxonomy, translated to HTTP status codes.
/// Client and quota errors map to 4xx and are returned synchronously from
/// admission; delivery outcomes never surface here — they are only
/// observable as `Event`s recorded later by the delivery worker pool.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("missing or invalid credential")]
    Unauthenticated,
    #[error("credential has been revoked")]
    Revoked,
    #[error("sender domain is not authorized for this tenant")]
    UnauthorizedSender,
    #[error("recipient address is suppressed")]
    Suppressed,
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("{0}")]
    ValidationFailed(String),
    #[error("message exceeds the maximum allowed size")]
    PayloadTooLarge,
    #[error("tenant quota exceeded, retry after {retry_after}s")]
    QuotaExceeded { retry_after: i64 },
    #[error("tenant has been suspended")]
    TenantSuspended,
    #[error("not found")]
    NotFound,
    #[error("internal error")]
    Internal(#[from] crate::models::Error),
}

impl From<garde::Report> for ApiError {
    fn from(report: garde::Report) -> Self {
        ApiError::ValidationFailed(report.to_string())
    }
}

impl From<crate::submission::SubmissionError> for ApiError {
    fn from(err: crate::submission::SubmissionError) -> Self {
        use crate::submission::SubmissionError as S;
        match err {
            S::EmptyRecipients => {
                ApiError::InvalidAddress("at least one recipient is required".to_string())
            }
            S::TooManyRecipients => ApiError::ValidationFailed(err.to_string()),
            S::UnauthorizedSender => ApiError::UnauthorizedSender,
            S::PayloadTooLarge => ApiError::PayloadTooLarge,
            S::QuotaExceeded { retry_after } => ApiError::QuotaExceeded { retry_after },
            S::Internal(inner) => ApiError::Internal(inner),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response<axum::body::Body> {
        error!("API server error: {self}");

        let (status, message) = match &self {
            ApiError::Unauthenticated => (StatusCode::UNAUTHORIZED, self.to_string()),
            ApiError::Revoked => (StatusCode::UNAUTHORIZED, self.to_string()),
            ApiError::UnauthorizedSender => (StatusCode::FORBIDDEN, self.to_string()),
            ApiError::Suppressed => (StatusCode::FORBIDDEN, self.to_string()),
            ApiError::InvalidAddress(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ApiError::ValidationFailed(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ApiError::PayloadTooLarge => (StatusCode::PAYLOAD_TOO_LARGE, self.to_string()),
            ApiError::QuotaExceeded { .. } => (StatusCode::TOO_MANY_REQUESTS, self.to_string()),
            ApiError::TenantSuspended => (StatusCode::FORBIDDEN, self.to_string()),
            ApiError::NotFound => (StatusCode::NOT_FOUND, self.to_string()),
            ApiError::Internal(err) => {
                if matches!(err, crate::models::Error::NotFound(_)) {
                    (StatusCode::NOT_FOUND, "not found".to_string())
                } else {
                    (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
                }
            }
        };

        let mut response = (status, Json(json!({ "error": message }))).into_response();

        if let ApiError::QuotaExceeded { retry_after } = self
            && let Ok(value) = axum::http::HeaderValue::from_str(&retry_after.to_string())
        {
            response.headers_mut().insert(axum::http::header::RETRY_AFTER, value);
        }

        response
    }
}
