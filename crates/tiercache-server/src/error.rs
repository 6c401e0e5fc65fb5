//! HTTP mapping of engine errors.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tiercache_core::{CacheError, ErrorCategory};

/// Error returned by request handlers.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("Bad request: {0}")]
    BadRequest(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Cache(CacheError::StrategyNotFound(_)) => StatusCode::NOT_FOUND,
            Self::Cache(e) => match e.category() {
                ErrorCategory::Strategy => StatusCode::BAD_REQUEST,
                ErrorCategory::Storage => StatusCode::SERVICE_UNAVAILABLE,
                ErrorCategory::Peer | ErrorCategory::Loader => StatusCode::BAD_GATEWAY,
                ErrorCategory::Serialization
                | ErrorCategory::Encryption
                | ErrorCategory::Configuration => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(status = status.as_u16(), error = %self, "request failed");
        }
        let body = json!({
            "error": status.canonical_reason().unwrap_or("error"),
            "message": self.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ApiError::from(CacheError::backing_store("down")).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError::from(CacheError::strategy_not_found("x")).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(CacheError::invalid_strategy("x", "bad ttl")).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::BadRequest("nope".into()).status(),
            StatusCode::BAD_REQUEST
        );
    }
}
