//! HTTP mapping of the error taxonomy
//!
//! Every handler returns `ApiResult<T>`; the error body carries the
//! taxonomy kind so clients can map it back without parsing messages.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

use skyshift_common::Error;

/// Handler result type
pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Wrapper turning taxonomy errors into HTTP responses
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

impl ApiError {
    /// Status code and taxonomy kind for this error
    fn classify(&self) -> (StatusCode, &'static str) {
        match &self.0 {
            Error::InvalidObject { .. } => (StatusCode::BAD_REQUEST, "InvalidObject"),
            Error::AlreadyExists { .. } => (StatusCode::CONFLICT, "AlreadyExists"),
            Error::NotFound { .. } => (StatusCode::NOT_FOUND, "NotFound"),
            Error::Conflict { .. } => (StatusCode::CONFLICT, "Conflict"),
            Error::Unauthorized { .. } => (StatusCode::UNAUTHORIZED, "Unauthorized"),
            Error::Unsupported { .. } => (StatusCode::UNPROCESSABLE_ENTITY, "Unsupported"),
            Error::Transient { .. } => (StatusCode::SERVICE_UNAVAILABLE, "Transient"),
            Error::WatchGap { .. } => (StatusCode::GONE, "WatchGap"),
            Error::Fatal { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "Internal"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = self.classify();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self.0, "internal error serving request");
        }
        let body = Json(json!({
            "kind": kind,
            "error": self.0.to_string(),
        }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (Error::invalid("Job", "bad"), StatusCode::BAD_REQUEST),
            (Error::already_exists("k"), StatusCode::CONFLICT),
            (Error::not_found("k"), StatusCode::NOT_FOUND),
            (Error::conflict("k", 3), StatusCode::CONFLICT),
            (Error::unauthorized("no"), StatusCode::UNAUTHORIZED),
            (Error::unsupported("ray", "exec"), StatusCode::UNPROCESSABLE_ENTITY),
            (Error::transient("etcd", "down"), StatusCode::SERVICE_UNAVAILABLE),
            (Error::fatal("api", "broken"), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, expected) in cases {
            assert_eq!(ApiError(err).classify().0, expected);
        }
    }

    #[test]
    fn test_conflict_kinds_are_distinguishable() {
        assert_eq!(ApiError(Error::already_exists("k")).classify().1, "AlreadyExists");
        assert_eq!(ApiError(Error::conflict("k", 1)).classify().1, "Conflict");
    }
}
