//! HTTP error mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::{error, warn};

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    /// The shared transport is unreachable; clients should retry.
    Unavailable(String),
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<pulse_core::Error> for ApiError {
    fn from(err: pulse_core::Error) -> Self {
        use pulse_core::Error;

        match err {
            Error::InvalidInput(msg) => ApiError::BadRequest(msg),
            Error::Unauthorized(msg) => ApiError::Unauthorized(msg),
            Error::Forbidden(msg) => ApiError::Forbidden(msg),
            Error::Transport(_) | Error::Database(_) | Error::Request(_) => {
                ApiError::Unavailable(err.to_string())
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match self {
            ApiError::BadRequest(msg)
            | ApiError::Unauthorized(msg)
            | ApiError::Forbidden(msg) => msg,
            ApiError::Unavailable(msg) => {
                warn!(subsystem = "api", error = %msg, "Event transport unavailable");
                msg
            }
            ApiError::Internal(msg) => {
                error!(subsystem = "api", error = %msg, "Internal error");
                msg
            }
        };

        let body = Json(serde_json::json!({
            "error": message,
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_core::Error;

    #[test]
    fn test_core_error_mapping() {
        let cases = [
            (Error::InvalidInput("x".into()), StatusCode::BAD_REQUEST),
            (Error::Unauthorized("x".into()), StatusCode::UNAUTHORIZED),
            (Error::Forbidden("x".into()), StatusCode::FORBIDDEN),
            (Error::Transport("x".into()), StatusCode::SERVICE_UNAVAILABLE),
            (Error::Request("x".into()), StatusCode::SERVICE_UNAVAILABLE),
            (
                Error::Database(sqlx::Error::PoolTimedOut),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (Error::Config("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
            (
                Error::PayloadTooLarge { size: 9000, limit: 7900 },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(ApiError::from(err).status(), expected);
        }
    }

    #[test]
    fn test_response_status() {
        let response = ApiError::Forbidden("no".into()).into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }
}
