/// Structured failure responses for handlers.
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use vidrelay_shared::errors::{ChannelError, RelayError};
use vidrelay_shared::models::ApiResult;

/// A failure answered as `{code: 500, msg, data: null}` with an HTTP status.
#[derive(Debug)]
pub struct Failure {
    pub status: StatusCode,
    pub msg: String,
}

impl Failure {
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            msg: msg.into(),
        }
    }

    /// Failure carried inside an HTTP 200, as the login/resolve surface does.
    pub fn ok(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::OK, msg)
    }
}

impl IntoResponse for Failure {
    fn into_response(self) -> Response {
        (self.status, Json(ApiResult::<()>::fail(self.msg))).into_response()
    }
}

impl From<RelayError> for Failure {
    fn from(err: RelayError) -> Self {
        let status =
            StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        Self::new(status, err.to_string())
    }
}

impl From<ChannelError> for Failure {
    fn from(err: ChannelError) -> Self {
        Self::new(StatusCode::BAD_REQUEST, err.to_string())
    }
}
