use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Errors surfaced by the edge cache core, mapped to HTTP responses per the
/// disposition table: upstream dial/timeout errors never retry and never
/// write to cache; malformed Range headers carry their own `Content-Range`;
/// config errors are fatal at startup and never reach a client.
#[derive(Error, Debug)]
pub enum EdgeError {
    /// Origin dial, connect, or request timeout. No retry; no cache write.
    #[error("origin unreachable: {0}")]
    BadGateway(String),

    /// The upstream response body could not be read in full.
    #[error("failed to read upstream response body: {0}")]
    UpstreamBodyRead(String),

    /// A `Range` header was present but its value does not parse or is not
    /// satisfiable against the content length.
    #[error("range not satisfiable (content length {0})")]
    RangeNotSatisfiable(u64),

    /// Malformed client request (not a Range problem).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Startup-time configuration problem. Never converted into an HTTP
    /// response; `main` logs it and exits non-zero.
    #[error("configuration error: {0}")]
    Config(String),

    /// Anything else unexpected while building a response.
    #[error("internal error: {0}")]
    Internal(String),
}

pub type EdgeResult<T> = Result<T, EdgeError>;

impl EdgeError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            EdgeError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            EdgeError::UpstreamBodyRead(_) => StatusCode::INTERNAL_SERVER_ERROR,
            EdgeError::RangeNotSatisfiable(_) => StatusCode::RANGE_NOT_SATISFIABLE,
            EdgeError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            EdgeError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            EdgeError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for EdgeError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        if let EdgeError::RangeNotSatisfiable(size) = self {
            return (
                status,
                [(header::CONTENT_RANGE, format!("bytes */{size}"))],
                (),
            )
                .into_response();
        }

        let body = Json(json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

impl From<reqwest::Error> for EdgeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            EdgeError::BadGateway(err.to_string())
        } else if err.is_body() || err.is_decode() {
            EdgeError::UpstreamBodyRead(err.to_string())
        } else {
            EdgeError::BadGateway(err.to_string())
        }
    }
}
