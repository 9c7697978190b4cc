//! Request error taxonomy and its mapping onto HTTP responses.
//!
//! Every rejected request produces exactly one JSON error body; failures
//! after the status line has been written degrade to a closed connection
//! plus a log line and never reach this module.

use axum::{body::Body, response::Response};
use chrono::Utc;
use http::{StatusCode, header};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("no proxy instance named '{0}'")]
    UnknownInstance(String),

    #[error("missing 'url' query parameter")]
    MissingUrl,

    #[error("invalid target URL: {0}")]
    InvalidUrl(String),

    #[error("client IP {0} is not allowed")]
    ClientDenied(String),

    #[error("invalid or missing token")]
    InvalidToken,

    #[error("target {0} is not allowed")]
    TargetDenied(String),

    #[error("failed to read request body: {0}")]
    BadRequestBody(String),

    #[error("malformed WebSocket upgrade: {0}")]
    BadUpgrade(String),

    #[error("upstream request failed: {0}")]
    Upstream(String),

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::UnknownInstance(_) => StatusCode::NOT_FOUND,
            Self::MissingUrl
            | Self::InvalidUrl(_)
            | Self::BadRequestBody(_)
            | Self::BadUpgrade(_) => StatusCode::BAD_REQUEST,
            Self::InvalidToken => StatusCode::UNAUTHORIZED,
            Self::ClientDenied(_) | Self::TargetDenied(_) => StatusCode::FORBIDDEN,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Render the error as the JSON body reported to clients.
    pub fn into_response(self, instance: &str) -> Response {
        let status = self.status();
        let body = ErrorBody {
            error: self.to_string(),
            code: status.as_u16(),
            timestamp: Utc::now().to_rfc3339(),
            instance: instance.to_string(),
        };

        Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap_or_default()))
            .expect("static response parts are valid")
    }
}

/// JSON body carried by every error response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: u16,
    pub timestamp: String,
    pub instance: String,
}
