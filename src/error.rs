use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::time::Duration;

/// Typed failures of one bridge invocation.
///
/// Every variant maps onto exactly one HTTP status and one OpenAI error
/// `type`/`code` pair, see [`BridgeError::status`] and [`BridgeError::body`].
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// The inbound request could not be translated. No subprocess is spawned.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Admission control rejected the request.
    #[error("too many concurrent requests (limit {0})")]
    Overloaded(usize),

    /// The CLI binary is missing or not executable.
    #[error("claude CLI unavailable: {0}")]
    CliUnavailable(String),

    /// The CLI exited non-zero or reported an error result.
    #[error("claude CLI failed{}: {stderr}", .code.map(|c| format!(" with exit code {c}")).unwrap_or_default())]
    CliFailed { code: Option<i32>, stderr: String },

    /// The CLI did not finish within the configured deadline.
    #[error("claude CLI timed out after {0:?}")]
    Timeout(Duration),

    /// The output stream ended without a terminal event.
    #[error("claude CLI output ended unexpectedly")]
    Truncated,

    #[error("I/O error talking to claude CLI: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub code: &'static str,
}

impl BridgeError {
    pub fn status(&self) -> StatusCode {
        match self {
            BridgeError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            BridgeError::Overloaded(_) => StatusCode::TOO_MANY_REQUESTS,
            BridgeError::CliUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            BridgeError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            BridgeError::CliFailed { .. } | BridgeError::Truncated | BridgeError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// OpenAI-shaped error body, used both as a JSON response and as the
    /// terminating frame of a failed stream.
    pub fn body(&self) -> ErrorBody {
        let (kind, code) = match self {
            BridgeError::InvalidRequest(_) => ("invalid_request_error", "invalid_request"),
            BridgeError::Overloaded(_) => ("rate_limit_error", "too_many_requests"),
            BridgeError::CliUnavailable(_) => ("server_error", "cli_unavailable"),
            BridgeError::CliFailed { .. } => ("server_error", "cli_error"),
            BridgeError::Timeout(_) => ("server_error", "timeout"),
            BridgeError::Truncated | BridgeError::Io(_) => ("server_error", "internal_error"),
        };
        ErrorBody {
            error: ErrorDetail {
                message: self.to_string(),
                kind,
                code,
            },
        }
    }
}

impl IntoResponse for BridgeError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.body())).into_response()
    }
}

/// Cut diagnostic output down to something that fits in an error message.
pub(crate) fn truncate_str(s: &str, max_chars: usize) -> String {
    let trimmed = s.trim();
    match trimmed.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}
